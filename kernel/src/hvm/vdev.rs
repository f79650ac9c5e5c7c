//! User-mode virtual devices.
//!
//! Every emulated device is an ordinary user process wired to the VMM
//! with two one-slot channels: a request channel for port I/O traffic
//! and a sync channel for lifecycle messages. The routing tables map
//! each guest I/O port (per direction), each guest IRQ and the virtual
//! PIC to at most one owning device. Guest port reads are a strict
//! request/reply lockstep on the request channel, which is exactly what
//! the one-slot mailbox guarantees.

extern crate alloc;

use alloc::vec::Vec;

use super::{DataSz, VmSlot};
use crate::{
    config::MAX_VDEV,
    error::HvmError,
    ipc::{self, ChannelId},
    proc::Pid,
};

/* Wire magics, little-endian u32 at offset 0 of every message. */
pub const VDEV_DEVICE_READY: u32 = 0xABCD_0001;
pub const VDEV_DEVICE_SYNC: u32 = 0xABCD_0002;
pub const VDEV_READ_IOPORT: u32 = 0xABCD_0003;
pub const VDEV_WRITE_IOPORT: u32 = 0xABCD_0004;
pub const VDEV_GUEST_IOPORT_DATA: u32 = 0xABCD_0005;

/// Size of every vdev wire message.
pub const VDEV_MSG_LEN: usize = 12;

/// A port-I/O request or reply on a device channel.
///
/// Layout: magic u32 at 0, port u16 at 4, width u8 at 6, val u32 at 8.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IoportMsg {
    pub magic: u32,
    pub port: u16,
    pub width: DataSz,
    pub val: u32,
}

impl IoportMsg {
    pub fn encode(&self) -> [u8; VDEV_MSG_LEN] {
        let mut out = [0u8; VDEV_MSG_LEN];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..6].copy_from_slice(&self.port.to_le_bytes());
        out[6] = self.width as u8;
        out[8..12].copy_from_slice(&self.val.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, HvmError> {
        if buf.len() < VDEV_MSG_LEN {
            return Err(HvmError::BadArg);
        }
        let magic = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        let port = u16::from_le_bytes(buf[4..6].try_into().unwrap());
        let width = DataSz::from_u8(buf[6]).ok_or(HvmError::BadArg)?;
        let val = u32::from_le_bytes(buf[8..12].try_into().unwrap());
        Ok(IoportMsg { magic, port, width, val })
    }
}

/// Encode a bare lifecycle message (`DEVICE_READY`, `DEVICE_SYNC`).
pub fn encode_magic(magic: u32) -> [u8; VDEV_MSG_LEN] {
    let mut out = [0u8; VDEV_MSG_LEN];
    out[0..4].copy_from_slice(&magic.to_le_bytes());
    out
}

/// Magic of an encoded message.
pub fn peek_magic(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(u32::from_le_bytes(buf[0..4].try_into().unwrap()))
}

/// One attached device.
#[derive(Debug, Clone, Copy)]
pub struct DevSlot {
    pub pid: Pid,
    pub req_ch: ChannelId,
    pub sync_ch: ChannelId,
    pub ready: bool,
}

/// The per-VM device registry and routing tables.
pub struct Vdev {
    devs: [Option<DevSlot>; MAX_VDEV],
    /// Read and write owners per guest port, with the emulated width.
    ioport_read: Vec<Option<(u8, DataSz)>>,
    ioport_write: Vec<Option<(u8, DataSz)>>,
    irq: [Option<u8>; 256],
    pic: Option<u8>,
    /// Registered device memory ranges: (start, len, vid). Recorded
    /// and consulted on nested faults; no access protocol beyond that.
    mmio: Vec<(u32, u32, u8)>,
}

const NPORTS: usize = 0x10000;

impl Vdev {
    /// The const placeholder living in a vacant VM slot. `reset` sizes
    /// the port tables when a VM is created.
    pub const fn vacant() -> Self {
        Vdev {
            devs: [None; MAX_VDEV],
            ioport_read: Vec::new(),
            ioport_write: Vec::new(),
            irq: [None; 256],
            pic: None,
            mmio: Vec::new(),
        }
    }

    /// Clear every table and (re)allocate the port maps.
    pub fn reset(&mut self) {
        self.devs = [None; MAX_VDEV];
        self.ioport_read = alloc::vec![None; NPORTS];
        self.ioport_write = alloc::vec![None; NPORTS];
        self.irq = [None; 256];
        self.pic = None;
        self.mmio = Vec::new();
    }

    pub fn register_device(
        &mut self,
        pid: Pid,
        req_ch: ChannelId,
        sync_ch: ChannelId,
    ) -> Result<u8, HvmError> {
        if self.ioport_read.is_empty() {
            self.reset();
        }
        for (vid, slot) in self.devs.iter_mut().enumerate() {
            if slot.is_none() {
                *slot = Some(DevSlot {
                    pid,
                    req_ch,
                    sync_ch,
                    ready: false,
                });
                return Ok(vid as u8);
            }
        }
        Err(HvmError::NoSlot)
    }

    /// Detach a device and strip it from every routing table. Returns
    /// the process that was attached.
    pub fn unregister_device(&mut self, vid: u8) -> Result<Pid, HvmError> {
        let slot = self
            .devs
            .get_mut(vid as usize)
            .and_then(Option::take)
            .ok_or(HvmError::NoSlot)?;
        for e in self.ioport_read.iter_mut().chain(self.ioport_write.iter_mut()) {
            if e.map(|(v, _)| v) == Some(vid) {
                *e = None;
            }
        }
        for e in self.irq.iter_mut() {
            if *e == Some(vid) {
                *e = None;
            }
        }
        if self.pic == Some(vid) {
            self.pic = None;
        }
        self.mmio.retain(|&(_, _, v)| v != vid);
        Ok(slot.pid)
    }

    pub fn device(&self, vid: u8) -> Option<DevSlot> {
        self.devs.get(vid as usize).copied().flatten()
    }

    /// The device a process is attached as, if any.
    pub fn device_of(&self, pid: Pid) -> Option<u8> {
        self.devs
            .iter()
            .position(|d| d.map(|d| d.pid) == Some(pid))
            .map(|v| v as u8)
    }

    /// Claim a guest port, both directions. Fails `Busy` if either
    /// direction already belongs to another device.
    pub fn register_ioport(&mut self, port: u16, width: DataSz, vid: u8) -> Result<(), HvmError> {
        self.check_vid(vid)?;
        let p = port as usize;
        for tab in [&self.ioport_read, &self.ioport_write] {
            if tab[p].is_some_and(|(v, _)| v != vid) {
                return Err(HvmError::Busy);
            }
        }
        self.ioport_read[p] = Some((vid, width));
        self.ioport_write[p] = Some((vid, width));
        Ok(())
    }

    pub fn unregister_ioport(&mut self, port: u16, vid: u8) -> Result<(), HvmError> {
        self.check_vid(vid)?;
        let p = port as usize;
        for tab in [&mut self.ioport_read, &mut self.ioport_write] {
            match tab[p] {
                Some((v, _)) if v == vid => tab[p] = None,
                Some(_) => return Err(HvmError::NotOwner),
                None => {}
            }
        }
        Ok(())
    }

    pub fn port_owner(&self, port: u16, write: bool) -> Option<(u8, DataSz)> {
        let tab = if write { &self.ioport_write } else { &self.ioport_read };
        tab.get(port as usize).copied().flatten()
    }

    pub fn register_irq(&mut self, irq: u8, vid: u8) -> Result<(), HvmError> {
        self.check_vid(vid)?;
        if self.irq[irq as usize].is_some() {
            return Err(HvmError::Busy);
        }
        self.irq[irq as usize] = Some(vid);
        Ok(())
    }

    pub fn unregister_irq(&mut self, irq: u8, vid: u8) -> Result<(), HvmError> {
        match self.irq[irq as usize] {
            Some(v) if v == vid => {
                self.irq[irq as usize] = None;
                Ok(())
            }
            Some(_) => Err(HvmError::NotOwner),
            None => Ok(()),
        }
    }

    pub fn irq_owner(&self, irq: u8) -> Option<u8> {
        self.irq.get(irq as usize).copied().flatten()
    }

    pub fn register_pic(&mut self, vid: u8) -> Result<(), HvmError> {
        self.check_vid(vid)?;
        if self.pic.is_some() {
            return Err(HvmError::Busy);
        }
        self.pic = Some(vid);
        Ok(())
    }

    pub fn unregister_pic(&mut self, vid: u8) -> Result<(), HvmError> {
        match self.pic {
            Some(v) if v == vid => {
                self.pic = None;
                Ok(())
            }
            Some(_) => Err(HvmError::NotOwner),
            None => Ok(()),
        }
    }

    pub fn pic_owner(&self) -> Option<u8> {
        self.pic
    }

    pub fn register_mmio(&mut self, start: u32, len: u32, vid: u8) -> Result<(), HvmError> {
        self.check_vid(vid)?;
        if len == 0 || start.checked_add(len).is_none() {
            return Err(HvmError::BadArg);
        }
        let end = start + len;
        if self
            .mmio
            .iter()
            .any(|&(s, l, _)| start < s + l && s < end)
        {
            return Err(HvmError::Busy);
        }
        self.mmio.push((start, len, vid));
        Ok(())
    }

    pub fn unregister_mmio(&mut self, start: u32, vid: u8) -> Result<(), HvmError> {
        let before = self.mmio.len();
        self.mmio.retain(|&(s, _, v)| !(s == start && v == vid));
        if self.mmio.len() == before {
            return Err(HvmError::NotOwner);
        }
        Ok(())
    }

    pub fn mmio_owner(&self, gpa: u32) -> Option<u8> {
        self.mmio
            .iter()
            .find(|&&(s, l, _)| (s..s + l).contains(&gpa))
            .map(|&(_, _, v)| v)
    }

    pub fn mark_ready(&mut self, vid: u8) -> Result<(), HvmError> {
        match self.devs.get_mut(vid as usize).and_then(Option::as_mut) {
            Some(d) => {
                d.ready = true;
                Ok(())
            }
            None => Err(HvmError::NoSlot),
        }
    }

    pub fn all_ready(&self) -> bool {
        self.devs.iter().flatten().all(|d| d.ready)
    }

    fn check_vid(&self, vid: u8) -> Result<(), HvmError> {
        if self.device(vid).is_none() {
            return Err(HvmError::NoSlot);
        }
        Ok(())
    }
}

/// Guest port read, forwarded to the owning device: send READ_IOPORT,
/// block until the IOPORT_DATA reply lands on the same channel. Exactly
/// one reply is consumed per request before the VM resumes.
pub(super) fn forward_read(
    s: &VmSlot,
    vid: u8,
    port: u16,
    width: DataSz,
    vm_owner: Pid,
) -> Result<u32, HvmError> {
    let dev = s.vdev.lock().device(vid).ok_or(HvmError::NoSlot)?;
    let req = IoportMsg {
        magic: VDEV_READ_IOPORT,
        port,
        width,
        val: 0,
    };
    ipc::send(dev.req_ch, Some(vm_owner), &req.encode(), true).map_err(|_| HvmError::ExitFault)?;

    let mut buf = [0u8; VDEV_MSG_LEN];
    let n = ipc::recv(dev.req_ch, Some(vm_owner), &mut buf, true)
        .map_err(|_| HvmError::ExitFault)?;
    let reply = IoportMsg::decode(&buf[..n])?;
    if reply.magic != VDEV_GUEST_IOPORT_DATA || reply.port != port {
        return Err(HvmError::ExitFault);
    }
    Ok(reply.val & width.mask())
}

/// Guest port write: send WRITE_IOPORT and continue; no reply.
pub(super) fn forward_write(
    s: &VmSlot,
    vid: u8,
    port: u16,
    width: DataSz,
    val: u32,
    vm_owner: Pid,
) -> Result<(), HvmError> {
    let dev = s.vdev.lock().device(vid).ok_or(HvmError::NoSlot)?;
    let req = IoportMsg {
        magic: VDEV_WRITE_IOPORT,
        port,
        width,
        val: val & width.mask(),
    };
    ipc::send(dev.req_ch, Some(vm_owner), &req.encode(), true).map_err(|_| HvmError::ExitFault)
}

/// Block until every attached device has sent DEVICE_READY on its sync
/// channel.
pub fn wait_all_devices_ready(vmid: usize, vm_owner: Pid) -> Result<(), HvmError> {
    loop {
        let pending: Vec<(u8, ChannelId)> = super::with_vdev(vmid, |vd| {
            (0..MAX_VDEV as u8)
                .filter_map(|vid| vd.device(vid).filter(|d| !d.ready).map(|d| (vid, d.sync_ch)))
                .collect()
        })?;
        if pending.is_empty() {
            return Ok(());
        }
        for (vid, sync_ch) in pending {
            let mut buf = [0u8; VDEV_MSG_LEN];
            let n = ipc::recv(sync_ch, Some(vm_owner), &mut buf, true)
                .map_err(|_| HvmError::ExitFault)?;
            if peek_magic(&buf[..n]) == Some(VDEV_DEVICE_READY) {
                super::with_vdev(vmid, |vd| vd.mark_ready(vid))??;
            }
        }
    }
}

/// Ask every device to synchronize with its host counterpart and wait
/// for each acknowledgement, one device at a time.
pub fn sync_devices(vmid: usize, vm_owner: Pid) -> Result<(), HvmError> {
    let devs: Vec<ChannelId> = super::with_vdev(vmid, |vd| {
        (0..MAX_VDEV as u8)
            .filter_map(|vid| vd.device(vid).map(|d| d.sync_ch))
            .collect()
    })?;
    for sync_ch in devs {
        ipc::send(sync_ch, Some(vm_owner), &encode_magic(VDEV_DEVICE_SYNC), true)
            .map_err(|_| HvmError::ExitFault)?;
        let mut buf = [0u8; VDEV_MSG_LEN];
        ipc::recv(sync_ch, Some(vm_owner), &mut buf, true).map_err(|_| HvmError::ExitFault)?;
    }
    Ok(())
}
