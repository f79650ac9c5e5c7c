//! The channel pool.
//!
//! A channel is a one-slot mailbox: one message in flight, `empty` and
//! `full` strict complements, declared capacity rounded up to a page
//! multiple at allocation. The single slot is what the device-emulation
//! protocol relies on for its request/reply lockstep; do not grow this
//! into a ring.

extern crate alloc;

use alloc::vec::Vec;

use crate::{
    config::MAX_CHANNEL,
    error::IpcError,
    mm::{page_up, PAGE_SIZE},
    proc::{self, Pid},
    sync::SpinLock,
};

/// Largest capacity a channel may declare, pre-rounding.
pub const MAX_CAPACITY: usize = 16 * PAGE_SIZE;

/// Index into the channel pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelId(pub u32);

pub(super) struct Channel {
    inited: bool,
    p1: Option<Pid>,
    p2: Option<Pid>,
    p1_freed: bool,
    p2_freed: bool,
    cap: usize,
    buf: Vec<u8>,
    full: bool,
    /// Which endpoint filled the slot. A process never receives its
    /// own message; the request/reply lockstep depends on it.
    sent_by: Option<Pid>,
}

impl Channel {
    const fn vacant() -> Self {
        Channel {
            inited: false,
            p1: None,
            p2: None,
            p1_freed: false,
            p2_freed: false,
            cap: 0,
            buf: Vec::new(),
            full: false,
            sent_by: None,
        }
    }

    fn endpoint(&self, pid: Pid) -> bool {
        self.p1 == Some(pid) || self.p2 == Some(pid)
    }

    /// The other endpoint, from `pid`'s point of view.
    fn peer(&self, pid: Pid) -> Option<Pid> {
        if self.p1 == Some(pid) {
            self.p2
        } else if self.p2 == Some(pid) {
            self.p1
        } else {
            None
        }
    }

    /// Non-blocking send. `sender` is None for in-kernel callers, which
    /// bypass the endpoint check.
    pub(super) fn try_send(&mut self, sender: Option<Pid>, msg: &[u8]) -> Result<(), IpcError> {
        if !self.inited {
            return Err(IpcError::NoSlot);
        }
        if msg.is_empty() {
            return Err(IpcError::BadArg);
        }
        if msg.len() > self.cap {
            return Err(IpcError::OverCap);
        }
        if let Some(pid) = sender {
            if !self.endpoint(pid) {
                return Err(IpcError::IllSender);
            }
            if self.peer(pid).is_some_and(proc::is_gone) {
                return Err(IpcError::DeviceGone);
            }
        }
        if self.full {
            return Err(IpcError::Full);
        }
        self.buf.clear();
        self.buf.extend_from_slice(msg);
        self.full = true;
        self.sent_by = sender;
        Ok(())
    }

    /// Non-blocking receive into `buf`; returns the message length.
    /// Messages longer than `buf` are refused, not truncated.
    pub(super) fn try_recv(
        &mut self,
        receiver: Option<Pid>,
        buf: &mut [u8],
    ) -> Result<usize, IpcError> {
        if !self.inited {
            return Err(IpcError::NoSlot);
        }
        if let Some(pid) = receiver {
            if !self.endpoint(pid) {
                return Err(IpcError::IllReceiver);
            }
            // A slot holding the receiver's own outbound message reads
            // as empty from its side.
            let own_msg = self.full && self.sent_by == Some(pid);
            if (!self.full || own_msg) && self.peer(pid).is_some_and(proc::is_gone) {
                return Err(IpcError::DeviceGone);
            }
            if own_msg {
                return Err(IpcError::Empty);
            }
        }
        if !self.full {
            return Err(IpcError::Empty);
        }
        if buf.len() < self.buf.len() {
            return Err(IpcError::OverCap);
        }
        let n = self.buf.len();
        buf[..n].copy_from_slice(&self.buf);
        self.buf.clear();
        self.full = false;
        self.sent_by = None;
        Ok(n)
    }

    pub(super) fn is_full(&self) -> bool {
        self.full
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const CHAN_INIT: SpinLock<Channel> = SpinLock::new(Channel::vacant());

static CHANNELS: [SpinLock<Channel>; MAX_CHANNEL] = [CHAN_INIT; MAX_CHANNEL];

pub(super) fn slot(id: ChannelId) -> Result<&'static SpinLock<Channel>, IpcError> {
    CHANNELS.get(id.0 as usize).ok_or(IpcError::NoSlot)
}

/// Wait-channel key for sleepers on this channel: the pool slot's
/// address, which is stable for the life of the kernel.
pub(super) fn wchan(id: ChannelId) -> usize {
    slot(id).map(|s| s as *const _ as usize).unwrap_or(0)
}

/// Allocate a channel with the given endpoints and declared capacity
/// (rounded up to a page multiple).
pub fn alloc(p1: Option<Pid>, p2: Option<Pid>, capacity: usize) -> Result<ChannelId, IpcError> {
    if capacity == 0 || capacity > MAX_CAPACITY {
        return Err(IpcError::BadArg);
    }
    let cap = page_up(capacity as u32) as usize;
    for (idx, lock) in CHANNELS.iter().enumerate() {
        let mut ch = lock.lock();
        if ch.inited {
            continue;
        }
        *ch = Channel {
            inited: true,
            p1,
            p2,
            p1_freed: false,
            p2_freed: false,
            cap,
            buf: Vec::with_capacity(cap),
            full: false,
            sent_by: None,
        };
        return Ok(ChannelId(idx as u32));
    }
    Err(IpcError::NoSlot)
}

/// Release one endpoint's hold. The slot is recycled once both ends
/// have freed it; sleepers are kicked first so nothing keeps waiting on
/// a vacant slot.
pub fn free(id: ChannelId, by: Pid) {
    let Ok(lock) = slot(id) else { return };
    let mut ch = lock.lock();
    if !ch.inited {
        return;
    }
    if ch.p1 == Some(by) {
        ch.p1_freed = true;
    } else if ch.p2 == Some(by) {
        ch.p2_freed = true;
    } else {
        return;
    }
    let both = (ch.p1_freed || ch.p1.is_none()) && (ch.p2_freed || ch.p2.is_none());
    if both {
        *ch = Channel::vacant();
        drop(ch);
        crate::proc::sched::wake(wchan(id));
    }
}

/// Capacity of a live channel.
pub fn capacity(id: ChannelId) -> Result<usize, IpcError> {
    let ch = slot(id)?.lock();
    if !ch.inited {
        return Err(IpcError::NoSlot);
    }
    Ok(ch.cap)
}
