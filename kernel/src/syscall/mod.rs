//! The system-call surface.
//!
//! Software interrupt 48. The opcode rides in EAX, up to four arguments
//! in EBX/ECX/EDX/ESI, and the result code comes back in EAX with zero
//! for success. Out-parameters are written through the caller's address
//! space after the usual range checks. The legacy management-plane
//! calls at the end of the table are aliases over the structured
//! surface and share its handlers and error codes.

extern crate alloc;

use crate::{
    arch::x86::{cpu, trapframe::TrapFrame},
    config::CHANNEL_BUFFER_SIZE,
    error::KernelError,
    hvm::{self, vpic::IrqMode, DataSz},
    ipc,
    mm::{page_down, PhysPool, Pmap, PteFlags, VM_USERHI, VM_USERLO},
    proc::{self, elf::UserImage, sched, Pid, ProcState},
};

/// Opcode table, in ABI order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    Puts = 0,
    Getc,
    Spawn,
    Yield,
    Getpid,
    Ncpus,
    Getpchid,
    Send,
    Recv,
    RecvNonblock,
    RegisterIoport,
    UnregisterIoport,
    RegisterIrq,
    UnregisterIrq,
    RegisterPic,
    UnregisterPic,
    RegisterMmio,
    UnregisterMmio,
    ReadIoport,
    WriteIoport,
    RaiseIrq,
    TriggerIrq,
    LowerIrq,
    NotifyIrq,
    ReadGuestTsc,
    GuestTscFreq,
    GuestMemSize,
    Getchid,
    Allocvm,
    Execvm,
    MgmtStart,
    MgmtStop,
    MgmtAllocpage,
}

impl Syscall {
    pub fn from_u32(v: u32) -> Option<Self> {
        if v > Syscall::MgmtAllocpage as u32 {
            return None;
        }
        // SAFETY: The enum is repr(u32), dense from 0, and v is bounded
        // by the last discriminant.
        Some(unsafe { core::mem::transmute::<u32, Syscall>(v) })
    }
}

/// Trap-handler entry: decode, execute, stash the result code in EAX.
pub fn dispatch(tf: &mut TrapFrame) -> Result<(), KernelError> {
    let op = Syscall::from_u32(tf.regs.eax);
    let args = [tf.regs.ebx, tf.regs.ecx, tf.regs.edx, tf.regs.esi];

    let result = match op {
        Some(op) => execute(op, args),
        None => Err(KernelError::BadArg),
    };

    tf.regs.eax = match result {
        Ok(()) => 0,
        Err(e) => e.code(),
    };
    // Syscall failures are reported to the caller, never fatal here.
    Ok(())
}

fn current_pid() -> Result<Pid, KernelError> {
    proc::current().ok_or(KernelError::BadArg)
}

/// Run `f` with the calling process's pmap root handed out as a raw
/// borrow. The pmap lives in the PCB; the slot lock cannot be held
/// across channel sleeps, so handlers re-resolve per call.
fn with_caller_pmap<R>(
    pid: Pid,
    f: impl FnOnce(&Pmap) -> R,
) -> Result<R, KernelError> {
    proc::with_proc(pid, |p| p.space.as_ref().map(|s| f(s.pmap())))
        .flatten()
        .ok_or(KernelError::BadArg)
}

fn check_user_range(va: u32, size: u32) -> Result<(), KernelError> {
    let end = va.checked_add(size).ok_or(KernelError::BadArg)?;
    if va < VM_USERLO || end > VM_USERHI {
        return Err(KernelError::BadArg);
    }
    Ok(())
}

/// Write a u32 through the caller's page map.
fn put_user_u32(pool: &PhysPool, pid: Pid, va: u32, val: u32) -> Result<(), KernelError> {
    check_user_range(va, 4)?;
    with_caller_pmap(pid, |pmap| {
        if !pmap.checkrange(pool, va, 4) {
            return Err(KernelError::NotPresent);
        }
        let bytes = val.to_le_bytes();
        for (i, b) in bytes.iter().enumerate() {
            let cur = va + i as u32;
            let pte = pmap.lookup(pool, cur).ok_or(KernelError::NotPresent)?;
            // SAFETY: The PTE resolves into a pool frame.
            unsafe {
                *pool
                    .frame_ptr(crate::mm::FrameNumber::new(pte >> 12))
                    .add(crate::mm::page_off(cur) as usize) = *b;
            }
        }
        Ok(())
    })?
}

fn put_user_u64(pool: &PhysPool, pid: Pid, va: u32, val: u64) -> Result<(), KernelError> {
    put_user_u32(pool, pid, va, val as u32)?;
    put_user_u32(pool, pid, va + 4, (val >> 32) as u32)
}

/// The caller's vdev binding, registering it on first use. A process
/// becomes a virtual device of its parent's VM, with the parent channel
/// as the request channel and a freshly allocated sync channel.
fn ensure_vdev(pid: Pid) -> Result<(usize, u8), KernelError> {
    if let Some(binding) = proc::with_proc(pid, |p| p.vdev).flatten() {
        return Ok(binding);
    }
    let (parent, req_ch) = proc::with_proc(pid, |p| (p.parent, p.parent_ch))
        .ok_or(KernelError::BadArg)?;
    let parent = parent.ok_or(KernelError::Permission)?;
    let req_ch = req_ch.ok_or(KernelError::Permission)?;
    let vmid = proc::with_proc(parent, |p| p.vmid)
        .flatten()
        .ok_or(KernelError::Permission)?;
    let sync_ch = ipc::alloc(Some(parent), Some(pid), CHANNEL_BUFFER_SIZE)
        .map_err(KernelError::from)?;
    let vid = hvm::register_device(vmid, pid, req_ch, sync_ch)?;
    Ok((vmid, vid))
}

fn vdev_binding(pid: Pid) -> Result<(usize, u8), KernelError> {
    proc::with_proc(pid, |p| p.vdev)
        .flatten()
        .ok_or(KernelError::Permission)
}

fn set_irq_mode(pid: Pid, irq: u32, mode: IrqMode) -> Result<(), KernelError> {
    let (vmid, vid) = vdev_binding(pid)?;
    if irq > 0xFF {
        return Err(KernelError::BadArg);
    }
    hvm::set_irq(vmid, vid, irq as u8, mode).map_err(KernelError::from)
}

fn execute(op: Syscall, args: [u32; 4]) -> Result<(), KernelError> {
    let pool = crate::mm::pool();
    let pid = current_pid()?;

    match op {
        Syscall::Puts => {
            let (va, len) = (args[0], args[1]);
            if len == 0 || len > 4096 {
                return Err(KernelError::BadArg);
            }
            check_user_range(va, len)?;
            let mut buf = alloc::vec![0u8; len as usize];
            let copied = with_caller_pmap(pid, |pmap| {
                let mut done = 0usize;
                while done < len as usize {
                    let cur = va + done as u32;
                    let Some(pte) = pmap.lookup(pool, cur) else {
                        return done;
                    };
                    let off = crate::mm::page_off(cur) as usize;
                    let chunk = (len as usize - done).min(crate::mm::PAGE_SIZE - off);
                    // SAFETY: Resolved pool frame, chunk within page.
                    unsafe {
                        let src = pool
                            .frame_ptr(crate::mm::FrameNumber::new(pte >> 12))
                            .add(off);
                        core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk);
                    }
                    done += chunk;
                }
                done
            })?;
            if copied != len as usize {
                return Err(KernelError::NotPresent);
            }
            crate::dev::console_puts(&buf);
            Ok(())
        }
        Syscall::Getc => {
            let c = crate::dev::console().getc().map(u32::from).unwrap_or(u32::MAX);
            put_user_u32(pool, pid, args[0], c)
        }
        Syscall::Spawn => {
            let [cpu_idx, image_va, image_len, out_pid] = args;
            if cpu_idx as usize >= crate::config::MAX_CPU {
                return Err(KernelError::BadArg);
            }
            if image_len == 0 || image_len > 4 * 1024 * 1024 {
                return Err(KernelError::BadArg);
            }
            let kernel = crate::mm::kernel_pmap();
            // Snapshot the image into kernel memory first; spawning
            // scans the process table and must not run under the
            // caller's slot lock.
            let image = with_caller_pmap(pid, |pmap| {
                let img = UserImage::new(pool, pmap, image_va, image_len)
                    .map_err(KernelError::from)?;
                let mut buf = alloc::vec![0u8; image_len as usize];
                use proc::elf::ImageSource;
                img.read_at(0, &mut buf).map_err(KernelError::from)?;
                Ok::<_, KernelError>(buf)
            })??;
            let child =
                proc::proc_spawn(pool, kernel, cpu_idx as usize, &image.as_slice(), Some(pid))
                    .map_err(KernelError::from)?;
            // Wire the parent channel before the child first runs.
            let chid = ipc::alloc(Some(pid), Some(child), CHANNEL_BUFFER_SIZE)
                .map_err(KernelError::from)?;
            proc::with_proc(child, |p| p.parent_ch = Some(chid));
            if out_pid != 0 {
                put_user_u32(pool, pid, out_pid, child.0)?;
            }
            Ok(())
        }
        Syscall::Yield => {
            sched::yield_cpu();
            Ok(())
        }
        Syscall::Getpid => put_user_u32(pool, pid, args[0], pid.0),
        Syscall::Ncpus => put_user_u32(
            pool,
            pid,
            args[0],
            crate::arch::percpu::ncpu() as u32,
        ),
        Syscall::Getpchid => {
            let chid = proc::with_proc(pid, |p| p.parent_ch)
                .flatten()
                .ok_or(KernelError::NoSlot)?;
            put_user_u32(pool, pid, args[0], chid.0)
        }
        Syscall::Send | Syscall::Recv | Syscall::RecvNonblock => {
            let [chid, va, size, out_size] = args;
            let id = ipc::ChannelId(chid);
            if size == 0 {
                return Err(KernelError::BadArg);
            }
            // The channel layer copies through the caller's pmap; the
            // pmap reference cannot be held across a blocking sleep, so
            // resolve the root and rebuild the borrow below it.
            let root = proc::with_proc(pid, |p| p.space.as_ref().map(|s| s.root()))
                .flatten()
                .ok_or(KernelError::BadArg)?;
            let pmap = Pmap::from_root(root);
            match op {
                Syscall::Send => {
                    ipc::send_user(pool, &pmap, id, pid, va, size as usize, true)
                        .map_err(KernelError::from)
                }
                Syscall::Recv | Syscall::RecvNonblock => {
                    let blocking = op == Syscall::Recv;
                    let n = ipc::recv_user(pool, &pmap, id, pid, va, size as usize, blocking)
                        .map_err(KernelError::from)?;
                    if out_size != 0 {
                        put_user_u32(pool, pid, out_size, n as u32)?;
                    }
                    Ok(())
                }
                _ => unreachable!(),
            }
        }
        Syscall::RegisterIoport => {
            let (vmid, vid) = ensure_vdev(pid)?;
            let port = u16::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            let width = DataSz::from_u8(args[1] as u8).ok_or(KernelError::BadArg)?;
            hvm::with_vdev(vmid, |vd| vd.register_ioport(port, width, vid))?
                .map_err(KernelError::from)
        }
        Syscall::UnregisterIoport => {
            let (vmid, vid) = vdev_binding(pid)?;
            let port = u16::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            hvm::with_vdev(vmid, |vd| vd.unregister_ioport(port, vid))?
                .map_err(KernelError::from)
        }
        Syscall::RegisterIrq => {
            let (vmid, vid) = ensure_vdev(pid)?;
            let irq = u8::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            hvm::with_vdev(vmid, |vd| vd.register_irq(irq, vid))?.map_err(KernelError::from)
        }
        Syscall::UnregisterIrq => {
            let (vmid, vid) = vdev_binding(pid)?;
            let irq = u8::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            hvm::with_vdev(vmid, |vd| vd.unregister_irq(irq, vid))?.map_err(KernelError::from)
        }
        Syscall::RegisterPic => {
            let (vmid, vid) = ensure_vdev(pid)?;
            hvm::with_vdev(vmid, |vd| vd.register_pic(vid))?.map_err(KernelError::from)
        }
        Syscall::UnregisterPic => {
            let (vmid, vid) = vdev_binding(pid)?;
            hvm::with_vdev(vmid, |vd| vd.unregister_pic(vid))?.map_err(KernelError::from)
        }
        Syscall::RegisterMmio => {
            let (vmid, vid) = ensure_vdev(pid)?;
            hvm::with_vdev(vmid, |vd| vd.register_mmio(args[0], args[1], vid))?
                .map_err(KernelError::from)
        }
        Syscall::UnregisterMmio => {
            let (vmid, vid) = vdev_binding(pid)?;
            hvm::with_vdev(vmid, |vd| vd.unregister_mmio(args[0], vid))?
                .map_err(KernelError::from)
        }
        Syscall::ReadIoport => {
            // Host port access on behalf of a device process.
            vdev_binding(pid)?;
            let port = u16::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            let width = DataSz::from_u8(args[1] as u8).ok_or(KernelError::BadArg)?;
            let val = match width {
                DataSz::Sz8 => cpu::inb(port) as u32,
                DataSz::Sz16 => cpu::inw(port) as u32,
                DataSz::Sz32 => cpu::inl(port),
            };
            put_user_u32(pool, pid, args[2], val)
        }
        Syscall::WriteIoport => {
            vdev_binding(pid)?;
            let port = u16::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            let width = DataSz::from_u8(args[1] as u8).ok_or(KernelError::BadArg)?;
            match width {
                DataSz::Sz8 => cpu::outb(port, args[2] as u8),
                DataSz::Sz16 => cpu::outw(port, args[2] as u16),
                DataSz::Sz32 => cpu::outl(port, args[2]),
            }
            Ok(())
        }
        Syscall::RaiseIrq => set_irq_mode(pid, args[0], IrqMode::Raise),
        Syscall::TriggerIrq => set_irq_mode(pid, args[0], IrqMode::Trigger),
        Syscall::LowerIrq => set_irq_mode(pid, args[0], IrqMode::Lower),
        Syscall::NotifyIrq => {
            let (vmid, vid) = vdev_binding(pid)?;
            let irq = u8::try_from(args[0]).map_err(|_| KernelError::BadArg)?;
            hvm::notify_irq(vmid, vid, irq).map_err(KernelError::from)
        }
        Syscall::ReadGuestTsc => {
            let vmid = bound_vmid(pid)?;
            let tsc = hvm::guest_tsc(vmid)?;
            put_user_u64(pool, pid, args[0], tsc)
        }
        Syscall::GuestTscFreq => put_user_u64(pool, pid, args[0], hvm::guest_tsc_freq()),
        Syscall::GuestMemSize => {
            let vmid = bound_vmid(pid)?;
            put_user_u32(pool, pid, args[0], hvm::guest_mem_size(vmid)?)
        }
        Syscall::Getchid => {
            let (vmid, vid) = vdev_binding(pid)?;
            let sync_ch = hvm::with_vdev(vmid, |vd| vd.device(vid).map(|d| d.sync_ch))?
                .ok_or(KernelError::NoSlot)?;
            put_user_u32(pool, pid, args[0], sync_ch.0)
        }
        Syscall::Allocvm => {
            if proc::with_proc(pid, |p| p.vmid).flatten().is_some() {
                return Err(KernelError::Busy);
            }
            hvm::create_vm(pool_static()?, pid)?;
            Ok(())
        }
        Syscall::Execvm => {
            let vmid = proc::with_proc(pid, |p| p.vmid)
                .flatten()
                .ok_or(KernelError::NoSlot)?;
            hvm::vdev::wait_all_devices_ready(vmid, pid)?;
            hvm::vdev::sync_devices(vmid, pid)?;
            let result = hvm::run_vm(pool, vmid, pid);
            if result.is_err() {
                // The guest is unrecoverable; the slot frees for reuse
                // and the owner sees the error code.
                let _ = hvm::destroy_vm(vmid);
            }
            result.map_err(KernelError::from)
        }
        Syscall::MgmtStart => {
            // Legacy alias: launch a prepared process.
            let target = Pid(args[0]);
            let (state, cpu) = proc::with_proc(target, |p| (p.state, p.cpu))
                .ok_or(KernelError::NoSlot)?;
            if state != ProcState::Inited {
                return Err(KernelError::Busy);
            }
            sched::add(target, cpu);
            Ok(())
        }
        Syscall::MgmtStop => {
            // Legacy alias for kill; only the parent (or the process
            // itself) may stop a process.
            let target = Pid(args[0]);
            let parent = proc::with_proc(target, |p| p.parent).ok_or(KernelError::NoSlot)?;
            if target != pid && parent != Some(pid) {
                return Err(KernelError::NotOwner);
            }
            proc::proc_destroy(pool, target);
            Ok(())
        }
        Syscall::MgmtAllocpage => {
            // Legacy alias for reserve at a caller-chosen address.
            let va = page_down(args[0]);
            check_user_range(va, crate::mm::PAGE_SIZE as u32)?;
            proc::with_proc(pid, |p| {
                let space = p.space.as_ref().ok_or(KernelError::BadArg)?;
                space
                    .reserve(pool, va, PteFlags::W | PteFlags::U)
                    .map_err(KernelError::from)
            })
            .ok_or(KernelError::BadArg)?
        }
    }
}

fn bound_vmid(pid: Pid) -> Result<usize, KernelError> {
    if let Some(vmid) = proc::with_proc(pid, |p| p.vmid).flatten() {
        return Ok(vmid);
    }
    // Devices may query their VM too.
    Ok(vdev_binding(pid)?.0)
}

/// The pool as a 'static borrow for VM creation.
fn pool_static() -> Result<&'static PhysPool, KernelError> {
    Ok(crate::mm::pool())
}
