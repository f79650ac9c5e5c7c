//! Processes.
//!
//! A fixed table of process control blocks, each owning a user address
//! space, a kernel stack page, a saved user context, and a syscall
//! scratch page. Creation and ELF exec live here; scheduling policy is
//! in `sched`.

pub mod elf;
pub mod sched;

extern crate alloc;

use alloc::boxed::Box;

pub use crate::error::ProcError;
use crate::{
    arch::x86::{kctx, percpu::Kstack, trapframe::TrapFrame},
    config::{MAX_CPU, MAX_PID},
    mm::{AddrSpace, FrameNumber, PhysPool, Pmap, PteFlags, PAGE_SIZE, VM_STACKHI},
    sync::SpinLock,
};

/// Process identifier: an index into the process table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Pid(pub u32);

impl core::fmt::Display for Pid {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Scheduler-visible process state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcState {
    /// Created but not yet handed to a scheduler.
    Inited,
    Ready,
    Running,
    Sleeping,
    Dead,
}

/// A process control block.
pub struct Process {
    pub pid: Pid,
    pub state: ProcState,
    /// The CPU this process is pinned to. Never changes after
    /// `sched::add`; there is no migration.
    pub cpu: usize,
    pub space: Option<AddrSpace>,
    pub kstack: Option<Box<Kstack>>,
    /// Saved kernel context, as an address into the kstack page.
    pub kctx: usize,
    /// Saved user context, written by the trap path.
    pub uctx: TrapFrame,
    /// Scratch page for syscall argument shuttling.
    pub sysbuf: Option<FrameNumber>,
    pub parent: Option<Pid>,
    /// Channel to the parent, when the parent created one at spawn.
    pub parent_ch: Option<crate::ipc::ChannelId>,
    /// Wait channel while sleeping.
    pub wchan: usize,
    /// VM this process owns, if it called allocvm.
    pub vmid: Option<usize>,
    /// Virtual-device binding: (vmid, vdev id).
    pub vdev: Option<(usize, u8)>,
}

type Slot = Option<Process>;

#[allow(clippy::declare_interior_mutable_const)]
const SLOT_INIT: SpinLock<Slot> = SpinLock::new(None);

static PROC_TABLE: [SpinLock<Slot>; MAX_PID] = [SLOT_INIT; MAX_PID];

/// Run `f` against the live process `pid`, if there is one.
pub fn with_proc<R>(pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
    let idx = pid.0 as usize;
    if idx >= MAX_PID {
        return None;
    }
    let mut slot = PROC_TABLE[idx].lock();
    slot.as_mut().map(f)
}

/// State of `pid` without keeping the slot locked.
pub fn state_of(pid: Pid) -> Option<ProcState> {
    with_proc(pid, |p| p.state)
}

/// Is the slot dead or vacant? Channels use this to detect gone peers.
pub fn is_gone(pid: Pid) -> bool {
    !matches!(
        state_of(pid),
        Some(ProcState::Inited | ProcState::Ready | ProcState::Running | ProcState::Sleeping)
    )
}

/// Allocate a PCB pinned to `cpu`: user address space, kernel stack,
/// syscall scratch page, and a one-page user stack just below
/// `VM_STACKHI`.
pub fn proc_new(pool: &PhysPool, kernel: &Pmap, cpu: usize) -> Result<Pid, ProcError> {
    assert!(cpu < MAX_CPU);

    let space = AddrSpace::new_user(pool, kernel)?;
    space.reserve(
        pool,
        VM_STACKHI - PAGE_SIZE as u32,
        PteFlags::W | PteFlags::U,
    )?;

    let sysbuf = match pool.alloc_page() {
        Ok(f) => f,
        Err(e) => {
            space.destroy(pool);
            return Err(e.into());
        }
    };
    pool.incref(sysbuf);

    let mut kstack = Box::new(Kstack::empty());
    kstack.setup(cpu as u32);

    for (idx, slot) in PROC_TABLE.iter().enumerate() {
        let mut guard = slot.lock();
        if guard.is_none() {
            let pid = Pid(idx as u32);
            *guard = Some(Process {
                pid,
                state: ProcState::Inited,
                cpu,
                space: Some(space),
                kstack: Some(kstack),
                kctx: 0,
                uctx: TrapFrame::default(),
                sysbuf: Some(sysbuf),
                parent: None,
                parent_ch: None,
                wchan: 0,
                vmid: None,
                vdev: None,
            });
            return Ok(pid);
        }
    }

    // Table full; give the resources back.
    pool.decref(sysbuf);
    space.destroy(pool);
    Err(ProcError::NoSlot)
}

/// Load an ELF image into `pid`'s address space and point its user
/// context at the entry with a fresh stack.
pub fn proc_exec<S: elf::ImageSource + ?Sized>(
    pool: &PhysPool,
    pid: Pid,
    src: &S,
) -> Result<(), ProcError> {
    // Load outside the slot lock would race exec/exit; the table lock
    // is per-slot and the loader only touches this process's space.
    with_proc(pid, |p| {
        let space = p.space.as_ref().ok_or(ProcError::NotFound)?;
        let entry = elf::load(pool, space, src)?;
        p.uctx = TrapFrame::new_user(entry, VM_STACKHI);
        if let Some(ks) = p.kstack.as_mut() {
            p.kctx = kctx::prepare(ks, proc_start) as usize;
        }
        Ok(())
    })
    .unwrap_or(Err(ProcError::NotFound))
}

/// Create a process on `cpu` from an image and queue it.
pub fn proc_spawn<S: elf::ImageSource + ?Sized>(
    pool: &PhysPool,
    kernel: &Pmap,
    cpu: usize,
    src: &S,
    parent: Option<Pid>,
) -> Result<Pid, ProcError> {
    let pid = proc_new(pool, kernel, cpu)?;
    if let Err(e) = proc_exec(pool, pid, src) {
        proc_destroy(pool, pid);
        return Err(e);
    }
    with_proc(pid, |p| p.parent = parent);
    sched::add(pid, cpu);
    Ok(pid)
}

/// Tear a process down and release everything it owns. The slot is
/// vacated; queues are purged by the scheduler side.
pub fn proc_destroy(pool: &PhysPool, pid: Pid) {
    sched::purge(pid);
    let idx = pid.0 as usize;
    let mut slot = PROC_TABLE[idx].lock();
    if let Some(p) = slot.take() {
        if let Some(space) = p.space {
            space.destroy(pool);
        }
        if let Some(buf) = p.sysbuf {
            pool.decref(buf);
        }
        log::info!("proc: pid {} destroyed", pid);
    }
}

/// The process currently running on this CPU.
pub fn current() -> Option<Pid> {
    sched::current(crate::arch::cpu_id())
}

/// First leg of a fresh process: runs on the new kernel stack right
/// after the first context switch and drops into the saved user
/// context.
extern "C" fn proc_start() -> ! {
    proc_start_impl()
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn proc_start_impl() -> ! {
    let pid = current().expect("ctx_start with no current process");
    crate::trap::ctx_start(pid)
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn proc_start_impl() -> ! {
    unreachable!("proc_start on the host")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil;

    fn boot(pool: &'static crate::mm::PhysPool) -> Pmap {
        Pmap::new_kernel(pool).unwrap()
    }

    #[test]
    fn proc_new_wires_up_the_standard_resources() {
        let pool = testutil::pool(96);
        let kernel = boot(pool);
        let pid = proc_new(pool, &kernel, 1).unwrap();

        with_proc(pid, |p| {
            assert_eq!(p.state, ProcState::Inited);
            assert_eq!(p.cpu, 1);
            assert!(p.sysbuf.is_some());
            let space = p.space.as_ref().unwrap();
            // The user stack page is in place, writable, user.
            let pte = space
                .lookup(pool, VM_STACKHI - PAGE_SIZE as u32)
                .expect("stack page mapped");
            assert!(pte & PteFlags::W.bits() != 0);
            assert!(pte & PteFlags::U.bits() != 0);
            assert!(p.kstack.as_ref().unwrap().magic_ok());
        })
        .unwrap();

        proc_destroy(pool, pid);
        assert!(is_gone(pid));
    }

    #[test]
    fn exec_points_the_user_context_at_the_image() {
        let pool = testutil::pool(96);
        let kernel = boot(pool);
        let pid = proc_new(pool, &kernel, 0).unwrap();

        let image = elf::build_image(0x4100_0000, &[0xEB, 0xFE], false);
        proc_exec(pool, pid, &image.as_slice()).unwrap();

        with_proc(pid, |p| {
            assert_eq!(p.uctx.eip, 0x4100_0000);
            assert_eq!(p.uctx.esp, VM_STACKHI);
            assert!(p.uctx.from_user());
            assert_ne!(p.kctx, 0, "kernel context seeded for the first switch");
        })
        .unwrap();
        proc_destroy(pool, pid);
    }

    #[test]
    fn destroy_returns_every_frame() {
        let pool = testutil::pool(96);
        let kernel = boot(pool);
        let free0 = pool.free_frames();
        let pid = proc_new(pool, &kernel, 0).unwrap();
        let image = elf::build_image(0x4100_0000, &[0x90; 64], true);
        proc_exec(pool, pid, &image.as_slice()).unwrap();
        proc_destroy(pool, pid);
        assert_eq!(pool.free_frames(), free0);
    }

    #[test]
    fn slots_are_reusable_after_destroy() {
        let pool = testutil::pool(96);
        let kernel = boot(pool);
        let a = proc_new(pool, &kernel, 0).unwrap();
        proc_destroy(pool, a);
        let b = proc_new(pool, &kernel, 0).unwrap();
        assert!(state_of(b).is_some());
        proc_destroy(pool, b);
    }
}
