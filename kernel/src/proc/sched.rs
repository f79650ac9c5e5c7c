//! The per-CPU scheduler.
//!
//! One round-robin scheduler per processor. Processes are pinned: a PCB
//! joins exactly one CPU's queues at `add` and never migrates. Each
//! scheduler keeps a FIFO ready queue, a sleep queue keyed by wait
//! channel (any word-sized key), and a dead queue. The timer tick
//! charges the running process; once it has consumed its slice and the
//! ready queue is non-empty it is rotated out.

extern crate alloc;

use alloc::collections::VecDeque;
use alloc::vec::Vec;

use super::{with_proc, Pid, ProcState};
use crate::{
    config::{MAX_CPU, SCHED_SLICE},
    sync::{SpinLock, SpinLockGuard},
};

struct Sched {
    cur: Option<Pid>,
    /// Ticks the current process has run since it was chosen.
    run_ticks: u64,
    rdyq: VecDeque<Pid>,
    /// Sleeping processes and the channel each waits on.
    slpq: Vec<(Pid, usize)>,
    deadq: VecDeque<Pid>,
    need_resched: bool,
}

impl Sched {
    const fn new() -> Self {
        Sched {
            cur: None,
            run_ticks: 0,
            rdyq: VecDeque::new(),
            slpq: Vec::new(),
            deadq: VecDeque::new(),
            need_resched: false,
        }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const SCHED_INIT: SpinLock<Sched> = SpinLock::new(Sched::new());

static SCHEDULERS: [SpinLock<Sched>; MAX_CPU] = [SCHED_INIT; MAX_CPU];

/// Hand a fresh process to its pinned CPU's ready queue.
pub fn add(pid: Pid, cpu: usize) {
    let mut sched = SCHEDULERS[cpu].lock();
    with_proc(pid, |p| {
        assert_eq!(p.state, ProcState::Inited, "add of a non-fresh process");
        p.state = ProcState::Ready;
        p.cpu = cpu;
    });
    sched.rdyq.push_back(pid);
}

/// The process currently running on `cpu`.
pub fn current(cpu: usize) -> Option<Pid> {
    SCHEDULERS[cpu].lock().cur
}

/// Timer-tick accounting. Marks the CPU for rescheduling once the
/// running process has burned its slice and someone else is ready.
pub fn tick(cpu: usize) {
    let mut sched = SCHEDULERS[cpu].lock();
    sched.run_ticks += 1;
    if sched.run_ticks > SCHED_SLICE && !sched.rdyq.is_empty() {
        sched.need_resched = true;
    }
}

/// Does the trap-return path owe the CPU a reschedule?
pub fn need_resched(cpu: usize) -> bool {
    SCHEDULERS[cpu].lock().need_resched
}

/// Pick the next process for `cpu`, per round-robin policy. Updates
/// process states and the `cur` pointer; the caller is the context-
/// switch layer, which swaps kernel stacks when the choice changed.
///
/// With `force`, a new pick happens even inside the slice.
pub fn resched(cpu: usize, force: bool) -> Option<Pid> {
    let mut sched = SCHEDULERS[cpu].lock();
    sched.need_resched = false;

    let cur_running = sched
        .cur
        .and_then(super::state_of)
        .is_some_and(|s| s == ProcState::Running);

    let pick_new = if !cur_running {
        true
    } else {
        (force || sched.run_ticks > SCHED_SLICE) && !sched.rdyq.is_empty()
    };

    if !pick_new {
        return sched.cur;
    }

    // A still-running current process rotates to the queue tail.
    if cur_running {
        let cur = sched.cur.unwrap();
        with_proc(cur, |p| p.state = ProcState::Ready);
        sched.rdyq.push_back(cur);
    }

    let next = sched.rdyq.pop_front();
    sched.cur = next;
    sched.run_ticks = 0;
    if let Some(pid) = next {
        with_proc(pid, |p| {
            debug_assert_eq!(p.cpu, cpu, "process scheduled on a foreign CPU");
            p.state = ProcState::Running;
            if let Some(ks) = p.kstack.as_mut() {
                ks.set_cpu_id(cpu as u32);
            }
        });
    }
    next
}

/// Put `pid` to sleep on `wchan`. The caller's lock, if any, is
/// released only after the process is queued, closing the wake-up race.
/// On return (after wake) the caller must re-take its lock itself.
pub fn sleep<T>(pid: Pid, wchan: usize, guard: Option<SpinLockGuard<'_, T>>) {
    let cpu = {
        let mut target = None;
        with_proc(pid, |p| {
            p.state = ProcState::Sleeping;
            p.wchan = wchan;
            target = Some(p.cpu);
        });
        target.expect("sleep of a vacant pid")
    };
    {
        let mut sched = SCHEDULERS[cpu].lock();
        if !sched.slpq.iter().any(|&(p, _)| p == pid) {
            sched.slpq.push((pid, wchan));
        }
        drop(guard);
    }
    switch_away(cpu);
}

/// Wake every process sleeping on `wchan`, across all CPUs. Woken
/// processes go to the head of their ready queue; a remote CPU gets a
/// reschedule IPI.
pub fn wake(wchan: usize) {
    let this_cpu = crate::arch::cpu_id();
    for (cpu, lock) in SCHEDULERS.iter().enumerate() {
        let mut sched = lock.lock();
        let mut woke_any = false;
        let mut i = 0;
        while i < sched.slpq.len() {
            if sched.slpq[i].1 == wchan {
                let (pid, _) = sched.slpq.swap_remove(i);
                with_proc(pid, |p| {
                    debug_assert_eq!(p.state, ProcState::Sleeping);
                    p.state = ProcState::Ready;
                    p.wchan = 0;
                });
                sched.rdyq.push_front(pid);
                woke_any = true;
            } else {
                i += 1;
            }
        }
        if woke_any {
            sched.need_resched = true;
            if cpu != this_cpu {
                crate::dev::intrctl().send_resched_ipi(cpu);
            }
        }
    }
}

/// Give up the processor voluntarily; the current process rotates to
/// the tail of the ready queue.
pub fn yield_cpu() {
    resched_and_switch(crate::arch::cpu_id(), true);
}

/// Remove `pid` from whatever queue holds it; used when a process dies.
pub fn purge(pid: Pid) {
    for lock in SCHEDULERS.iter() {
        let mut sched = lock.lock();
        sched.rdyq.retain(|&p| p != pid);
        sched.slpq.retain(|&(p, _)| p != pid);
        sched.deadq.retain(|&p| p != pid);
        if sched.cur == Some(pid) {
            sched.cur = None;
        }
    }
}

/// Mark the current process dead and pick another.
pub fn exit_current(cpu: usize) {
    let mut sched = SCHEDULERS[cpu].lock();
    if let Some(pid) = sched.cur.take() {
        with_proc(pid, |p| p.state = ProcState::Dead);
        sched.deadq.push_back(pid);
    }
    drop(sched);
    switch_away(cpu);
}

/// Dead processes awaiting reclamation on `cpu`.
pub fn reap(cpu: usize) -> Option<Pid> {
    SCHEDULERS[cpu].lock().deadq.pop_front()
}

/// Pick and, on bare metal, actually switch to the chosen process.
pub fn resched_and_switch(cpu: usize, force: bool) {
    let prev = current(cpu);
    let next = resched(cpu, force);
    if prev != next {
        do_switch(cpu, prev, next);
    }
}

fn switch_away(cpu: usize) {
    resched_and_switch(cpu, true);
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn do_switch(_cpu: usize, prev: Option<Pid>, next: Option<Pid>) {
    use crate::arch::x86::kctx::{swtch, KernCtx};

    let Some(next) = next else {
        // Nothing runnable; the idle loop in the boot path spins on hlt.
        return;
    };
    let to = match with_proc(next, |p| p.kctx as *mut KernCtx) {
        Some(ptr) if !ptr.is_null() => ptr,
        _ => return,
    };
    match prev {
        Some(prev_pid) => {
            // The save slot is the PCB's kctx field itself, so the
            // saved context is visible the moment swtch stores it.
            let from = with_proc(prev_pid, |p| {
                core::ptr::addr_of_mut!(p.kctx).cast::<*mut KernCtx>()
            });
            let Some(from) = from else { return };
            // SAFETY: `from` points into a PCB slot that stays alive
            // while its process can be switched back to; `to` is a
            // seeded frame in the incoming kstack page.
            unsafe { swtch(from, to) };
        }
        None => {
            let mut scratch: *mut KernCtx = core::ptr::null_mut();
            // SAFETY: See above; the boot stack's frame is discarded.
            unsafe { swtch(&mut scratch, to) };
        }
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
fn do_switch(_cpu: usize, _prev: Option<Pid>, _next: Option<Pid>) {
    // Host build: state bookkeeping stands in for the stack swap.
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mm::testutil,
        proc::{proc_destroy, proc_new, state_of},
    };

    // Each test pins its processes to a dedicated CPU index so the
    // global scheduler array is not shared between tests.

    fn fresh(pool: &'static crate::mm::PhysPool, cpu: usize) -> Pid {
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        proc_new(pool, &kernel, cpu).unwrap()
    }

    #[test]
    fn ready_queue_is_fifo_and_pinned() {
        let pool = testutil::pool(96);
        let cpu = 5;
        let a = fresh(pool, cpu);
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let b = proc_new(pool, &kernel, cpu).unwrap();
        add(a, cpu);
        add(b, cpu);

        assert_eq!(resched(cpu, true), Some(a));
        assert_eq!(state_of(a), Some(ProcState::Running));
        assert_eq!(current(cpu), Some(a));

        // Forced resched rotates a out, b in, FIFO order.
        assert_eq!(resched(cpu, true), Some(b));
        assert_eq!(state_of(a), Some(ProcState::Ready));
        assert_eq!(state_of(b), Some(ProcState::Running));

        proc_destroy(pool, a);
        proc_destroy(pool, b);
    }

    #[test]
    fn slice_expiry_requeues_only_when_someone_waits() {
        let pool = testutil::pool(96);
        let cpu = 6;
        let a = fresh(pool, cpu);
        add(a, cpu);
        assert_eq!(resched(cpu, true), Some(a));

        // Burn a slice with an empty ready queue: no resched needed.
        for _ in 0..SCHED_SLICE + 5 {
            tick(cpu);
        }
        assert!(!need_resched(cpu));
        assert_eq!(resched(cpu, false), Some(a), "lone process keeps the CPU");

        // With a waiter, the expired slice forces rotation.
        let kernel = crate::mm::Pmap::new_kernel(pool).unwrap();
        let b = proc_new(pool, &kernel, cpu).unwrap();
        add(b, cpu);
        for _ in 0..SCHED_SLICE + 1 {
            tick(cpu);
        }
        assert!(need_resched(cpu));
        assert_eq!(resched(cpu, false), Some(b));

        proc_destroy(pool, a);
        proc_destroy(pool, b);
    }

    #[test]
    fn sleep_and_wake_move_through_the_sleep_queue() {
        let pool = testutil::pool(96);
        let cpu = 7;
        let a = fresh(pool, cpu);
        add(a, cpu);
        resched(cpu, true);

        let wchan = 0xCAFE_BABE_usize;
        sleep::<()>(a, wchan, None);
        assert_eq!(state_of(a), Some(ProcState::Sleeping));
        assert_eq!(current(cpu), None, "sleeper left the CPU");

        // Wake on the wrong channel does nothing.
        wake(wchan ^ 1);
        assert_eq!(state_of(a), Some(ProcState::Sleeping));

        // The right channel readies it at the queue head.
        wake(wchan);
        assert_eq!(state_of(a), Some(ProcState::Ready));
        assert_eq!(resched(cpu, true), Some(a));

        proc_destroy(pool, a);
    }

    #[test]
    fn sleep_releases_the_handed_in_lock() {
        let pool = testutil::pool(96);
        let cpu = 4;
        let a = fresh(pool, cpu);
        add(a, cpu);
        resched(cpu, true);

        let lock = SpinLock::new(0u32);
        let guard = lock.lock();
        sleep(a, 0x1234, Some(guard));
        // The guard died inside sleep; the lock must be free again.
        assert!(lock.try_lock().is_some());

        wake(0x1234);
        resched(cpu, true);
        proc_destroy(pool, a);
    }

    #[test]
    fn exit_moves_the_current_process_to_the_dead_queue() {
        let pool = testutil::pool(96);
        let cpu = 3;
        let a = fresh(pool, cpu);
        add(a, cpu);
        resched(cpu, true);

        exit_current(cpu);
        assert_eq!(state_of(a), Some(ProcState::Dead));
        assert_eq!(reap(cpu), Some(a));
        assert_eq!(reap(cpu), None);
        proc_destroy(pool, a);
    }
}
