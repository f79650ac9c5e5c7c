//! Trap dispatch.
//!
//! The assembly entry path hands every trap to `dispatch_raw` with a
//! pointer to the saved frame. Dispatch splits on the active address
//! space: if the kernel map is loaded this is a kernel trap, handled in
//! place or fatal; otherwise it is a user trap, whose frame is copied
//! into the current process before the per-CPU handler runs and the
//! process is resumed through `ctx_start`.

use crate::{
    arch::{
        self,
        x86::{
            cpu,
            trapframe::{
                TrapFrame, IRQ_SPURIOUS, PGFLT_P, T_IPI_RESCHED, T_IRQ0, T_LERROR, T_LTIMER,
                T_MAX, T_PGFLT, T_SYSCALL,
            },
        },
    },
    config::MAX_CPU,
    error::KernelError,
    mm::{self, page_down, PteFlags, VM_USERHI, VM_USERLO},
    proc::{self, sched, Pid},
    sync::SpinLock,
};

pub type TrapHandler = fn(&mut TrapFrame) -> Result<(), KernelError>;

type HandlerTable = [Option<TrapHandler>; T_MAX];

#[allow(clippy::declare_interior_mutable_const)]
const TABLE_INIT: SpinLock<HandlerTable> = SpinLock::new([None; T_MAX]);

/// Per-CPU trap handler vectors.
static HANDLERS: [SpinLock<HandlerTable>; MAX_CPU] = [TABLE_INIT; MAX_CPU];

/// Install a handler for `vec` on `cpu`, returning the old one.
pub fn register(cpu: usize, vec: u8, h: TrapHandler) -> Option<TrapHandler> {
    let mut tab = HANDLERS[cpu].lock();
    tab[vec as usize].replace(h)
}

fn handler_for(cpu: usize, vec: u8) -> Option<TrapHandler> {
    HANDLERS[cpu].lock()[vec as usize]
}

/// Wire the standard handlers for `cpu`.
pub fn init(cpu: usize) {
    register(cpu, T_PGFLT, pgflt_handler);
    #[cfg(feature = "hvm")]
    register(cpu, T_SYSCALL, crate::syscall::dispatch);
    register(cpu, T_LTIMER, timer_handler);
    register(cpu, T_LERROR, lapic_error_handler);
    register(cpu, T_IPI_RESCHED, resched_handler);
    register(cpu, T_IRQ0 + IRQ_SPURIOUS, spurious_handler);
}

/// Is the kernel map the active space on `cpu`? Before any space was
/// activated the CPU is trivially in the kernel.
fn kernel_active(cpu: usize) -> bool {
    match (mm::addrspace::active_root(cpu), mm::try_kernel_root()) {
        (None, _) => true,
        (Some(active), Some(kroot)) => active == kroot,
        (Some(_), None) => false,
    }
}

/// C-ABI shim the assembly entry path calls.
///
/// # Safety
/// `tf` must point at the frame the entry path just built.
pub unsafe extern "C" fn dispatch_raw(tf: *mut TrapFrame) {
    // SAFETY: Contract above.
    dispatch(unsafe { &mut *tf });
}

/// High-level trap dispatch, shared by every vector.
pub fn dispatch(tf: &mut TrapFrame) {
    cpu::cld();
    let cpu_idx = arch::cpu_id();
    let vec = tf.trapno as u8;

    if kernel_active(cpu_idx) {
        match handler_for(cpu_idx, vec) {
            Some(h) => {
                if let Err(e) = h(tf) {
                    dump_frame(tf);
                    panic!("kernel trap {} failed: {}", vec, e);
                }
            }
            None => {
                dump_frame(tf);
                panic!("unhandled kernel trap {}", vec);
            }
        }
        return;
    }

    // User trap: bank the context, run under the kernel map, resume.
    let user_root = mm::addrspace::active_root(cpu_idx);
    if let Some(kroot) = mm::try_kernel_root() {
        mm::addrspace::set_active_root(cpu_idx, kroot);
    }

    let cur = sched::current(cpu_idx);
    if let Some(pid) = cur {
        proc::with_proc(pid, |p| p.uctx = *tf);
    }

    match handler_for(cpu_idx, vec) {
        Some(h) => {
            if let Err(e) = h(tf) {
                log::warn!("trap {}: pid {:?} faulted: {}", vec, cur.map(|p| p.0), e);
                if let Some(pid) = cur {
                    fatal_user_fault(pid);
                }
            }
        }
        None => {
            log::warn!("trap {}: no handler, resuming", vec);
        }
    }

    if let Some(root) = user_root {
        mm::addrspace::set_active_root(cpu_idx, root);
    }

    if sched::need_resched(cpu_idx) {
        sched::resched_and_switch(cpu_idx, false);
    }

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    if let Some(pid) = sched::current(cpu_idx) {
        ctx_start(pid);
    }
}

/// What to do about a user page fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PgfltAction {
    /// Demand-map a zero page at the faulting address.
    DemandMap,
    /// Protection violation or out-of-window access: kill the process.
    Fatal,
}

/// Page-fault policy: absence inside the user window is demand
/// paging; everything else is fatal.
pub fn pgflt_action(err: u32, fault_va: u32) -> PgfltAction {
    if err & PGFLT_P != 0 {
        return PgfltAction::Fatal;
    }
    if !(VM_USERLO..VM_USERHI).contains(&fault_va) {
        return PgfltAction::Fatal;
    }
    PgfltAction::DemandMap
}

fn pgflt_handler(tf: &mut TrapFrame) -> Result<(), KernelError> {
    let fault_va = cpu::rcr2();

    if !tf.from_user() {
        // A kernel-mode page fault has no recovery path.
        dump_frame(tf);
        panic!("page fault in the kernel at {:#010x}", fault_va);
    }

    match pgflt_action(tf.err, fault_va) {
        PgfltAction::DemandMap => {
            let pid = proc::current().ok_or(KernelError::NotPresent)?;
            let pool = mm::pool();
            proc::with_proc(pid, |p| {
                let space = p.space.as_ref().ok_or(KernelError::NotPresent)?;
                match space.reserve(pool, page_down(fault_va), PteFlags::W | PteFlags::U) {
                    // A racing fault on the same page already mapped it.
                    Err(crate::error::MemError::Busy) | Ok(()) => Ok(()),
                    Err(e) => Err(KernelError::from(e)),
                }
            })
            .unwrap_or(Err(KernelError::NotPresent))
        }
        PgfltAction::Fatal => Err(KernelError::Permission),
    }
}

fn timer_handler(_tf: &mut TrapFrame) -> Result<(), KernelError> {
    crate::dev::tick();
    sched::tick(arch::cpu_id());
    crate::dev::intrctl().eoi();
    Ok(())
}

fn lapic_error_handler(_tf: &mut TrapFrame) -> Result<(), KernelError> {
    log::warn!("local APIC error interrupt");
    crate::dev::intrctl().eoi();
    Ok(())
}

fn resched_handler(_tf: &mut TrapFrame) -> Result<(), KernelError> {
    // The work happens on the way out of the trap, where need_resched
    // is consumed.
    crate::dev::intrctl().eoi();
    Ok(())
}

fn spurious_handler(_tf: &mut TrapFrame) -> Result<(), KernelError> {
    // Dropped on the floor, and deliberately no EOI.
    Ok(())
}

/// Kill a process that faulted fatally and release its resources.
fn fatal_user_fault(pid: Pid) {
    log::warn!("pid {} terminated by fault", pid);
    sched::exit_current(proc::with_proc(pid, |p| p.cpu).unwrap_or(0));
    proc::proc_destroy(mm::pool(), pid);
}

fn dump_frame(tf: &TrapFrame) {
    log::error!(
        "trap {} err {:#x} eip {:#010x} cs {:#06x} eflags {:#010x}",
        tf.trapno,
        tf.err,
        tf.eip,
        tf.cs,
        tf.eflags
    );
    log::error!(
        "eax {:#010x} ebx {:#010x} ecx {:#010x} edx {:#010x}",
        tf.regs.eax,
        tf.regs.ebx,
        tf.regs.ecx,
        tf.regs.edx
    );
    log::error!(
        "esi {:#010x} edi {:#010x} ebp {:#010x} esp {:#010x} ss {:#06x}",
        tf.regs.esi,
        tf.regs.edi,
        tf.regs.ebp,
        tf.esp,
        tf.ss
    );
}

/// Resume `pid`'s saved user context. Runs with the process current on
/// this CPU; never returns.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn ctx_start(pid: Pid) -> ! {
    use crate::arch::x86::cpu::FL_IF;

    let cpu_idx = arch::cpu_id();
    debug_assert_eq!(sched::current(cpu_idx), Some(pid));

    let tf_ptr = proc::with_proc(pid, |p| {
        assert!(p.uctx.eflags & FL_IF != 0, "resuming user context with IF clear");
        if let Some(space) = p.space.as_ref() {
            space.activate(cpu_idx);
        }
        core::ptr::addr_of_mut!(p.uctx)
    })
    .expect("ctx_start on a vacant pid");

    // SAFETY: tf_ptr points at a trap frame built for ring 3; trap_ret
    // unwinds it with popal/iretd.
    unsafe {
        core::arch::asm!(
            "mov esp, {0}",
            "jmp trap_ret",
            in(reg) tf_ptr,
            options(noreturn)
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_fault_policy_matches_the_contract() {
        // Absent page inside the user window: demand paging.
        assert_eq!(pgflt_action(0, 0x5000_0000), PgfltAction::DemandMap);
        assert_eq!(pgflt_action(PGFLT_P, 0x5000_0000), PgfltAction::Fatal);
        // Kernel window from user mode is always fatal.
        assert_eq!(pgflt_action(0, 0x1000), PgfltAction::Fatal);
        assert_eq!(pgflt_action(0, 0xF123_4567), PgfltAction::Fatal);
    }

    #[test]
    fn handlers_register_per_cpu() {
        fn probe(_tf: &mut TrapFrame) -> Result<(), KernelError> {
            Ok(())
        }
        assert!(register(6, 77, probe).is_none());
        assert!(handler_for(6, 77).is_some());
        assert!(handler_for(5, 77).is_none(), "tables are per CPU");
        // Re-registration returns the previous handler.
        assert!(register(6, 77, probe).is_some());
    }

    #[test]
    fn before_any_activation_the_cpu_counts_as_kernel() {
        assert!(kernel_active(7));
    }
}
