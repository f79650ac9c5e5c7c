//! The interrupt descriptor table.
//!
//! 256 gates, every one initially routed to the common entry path; the
//! syscall vector is the only gate reachable from ring 3. The assembly
//! trampolines push a zero error code where the processor does not, tag
//! the frame with its vector and funnel into one register-save routine
//! that calls the high-level dispatcher.

#![allow(dead_code)]

use super::{
    seg::GateDesc,
    trapframe::{T_MAX, T_SYSCALL},
};

/// The in-memory IDT. A single table is shared by all CPUs; each CPU
/// loads it with `lidt` at bring-up.
#[repr(C, align(8))]
pub struct Idt {
    gates: [GateDesc; T_MAX],
}

impl Idt {
    pub const fn empty() -> Self {
        Idt {
            gates: [GateDesc::missing(); T_MAX],
        }
    }

    /// Point every vector at its trampoline. All gates are interrupt
    /// gates at DPL 0 except the syscall vector, which userspace must
    /// be able to raise.
    pub fn build(&mut self, trampolines: &[u32; T_MAX]) {
        for (vec, &addr) in trampolines.iter().enumerate() {
            let dpl = if vec == T_SYSCALL as usize { 3 } else { 0 };
            self.gates[vec] = GateDesc::interrupt(addr, dpl);
        }
    }

    pub fn gate(&self, vec: usize) -> &GateDesc {
        &self.gates[vec]
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod hw {
    use core::arch::global_asm;

    use super::{Idt, T_MAX};
    use crate::arch::x86::seg::{PseudoDesc, SEG_KDATA};

    // One short trampoline per vector. Vectors 8, 10-14 and 17 already
    // carry a processor-pushed error code; the rest get a zero so the
    // frame layout is uniform.
    global_asm!(
        ".altmacro",
        ".macro vector n",
        "vector\\n:",
        ".if (\\n == 8 || (\\n >= 10 && \\n <= 14) || \\n == 17)",
        ".else",
        "  push 0", // the processor pushed no error code here
        ".endif",
        "  push \\n",
        "  jmp {alltraps}",
        ".endm",
        ".set i, 0",
        ".rept 256",
        "  vector %i",
        "  .set i, i+1",
        ".endr",
        ".macro vector_entry n",
        "  .long vector\\n",
        ".endm",
        ".section .rodata",
        ".globl TRAP_TRAMPOLINES",
        ".balign 4",
        "TRAP_TRAMPOLINES:",
        ".set i, 0",
        ".rept 256",
        "  vector_entry %i",
        "  .set i, i+1",
        ".endr",
        ".text",
        alltraps = sym alltraps,
    );

    global_asm!(
        // Common save path: complete the TrapFrame, switch to kernel
        // data segments, hand the frame to the dispatcher.
        ".globl alltraps",
        "alltraps:",
        "  push ds",
        "  push es",
        "  pushad",
        "  mov ax, {kdata}",
        "  mov ds, ax",
        "  mov es, ax",
        "  push esp",
        "  call {dispatch}",
        "  add esp, 4",
        ".globl trap_ret",
        "trap_ret:",
        "  popad",
        "  pop es",
        "  pop ds",
        "  add esp, 8",
        "  iretd",
        kdata = const SEG_KDATA as i32,
        dispatch = sym crate::trap::dispatch_raw,
    );

    extern "C" {
        static TRAP_TRAMPOLINES: [u32; T_MAX];
        pub fn alltraps();
    }

    static mut IDT: Idt = Idt::empty();

    /// Build the shared IDT once and load it on the calling CPU.
    pub fn load() {
        // SAFETY: Rebuilding writes the same gate values; lidt only
        // reads the table.
        unsafe {
            let idt = &mut *core::ptr::addr_of_mut!(IDT);
            idt.build(&TRAP_TRAMPOLINES);
            let desc = PseudoDesc {
                limit: (core::mem::size_of::<Idt>() - 1) as u16,
                base: idt as *const Idt as u32,
            };
            core::arch::asm!("lidt [{}]", in(reg) &desc, options(nostack));
        }
    }
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
pub use hw::load;

/// Host build: nothing to load.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn load() {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_installs_every_gate_with_syscall_open_to_ring3() {
        let mut idt = alloc::boxed::Box::new(Idt::empty());
        let mut stubs = [0u32; T_MAX];
        for (i, s) in stubs.iter_mut().enumerate() {
            *s = 0x0010_0000 + (i as u32) * 16;
        }
        idt.build(&stubs);

        for vec in 0..T_MAX {
            let g = idt.gate(vec);
            assert!(g.present());
            assert_eq!(g.handler(), stubs[vec]);
            let want_dpl = if vec == T_SYSCALL as usize { 3 } else { 0 };
            assert_eq!(g.dpl(), want_dpl, "vector {}", vec);
        }
    }
}
