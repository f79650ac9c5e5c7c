//! Kernel-to-kernel context switch.
//!
//! Each process has a `KernCtx` frame on its kernel stack holding the
//! callee-saved registers. `swtch` pushes the outgoing set, stores the
//! resulting stack pointer through `from`, reloads `to` and returns on
//! the incoming stack. The first switch into a fresh process "returns"
//! to the entry function its stack was seeded with.

#![allow(dead_code)]

use super::percpu::Kstack;

/// Callee-saved register frame, in the order `swtch` pops it.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct KernCtx {
    pub edi: u32,
    pub esi: u32,
    pub ebx: u32,
    pub ebp: u32,
    pub eip: u32,
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
core::arch::global_asm!(
    ".globl swtch",
    "swtch:",
    "  mov eax, [esp + 4]", // from: *mut *mut KernCtx
    "  mov edx, [esp + 8]", // to: *mut KernCtx
    "  push ebp",
    "  push ebx",
    "  push esi",
    "  push edi",
    "  mov [eax], esp",
    "  mov esp, edx",
    "  pop edi",
    "  pop esi",
    "  pop ebx",
    "  pop ebp",
    "  ret",
);

#[cfg(all(target_arch = "x86", target_os = "none"))]
extern "C" {
    /// Swap kernel contexts. `from` receives the outgoing frame.
    pub fn swtch(from: *mut *mut KernCtx, to: *mut KernCtx);
}

/// Host build: context switching needs a real stack to run on.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[allow(clippy::missing_safety_doc)]
pub unsafe fn swtch(_from: *mut *mut KernCtx, _to: *mut KernCtx) {
    unreachable!("kernel context switch on the host");
}

/// Seed a fresh kernel stack so the first `swtch` into it "returns"
/// into `entry`. Returns the context pointer to hand to `swtch`.
pub fn prepare(kstack: &mut Kstack, entry: extern "C" fn() -> !) -> *mut KernCtx {
    let top = kstack.stack_top();
    let ctx_addr = top - core::mem::size_of::<KernCtx>();
    let ctx = ctx_addr as *mut KernCtx;
    // SAFETY: ctx_addr lies inside the caller's kstack page and is
    // aligned for KernCtx (the page end is page-aligned).
    unsafe {
        ctx.write(KernCtx {
            eip: entry as usize as u32,
            ..KernCtx::default()
        });
    }
    ctx
}
