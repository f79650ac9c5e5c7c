//! Architecture support.
//!
//! The kernel targets 32-bit x86. Descriptor tables, trap frames and
//! the per-CPU block are plain data and build everywhere; instructions
//! that only exist in ring 0 on real hardware are confined to
//! `x86::cpu` and stubbed out on the host so the rest of the kernel can
//! be exercised by ordinary tests.

pub mod x86;

pub use x86::percpu;

/// Index of the calling CPU.
#[inline]
pub fn cpu_id() -> usize {
    x86::percpu::cpu_id()
}

/// Are interrupts currently enabled on this CPU?
#[inline]
pub fn intr_enabled() -> bool {
    x86::cpu::intr_enabled()
}

#[inline]
pub fn intr_disable() {
    x86::cpu::intr_disable();
}

#[inline]
pub fn intr_enable() {
    x86::cpu::intr_enable();
}
