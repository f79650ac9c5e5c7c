//! Contracts for external collaborators.
//!
//! The console driver, timer wiring and interrupt-controller plumbing
//! live outside the core; the kernel talks to them through these traits
//! and a registry of installed implementations. Everything defaults to
//! an inert implementation so the core runs (and tests) without any
//! device attached.

use core::sync::atomic::{AtomicU64, Ordering};

/// Byte console: `puts`/`getc` material.
pub trait Console: Send + Sync {
    fn putc(&self, c: u8);
    /// A pending input byte, if any. Non-blocking.
    fn getc(&self) -> Option<u8>;
}

/// Interrupt-controller operations the trap path needs.
pub trait IntrCtl: Send + Sync {
    /// Acknowledge the in-service interrupt.
    fn eoi(&self);
    /// Kick another CPU into its scheduler.
    fn send_resched_ipi(&self, cpu: usize);
}

struct NullConsole;

impl Console for NullConsole {
    fn putc(&self, _c: u8) {}

    fn getc(&self) -> Option<u8> {
        None
    }
}

struct NullIntrCtl;

impl IntrCtl for NullIntrCtl {
    fn eoi(&self) {}

    fn send_resched_ipi(&self, _cpu: usize) {}
}

static NULL_CONSOLE: NullConsole = NullConsole;
static NULL_INTRCTL: NullIntrCtl = NullIntrCtl;

static CONSOLE: spin::RwLock<&'static dyn Console> = spin::RwLock::new(&NULL_CONSOLE);
static INTRCTL: spin::RwLock<&'static dyn IntrCtl> = spin::RwLock::new(&NULL_INTRCTL);

/// Timer ticks seen since boot, fed by the timer interrupt.
static TICKS: AtomicU64 = AtomicU64::new(0);

pub fn register_console(c: &'static dyn Console) {
    *CONSOLE.write() = c;
}

pub fn register_intrctl(ic: &'static dyn IntrCtl) {
    *INTRCTL.write() = ic;
}

pub fn console() -> &'static dyn Console {
    *CONSOLE.read()
}

pub fn intrctl() -> &'static dyn IntrCtl {
    *INTRCTL.read()
}

pub fn console_puts(s: &[u8]) {
    let con = console();
    for &b in s {
        con.putc(b);
    }
}

pub fn tick() -> u64 {
    TICKS.fetch_add(1, Ordering::AcqRel) + 1
}

pub fn ticks() -> u64 {
    TICKS.load(Ordering::Acquire)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn null_console_swallows_everything() {
        console_puts(b"no device attached");
        assert_eq!(console().getc(), None);
    }

    #[test]
    fn ticks_count_up() {
        let before = ticks();
        tick();
        assert!(ticks() > before);
    }
}
