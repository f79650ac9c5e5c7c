//! Synchronization primitives.
//!
//! `SpinLock` is the kernel's interrupt-aware spinlock. Plain shared
//! data that is never touched from interrupt context can keep using
//! `spin::Mutex`; everything reachable from a trap handler goes through
//! `SpinLock` so interrupts are only re-enabled once a CPU has dropped
//! every lock it holds.

mod spinlock;

pub use spinlock::{SpinLock, SpinLockGuard};
