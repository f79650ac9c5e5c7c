//! Cinnabar Kernel Library
//!
//! Core of a small multiprocessor x86 operating system with a hardware
//! virtual machine monitor. This library carries everything above the
//! boot shim: memory management, processes and scheduling, IPC
//! channels, trap dispatch, the SVM/VMX monitor and its user-mode
//! device protocol.
//!
//! The crate builds for bare-metal x86 and, with the hardware paths
//! compiled out, for the host, where the unit tests run under the
//! standard harness over arena-backed physical memory.

#![no_std]

#[cfg(feature = "alloc")]
extern crate alloc;

// Host target: link std for the test harness and thread-based tests.
#[cfg(not(target_os = "none"))]
extern crate std;

// Bare metal uses the linked-list heap; the host delegates to the
// system allocator so test code allocates normally.
#[cfg(all(target_arch = "x86", target_os = "none"))]
use linked_list_allocator::LockedHeap;

#[cfg(all(target_arch = "x86", target_os = "none"))]
#[global_allocator]
pub static ALLOCATOR: LockedHeap = LockedHeap::empty();

#[cfg(not(target_os = "none"))]
#[global_allocator]
static SYSTEM_ALLOCATOR: std::alloc::System = std::alloc::System;

#[macro_use]
pub mod print;

pub mod arch;
pub mod bootstrap;
pub mod config;
pub mod dev;
pub mod error;
#[cfg(feature = "hvm")]
pub mod hvm;
#[cfg(feature = "alloc")]
pub mod ipc;
pub mod klog;
#[cfg(feature = "alloc")]
pub mod mm;
#[cfg(feature = "alloc")]
pub mod proc;
pub mod serial;
pub mod sync;
#[cfg(all(feature = "alloc", feature = "hvm"))]
pub mod syscall;
#[cfg(feature = "alloc")]
pub mod trap;

// Re-exports for the boot shim and integration tests.
#[cfg(feature = "alloc")]
pub use mm::{FrameNumber, PhysPool, PAGE_SIZE};
#[cfg(feature = "alloc")]
pub use proc::{Pid, ProcState};
