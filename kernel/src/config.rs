//! Compile-time kernel parameters.
//!
//! Pool sizes and scheduling constants. Everything here is a plain
//! constant so the limits show up in one place instead of being
//! scattered through the subsystems that enforce them.

/// Maximum number of processors supported.
pub const MAX_CPU: usize = 8;

/// Size of the process table. Process ids are indices into it.
pub const MAX_PID: usize = 64;

/// Size of the channel pool.
pub const MAX_CHANNEL: usize = 64;

/// Size of the virtual machine pool.
///
/// Kept at 1, matching the management model of one guest per host, but
/// every VMM entry point takes a vmid so raising this is a local change.
pub const MAX_VMID: usize = 1;

/// Maximum number of virtual devices attached to one virtual machine.
pub const MAX_VDEV: usize = 8;

/// Scheduling time slice, in timer ticks.
pub const SCHED_SLICE: u64 = 20;

/// Default channel message capacity, in bytes, when the creator does
/// not declare one.
pub const CHANNEL_BUFFER_SIZE: usize = 1024;

/// Guest physical memory presented to a virtual machine.
pub const GUEST_PHY_MEMORY_SIZE: u32 = 64 * 1024 * 1024;

/// TSC frequency reported to the guest, in Hz.
pub const GUEST_TSC_FREQ: u64 = 800_000_000;
