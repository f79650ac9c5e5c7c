//! Kernel error types.
//!
//! Every subsystem has its own small error enum; `KernelError` is the
//! union used at the system-call boundary, where each kind maps to the
//! numeric code returned to userspace in the accumulator.

use core::fmt;

/// Main kernel error type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use = "kernel errors must be handled, not silently discarded"]
pub enum KernelError {
    /// No physical page (or contiguous run) available.
    NoMem,
    /// A fixed pool (processes, channels, VMs, vdevs) is exhausted, or
    /// the requested slot is unused.
    NoSlot,
    /// The caller does not own the resource it is operating on.
    NotOwner,
    /// The resource is already claimed or the slot already mapped.
    Busy,
    /// Receive on a channel with no message in flight.
    Empty,
    /// Send on a channel whose slot is occupied.
    Full,
    /// Message larger than the channel's declared capacity.
    OverCap,
    /// Malformed argument (zero-sized message, bad range, unknown id).
    BadArg,
    /// An address did not resolve through the page tables.
    NotPresent,
    /// Operation forbidden in the caller's current role or ring.
    Permission,
    /// The guest reached a state the VMM cannot continue from.
    VmExitFault,
    /// The process on the far side of a channel is dead.
    DeviceGone,
}

impl KernelError {
    /// Numeric code stored in the accumulator on syscall return.
    /// Zero is reserved for success.
    pub const fn code(self) -> u32 {
        match self {
            KernelError::NoMem => 1,
            KernelError::NoSlot => 2,
            KernelError::NotOwner => 3,
            KernelError::Busy => 4,
            KernelError::Empty => 5,
            KernelError::Full => 6,
            KernelError::OverCap => 7,
            KernelError::BadArg => 8,
            KernelError::NotPresent => 9,
            KernelError::Permission => 10,
            KernelError::VmExitFault => 11,
            KernelError::DeviceGone => 12,
        }
    }
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelError::NoMem => write!(f, "out of physical memory"),
            KernelError::NoSlot => write!(f, "no free slot"),
            KernelError::NotOwner => write!(f, "caller does not own the resource"),
            KernelError::Busy => write!(f, "resource busy"),
            KernelError::Empty => write!(f, "channel empty"),
            KernelError::Full => write!(f, "channel full"),
            KernelError::OverCap => write!(f, "message exceeds channel capacity"),
            KernelError::BadArg => write!(f, "bad argument"),
            KernelError::NotPresent => write!(f, "address not mapped"),
            KernelError::Permission => write!(f, "permission denied"),
            KernelError::VmExitFault => write!(f, "unrecoverable VM exit"),
            KernelError::DeviceGone => write!(f, "peer process is dead"),
        }
    }
}

/// Memory subsystem errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum MemError {
    NoMem,
    /// Insert over an already-present mapping.
    Busy,
    NotPresent,
    BadArg,
}

impl fmt::Display for MemError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemError::NoMem => write!(f, "out of physical memory"),
            MemError::Busy => write!(f, "mapping already present"),
            MemError::NotPresent => write!(f, "not mapped"),
            MemError::BadArg => write!(f, "bad argument"),
        }
    }
}

impl From<MemError> for KernelError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::NoMem => KernelError::NoMem,
            MemError::Busy => KernelError::Busy,
            MemError::NotPresent => KernelError::NotPresent,
            MemError::BadArg => KernelError::BadArg,
        }
    }
}

/// IPC channel errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum IpcError {
    /// No message in the slot.
    Empty,
    /// The slot is occupied.
    Full,
    /// Message larger than the channel capacity.
    OverCap,
    /// Zero-length message or bad buffer range.
    BadArg,
    /// Sender is not an endpoint of the channel.
    IllSender,
    /// Receiver is not an endpoint of the channel.
    IllReceiver,
    /// The peer endpoint's process is dead.
    DeviceGone,
    /// The channel pool is exhausted or the id is stale.
    NoSlot,
}

impl fmt::Display for IpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpcError::Empty => write!(f, "channel empty"),
            IpcError::Full => write!(f, "channel full"),
            IpcError::OverCap => write!(f, "message exceeds capacity"),
            IpcError::BadArg => write!(f, "bad message"),
            IpcError::IllSender => write!(f, "illegal sender"),
            IpcError::IllReceiver => write!(f, "illegal receiver"),
            IpcError::DeviceGone => write!(f, "peer is dead"),
            IpcError::NoSlot => write!(f, "no channel slot"),
        }
    }
}

impl From<IpcError> for KernelError {
    fn from(e: IpcError) -> Self {
        match e {
            IpcError::Empty => KernelError::Empty,
            IpcError::Full => KernelError::Full,
            IpcError::OverCap => KernelError::OverCap,
            IpcError::BadArg => KernelError::BadArg,
            IpcError::IllSender | IpcError::IllReceiver => KernelError::Permission,
            IpcError::DeviceGone => KernelError::DeviceGone,
            IpcError::NoSlot => KernelError::NoSlot,
        }
    }
}

/// Virtualization errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum HvmError {
    /// Neither SVM nor VMX is usable on this processor.
    NotSupported,
    /// The vmid does not name a live VM.
    NoSlot,
    /// The caller is not the VM's owner.
    NotOwner,
    /// Port, IRQ or PIC already owned by another device.
    Busy,
    NoMem,
    BadArg,
    /// Hardware entry/exit or state access failed, or the guest is in a
    /// state the monitor cannot resume.
    ExitFault,
}

impl fmt::Display for HvmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HvmError::NotSupported => write!(f, "hardware virtualization unavailable"),
            HvmError::NoSlot => write!(f, "no such VM"),
            HvmError::NotOwner => write!(f, "not the VM owner"),
            HvmError::Busy => write!(f, "resource already owned"),
            HvmError::NoMem => write!(f, "out of physical memory"),
            HvmError::BadArg => write!(f, "bad argument"),
            HvmError::ExitFault => write!(f, "unrecoverable VM exit"),
        }
    }
}

impl From<MemError> for HvmError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::NoMem => HvmError::NoMem,
            MemError::Busy => HvmError::Busy,
            MemError::NotPresent | MemError::BadArg => HvmError::BadArg,
        }
    }
}

impl From<HvmError> for KernelError {
    fn from(e: HvmError) -> Self {
        match e {
            HvmError::NotSupported => KernelError::BadArg,
            HvmError::NoSlot => KernelError::NoSlot,
            HvmError::NotOwner => KernelError::NotOwner,
            HvmError::Busy => KernelError::Busy,
            HvmError::NoMem => KernelError::NoMem,
            HvmError::BadArg => KernelError::BadArg,
            HvmError::ExitFault => KernelError::VmExitFault,
        }
    }
}

/// Process and scheduler errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ProcError {
    /// Process table full.
    NoSlot,
    NoMem,
    /// Not a valid ELF image or a malformed program header.
    BadImage,
    /// The pid does not name a live process.
    NotFound,
}

impl fmt::Display for ProcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcError::NoSlot => write!(f, "process table full"),
            ProcError::NoMem => write!(f, "out of physical memory"),
            ProcError::BadImage => write!(f, "bad executable image"),
            ProcError::NotFound => write!(f, "no such process"),
        }
    }
}

impl From<MemError> for ProcError {
    fn from(e: MemError) -> Self {
        match e {
            MemError::NoMem => ProcError::NoMem,
            _ => ProcError::BadImage,
        }
    }
}

impl From<ProcError> for KernelError {
    fn from(e: ProcError) -> Self {
        match e {
            ProcError::NoSlot => KernelError::NoSlot,
            ProcError::NoMem => KernelError::NoMem,
            ProcError::BadImage => KernelError::BadArg,
            ProcError::NotFound => KernelError::NoSlot,
        }
    }
}
