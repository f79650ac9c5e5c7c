//! Memory management.
//!
//! Three layers, bottom up: the physical page allocator (`phys`), the
//! two-level page tables (`pmap`) and the address-space facade
//! (`addrspace`). The memory map parser (`e820`) feeds the allocator at
//! boot and the kernel heap (`heap`) backs `alloc` collections.

pub mod addrspace;
pub mod e820;
pub mod heap;
pub mod phys;
pub mod pmap;

use spin::Once;

pub use addrspace::AddrSpace;
pub use phys::{FrameNumber, PageKind, PhysAddr, PhysPool};
pub use pmap::Pmap;

use crate::error::MemError;

/// Size of a physical frame and of a virtual page.
pub const PAGE_SIZE: usize = 4096;
pub const PAGE_SHIFT: u32 = 12;

/// Bottom of the user window. Everything below is the kernel-shared
/// identity mapping, inaccessible to ring 3.
pub const VM_USERLO: u32 = 0x4000_0000;
/// Top of the user window; kernel and devices above.
pub const VM_USERHI: u32 = 0xF000_0000;
/// Top of the per-process user stack; one page lives just below.
pub const VM_STACKHI: u32 = 0xF000_0000;

bitflags::bitflags! {
    /// Low bits of a PDE/PTE.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PteFlags: u32 {
        const P = 1 << 0;
        const W = 1 << 1;
        const U = 1 << 2;
        const PWT = 1 << 3;
        const PCD = 1 << 4;
        const A = 1 << 5;
        const D = 1 << 6;
        /// 4 MiB page (directory level only).
        const PS = 1 << 7;
        const G = 1 << 8;
        /// Software bit: this leaf holds a reference on its frame.
        const REFD = 1 << 9;
    }
}

#[inline]
pub const fn page_down(addr: u32) -> u32 {
    addr & !(PAGE_SIZE as u32 - 1)
}

#[inline]
pub const fn page_up(addr: u32) -> u32 {
    page_down(addr.wrapping_add(PAGE_SIZE as u32 - 1))
}

#[inline]
pub const fn page_off(addr: u32) -> u32 {
    addr & (PAGE_SIZE as u32 - 1)
}

static PHYS_POOL: Once<PhysPool> = Once::new();
static KERNEL_PMAP: Once<Pmap> = Once::new();

/// Initialize the physical allocator from the boot memory map and
/// build the shared kernel pmap.
pub fn init(regions: &[e820::MemRegion], kernel_end: u64) -> Result<(), MemError> {
    let pool = PHYS_POOL.call_once(|| {
        PhysPool::new(regions, kernel_end, 0).expect("building the physical page pool")
    });
    log::info!(
        "mm: {} frames, {} free",
        pool.nframes(),
        pool.free_frames()
    );
    KERNEL_PMAP.call_once(|| Pmap::new_kernel(pool).expect("building the kernel pmap"));
    Ok(())
}

/// The global physical page pool. Panics before `init`.
pub fn pool() -> &'static PhysPool {
    PHYS_POOL.get().expect("mm::init has not run")
}

/// The shared kernel page map. Panics before `init`.
pub fn kernel_pmap() -> &'static Pmap {
    KERNEL_PMAP.get().expect("mm::init has not run")
}

/// The kernel map's root frame, if `init` has run.
pub fn try_kernel_root() -> Option<FrameNumber> {
    KERNEL_PMAP.get().map(Pmap::root)
}

// Arena-backed pools for the unit and integration tests; host only.
#[cfg(not(target_os = "none"))]
pub mod testutil {
    //! Arena-backed pools for tests: "physical" frames live in leaked
    //! heap memory addressed through the pool window.

    use super::{e820::MemRegion, phys::PhysPool, PAGE_SIZE};

    /// Initialize the global pool and kernel pmap over an arena, so
    /// code that reaches for `mm::pool()` runs under test. Idempotent;
    /// every caller shares one arena.
    pub fn init_global() -> &'static super::PhysPool {
        let p = super::PHYS_POOL.call_once(|| {
            let bytes = 1025 * PAGE_SIZE;
            let arena = alloc::vec![0u8; bytes].leak();
            let base = arena.as_mut_ptr();
            let aligned = ((base as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) as *mut u8;
            let regions = [MemRegion {
                addr: 0,
                len: 1024 * PAGE_SIZE as u64,
                kind: MemRegion::RAM,
            }];
            PhysPool::new(&regions, 0, aligned as usize).unwrap()
        });
        super::KERNEL_PMAP.call_once(|| super::Pmap::new_kernel(p).unwrap());
        p
    }

    /// Build a pool of `frames` normal frames over a leaked arena.
    pub fn pool(frames: u32) -> &'static PhysPool {
        let bytes = (frames as usize + 1) * PAGE_SIZE;
        let arena = alloc::vec![0u8; bytes].leak();
        let base = arena.as_mut_ptr();
        let aligned = ((base as usize + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)) as *mut u8;
        let regions = [MemRegion {
            addr: 0,
            len: frames as u64 * PAGE_SIZE as u64,
            kind: MemRegion::RAM,
        }];
        let pool = PhysPool::new(&regions, 0, aligned as usize).unwrap();
        alloc::boxed::Box::leak(alloc::boxed::Box::new(pool))
    }
}
