//! Address spaces.
//!
//! A thin policy layer over `Pmap`: reserving a page allocates a zeroed
//! frame from the pool and maps it, assigning maps a frame someone else
//! owns, unassigning is a plain unmap. The module also tracks which
//! space each CPU currently has loaded so the trap path can tell kernel
//! traps from user traps by the active root.

use core::sync::atomic::{AtomicU32, Ordering};

use super::{
    phys::{FrameNumber, PhysPool},
    pmap::Pmap,
    PteFlags,
};
use crate::{config::MAX_CPU, error::MemError};

/// A pmap plus allocation policy.
pub struct AddrSpace {
    pmap: Pmap,
}

impl AddrSpace {
    /// The shared kernel space.
    pub fn new_kernel(pool: &PhysPool) -> Result<Self, MemError> {
        Ok(AddrSpace {
            pmap: Pmap::new_kernel(pool)?,
        })
    }

    /// A fresh user space, seeded from the kernel map.
    pub fn new_user(pool: &PhysPool, kernel: &Pmap) -> Result<Self, MemError> {
        Ok(AddrSpace {
            pmap: Pmap::new_user(pool, kernel)?,
        })
    }

    pub fn pmap(&self) -> &Pmap {
        &self.pmap
    }

    pub fn root(&self) -> FrameNumber {
        self.pmap.root()
    }

    /// Back `va` with a fresh zeroed frame.
    pub fn reserve(&self, pool: &PhysPool, va: u32, perm: PteFlags) -> Result<(), MemError> {
        let frame = pool.alloc_page()?;
        pool.zero_frame(frame);
        if let Err(e) = self.pmap.insert(pool, frame, va, perm) {
            // The frame never got a reference; hand it straight back.
            pool.free_page(frame);
            return Err(e);
        }
        Ok(())
    }

    /// Map an externally-owned frame at `va`.
    pub fn assign(
        &self,
        pool: &PhysPool,
        va: u32,
        perm: PteFlags,
        frame: FrameNumber,
    ) -> Result<(), MemError> {
        self.pmap.insert(pool, frame, va, perm)
    }

    /// Unmap `[va, va + size)`.
    pub fn unassign(&self, pool: &PhysPool, va: u32, size: u32) {
        self.pmap.remove(pool, va, size);
    }

    pub fn setperm(&self, pool: &PhysPool, va: u32, size: u32, perm: PteFlags) -> Result<(), MemError> {
        self.pmap.setperm(pool, va, size, perm)
    }

    pub fn lookup(&self, pool: &PhysPool, va: u32) -> Option<u32> {
        self.pmap.lookup(pool, va)
    }

    pub fn checkrange(&self, pool: &PhysPool, va: u32, size: u32) -> bool {
        self.pmap.checkrange(pool, va, size)
    }

    /// Byte copy between two spaces; see `Pmap::copy`.
    pub fn copy(pool: &PhysPool, dst: &AddrSpace, dva: u32, src: &AddrSpace, sva: u32, size: u32) -> usize {
        Pmap::copy(pool, &dst.pmap, dva, &src.pmap, sva, size)
    }

    pub fn memset(&self, pool: &PhysPool, va: u32, byte: u8, size: u32) -> usize {
        self.pmap.memset(pool, va, byte, size)
    }

    /// Release every mapping and frame this space holds.
    pub fn destroy(self, pool: &PhysPool) {
        self.pmap.destroy(pool);
    }

    /// Make this space current on the calling CPU.
    pub fn activate(&self, cpu: usize) {
        set_active_root(cpu, self.root());
    }
}

/// Active root per CPU, stored as frame + 1 (0 = none).
static ACTIVE_ROOT: [AtomicU32; MAX_CPU] = [const { AtomicU32::new(0) }; MAX_CPU];

/// Record (and on bare metal, load) the active page-directory root.
pub fn set_active_root(cpu: usize, root: FrameNumber) {
    ACTIVE_ROOT[cpu].store(root.as_u32() + 1, Ordering::Release);
    #[cfg(all(target_arch = "x86", target_os = "none"))]
    // SAFETY: root comes from a live pmap whose directory frame stays
    // allocated while it is active.
    unsafe {
        crate::arch::x86::cpu::lcr3(root.addr().as_u32())
    };
}

/// The root currently active on `cpu`, if any space was activated.
pub fn active_root(cpu: usize) -> Option<FrameNumber> {
    match ACTIVE_ROOT[cpu].load(Ordering::Acquire) {
        0 => None,
        n => Some(FrameNumber::new(n - 1)),
    }
}
