//! Nested page tables.
//!
//! The guest-physical to host-physical translation reuses the two-level
//! page-table machinery and the frame refcount rules of the memory
//! subsystem: the nested root is a directory frame, tables come from
//! the pool, and unmapping a guest page drops the reference on the host
//! frame behind it. Vendor backends wrap this with their own entry
//! encodings where the hardware insists (EPT); the SVM backend uses it
//! directly, since NPT walks ordinary page tables.

use super::CacheType;
use crate::{
    error::HvmError,
    mm::{page_down, Pmap, PhysAddr, PhysPool, PteFlags},
};

/// A guest-physical address space.
pub struct NestedPtab {
    pmap: Pmap,
}

impl NestedPtab {
    /// A fresh table with every entry absent.
    pub fn new(pool: &PhysPool) -> Result<Self, HvmError> {
        Ok(NestedPtab {
            pmap: Pmap::new(pool).map_err(HvmError::from)?,
        })
    }

    /// Root frame for nested CR3.
    pub fn root(&self) -> crate::mm::FrameNumber {
        self.pmap.root()
    }

    fn flags(ctype: CacheType) -> PteFlags {
        // Nested walks run with user permission; the guest is ring 3
        // from the host's point of view.
        let base = PteFlags::W | PteFlags::U | PteFlags::A | PteFlags::D;
        match ctype {
            CacheType::WriteBack => base,
            CacheType::Uncacheable => base | PteFlags::PCD,
        }
    }

    /// Create or replace the mapping `gpa -> hpa`.
    pub fn set_mmap(
        &self,
        pool: &PhysPool,
        gpa: u32,
        hpa: u32,
        ctype: CacheType,
    ) -> Result<(), HvmError> {
        let gpa = page_down(gpa);
        if self.pmap.lookup(pool, gpa).is_some() {
            self.pmap.remove(pool, gpa, crate::mm::PAGE_SIZE as u32);
        }
        self.pmap
            .insert(pool, PhysAddr::new(hpa).frame(), gpa, Self::flags(ctype))
            .map_err(HvmError::from)
    }

    /// Resolve `gpa` to the host-physical address it maps to.
    pub fn translate(&self, pool: &PhysPool, gpa: u32) -> Option<u32> {
        let pte = self.pmap.lookup(pool, page_down(gpa))?;
        Some((pte & !0xFFF) | crate::mm::page_off(gpa))
    }

    /// Drop the mapping for one guest page, releasing the host frame's
    /// reference.
    pub fn unmap(&self, pool: &PhysPool, gpa: u32) {
        self.pmap.remove(pool, page_down(gpa), crate::mm::PAGE_SIZE as u32);
    }

    /// Release the whole table and every host frame it references.
    pub fn destroy(self, pool: &PhysPool) {
        // The guest physical space is not the user window, so sweep all
        // of it before the directory teardown.
        self.pmap.remove(pool, 0, 0x8000_0000);
        self.pmap.remove(pool, 0x8000_0000, 0x7FFF_F000);
        self.pmap.destroy(pool);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{testutil, PAGE_SIZE};

    #[test]
    fn mappings_reference_their_host_frames() {
        let pool = testutil::pool(16);
        let npt = NestedPtab::new(pool).unwrap();
        let host = pool.alloc_page().unwrap();

        npt.set_mmap(pool, 0x7000, host.addr().as_u32(), CacheType::WriteBack)
            .unwrap();
        assert_eq!(pool.refcount(host), 1);
        assert_eq!(
            npt.translate(pool, 0x7123),
            Some(host.addr().as_u32() + 0x123)
        );

        npt.unmap(pool, 0x7000);
        assert!(npt.translate(pool, 0x7000).is_none());
        assert!(pool.is_free(host), "host frame released with the mapping");
    }

    #[test]
    fn remap_replaces_and_releases_the_old_frame() {
        let pool = testutil::pool(16);
        let npt = NestedPtab::new(pool).unwrap();
        let a = pool.alloc_page().unwrap();
        let b = pool.alloc_page().unwrap();

        npt.set_mmap(pool, 0, a.addr().as_u32(), CacheType::WriteBack).unwrap();
        npt.set_mmap(pool, 0, b.addr().as_u32(), CacheType::Uncacheable).unwrap();
        assert!(pool.is_free(a));
        let pte = npt.translate(pool, 0).unwrap();
        assert_eq!(pte & !0xFFF_u32, b.addr().as_u32());

        npt.destroy(pool);
        assert!(pool.is_free(b));
    }

    #[test]
    fn unmapped_guest_pages_do_not_translate() {
        let pool = testutil::pool(16);
        let npt = NestedPtab::new(pool).unwrap();
        assert_eq!(npt.translate(pool, 64 * PAGE_SIZE as u32), None);
    }
}
