//! Extended page tables.
//!
//! EPT walks its own four-level format with 64-bit entries, so the
//! shared two-level table cannot be reused here; the frame-allocation
//! and refcount rules are the same, only the entry encoding differs.
//! The guest space is 32-bit, which pins the walk to PML4 slot 0 and
//! the first four PDPT slots.

use super::super::CacheType;
use crate::{
    error::HvmError,
    mm::{page_down, page_off, FrameNumber, PageKind, PhysAddr, PhysPool},
};

const EPT_R: u64 = 1 << 0;
const EPT_W: u64 = 1 << 1;
const EPT_X: u64 = 1 << 2;
const EPT_MEMTYPE_SHIFT: u64 = 3;
const EPT_MEMTYPE_UC: u64 = 0;
const EPT_MEMTYPE_WB: u64 = 6;

const ENTRIES: usize = 512;
const PRESENT_MASK: u64 = EPT_R | EPT_W | EPT_X;

/// A four-level EPT hierarchy.
pub struct EptPtab {
    pml4: FrameNumber,
}

impl EptPtab {
    pub fn new(pool: &PhysPool) -> Result<Self, HvmError> {
        let pml4 = pool.alloc_page().map_err(HvmError::from)?;
        pool.incref(pml4);
        pool.zero_frame(pml4);
        Ok(EptPtab { pml4 })
    }

    /// Value for the EPT pointer field: WB walks, 4 levels.
    pub fn eptp(&self) -> u64 {
        self.pml4.addr().as_u32() as u64 | (3 << 3) | 6
    }

    fn entry_ptr(pool: &PhysPool, table: FrameNumber, idx: usize) -> *mut u64 {
        debug_assert!(idx < ENTRIES);
        // SAFETY: Table frames are pool-backed; idx is bounded.
        unsafe { pool.frame_ptr(table).cast::<u64>().add(idx) }
    }

    fn read(pool: &PhysPool, table: FrameNumber, idx: usize) -> u64 {
        // SAFETY: See entry_ptr.
        unsafe { *Self::entry_ptr(pool, table, idx) }
    }

    fn write(pool: &PhysPool, table: FrameNumber, idx: usize, val: u64) {
        // SAFETY: See entry_ptr.
        unsafe { *Self::entry_ptr(pool, table, idx) = val };
    }

    /// Indexes of the four levels for a 32-bit guest address.
    fn split(gpa: u32) -> [usize; 4] {
        let g = gpa as u64;
        [
            ((g >> 39) & 0x1FF) as usize, // always 0 for 32-bit space
            ((g >> 30) & 0x1FF) as usize,
            ((g >> 21) & 0x1FF) as usize,
            ((g >> 12) & 0x1FF) as usize,
        ]
    }

    /// Find the leaf slot for `gpa`, allocating intermediate tables
    /// when `create` is set.
    fn walk(&self, pool: &PhysPool, gpa: u32, create: bool) -> Result<(FrameNumber, usize), HvmError> {
        let idx = Self::split(gpa);
        let mut table = self.pml4;
        for &i in &idx[..3] {
            let e = Self::read(pool, table, i);
            table = if e & PRESENT_MASK != 0 {
                PhysAddr::new((e & !0xFFF) as u32).frame()
            } else {
                if !create {
                    return Err(HvmError::BadArg);
                }
                let t = pool.alloc_page().map_err(HvmError::from)?;
                pool.incref(t);
                pool.zero_frame(t);
                Self::write(
                    pool,
                    table,
                    i,
                    t.addr().as_u32() as u64 | EPT_R | EPT_W | EPT_X,
                );
                t
            };
        }
        Ok((table, idx[3]))
    }

    /// Map `gpa` onto `hpa` with full guest permissions.
    pub fn set_mmap(&self, pool: &PhysPool, gpa: u32, hpa: u32, ctype: CacheType) -> Result<(), HvmError> {
        let (table, slot) = self.walk(pool, page_down(gpa), true)?;
        let old = Self::read(pool, table, slot);
        if old & PRESENT_MASK != 0 {
            release_leaf(pool, old);
        }
        let memtype = match ctype {
            CacheType::WriteBack => EPT_MEMTYPE_WB,
            CacheType::Uncacheable => EPT_MEMTYPE_UC,
        };
        let frame = PhysAddr::new(page_down(hpa)).frame();
        if frame.as_u32() < pool.nframes() && pool.kind(frame) == PageKind::Normal {
            pool.incref(frame);
        }
        Self::write(
            pool,
            table,
            slot,
            page_down(hpa) as u64 | PRESENT_MASK | (memtype << EPT_MEMTYPE_SHIFT),
        );
        Ok(())
    }

    pub fn translate(&self, pool: &PhysPool, gpa: u32) -> Option<u32> {
        let (table, slot) = self.walk(pool, page_down(gpa), false).ok()?;
        let e = Self::read(pool, table, slot);
        if e & PRESENT_MASK == 0 {
            return None;
        }
        Some((e & !0xFFF) as u32 | page_off(gpa))
    }

    /// Tear the hierarchy down, releasing mapped host frames and every
    /// table.
    pub fn destroy(self, pool: &PhysPool) {
        free_level(pool, self.pml4, 0);
        pool.decref(self.pml4);
    }
}

fn release_leaf(pool: &PhysPool, entry: u64) {
    let frame = PhysAddr::new((entry & !0xFFF) as u32).frame();
    if frame.as_u32() < pool.nframes() && pool.kind(frame) == PageKind::Normal {
        pool.decref(frame);
    }
}

fn free_level(pool: &PhysPool, table: FrameNumber, depth: usize) {
    for i in 0..ENTRIES {
        let e = EptPtab::read(pool, table, i);
        if e & PRESENT_MASK == 0 {
            continue;
        }
        let frame = PhysAddr::new((e & !0xFFF) as u32).frame();
        if depth == 3 {
            release_leaf(pool, e);
        } else {
            free_level(pool, frame, depth + 1);
            pool.decref(frame);
        }
        EptPtab::write(pool, table, i, 0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::testutil;

    #[test]
    fn mapping_references_and_translates() {
        let pool = testutil::pool(24);
        let ept = EptPtab::new(pool).unwrap();
        let host = pool.alloc_page().unwrap();

        ept.set_mmap(pool, 0x1000, host.addr().as_u32(), CacheType::WriteBack)
            .unwrap();
        assert_eq!(pool.refcount(host), 1);
        assert_eq!(
            ept.translate(pool, 0x1ABC),
            Some(host.addr().as_u32() + 0xABC)
        );
        assert_eq!(ept.translate(pool, 0x3000), None);
    }

    #[test]
    fn destroy_balances_every_reference() {
        let pool = testutil::pool(24);
        let free0 = pool.free_frames();
        let ept = EptPtab::new(pool).unwrap();
        let host = pool.alloc_page().unwrap();
        ept.set_mmap(pool, 0x40_0000, host.addr().as_u32(), CacheType::Uncacheable)
            .unwrap();
        ept.destroy(pool);
        assert_eq!(pool.free_frames(), free0);
    }

    #[test]
    fn eptp_carries_root_walk_length_and_memtype() {
        let pool = testutil::pool(24);
        let ept = EptPtab::new(pool).unwrap();
        let eptp = ept.eptp();
        assert_eq!(eptp & 0x7, 6, "write-back walks");
        assert_eq!((eptp >> 3) & 0x7, 3, "4-level walk encodes as 3");
        assert_eq!(eptp & !0xFFF, ept.pml4.addr().as_u32() as u64);
    }
}
