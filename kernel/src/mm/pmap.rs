//! Two-level 32-bit page tables.
//!
//! A `Pmap` owns a 4 KiB directory of 1024 PDEs, each addressing a
//! 4 KiB table of 1024 PTEs. Frames for the directory and the tables
//! come from the page pool and are reference counted: a present PDE
//! holds exactly one reference on the table it points to, and a leaf
//! PTE carrying the `REFD` software bit holds one reference on its
//! frame. The kernel identity window is mapped without `REFD` so that
//! mapping free RAM does not pin it.

use super::{
    page_off,
    phys::{FrameNumber, PageKind, PhysAddr, PhysPool},
    PteFlags, PAGE_SHIFT, PAGE_SIZE, VM_USERHI, VM_USERLO,
};
use crate::error::MemError;

pub const NPDENTRIES: usize = 1024;
pub const NPTENTRIES: usize = 1024;

/// Bytes of virtual space one PDE covers.
pub const PTSIZE: u32 = (PAGE_SIZE * NPTENTRIES) as u32;

#[inline]
const fn pdx(va: u32) -> usize {
    (va >> 22) as usize
}

#[inline]
const fn ptx(va: u32) -> usize {
    ((va >> 12) & 0x3FF) as usize
}

#[inline]
const fn pte_addr(pte: u32) -> PhysAddr {
    PhysAddr::new(pte & !0xFFF)
}

/// A page-directory-rooted virtual-to-physical mapping.
pub struct Pmap {
    pdir: FrameNumber,
}

impl Pmap {
    /// Allocate an empty pmap.
    pub fn new(pool: &PhysPool) -> Result<Self, MemError> {
        let pdir = pool.alloc_page()?;
        pool.incref(pdir);
        pool.zero_frame(pdir);
        Ok(Pmap { pdir })
    }

    /// The directory frame; `cr3` material.
    pub fn root(&self) -> FrameNumber {
        self.pdir
    }

    /// Rebuild a handle from a directory frame. For paths that cannot
    /// hold a borrow of the owning address space across a sleep; the
    /// caller asserts the directory stays live for the handle's use.
    pub fn from_root(root: FrameNumber) -> Self {
        Pmap { pdir: root }
    }

    fn dir_entry(&self, pool: &PhysPool, idx: usize) -> u32 {
        debug_assert!(idx < NPDENTRIES);
        // SAFETY: The directory frame is pool-backed and owned by this
        // pmap; idx is bounded above.
        unsafe { *pool.frame_ptr(self.pdir).cast::<u32>().add(idx) }
    }

    fn set_dir_entry(&self, pool: &PhysPool, idx: usize, pde: u32) {
        debug_assert!(idx < NPDENTRIES);
        // SAFETY: See dir_entry.
        unsafe { *pool.frame_ptr(self.pdir).cast::<u32>().add(idx) = pde };
    }

    fn table_entry_ptr(pool: &PhysPool, table: FrameNumber, idx: usize) -> *mut u32 {
        debug_assert!(idx < NPTENTRIES);
        // SAFETY: Table frames are pool-backed; idx is bounded above.
        unsafe { pool.frame_ptr(table).cast::<u32>().add(idx) }
    }

    /// Find the PTE slot addressing `va`. With `create`, an absent page
    /// table is allocated (zeroed, referenced) and installed
    /// present|writable|user|accessed; without it the walk fails.
    fn walk(&self, pool: &PhysPool, va: u32, create: bool) -> Result<*mut u32, MemError> {
        let pde = self.dir_entry(pool, pdx(va));
        let table = if pde & PteFlags::P.bits() != 0 {
            debug_assert_eq!(pde & PteFlags::PS.bits(), 0, "walk through a 4 MiB mapping");
            pte_addr(pde).frame()
        } else {
            if !create {
                return Err(MemError::NotPresent);
            }
            let t = pool.alloc_page()?;
            pool.incref(t);
            pool.zero_frame(t);
            let flags = PteFlags::P | PteFlags::W | PteFlags::U | PteFlags::A;
            self.set_dir_entry(pool, pdx(va), t.addr().as_u32() | flags.bits());
            t
        };
        Ok(Self::table_entry_ptr(pool, table, ptx(va)))
    }

    /// Map `frame` at `va`. Fails with `Busy` if `va` is already
    /// mapped. Normal-pool frames are reference counted by the mapping.
    pub fn insert(
        &self,
        pool: &PhysPool,
        frame: FrameNumber,
        va: u32,
        perm: PteFlags,
    ) -> Result<(), MemError> {
        let pte = self.walk(pool, va, true)?;
        // SAFETY: walk returned a live slot in a pool-backed table.
        unsafe {
            if *pte & PteFlags::P.bits() != 0 {
                return Err(MemError::Busy);
            }
            let mut flags = perm | PteFlags::P;
            if frame.as_u32() < pool.nframes() && pool.kind(frame) == PageKind::Normal {
                pool.incref(frame);
                flags |= PteFlags::REFD;
            }
            *pte = frame.addr().as_u32() | flags.bits();
        }
        Ok(())
    }

    /// Identity-window variant: installs the mapping without taking a
    /// reference, for the shared kernel window that maps RAM it does
    /// not own.
    fn insert_unref(
        &self,
        pool: &PhysPool,
        pa: PhysAddr,
        va: u32,
        perm: PteFlags,
    ) -> Result<(), MemError> {
        let pte = self.walk(pool, va, true)?;
        // SAFETY: See insert.
        unsafe {
            if *pte & PteFlags::P.bits() != 0 {
                return Err(MemError::Busy);
            }
            *pte = pa.as_u32() | (perm | PteFlags::P).bits();
        }
        Ok(())
    }

    /// Unmap `[va, va + size)`. `size` must be a page multiple.
    /// Referenced leaves are decref'd; a page table whose whole span is
    /// covered is removed and decref'd too.
    pub fn remove(&self, pool: &PhysPool, va: u32, size: u32) {
        assert_eq!(page_off(size), 0, "remove size must be page aligned");
        let mut va = va;
        let end = va.checked_add(size).unwrap_or(u32::MAX & !(PAGE_SIZE as u32 - 1));

        while va < end {
            let pde = self.dir_entry(pool, pdx(va));
            if pde & PteFlags::P.bits() == 0 {
                // Nothing mapped under this PDE; skip to the next one.
                match (va & !(PTSIZE - 1)).checked_add(PTSIZE) {
                    Some(next) => {
                        va = next;
                        continue;
                    }
                    None => break,
                }
            }
            debug_assert_eq!(pde & PteFlags::PS.bits(), 0);

            let whole_table = ptx(va) == 0 && end - va >= PTSIZE;
            let table = pte_addr(pde).frame();

            loop {
                let pte = Self::table_entry_ptr(pool, table, ptx(va));
                // SAFETY: Slot bounded by the table frame.
                unsafe {
                    let old = *pte;
                    *pte = 0;
                    if old & (PteFlags::P | PteFlags::REFD).bits()
                        == (PteFlags::P | PteFlags::REFD).bits()
                    {
                        pool.decref(pte_addr(old).frame());
                    }
                }
                va = match va.checked_add(PAGE_SIZE as u32) {
                    Some(v) => v,
                    None => return,
                };
                if va >= end || ptx(va) == 0 {
                    break;
                }
            }

            if whole_table {
                self.set_dir_entry(pool, pdx(va.wrapping_sub(PTSIZE)), 0);
                pool.decref(table);
            }
        }
    }

    /// OR `perm` into every PTE of `[va, va + size)`, allocating page
    /// tables as needed. An empty `perm` is a no-op.
    pub fn setperm(&self, pool: &PhysPool, va: u32, size: u32, perm: PteFlags) -> Result<(), MemError> {
        assert_eq!(page_off(va), 0);
        assert_eq!(page_off(size), 0);
        if perm.is_empty() {
            return Ok(());
        }
        let mut va = va;
        let end = va + size;
        while va < end {
            let pte = self.walk(pool, va, true)?;
            // SAFETY: walk returned a live slot.
            unsafe { *pte |= perm.bits() };
            va += PAGE_SIZE as u32;
        }
        Ok(())
    }

    /// The PTE addressing `va`, or None when either level is absent.
    pub fn lookup(&self, pool: &PhysPool, va: u32) -> Option<u32> {
        let pde = self.dir_entry(pool, pdx(va));
        if pde & PteFlags::P.bits() == 0 {
            return None;
        }
        if pde & PteFlags::PS.bits() != 0 {
            // 4 MiB mapping: synthesize the leaf view.
            let base = pde & !(PTSIZE - 1);
            return Some(base | (va & (PTSIZE - 1) & !0xFFF) | (pde & 0xFFF & !PteFlags::PS.bits()));
        }
        let pte = Self::table_entry_ptr(pool, pte_addr(pde).frame(), ptx(va));
        // SAFETY: Slot bounded by the table frame.
        let val = unsafe { *pte };
        (val & PteFlags::P.bits() != 0).then_some(val)
    }

    /// True iff every page of `[va, va + size)` is present. An empty
    /// range trivially checks out; a partial page checks its enclosing
    /// page.
    pub fn checkrange(&self, pool: &PhysPool, va: u32, size: u32) -> bool {
        if size == 0 {
            return true;
        }
        let mut page = va & !(PAGE_SIZE as u32 - 1);
        let last = match va.checked_add(size - 1) {
            Some(e) => e & !(PAGE_SIZE as u32 - 1),
            None => return false,
        };
        loop {
            if self.lookup(pool, page).is_none() {
                return false;
            }
            if page == last {
                return true;
            }
            page += PAGE_SIZE as u32;
        }
    }

    /// Copy `size` bytes from `(src, sva)` to `(dst, dva)`, page by
    /// page. Returns the number of bytes copied: `size`, or 0 when
    /// either range does not fully resolve.
    pub fn copy(
        pool: &PhysPool,
        dst: &Pmap,
        dva: u32,
        src: &Pmap,
        sva: u32,
        size: u32,
    ) -> usize {
        if !dst.checkrange(pool, dva, size) || !src.checkrange(pool, sva, size) {
            return 0;
        }
        let mut copied = 0u32;
        while copied < size {
            let d = dva + copied;
            let s = sva + copied;
            let d_pa = pte_addr(dst.lookup(pool, d).unwrap()).as_u32() + page_off(d);
            let s_pa = pte_addr(src.lookup(pool, s).unwrap()).as_u32() + page_off(s);
            let chunk = (size - copied)
                .min(PAGE_SIZE as u32 - page_off(d))
                .min(PAGE_SIZE as u32 - page_off(s));
            // SAFETY: Both physical ranges resolve into pool frames and
            // chunk stays inside one page on each side.
            unsafe {
                core::ptr::copy(
                    pool.phys_ptr(PhysAddr::new(s_pa)),
                    pool.phys_ptr(PhysAddr::new(d_pa)),
                    chunk as usize,
                );
            }
            copied += chunk;
        }
        size as usize
    }

    /// Fill `size` bytes at `va` with `byte`. Same resolution contract
    /// as `copy`.
    pub fn memset(&self, pool: &PhysPool, va: u32, byte: u8, size: u32) -> usize {
        if !self.checkrange(pool, va, size) {
            return 0;
        }
        let mut done = 0u32;
        while done < size {
            let v = va + done;
            let pa = pte_addr(self.lookup(pool, v).unwrap()).as_u32() + page_off(v);
            let chunk = (size - done).min(PAGE_SIZE as u32 - page_off(v));
            // SAFETY: The range resolves into a pool frame and chunk
            // stays inside one page.
            unsafe { core::ptr::write_bytes(pool.phys_ptr(PhysAddr::new(pa)), byte, chunk as usize) };
            done += chunk;
        }
        size as usize
    }

    /// Build the shared kernel pmap: identity-map available RAM below
    /// the user window with 4 KiB global pages, and the device window
    /// above it with 4 MiB global mappings that need no backing tables.
    pub fn new_kernel(pool: &PhysPool) -> Result<Self, MemError> {
        let pmap = Pmap::new(pool)?;
        let flags = PteFlags::W | PteFlags::G;

        let top = (pool.nframes() << PAGE_SHIFT).min(VM_USERLO);
        let mut va = 0;
        while va < top {
            pmap.insert_unref(pool, PhysAddr::new(va), va, flags)?;
            va += PAGE_SIZE as u32;
        }

        // Device space: 4 MiB page-size mappings straight in the PDEs.
        let mut va = VM_USERHI;
        loop {
            pmap.set_dir_entry(
                pool,
                pdx(va),
                va | (flags | PteFlags::P | PteFlags::PS).bits(),
            );
            va = match va.checked_add(PTSIZE) {
                Some(v) => v,
                None => break,
            };
        }
        Ok(pmap)
    }

    /// Build a user pmap: share the kernel pmap's directory slots
    /// outside the user window. Shared page tables gain one reference
    /// per directory that points at them.
    pub fn new_user(pool: &PhysPool, kernel: &Pmap) -> Result<Self, MemError> {
        let pmap = Pmap::new(pool)?;
        for idx in 0..NPDENTRIES {
            let va = (idx as u32) << 22;
            if (VM_USERLO..VM_USERHI).contains(&va) {
                continue;
            }
            let pde = kernel.dir_entry(pool, idx);
            if pde & PteFlags::P.bits() == 0 {
                continue;
            }
            if pde & PteFlags::PS.bits() == 0 {
                pool.incref(pte_addr(pde).frame());
            }
            pmap.set_dir_entry(pool, idx, pde);
        }
        Ok(pmap)
    }

    /// Tear the pmap down: unmap the user window, release every page
    /// table still referenced from the directory, then the directory
    /// itself.
    pub fn destroy(self, pool: &PhysPool) {
        self.remove(pool, VM_USERLO, VM_USERHI - VM_USERLO);
        for idx in 0..NPDENTRIES {
            let pde = self.dir_entry(pool, idx);
            if pde & PteFlags::P.bits() != 0 && pde & PteFlags::PS.bits() == 0 {
                self.set_dir_entry(pool, idx, 0);
                pool.decref(pte_addr(pde).frame());
            }
        }
        pool.decref(self.pdir);
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil;
    use super::*;

    const UVA: u32 = 0x5000_0000;

    #[test]
    fn insert_then_lookup_round_trips() {
        let pool = testutil::pool(16);
        let pmap = Pmap::new(pool).unwrap();
        let f = pool.alloc_page().unwrap();

        pmap.insert(pool, f, UVA, PteFlags::W | PteFlags::U).unwrap();
        let pte = pmap.lookup(pool, UVA).unwrap();
        assert_eq!(pte_addr(pte), f.addr());
        assert!(pte & PteFlags::W.bits() != 0);
        assert_eq!(pool.refcount(f), 1, "insert must reference a pool frame");
    }

    #[test]
    fn double_insert_is_busy() {
        let pool = testutil::pool(16);
        let pmap = Pmap::new(pool).unwrap();
        let f = pool.alloc_page().unwrap();
        let g = pool.alloc_page().unwrap();
        pmap.insert(pool, f, UVA, PteFlags::W | PteFlags::U).unwrap();
        assert_eq!(
            pmap.insert(pool, g, UVA, PteFlags::W | PteFlags::U),
            Err(MemError::Busy)
        );
    }

    #[test]
    fn walk_allocates_and_references_page_tables() {
        let pool = testutil::pool(16);
        let free_before = pool.free_frames();
        let pmap = Pmap::new(pool).unwrap();
        let f = pool.alloc_page().unwrap();
        pmap.insert(pool, f, UVA, PteFlags::U).unwrap();
        // Directory + table + leaf.
        assert_eq!(pool.free_frames(), free_before - 3);

        let pde = pmap.dir_entry(pool, pdx(UVA));
        assert!(pde & PteFlags::P.bits() != 0);
        let table = pte_addr(pde).frame();
        assert_eq!(pte_addr(pde).as_u32() % PAGE_SIZE as u32, 0);
        assert_eq!(pool.refcount(table), 1);
    }

    #[test]
    fn remove_releases_leaves_and_whole_tables() {
        let pool = testutil::pool(32);
        let pmap = Pmap::new(pool).unwrap();
        let free_start = pool.free_frames();

        for i in 0..4 {
            let f = pool.alloc_page().unwrap();
            pmap.insert(pool, f, UVA + i * PAGE_SIZE as u32, PteFlags::W | PteFlags::U)
                .unwrap();
        }
        // Partial remove keeps the table.
        pmap.remove(pool, UVA, 2 * PAGE_SIZE as u32);
        assert!(pmap.lookup(pool, UVA).is_none());
        assert!(pmap.lookup(pool, UVA + 2 * PAGE_SIZE as u32).is_some());

        // Covering the whole 4 MiB span releases the table as well.
        pmap.remove(pool, UVA & !(PTSIZE - 1), PTSIZE);
        assert!(pmap.lookup(pool, UVA + 2 * PAGE_SIZE as u32).is_none());
        assert_eq!(pool.free_frames(), free_start);
    }

    #[test]
    fn checkrange_boundaries() {
        let pool = testutil::pool(16);
        let pmap = Pmap::new(pool).unwrap();
        let f = pool.alloc_page().unwrap();
        pmap.insert(pool, f, UVA, PteFlags::U).unwrap();

        assert!(pmap.checkrange(pool, UVA + 123, 0), "empty range is trivially fine");
        assert!(pmap.checkrange(pool, UVA + 123, 1));
        assert!(pmap.checkrange(pool, UVA, PAGE_SIZE as u32));
        assert!(!pmap.checkrange(pool, UVA, PAGE_SIZE as u32 + 1));
        assert!(!pmap.checkrange(pool, UVA - 1, 2));
    }

    #[test]
    fn setperm_with_no_bits_is_a_noop() {
        let pool = testutil::pool(8);
        let pmap = Pmap::new(pool).unwrap();
        let free_before = pool.free_frames();
        pmap.setperm(pool, UVA, 4 * PAGE_SIZE as u32, PteFlags::empty())
            .unwrap();
        // No tables were allocated and nothing became present.
        assert_eq!(pool.free_frames(), free_before);
        assert!(pmap.lookup(pool, UVA).is_none());
    }

    #[test]
    fn setperm_or_updates_flags() {
        let pool = testutil::pool(16);
        let pmap = Pmap::new(pool).unwrap();
        let f = pool.alloc_page().unwrap();
        pmap.insert(pool, f, UVA, PteFlags::U).unwrap();
        assert_eq!(pmap.lookup(pool, UVA).unwrap() & PteFlags::W.bits(), 0);

        pmap.setperm(pool, UVA, PAGE_SIZE as u32, PteFlags::W).unwrap();
        let pte = pmap.lookup(pool, UVA).unwrap();
        assert!(pte & PteFlags::W.bits() != 0);
        assert!(pte & PteFlags::U.bits() != 0, "existing bits survive");
    }

    #[test]
    fn copy_moves_bytes_across_pmaps() {
        let pool = testutil::pool(32);
        let a = Pmap::new(pool).unwrap();
        let b = Pmap::new(pool).unwrap();

        let fa = pool.alloc_page().unwrap();
        let fb = pool.alloc_page().unwrap();
        a.insert(pool, fa, UVA, PteFlags::W | PteFlags::U).unwrap();
        b.insert(pool, fb, UVA + PTSIZE, PteFlags::W | PteFlags::U).unwrap();

        a.memset(pool, UVA, 0x5A, PAGE_SIZE as u32);
        let n = Pmap::copy(pool, &b, UVA + PTSIZE, &a, UVA, 64);
        assert_eq!(n, 64);
        // SAFETY: fb is arena-backed.
        unsafe {
            assert_eq!(*pool.frame_ptr(fb), 0x5A);
            assert_eq!(*pool.frame_ptr(fb).add(63), 0x5A);
            assert_eq!(*pool.frame_ptr(fb).add(64), 0);
        }
    }

    #[test]
    fn copy_of_an_unresolved_range_copies_nothing() {
        let pool = testutil::pool(16);
        let a = Pmap::new(pool).unwrap();
        let b = Pmap::new(pool).unwrap();
        let fa = pool.alloc_page().unwrap();
        a.insert(pool, fa, UVA, PteFlags::W | PteFlags::U).unwrap();
        assert_eq!(Pmap::copy(pool, &b, UVA, &a, UVA, 16), 0);
    }

    #[test]
    fn kernel_map_covers_ram_with_global_unrefd_pages() {
        let pool = testutil::pool(24);
        let k = Pmap::new_kernel(pool).unwrap();

        let pte = k.lookup(pool, 0).unwrap();
        assert_eq!(pte_addr(pte).as_u32(), 0);
        assert!(pte & PteFlags::G.bits() != 0);
        assert!(pte & PteFlags::W.bits() != 0);
        assert_eq!(pte & PteFlags::REFD.bits(), 0, "identity window takes no references");
        assert_eq!(pte & PteFlags::U.bits(), 0, "kernel window hidden from ring 3");

        // Device window resolves through 4 MiB mappings.
        let dev = k.lookup(pool, VM_USERHI + 0x0123_4000).unwrap();
        assert_eq!(pte_addr(dev).as_u32(), VM_USERHI + 0x0123_4000);
        assert!(dev & PteFlags::G.bits() != 0);
    }

    #[test]
    fn user_map_shares_kernel_slots_and_destroy_balances() {
        let pool = testutil::pool(24);
        let free0 = pool.free_frames();
        let k = Pmap::new_kernel(pool).unwrap();
        let u = Pmap::new_user(pool, &k).unwrap();

        // Kernel window visible through the user pmap.
        assert_eq!(u.lookup(pool, 0), k.lookup(pool, 0));
        // User window empty.
        assert!(u.lookup(pool, VM_USERLO).is_none());

        // Populate and tear down; only the kernel pmap's frames remain.
        let f = pool.alloc_page().unwrap();
        u.insert(pool, f, UVA, PteFlags::W | PteFlags::U).unwrap();
        u.destroy(pool);
        k.destroy(pool);
        assert_eq!(pool.free_frames(), free0);
    }

    /// Invariant: every present, non-4MiB PDE references a page-aligned
    /// frame with refcount at least 1.
    #[test]
    fn present_pdes_reference_aligned_live_frames() {
        let pool = testutil::pool(24);
        let k = Pmap::new_kernel(pool).unwrap();
        let u = Pmap::new_user(pool, &k).unwrap();
        let f = pool.alloc_page().unwrap();
        u.insert(pool, f, UVA, PteFlags::U).unwrap();

        for pmap in [&k, &u] {
            for idx in 0..NPDENTRIES {
                let pde = pmap.dir_entry(pool, idx);
                if pde & PteFlags::P.bits() == 0 || pde & PteFlags::PS.bits() != 0 {
                    continue;
                }
                assert_eq!(pte_addr(pde).as_u32() % PAGE_SIZE as u32, 0);
                assert!(pool.refcount(pte_addr(pde).frame()) >= 1);
            }
        }
    }
}
