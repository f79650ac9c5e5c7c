//! ELF32 loader.
//!
//! Validates the header, walks the program headers and materializes
//! every `PT_LOAD` segment in the target address space: pages are
//! reserved read-only, file bytes land through the physical window, and
//! the writable bit is granted only where the header asks for it.

use super::ProcError;
use crate::mm::{page_down, page_off, page_up, AddrSpace, PhysPool, Pmap, PteFlags, PAGE_SIZE, VM_USERHI, VM_USERLO};

pub const ELF_MAGIC: u32 = 0x464C_457F; // "\x7FELF"

const ET_EXEC: u16 = 2;
const EM_386: u16 = 3;
pub const PT_LOAD: u32 = 1;
pub const PF_W: u32 = 2;

/// ELF32 file header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Ehdr {
    pub magic: u32,
    pub ident: [u8; 12],
    pub e_type: u16,
    pub machine: u16,
    pub version: u32,
    pub entry: u32,
    pub phoff: u32,
    pub shoff: u32,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// ELF32 program header.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub offset: u32,
    pub vaddr: u32,
    pub paddr: u32,
    pub filesz: u32,
    pub memsz: u32,
    pub flags: u32,
    pub align: u32,
}

/// Something an ELF image can be read out of.
pub trait ImageSource {
    fn read_at(&self, off: u32, buf: &mut [u8]) -> Result<(), ProcError>;
}

impl ImageSource for &[u8] {
    fn read_at(&self, off: u32, buf: &mut [u8]) -> Result<(), ProcError> {
        let off = off as usize;
        let end = off.checked_add(buf.len()).ok_or(ProcError::BadImage)?;
        if end > self.len() {
            return Err(ProcError::BadImage);
        }
        buf.copy_from_slice(&self[off..end]);
        Ok(())
    }
}

/// An image sitting in some process's user memory.
pub struct UserImage<'a> {
    pool: &'a PhysPool,
    pmap: &'a Pmap,
    base: u32,
    len: u32,
}

impl<'a> UserImage<'a> {
    pub fn new(pool: &'a PhysPool, pmap: &'a Pmap, base: u32, len: u32) -> Result<Self, ProcError> {
        if base < VM_USERLO || base.checked_add(len).is_none_or(|e| e > VM_USERHI) {
            return Err(ProcError::BadImage);
        }
        if !pmap.checkrange(pool, base, len) {
            return Err(ProcError::BadImage);
        }
        Ok(UserImage { pool, pmap, base, len })
    }
}

impl ImageSource for UserImage<'_> {
    fn read_at(&self, off: u32, buf: &mut [u8]) -> Result<(), ProcError> {
        let end = off.checked_add(buf.len() as u32).ok_or(ProcError::BadImage)?;
        if end > self.len {
            return Err(ProcError::BadImage);
        }
        let mut done = 0usize;
        while done < buf.len() {
            let va = self.base + off + done as u32;
            let pte = self.pmap.lookup(self.pool, va).ok_or(ProcError::BadImage)?;
            let chunk = (buf.len() - done).min(PAGE_SIZE - page_off(va) as usize);
            // SAFETY: The PTE resolves to a pool frame; chunk stays in
            // its page.
            unsafe {
                let src = self
                    .pool
                    .frame_ptr(crate::mm::FrameNumber::new(pte >> 12))
                    .add(page_off(va) as usize);
                core::ptr::copy_nonoverlapping(src, buf[done..].as_mut_ptr(), chunk);
            }
            done += chunk;
        }
        Ok(())
    }
}

fn read_struct<T: Copy, S: ImageSource + ?Sized>(src: &S, off: u32) -> Result<T, ProcError> {
    let mut val = core::mem::MaybeUninit::<T>::uninit();
    // SAFETY: The byte view covers exactly the uninitialized value,
    // which is Copy and filled completely before assume_init.
    unsafe {
        let bytes =
            core::slice::from_raw_parts_mut(val.as_mut_ptr().cast::<u8>(), core::mem::size_of::<T>());
        src.read_at(off, bytes)?;
        Ok(val.assume_init())
    }
}

/// Load `src` into `space`. Returns the image entry point.
pub fn load<S: ImageSource + ?Sized>(
    pool: &PhysPool,
    space: &AddrSpace,
    src: &S,
) -> Result<u32, ProcError> {
    let ehdr: Elf32Ehdr = read_struct(src, 0)?;
    if ehdr.magic != ELF_MAGIC || ehdr.machine != EM_386 || ehdr.e_type != ET_EXEC {
        return Err(ProcError::BadImage);
    }
    if ehdr.phentsize as usize != core::mem::size_of::<Elf32Phdr>() {
        return Err(ProcError::BadImage);
    }

    for i in 0..ehdr.phnum as u32 {
        let ph: Elf32Phdr = read_struct(src, ehdr.phoff + i * ehdr.phentsize as u32)?;
        if ph.p_type != PT_LOAD {
            continue;
        }
        if ph.filesz > ph.memsz {
            return Err(ProcError::BadImage);
        }
        let start = page_down(ph.vaddr);
        let end = page_up(ph.vaddr.checked_add(ph.memsz).ok_or(ProcError::BadImage)?);
        if start < VM_USERLO || end > VM_USERHI || end <= start {
            return Err(ProcError::BadImage);
        }

        let mut va = start;
        while va < end {
            space.reserve(pool, va, PteFlags::U)?;
            va += PAGE_SIZE as u32;
        }

        // File bytes through the physical window; the rest of the
        // span stays at the zero fill reserve left behind.
        let mut copied = 0u32;
        while copied < ph.filesz {
            let va = ph.vaddr + copied;
            let pte = space.lookup(pool, va).ok_or(ProcError::BadImage)?;
            let chunk = (ph.filesz - copied).min(PAGE_SIZE as u32 - page_off(va));
            // SAFETY: Freshly reserved pool frame; chunk stays inside it.
            unsafe {
                let dst = pool
                    .frame_ptr(crate::mm::FrameNumber::new(pte >> 12))
                    .add(page_off(va) as usize);
                let bytes = core::slice::from_raw_parts_mut(dst, chunk as usize);
                src.read_at(ph.offset + copied, bytes)?;
            }
            copied += chunk;
        }

        if ph.flags & PF_W != 0 {
            space.setperm(pool, start, end - start, PteFlags::W)?;
        }
    }

    if ehdr.entry < VM_USERLO || ehdr.entry >= VM_USERHI {
        return Err(ProcError::BadImage);
    }
    Ok(ehdr.entry)
}

/// Build a minimal in-memory executable for tests and the boot image
/// path: one segment, `code` at `vaddr`, entry at `vaddr`.
#[cfg(any(test, feature = "alloc"))]
pub fn build_image(vaddr: u32, code: &[u8], writable: bool) -> alloc::vec::Vec<u8> {
    use alloc::vec::Vec;

    let ehsize = core::mem::size_of::<Elf32Ehdr>();
    let phsize = core::mem::size_of::<Elf32Phdr>();
    let ehdr = Elf32Ehdr {
        magic: ELF_MAGIC,
        ident: [0; 12],
        e_type: ET_EXEC,
        machine: EM_386,
        version: 1,
        entry: vaddr,
        phoff: ehsize as u32,
        shoff: 0,
        flags: 0,
        ehsize: ehsize as u16,
        phentsize: phsize as u16,
        phnum: 1,
        shentsize: 0,
        shnum: 0,
        shstrndx: 0,
    };
    let phdr = Elf32Phdr {
        p_type: PT_LOAD,
        offset: (ehsize + phsize) as u32,
        vaddr,
        paddr: vaddr,
        filesz: code.len() as u32,
        memsz: code.len() as u32 + 0x100, // a little bss
        flags: if writable { PF_W } else { 0 },
        align: PAGE_SIZE as u32,
    };

    let mut out = Vec::new();
    // SAFETY: Both structs are repr(C) plain data.
    unsafe {
        out.extend_from_slice(core::slice::from_raw_parts(
            (&ehdr as *const Elf32Ehdr).cast::<u8>(),
            ehsize,
        ));
        out.extend_from_slice(core::slice::from_raw_parts(
            (&phdr as *const Elf32Phdr).cast::<u8>(),
            phsize,
        ));
    }
    out.extend_from_slice(code);
    out
}
