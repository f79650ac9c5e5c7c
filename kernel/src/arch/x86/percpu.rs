//! The per-CPU block.
//!
//! Every CPU owns exactly one page, the `Kstack`: descriptor tables and
//! per-CPU metadata at the low end, the kernel stack growing down from
//! the top. A process's kernel stack is a separate allocation of the
//! same shape, so masking any ring-0 stack pointer to its page boundary
//! finds the block for whatever is running.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

use super::seg::{self, SegDesc, TaskState, GDT_ENTRIES};
use crate::{config::MAX_CPU, mm::PAGE_SIZE};

/// Stamp written at bring-up; checked on every ring-0 entry.
pub const KSTACK_MAGIC: u32 = 0x9876_5432;

/// Fixed low-end layout of a kernel-stack page.
#[repr(C)]
pub struct KstackHeader {
    gdt: [SegDesc; GDT_ENTRIES],
    tss: TaskState,
    cpu_id: u32,
    booted: AtomicBool,
    magic: AtomicU32,
}

const STACK_BYTES: usize = PAGE_SIZE - core::mem::size_of::<KstackHeader>();

/// One kernel-stack page.
#[repr(C, align(4096))]
pub struct Kstack {
    hdr: KstackHeader,
    stack: [u8; STACK_BYTES],
}

impl Kstack {
    pub const fn empty() -> Self {
        Kstack {
            hdr: KstackHeader {
                gdt: [SegDesc::null(); GDT_ENTRIES],
                tss: TaskState::zeroed(),
                cpu_id: 0,
                booted: AtomicBool::new(false),
                magic: AtomicU32::new(0),
            },
            stack: [0; STACK_BYTES],
        }
    }

    /// Populate the block for `cpu`: flat kernel/user segments, a TSS
    /// whose ring-0 stack is the top of this very page, and the magic
    /// stamp. Loading the tables into the processor is the caller's
    /// (bare-metal) job; the layout work is identical everywhere.
    pub fn setup(&mut self, cpu: u32) {
        self.hdr.gdt[0] = SegDesc::null();
        self.hdr.gdt[(seg::SEG_KCODE >> 3) as usize] = SegDesc::code(0);
        self.hdr.gdt[(seg::SEG_KDATA >> 3) as usize] = SegDesc::data(0);
        self.hdr.gdt[(seg::SEG_UCODE >> 3) as usize] = SegDesc::code(3);
        self.hdr.gdt[(seg::SEG_UDATA >> 3) as usize] = SegDesc::data(3);

        let tss_base = core::ptr::addr_of!(self.hdr.tss) as u32;
        let tss_limit = core::mem::size_of::<TaskState>() as u32 - 1;
        self.hdr.gdt[(seg::SEG_TSS >> 3) as usize] = SegDesc::tss(tss_base, tss_limit);

        self.hdr.tss = TaskState::zeroed();
        self.hdr.tss.esp0 = self.stack_top() as u32;
        self.hdr.tss.ss0 = seg::SEG_KDATA as u32;

        self.hdr.cpu_id = cpu;
        self.hdr.magic.store(KSTACK_MAGIC, Ordering::Release);
    }

    /// Highest usable stack address in this page.
    pub fn stack_top(&self) -> usize {
        self.stack.as_ptr() as usize + STACK_BYTES
    }

    pub fn cpu_id(&self) -> u32 {
        self.hdr.cpu_id
    }

    /// Retarget this block at another CPU (process stacks are stamped
    /// with their pinned CPU when scheduled).
    pub fn set_cpu_id(&mut self, cpu: u32) {
        self.hdr.cpu_id = cpu;
    }

    pub fn booted(&self) -> bool {
        self.hdr.booted.load(Ordering::Acquire)
    }

    pub fn set_booted(&self) {
        self.hdr.booted.store(true, Ordering::Release);
    }

    pub fn magic_ok(&self) -> bool {
        self.hdr.magic.load(Ordering::Acquire) == KSTACK_MAGIC
    }

    pub fn tss_mut(&mut self) -> &mut TaskState {
        &mut self.hdr.tss
    }

    pub fn gdt(&self) -> &[SegDesc; GDT_ENTRIES] {
        &self.hdr.gdt
    }
}

struct KstackCell(core::cell::UnsafeCell<Kstack>);

// SAFETY: Each cell is only written by its own CPU during bring-up and
// by the boot CPU before the others start.
unsafe impl Sync for KstackCell {}

#[allow(clippy::declare_interior_mutable_const)]
const KSTACK_INIT: KstackCell = KstackCell(core::cell::UnsafeCell::new(Kstack::empty()));

/// The boot-time kernel stacks, one per CPU.
static KSTACKS: [KstackCell; MAX_CPU] = [KSTACK_INIT; MAX_CPU];

/// Number of CPUs that completed bring-up.
static BOOTED_CPUS: AtomicUsize = AtomicUsize::new(0);

/// CPU id the host build reports; always 0.
#[cfg(not(all(target_arch = "x86", target_os = "none")))]
pub fn cpu_id() -> usize {
    0
}

/// Derive the CPU id from the current stack pointer's page.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn cpu_id() -> usize {
    current_kstack().cpu_id() as usize
}

/// The per-CPU block the current stack pointer lives in.
#[cfg(all(target_arch = "x86", target_os = "none"))]
pub fn current_kstack() -> &'static Kstack {
    let esp = super::cpu::read_esp() as usize;
    // SAFETY: Ring-0 stack pointers always point into a Kstack page;
    // the magic assert below backs that invariant.
    let ks = unsafe { &*((esp & !(PAGE_SIZE - 1)) as *const Kstack) };
    assert!(ks.magic_ok(), "kernel stack page lost its magic");
    ks
}

/// Bring up the per-CPU block for the calling CPU and load its
/// descriptor tables.
pub fn init(cpu: usize) {
    assert!(cpu < MAX_CPU);
    // SAFETY: Bring-up of slot `cpu` runs once, on one CPU.
    let ks = unsafe { &mut *KSTACKS[cpu].0.get() };
    ks.setup(cpu as u32);

    #[cfg(all(target_arch = "x86", target_os = "none"))]
    load_tables(ks);

    ks.set_booted();
    BOOTED_CPUS.fetch_add(1, Ordering::AcqRel);
}

/// Shared access to a CPU's block after bring-up.
pub fn kstack(cpu: usize) -> &'static Kstack {
    assert!(cpu < MAX_CPU);
    // SAFETY: After init the block is only read, except for the TSS
    // esp0 update done by its own CPU with interrupts off.
    unsafe { &*KSTACKS[cpu].0.get() }
}

/// Number of CPUs online.
pub fn ncpu() -> usize {
    BOOTED_CPUS.load(Ordering::Acquire).max(1)
}

#[cfg(all(target_arch = "x86", target_os = "none"))]
fn load_tables(ks: &mut Kstack) {
    use core::arch::asm;

    use super::seg::PseudoDesc;

    let gdt_desc = PseudoDesc {
        limit: (GDT_ENTRIES * 8 - 1) as u16,
        base: ks.gdt().as_ptr() as u32,
    };
    // SAFETY: The GDT lives for the life of the kernel; selectors below
    // index entries initialized by setup().
    unsafe {
        asm!(
            "lgdt [{0}]",
            "mov ds, {1:x}",
            "mov es, {1:x}",
            "mov ss, {1:x}",
            "mov fs, {1:x}",
            "mov gs, {1:x}",
            "push {2}",
            "lea {3}, [2f]",
            "push {3}",
            "retf",
            "2:",
            "ltr {4:x}",
            in(reg) &gdt_desc,
            in(reg) seg::SEG_KDATA as u32,
            const seg::SEG_KCODE as i32,
            out(reg) _,
            in(reg) seg::SEG_TSS as u32,
        );
    }
    super::idt::load();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kstack_is_exactly_one_page() {
        assert_eq!(core::mem::size_of::<Kstack>(), PAGE_SIZE);
        assert_eq!(core::mem::align_of::<Kstack>(), PAGE_SIZE);
    }

    #[test]
    fn setup_stamps_magic_and_points_tss_at_the_top() {
        let mut ks = alloc::boxed::Box::new(Kstack::empty());
        assert!(!ks.magic_ok());
        ks.setup(3);
        assert!(ks.magic_ok());
        assert_eq!(ks.cpu_id(), 3);
        assert_eq!(ks.tss_mut().esp0 as usize, ks.stack_top());
        assert_eq!(ks.tss_mut().ss0, seg::SEG_KDATA as u32);
        // Stack top is the end of the page.
        let base = &*ks as *const Kstack as usize;
        assert_eq!(ks.stack_top(), base + PAGE_SIZE);
    }

    #[test]
    fn gdt_has_the_five_live_descriptors() {
        let mut ks = alloc::boxed::Box::new(Kstack::empty());
        ks.setup(0);
        let gdt = ks.gdt();
        assert!(!gdt[0].present());
        for sel in [seg::SEG_KCODE, seg::SEG_KDATA, seg::SEG_TSS] {
            assert!(gdt[(sel >> 3) as usize].present());
            assert_eq!(gdt[(sel >> 3) as usize].dpl(), 0);
        }
        for sel in [seg::SEG_UCODE, seg::SEG_UDATA] {
            assert!(gdt[(sel >> 3) as usize].present());
            assert_eq!(gdt[(sel >> 3) as usize].dpl(), 3);
        }
    }
}
