//! Boot orchestration.
//!
//! Bring-up is a fixed sequence: console and logging first so later
//! stages can talk, then the heap, the physical pool and kernel map,
//! this CPU's descriptor tables and trap vectors, and finally the
//! scheduler idle loop. Application processors run the short tail of
//! the same sequence.

#[cfg(feature = "alloc")]
use crate::mm::{self, e820::MemRegion};
use crate::{arch, klog, serial};

/// Physical address where the kernel image ends; everything below is
/// off-limits to the page pool.
#[cfg(all(target_arch = "x86", target_os = "none"))]
fn kernel_end() -> u64 {
    extern "C" {
        static __kernel_end: u8;
    }
    // SAFETY: Linker-provided symbol; only its address is taken.
    unsafe { core::ptr::addr_of!(__kernel_end) as u64 }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
#[cfg(feature = "alloc")]
fn kernel_end() -> u64 {
    0x10_0000
}

/// Bring up the boot processor. `regions` is the parsed memory map;
/// empty means the bootloader passed none and the NVRAM fallback is
/// consulted.
#[cfg(feature = "alloc")]
pub fn primary(regions: &[MemRegion]) {
    serial::init();
    klog::init(log::LevelFilter::Info);
    log::info!("cinnabar: booting");

    mm::heap::init();

    if regions.is_empty() {
        // No map from the bootloader; the NVRAM probe is the last
        // resort and only exists on real hardware.
        #[cfg(all(target_arch = "x86", target_os = "none"))]
        {
            let fallback = mm::e820::nvram_fallback();
            mm::init(&fallback, kernel_end()).expect("physical memory init");
        }
        #[cfg(not(all(target_arch = "x86", target_os = "none")))]
        panic!("boot without a memory map");
    } else {
        mm::init(regions, kernel_end()).expect("physical memory init");
    }

    arch::percpu::init(0);
    crate::trap::init(0);
    mm::kernel_pmap();
    crate::mm::addrspace::set_active_root(0, mm::kernel_pmap().root());

    #[cfg(feature = "hvm")]
    if crate::hvm::available() {
        log::info!("hvm: hardware virtualization present");
    } else {
        log::info!("hvm: not available on this processor");
    }

    log::info!("cinnabar: cpu 0 up");
}

/// Bring up an application processor.
#[cfg(feature = "alloc")]
pub fn secondary(cpu: usize) {
    arch::percpu::init(cpu);
    crate::trap::init(cpu);
    crate::mm::addrspace::set_active_root(cpu, mm::kernel_pmap().root());
    log::info!("cinnabar: cpu {} up", cpu);
}

/// Park the CPU until the scheduler has work.
pub fn idle_loop() -> ! {
    loop {
        #[cfg(feature = "alloc")]
        crate::proc::sched::resched_and_switch(arch::cpu_id(), false);
        crate::arch::x86::cpu::halt();
        core::hint::spin_loop();
    }
}
