//! Kernel heap.
//!
//! A fixed early region handed to `linked_list_allocator` before the
//! page pool exists, so boot code can already use `alloc` collections.
//! The host build uses the system allocator instead and this module
//! reduces to a stub.

#[cfg(all(target_arch = "x86", target_os = "none"))]
mod imp {
    use core::sync::atomic::{AtomicBool, Ordering};

    /// 1 MiB of statically reserved heap.
    const HEAP_BYTES: usize = 1024 * 1024;

    #[repr(align(4096))]
    struct HeapArena([u8; HEAP_BYTES]);

    static mut HEAP_ARENA: HeapArena = HeapArena([0; HEAP_BYTES]);
    static HEAP_READY: AtomicBool = AtomicBool::new(false);

    /// Hand the static arena to the global allocator. Idempotent.
    pub fn init() {
        if HEAP_READY.swap(true, Ordering::AcqRel) {
            return;
        }
        // SAFETY: The arena is only donated once and never referenced
        // outside the allocator afterwards.
        unsafe {
            let base = core::ptr::addr_of_mut!(HEAP_ARENA) as *mut u8;
            crate::ALLOCATOR.lock().init(base, HEAP_BYTES);
        }
        log::debug!("heap: {} KiB ready", HEAP_BYTES / 1024);
    }
}

#[cfg(not(all(target_arch = "x86", target_os = "none")))]
mod imp {
    /// The host links the system allocator; nothing to do.
    pub fn init() {}
}

pub use imp::init;
