use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ptr::NonNull;

use ferrite_mm::address::{PAddr, PRange};
use ferrite_mm::page_table::PhysAccess;
use ferrite_mm::paging::{PAGE_SIZE, PFN};
use spin::Once;

#[repr(C, align(4096))]
struct PageData([u8; PAGE_SIZE]);

struct PhysMemory {
    base: NonNull<u8>,
    nframes: usize,
}

// SAFETY: the arena is never moved or freed after init.
unsafe impl Send for PhysMemory {}
unsafe impl Sync for PhysMemory {}

static PHYS_MEMORY: Once<PhysMemory> = Once::new();

/// Create the emulated physical memory arena. Called once at boot, before
/// any frame is touched; later calls return the existing range.
pub fn init_phys_memory(nframes: usize) -> PRange {
    let memory = PHYS_MEMORY.call_once(|| {
        let mut pages = Vec::with_capacity(nframes);
        pages.resize_with(nframes, || PageData([0; PAGE_SIZE]));
        let leaked: &'static mut [PageData] = Box::leak(pages.into_boxed_slice());

        PhysMemory {
            base: NonNull::new(leaked.as_mut_ptr()).unwrap().cast(),
            nframes: leaked.len(),
        }
    });

    PRange::new(
        PAddr::from(0usize),
        PAddr::from(memory.nframes * PAGE_SIZE),
    )
}

/// Number of frames backing the emulated machine.
pub fn phys_frames() -> usize {
    PHYS_MEMORY.get().expect("physical memory not initialised").nframes
}

/// The platform direct map: a frame number becomes a kernel pointer.
#[derive(Clone, Copy, Default)]
pub struct ArchPhysAccess;

impl ArchPhysAccess {
    /// # Safety
    /// `pfn` must be inside the arena and the caller must uphold Rust's
    /// aliasing rules for the bytes it touches.
    pub unsafe fn as_ptr(pfn: PFN) -> NonNull<u8> {
        let memory = PHYS_MEMORY.get().expect("physical memory not initialised");
        debug_assert!(usize::from(pfn) < memory.nframes);
        NonNull::new_unchecked(memory.base.as_ptr().add(usize::from(pfn) * PAGE_SIZE))
    }
}

impl PhysAccess for ArchPhysAccess {
    unsafe fn ptr_for_pfn(&self, pfn: PFN) -> NonNull<u8> {
        Self::as_ptr(pfn)
    }
}
