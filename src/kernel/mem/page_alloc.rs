use ferrite_mm::paging::PFN;
use ferrite_pmm::FrameAllocator;
use spin::Once;

static FRAME_ALLOCATOR: Once<FrameAllocator> = Once::new();

/// Create the emulated physical memory and the frame table over it.
/// Frame 0 is reserved so a PFN of zero never leaves the allocator.
pub fn init_frames(nframes: usize) {
    FRAME_ALLOCATOR.call_once(|| {
        ferrite_hal::init_phys_memory(nframes);
        let allocator = FrameAllocator::new(nframes);
        allocator.reserve(PFN::from(0), 1);
        allocator
    });
}

pub fn frame_allocator() -> &'static FrameAllocator {
    FRAME_ALLOCATOR.get().expect("frame allocator not initialised")
}
