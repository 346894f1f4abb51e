//! Frame accounting across address-space teardown. Kept in its own test
//! binary so the global allocated-frame counter is not disturbed by
//! concurrent tests.

mod common;

use common::init_mem;
use ferrite_kernel::kernel::mem::{frame_allocator, AddressSpace, MmapFlags, VmFlags};
use ferrite_mm::address::VAddr;
use ferrite_mm::paging::PAGE_SIZE;

#[test]
fn address_space_teardown_releases_frames() {
    init_mem();
    let allocator = frame_allocator();

    // Unmapping pages that were never faulted in allocates nothing: the
    // unmap walk skips missing tables instead of creating them.
    {
        let mm = AddressSpace::new();
        let base = mm
            .mmap_anonymous(
                VAddr::NULL,
                MmapFlags::PRIVATE,
                VmFlags::READ | VmFlags::WRITE,
                8,
            )
            .unwrap();
        let untouched = allocator.allocated_frames();
        mm.munmap(base, 8 * PAGE_SIZE).unwrap();
        assert_eq!(allocator.allocated_frames(), untouched);
    }

    let before = allocator.allocated_frames();
    {
        let parent = AddressSpace::new();
        let base = parent
            .mmap_anonymous(
                VAddr::NULL,
                MmapFlags::PRIVATE,
                VmFlags::READ | VmFlags::WRITE,
                16,
            )
            .unwrap();
        parent.write_user(base, &[1u8; 16 * PAGE_SIZE]).unwrap();
        assert!(allocator.allocated_frames() > before);

        // A forked copy shares the frames; dropping both releases them.
        let child = parent.fork();
        child.write_user(base, &[2u8; PAGE_SIZE]).unwrap();
    }
    assert_eq!(allocator.allocated_frames(), before);
}
