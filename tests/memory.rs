//! Virtual memory behaviour driven end to end through the emulated
//! platform: zero-on-demand, copy-on-write across fork, splits, protection
//! changes, and fault classification.

mod common;

use common::init_mem;
use ferrite_hal::USER_SPACE_END;
use ferrite_kernel::kernel::mem::{
    dma_unshare, handle_page_fault, zero_page, AddressSpace, Fault, MmapFlags, VmError, VmFlags,
};
use ferrite_mm::address::VAddr;
use ferrite_mm::page_table::PageAttribute;
use ferrite_mm::paging::PAGE_SIZE;

const RW: VmFlags = VmFlags::READ.union(VmFlags::WRITE);

fn anon_rw(mm: &AddressSpace, npages: usize) -> VAddr {
    mm.mmap_anonymous(VAddr::NULL, MmapFlags::PRIVATE, RW, npages)
        .unwrap()
}

#[test]
fn zero_on_demand_reads_zeroes_and_shares_the_zero_page() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 4);

    let mut buf = [0xffu8; 64];
    mm.read_user(base + PAGE_SIZE, &mut buf).unwrap();
    assert_eq!(buf, [0u8; 64]);

    // The read fault mapped the shared zero frame, read-only.
    let (pfn, attr) = mm.page_table().lookup(base + PAGE_SIZE).unwrap();
    assert_eq!(pfn, zero_page().pfn());
    assert!(attr.contains(PageAttribute::PRESENT | PageAttribute::COPY_ON_WRITE));
    assert!(!attr.contains(PageAttribute::WRITE));

    // Writing replaces it with a private frame.
    mm.write_user(base + PAGE_SIZE, b"x").unwrap();
    let (pfn, attr) = mm.page_table().lookup(base + PAGE_SIZE).unwrap();
    assert_ne!(pfn, zero_page().pfn());
    assert!(attr.contains(PageAttribute::WRITE));

    let mut byte = [0u8; 1];
    mm.read_user(base + PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(&byte, b"x");
}

#[test]
fn write_fault_allocates_fresh_writable_pages() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 2);

    mm.write_user(base, &[7u8; PAGE_SIZE]).unwrap();
    let (regular, _, cow) = mm.area_stat(base).unwrap();
    assert_eq!((regular, cow), (1, 0));
}

#[test]
fn fork_copy_on_write_isolates_parent_and_child() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 8);

    // Touch all eight pages read-only: eight zero-page mappings.
    let mut buf = [0u8; 1];
    for page in 0..8 {
        mm.read_user(base + page * PAGE_SIZE, &mut buf).unwrap();
    }
    assert_eq!(mm.area_stat(base).unwrap(), (0, 0, 8));

    let child = mm.fork();
    assert_eq!(child.area_stat(base).unwrap(), (0, 0, 8));

    // Child writes byte 0 of page 3.
    child.write_user(base + 3 * PAGE_SIZE, &[0x5a]).unwrap();

    let mut parent_byte = [0xaau8; 1];
    mm.read_user(base + 3 * PAGE_SIZE, &mut parent_byte).unwrap();
    assert_eq!(parent_byte[0], 0, "parent must still see the zero page");

    let mut child_byte = [0u8; 1];
    child.read_user(base + 3 * PAGE_SIZE, &mut child_byte).unwrap();
    assert_eq!(child_byte[0], 0x5a);

    let (regular, _, cow) = mm.area_stat(base).unwrap();
    assert_eq!(regular + cow, 8);
    let (regular, _, cow) = child.area_stat(base).unwrap();
    assert_eq!(regular + cow, 8);
}

#[test]
fn fork_after_writes_makes_both_sides_cow() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 4);

    mm.write_user(base, &[1u8; 2 * PAGE_SIZE]).unwrap();
    assert_eq!(mm.area_stat(base).unwrap(), (2, 0, 0));

    let child = mm.fork();

    // The parent's written pages turned CoW.
    assert_eq!(mm.area_stat(base).unwrap(), (0, 0, 2));
    let (_, attr) = mm.page_table().lookup(base).unwrap();
    assert!(attr.contains(PageAttribute::COPY_ON_WRITE));
    assert!(!attr.contains(PageAttribute::WRITE));

    // Parent writes again: its page is copied, the child still sees 1s.
    mm.write_user(base, &[9u8]).unwrap();
    let mut byte = [0u8; 1];
    child.read_user(base, &mut byte).unwrap();
    assert_eq!(byte[0], 1);
}

#[test]
fn shared_mapping_survives_fork() {
    init_mem();
    let mm = AddressSpace::new();
    let base = mm
        .mmap_anonymous(VAddr::NULL, MmapFlags::SHARED, RW, 2)
        .unwrap();

    mm.write_user(base, b"shared").unwrap();
    let child = mm.fork();

    // Same frame on both sides.
    let (parent_pfn, _) = mm.page_table().lookup(base).unwrap();
    let (child_pfn, child_attr) = child.page_table().lookup(base).unwrap();
    assert_eq!(parent_pfn, child_pfn);
    assert!(child_attr.contains(PageAttribute::WRITE));

    child.write_user(base, b"SHARED").unwrap();
    let mut buf = [0u8; 6];
    mm.read_user(base, &mut buf).unwrap();
    assert_eq!(&buf, b"SHARED");
}

#[test]
fn exact_mmap_past_user_end_is_out_of_virtual() {
    init_mem();
    let mm = AddressSpace::new();

    let err = mm
        .mmap_anonymous(
            USER_SPACE_END - 2 * PAGE_SIZE,
            MmapFlags::PRIVATE | MmapFlags::EXACT,
            RW,
            3,
        )
        .unwrap_err();
    assert_eq!(err, VmError::OutOfVirtual);

    // The last fitting slot still works.
    mm.mmap_anonymous(
        USER_SPACE_END - 3 * PAGE_SIZE,
        MmapFlags::PRIVATE | MmapFlags::EXACT,
        RW,
        3,
    )
    .unwrap();
}

#[test]
fn exact_mmap_over_existing_area_overlaps() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 4);

    let err = mm
        .mmap_anonymous(base, MmapFlags::PRIVATE | MmapFlags::EXACT, RW, 1)
        .unwrap_err();
    assert_eq!(err, VmError::Overlap);
}

#[test]
fn mmap_requires_exactly_one_share_kind() {
    init_mem();
    let mm = AddressSpace::new();

    assert_eq!(
        mm.mmap_anonymous(VAddr::NULL, MmapFlags::empty(), RW, 1),
        Err(VmError::InvalidArgument)
    );
    assert_eq!(
        mm.mmap_anonymous(
            VAddr::NULL,
            MmapFlags::SHARED | MmapFlags::PRIVATE,
            RW,
            1
        ),
        Err(VmError::InvalidArgument)
    );
}

#[test]
fn partial_munmap_splits_with_recounted_stats() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 8);

    mm.write_user(base, &[3u8; 8 * PAGE_SIZE]).unwrap();
    assert_eq!(mm.area_stat(base).unwrap(), (8, 0, 0));
    let areas_before = mm.area_count();

    // Drop pages 3 and 4.
    mm.munmap(base + 3 * PAGE_SIZE, 2 * PAGE_SIZE).unwrap();

    assert_eq!(mm.area_count(), areas_before + 1);

    let left = mm.area_range(base).unwrap();
    assert_eq!(left.len(), 3 * PAGE_SIZE);
    assert_eq!(mm.area_stat(base).unwrap(), (3, 0, 0));

    let right = mm.area_range(base + 5 * PAGE_SIZE).unwrap();
    assert_eq!(right.len(), 3 * PAGE_SIZE);
    assert_eq!(mm.area_stat(base + 5 * PAGE_SIZE).unwrap(), (3, 0, 0));

    // The hole faults as unmapped.
    let mut byte = [0u8; 1];
    assert!(mm.read_user(base + 3 * PAGE_SIZE, &mut byte).is_err());

    // Untouched halves keep their bytes.
    mm.read_user(base + 5 * PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(byte[0], 3);
}

#[test]
fn protect_masks_eagerly_and_regrants_lazily() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 4);

    mm.write_user(base, &[1u8; 4 * PAGE_SIZE]).unwrap();

    mm.protect(base, 4 * PAGE_SIZE, VmFlags::READ).unwrap();
    let (_, attr) = mm.page_table().lookup(base).unwrap();
    assert!(!attr.contains(PageAttribute::WRITE));

    // Writes now fault as invalid.
    assert!(mm.write_user(base, b"n").is_err());
    let mut byte = [0u8; 1];
    mm.read_user(base, &mut byte).unwrap();
    assert_eq!(byte[0], 1);

    // Restore write; the PTE stays read-only until the write fault.
    mm.protect(base, 4 * PAGE_SIZE, RW).unwrap();
    let (_, attr) = mm.page_table().lookup(base).unwrap();
    assert!(!attr.contains(PageAttribute::WRITE));

    mm.write_user(base, b"y").unwrap();
    let (_, attr) = mm.page_table().lookup(base).unwrap();
    assert!(attr.contains(PageAttribute::WRITE));
}

#[test]
fn protect_middle_splits_into_three() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 6);
    let before = mm.area_count();

    mm.protect(base + 2 * PAGE_SIZE, 2 * PAGE_SIZE, VmFlags::READ)
        .unwrap();

    assert_eq!(mm.area_count(), before + 2);
    assert_eq!(mm.area_flags(base).unwrap() & RW, RW);
    assert_eq!(
        mm.area_flags(base + 2 * PAGE_SIZE).unwrap() & RW,
        VmFlags::READ
    );
    assert_eq!(mm.area_flags(base + 5 * PAGE_SIZE).unwrap() & RW, RW);
}

#[test]
fn exec_fault_on_present_page_grants_the_bit() {
    init_mem();
    let mm = AddressSpace::new();
    let base = mm
        .mmap_anonymous(
            VAddr::NULL,
            MmapFlags::PRIVATE,
            RW | VmFlags::EXEC,
            1,
        )
        .unwrap();

    mm.write_user(base, &[0x90]).unwrap();
    // Protect dance strips EXEC from the PTE but the area allows it.
    mm.protect(base, PAGE_SIZE, RW).unwrap();
    mm.protect(base, PAGE_SIZE, RW | VmFlags::EXEC).unwrap();
    let (_, attr) = mm.page_table().lookup(base).unwrap();
    assert!(!attr.contains(PageAttribute::EXECUTE));

    let mut fault = Fault::exec(true);
    handle_page_fault(&mm, base, &mut fault).unwrap();

    let (_, attr) = mm.page_table().lookup(base).unwrap();
    assert!(attr.contains(PageAttribute::EXECUTE));
}

#[test]
fn faults_outside_any_area_are_invalid() {
    init_mem();
    let mm = AddressSpace::new();

    let mut fault = Fault::access(false, false);
    let err = handle_page_fault(&mm, VAddr::from(0x4000), &mut fault).unwrap_err();
    assert_eq!(err.reason, "page fault in unmapped area");
}

#[test]
fn write_fault_in_readonly_area_is_invalid() {
    init_mem();
    let mm = AddressSpace::new();
    let base = mm
        .mmap_anonymous(VAddr::NULL, MmapFlags::PRIVATE, VmFlags::READ, 1)
        .unwrap();

    let mut fault = Fault::access(false, true);
    let err = handle_page_fault(&mm, base, &mut fault).unwrap_err();
    assert_eq!(err.reason, "page fault in read-only area");
}

#[test]
fn tlb_shootdown_follows_mapping_changes() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 1);

    let before = ferrite_hal::tlb_shootdown_count();
    mm.write_user(base, b"a").unwrap();
    assert!(ferrite_hal::tlb_shootdown_count() > before);

    let before = ferrite_hal::tlb_shootdown_count();
    mm.munmap(base, PAGE_SIZE).unwrap();
    assert!(ferrite_hal::tlb_shootdown_count() > before);
}

#[test]
fn program_break_grows_upward() {
    init_mem();
    let mm = AddressSpace::new();
    let start = VAddr::from(0x2000_0000);
    mm.register_break(start);

    assert_eq!(mm.set_break(None), start);
    let new = mm.set_break(Some(start + 3 * PAGE_SIZE));
    assert_eq!(new, start + 3 * PAGE_SIZE);

    mm.write_user(start + PAGE_SIZE, b"brk").unwrap();

    // The break never shrinks.
    assert_eq!(mm.set_break(Some(start)), new);
}

#[test]
fn dma_unshare_copies_then_unmaps() {
    init_mem();
    let mm = AddressSpace::new();
    let base = anon_rw(&mm, 2);

    mm.write_user(base, b"dma contents").unwrap();
    let buffer = dma_unshare(&mm, base, 2).unwrap();
    assert_eq!(&buffer.as_bytes()[..12], b"dma contents");

    let mut byte = [0u8; 1];
    assert!(mm.read_user(base, &mut byte).is_err());
}
