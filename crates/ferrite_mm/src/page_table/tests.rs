use std::ptr::NonNull;
use std::sync::{Arc, Mutex};

use super::page_table::{PageTable, PhysAccess, RawPageTable, TableAlloc, TableFrame};
use super::paging_mode::{PageTableLevel, PagingMode};
use super::pte::{PageAttribute, RawAttribute, TableAttribute, PTE};
use crate::address::{VAddr, VRange};
use crate::paging::{PAGE_SIZE, PFN};

const ATTR_MASK: u64 = (1 << 20) - 1;

/// Software PTE for the tests: attribute bits in the low 20 bits, the frame
/// number above them. Table entries and leaf entries share the bit space;
/// which view applies depends on the level, as on real hardware.
#[repr(transparent)]
#[derive(Default)]
struct TestPte(u64);

#[derive(Clone, Copy)]
struct TestAttr(u64);

impl From<PageAttribute> for TestAttr {
    fn from(attr: PageAttribute) -> Self {
        Self(attr.bits())
    }
}

impl From<TableAttribute> for TestAttr {
    fn from(attr: TableAttribute) -> Self {
        Self(attr.bits())
    }
}

impl RawAttribute for TestAttr {
    fn null() -> Self {
        Self(0)
    }

    fn as_table_attr(self) -> Option<TableAttribute> {
        if self.0 & PageAttribute::HUGE.bits() != 0 {
            None
        } else {
            Some(TableAttribute::from_bits_truncate(self.0))
        }
    }

    fn as_page_attr(self) -> Option<PageAttribute> {
        Some(PageAttribute::from_bits_truncate(self.0))
    }
}

impl PTE for TestPte {
    type Attr = TestAttr;

    fn get(&self) -> (PFN, TestAttr) {
        (PFN::from((self.0 >> 20) as usize), TestAttr(self.0 & ATTR_MASK))
    }

    fn set(&mut self, pfn: PFN, attr: TestAttr) {
        self.0 = ((usize::from(pfn) as u64) << 20) | (attr.0 & ATTR_MASK);
    }
}

struct TestRawTable<'a> {
    ptr: NonNull<TestPte>,
    _lifetime: std::marker::PhantomData<&'a mut TestPte>,
}

impl<'a> RawPageTable<'a> for TestRawTable<'a> {
    type Entry = TestPte;

    fn index(&self, index: u16) -> &'a TestPte {
        unsafe { &*self.ptr.as_ptr().add(index as usize) }
    }

    fn index_mut(&mut self, index: u16) -> &'a mut TestPte {
        unsafe { &mut *self.ptr.as_ptr().add(index as usize) }
    }

    unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self {
            ptr: ptr.cast(),
            _lifetime: std::marker::PhantomData,
        }
    }
}

/// Three levels, 9 bits each; the middle level supports 2 MiB huge entries.
struct ThreeLevel;

impl PagingMode for ThreeLevel {
    type Entry = TestPte;
    type RawTable<'a> = TestRawTable<'a>;

    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(30, 9),
        PageTableLevel::new_huge(21, 9),
        PageTableLevel::new(12, 9),
    ];
}

#[repr(C, align(4096))]
struct PageData([u8; PAGE_SIZE]);

struct ArenaInner {
    free: Vec<usize>,
    allocated: usize,
}

#[derive(Clone)]
struct Arena {
    base: NonNull<PageData>,
    inner: Arc<Mutex<ArenaInner>>,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

struct ArenaFrame {
    pfn: PFN,
    arena: Arena,
}

impl Arena {
    fn new(npages: usize) -> Self {
        let mut pages = Vec::with_capacity(npages);
        pages.resize_with(npages, || PageData([0; PAGE_SIZE]));
        let boxed = pages.into_boxed_slice();
        let base = NonNull::new(Box::leak(boxed).as_mut_ptr()).unwrap();

        Self {
            base,
            inner: Arc::new(Mutex::new(ArenaInner {
                free: (0..npages).rev().collect(),
                allocated: 0,
            })),
        }
    }

    fn allocated(&self) -> usize {
        self.inner.lock().unwrap().allocated
    }
}

impl TableFrame for ArenaFrame {
    fn pfn(&self) -> PFN {
        self.pfn
    }

    fn into_raw(self) -> PFN {
        let pfn = self.pfn;
        std::mem::forget(self);
        pfn
    }
}

impl Drop for ArenaFrame {
    fn drop(&mut self) {
        let mut inner = self.arena.inner.lock().unwrap();
        inner.free.push(usize::from(self.pfn));
        inner.allocated -= 1;
    }
}

impl TableAlloc for Arena {
    type Frame = ArenaFrame;

    fn alloc_table(&self) -> ArenaFrame {
        let mut inner = self.inner.lock().unwrap();
        let pfn = inner.free.pop().expect("test arena exhausted");
        inner.allocated += 1;
        ArenaFrame {
            pfn: PFN::from(pfn),
            arena: self.clone(),
        }
    }

    unsafe fn from_raw(&self, pfn: PFN) -> ArenaFrame {
        self.inner.lock().unwrap().allocated += 1;
        ArenaFrame { pfn, arena: self.clone() }
    }
}

impl PhysAccess for Arena {
    unsafe fn ptr_for_pfn(&self, pfn: PFN) -> NonNull<u8> {
        NonNull::new_unchecked(self.base.as_ptr().add(usize::from(pfn))).cast()
    }
}

type TestPageTable = PageTable<ThreeLevel, Arena, Arena>;

fn new_table(arena: &Arena) -> TestPageTable {
    PageTable::new_root(arena.clone(), arena.clone())
}

fn user_attr() -> PageAttribute {
    PageAttribute::PRESENT | PageAttribute::READ | PageAttribute::WRITE | PageAttribute::USER
}

#[test]
fn iterator_crosses_table_boundaries() {
    let arena = Arena::new(256);
    let table = new_table(&arena);

    // 16 pages straddling a 2 MiB boundary.
    let start = VAddr::from(0x1ff000);
    let range = VRange::new(start, start + 16 * PAGE_SIZE);

    for (n, pte) in table.iter_user(range).enumerate() {
        pte.set(PFN::from(100 + n), TestAttr::from(user_attr()));
    }

    for n in 0..16 {
        let (pfn, attr) = table.lookup(start + n * PAGE_SIZE).unwrap();
        assert_eq!(pfn, PFN::from(100 + n));
        assert!(attr.contains(PageAttribute::PRESENT | PageAttribute::USER));
    }

    // One page past the range was never mapped.
    let past = table.lookup(start + 16 * PAGE_SIZE);
    assert!(past.map_or(true, |(_, attr)| !attr.contains(PageAttribute::PRESENT)));
}

#[test]
fn huge_entries_short_circuit_lookup() {
    let arena = Arena::new(64);
    let table = new_table(&arena);
    let before = arena.allocated();

    // 4 MiB at a 2 MiB-aligned address maps as two huge entries; only the
    // middle-level table is created.
    let start = VAddr::from(0x4000_0000);
    table.map_range(
        VRange::new(start, start + 2 * (1 << 21)),
        PFN::from(0x800),
        PageAttribute::READ | PageAttribute::WRITE | PageAttribute::GLOBAL,
        TableAttribute::GLOBAL,
    );

    assert_eq!(arena.allocated() - before, 1);

    let (pfn, attr) = table.lookup(start + 0x3000).unwrap();
    assert!(attr.contains(PageAttribute::HUGE));
    assert_eq!(pfn, PFN::from(0x800 + 3));

    let (pfn, _) = table.lookup(start + (1 << 21) + 0x5000).unwrap();
    assert_eq!(pfn, PFN::from(0x800 + 512 + 5));
}

#[test]
fn unaligned_ranges_fall_back_to_leaf_entries() {
    let arena = Arena::new(64);
    let table = new_table(&arena);

    let start = VAddr::from(0x4000_0000);
    table.map_range(
        VRange::new(start, start + 3 * PAGE_SIZE),
        PFN::from(0x100),
        PageAttribute::READ | PageAttribute::GLOBAL,
        TableAttribute::GLOBAL,
    );

    let (pfn, attr) = table.lookup(start + 2 * PAGE_SIZE).unwrap();
    assert_eq!(pfn, PFN::from(0x102));
    assert!(!attr.contains(PageAttribute::HUGE));
}

#[test]
fn readonly_walk_skips_missing_tables() {
    let arena = Arena::new(256);
    let table = new_table(&arena);

    let mapped = VAddr::from(0x20_0000);
    let mapped_range = VRange::new(mapped, mapped + 4 * PAGE_SIZE);
    for (n, pte) in table.iter_user(mapped_range).enumerate() {
        pte.set(PFN::from(0x40 + n), TestAttr::from(user_attr()));
    }

    let baseline = arena.allocated();

    // An untouched range yields nothing and, unlike the creating iterator,
    // allocates no intermediate tables.
    let far = VAddr::from(0x7000_0000);
    let mut visited = 0;
    table.walk_range(VRange::new(far, far + 64 * PAGE_SIZE), &mut |_, _| visited += 1);
    assert_eq!(visited, 0);
    assert_eq!(arena.allocated(), baseline);

    // The mapped range is visited with the right addresses and frames.
    let mut seen = Vec::new();
    table.walk_range(mapped_range, &mut |vaddr, pte| {
        seen.push((vaddr, pte.get_pfn()));
    });
    assert_eq!(seen.len(), 4);
    assert_eq!(seen[0], (mapped, PFN::from(0x40)));
    assert_eq!(seen[3], (mapped + 3 * PAGE_SIZE, PFN::from(0x43)));
}

#[test]
fn clone_keeps_kernel_half_and_clears_user_half() {
    let arena = Arena::new(256);
    let kernel_table = new_table(&arena);

    // A kernel mapping in the upper half and a user one in the lower half.
    let kaddr = VAddr::from(0x40_0000_0000); // root index 256
    kernel_table.map_range(
        VRange::new(kaddr, kaddr + PAGE_SIZE),
        PFN::from(0x42),
        PageAttribute::READ | PageAttribute::GLOBAL,
        TableAttribute::GLOBAL,
    );
    let uaddr = VAddr::from(0x1000_0000);
    for pte in kernel_table.iter_user(VRange::new(uaddr, uaddr + PAGE_SIZE)) {
        pte.set(PFN::from(0x17), TestAttr::from(user_attr()));
    }

    let cloned: TestPageTable = kernel_table.clone_in(arena.clone());

    let (pfn, _) = cloned.lookup(kaddr).unwrap();
    assert_eq!(pfn, PFN::from(0x42));
    assert!(cloned.lookup(uaddr).is_none());
}

#[test]
fn drop_reclaims_user_tables_only() {
    let arena = Arena::new(256);
    let kernel_table = new_table(&arena);

    let kaddr = VAddr::from(0x40_0000_0000);
    kernel_table.map_range(
        VRange::new(kaddr, kaddr + PAGE_SIZE),
        PFN::from(0x42),
        PageAttribute::READ | PageAttribute::GLOBAL,
        TableAttribute::GLOBAL,
    );

    let baseline = arena.allocated();

    {
        let cloned: TestPageTable = kernel_table.clone_in(arena.clone());
        let uaddr = VAddr::from(0x1000_0000);
        for pte in cloned.iter_user(VRange::new(uaddr, uaddr + PAGE_SIZE)) {
            pte.set(PFN::from(0x17), TestAttr::from(user_attr()));
        }
        assert!(arena.allocated() > baseline);
    }

    // The clone's root and its user tables are gone; the kernel tables that
    // were shared with the clone survive.
    assert_eq!(arena.allocated(), baseline);
    let (pfn, _) = kernel_table.lookup(kaddr).unwrap();
    assert_eq!(pfn, PFN::from(0x42));
}
