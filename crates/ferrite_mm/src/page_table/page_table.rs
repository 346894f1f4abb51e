use core::marker::PhantomData;
use core::ptr::NonNull;

use super::paging_mode::{PageTableLevel, PagingMode};
use super::pte::{PageAttribute, RawAttribute, TableAttribute, PTE};
use super::pte_iterator::PageTableIterator;
use crate::address::{Addr as _, AddrOps as _, PAddr, VAddr, VRange};
use crate::paging::{PAGE_SIZE, PAGE_SIZE_BITS, PFN};

/// One physical page interpreted as an array of page-table entries.
pub trait RawPageTable<'a>: 'a {
    type Entry: PTE + 'a;

    fn index(&self, index: u16) -> &'a Self::Entry;
    fn index_mut(&mut self, index: u16) -> &'a mut Self::Entry;

    /// # Safety
    /// `ptr` must point to a live page-table page.
    unsafe fn from_ptr(ptr: NonNull<u8>) -> Self;
}

/// An owned handle on a frame used as a page-table page. Dropping the handle
/// returns the frame to its allocator.
pub trait TableFrame {
    fn pfn(&self) -> PFN;

    /// Give up ownership; the frame stays allocated.
    fn into_raw(self) -> PFN;
}

pub trait TableAlloc: Clone {
    type Frame: TableFrame;

    fn alloc_table(&self) -> Self::Frame;

    /// # Safety
    /// `pfn` must have been produced by `TableFrame::into_raw` on a frame of
    /// this allocator and must not be reclaimed twice.
    unsafe fn from_raw(&self, pfn: PFN) -> Self::Frame;
}

/// Translation from a frame number to a kernel-accessible pointer, i.e. the
/// platform's direct map.
pub trait PhysAccess: Clone {
    /// # Safety
    /// `pfn` must refer to an existing physical frame.
    unsafe fn ptr_for_pfn(&self, pfn: PFN) -> NonNull<u8>;
}

pub struct PageTable<M, A, X>
where
    M: PagingMode,
    A: TableAlloc,
    X: PhysAccess,
{
    root: A::Frame,
    alloc: A,
    access: X,
    phantom: PhantomData<M>,
}

impl<M, A, X> PageTable<M, A, X>
where
    M: PagingMode,
    A: TableAlloc,
    X: PhysAccess,
{
    pub fn new(root: A::Frame, alloc: A, access: X) -> Self {
        Self {
            root,
            alloc,
            access,
            phantom: PhantomData,
        }
    }

    /// Allocate a zeroed root table.
    pub fn new_root(alloc: A, access: X) -> Self {
        let root = alloc.alloc_table();
        unsafe {
            // SAFETY: `root` is a freshly allocated table page.
            core::ptr::write_bytes(access.ptr_for_pfn(root.pfn()).as_ptr(), 0, PAGE_SIZE);
        }
        Self::new(root, alloc, access)
    }

    pub fn addr(&self) -> PAddr {
        PAddr::from(self.root.pfn())
    }

    pub fn root_pfn(&self) -> PFN {
        self.root.pfn()
    }

    fn raw_root(&self) -> M::RawTable<'_> {
        unsafe {
            // SAFETY: the root frame is owned by us and is a page table.
            M::RawTable::from_ptr(self.access.ptr_for_pfn(self.root.pfn()))
        }
    }

    /// Duplicate the kernel half of this table into a fresh root owned by
    /// `alloc`. The user half of the new root is left empty.
    pub fn clone_in<B>(&self, alloc: B) -> PageTable<M, B, X>
    where
        B: TableAlloc,
    {
        let new_root = alloc.alloc_table();
        unsafe {
            // SAFETY: both pointers reference distinct, valid table pages.
            let src = self.access.ptr_for_pfn(self.root.pfn());
            let dst = self.access.ptr_for_pfn(new_root.pfn());
            core::ptr::copy_nonoverlapping(src.as_ptr(), dst.as_ptr(), PAGE_SIZE);
        }

        let mut root_table = unsafe {
            // SAFETY: `new_root` is a valid page table.
            M::RawTable::from_ptr(self.access.ptr_for_pfn(new_root.pfn()))
        };

        // The lower half of the top level is user space.
        let level0 = M::LEVELS[0];
        for idx in 0..=level0.max_index() / 2 {
            root_table.index_mut(idx).take();
        }

        PageTable::new(new_root, alloc, self.access.clone())
    }

    /// Iterate over the leaf entries covering `range`, creating intermediate
    /// tables marked `USER` on the way: the write (mapping) path. Callers
    /// that only inspect or clear existing mappings use [`Self::walk_range`].
    pub fn iter_user(&self, range: VRange) -> PageTableIterator<'_, M, A, X> {
        PageTableIterator::new(
            self.raw_root(),
            range,
            TableAttribute::USER,
            self.alloc.clone(),
            self.access.clone(),
        )
    }

    /// Same as [`Self::iter_user`] for kernel ranges; intermediate tables are
    /// created `GLOBAL` so cloned address spaces share them.
    pub fn iter_kernel(&self, range: VRange) -> PageTableIterator<'_, M, A, X> {
        PageTableIterator::new(
            self.raw_root(),
            range,
            TableAttribute::GLOBAL,
            self.alloc.clone(),
            self.access.clone(),
        )
    }

    /// Translate a single virtual address. Returns the frame and the leaf
    /// attributes, short-circuiting on huge entries. `None` means some
    /// intermediate table is missing.
    pub fn lookup(&self, vaddr: VAddr) -> Option<(PFN, PageAttribute)> {
        let levels = M::LEVELS;
        let mut table_pfn = self.root.pfn();

        for (depth, level) in levels.iter().enumerate() {
            let table = unsafe {
                // SAFETY: `table_pfn` came from a present table entry.
                M::RawTable::from_ptr(self.access.ptr_for_pfn(table_pfn))
            };
            let entry = table.index(level.index_of(vaddr));
            let (pfn, raw) = entry.get();

            if depth == levels.len() - 1 {
                return raw.as_page_attr().map(|attr| (pfn, attr));
            }

            if level.supports_huge() {
                if let Some(attr) = raw.as_page_attr() {
                    if attr.contains(PageAttribute::HUGE | PageAttribute::PRESENT) {
                        let npages = level.page_size() >> PAGE_SIZE_BITS;
                        let offset = (vaddr.addr() >> PAGE_SIZE_BITS) & (npages - 1);
                        return Some((pfn + offset, attr));
                    }
                }
            }

            let table_attr = raw.as_table_attr()?;
            if !table_attr.contains(TableAttribute::PRESENT) {
                return None;
            }
            table_pfn = pfn;
        }

        unreachable!("paging mode with no levels")
    }

    /// Map `range` to the contiguous frames starting at `start_pfn`, using
    /// huge entries wherever alignment allows. Used for kernel ranges (the
    /// direct map); user mappings always go through the iterator.
    pub fn map_range(
        &self,
        range: VRange,
        start_pfn: PFN,
        attr: PageAttribute,
        table_attr: TableAttribute,
    ) {
        assert!(range.start().is_page_aligned() && range.end().is_page_aligned());
        self.do_map_range(self.root.pfn(), M::LEVELS, range, start_pfn, attr, table_attr);
    }

    fn do_map_range(
        &self,
        table_pfn: PFN,
        levels: &'static [PageTableLevel],
        range: VRange,
        start_pfn: PFN,
        attr: PageAttribute,
        table_attr: TableAttribute,
    ) {
        let [level, rest @ ..] = levels else { return };

        let mut table = unsafe {
            // SAFETY: `table_pfn` refers to a live page-table page.
            M::RawTable::from_ptr(self.access.ptr_for_pfn(table_pfn))
        };

        let mut vaddr = range.start();
        let mut pfn = start_pfn;
        while vaddr < range.end() {
            let entry_size = level.page_size();
            let entry_start = VAddr::from(vaddr.addr() & !(entry_size - 1));
            let chunk_end = range.end().min(entry_start + entry_size);
            let entry = table.index_mut(level.index_of(vaddr));

            if rest.is_empty() {
                entry.set(pfn, (attr | PageAttribute::PRESENT).into());
                pfn = pfn + 1;
                vaddr = chunk_end;
                continue;
            }

            let entry_npages = entry_size >> PAGE_SIZE_BITS;
            if level.supports_huge()
                && vaddr == entry_start
                && chunk_end == entry_start + entry_size
                && usize::from(pfn) % entry_npages == 0
            {
                entry.set(
                    pfn,
                    (attr | PageAttribute::PRESENT | PageAttribute::HUGE).into(),
                );
                pfn = pfn + entry_npages;
                vaddr = chunk_end;
                continue;
            }

            let next_pfn = match entry.get_attr().as_table_attr() {
                Some(t) if t.contains(TableAttribute::PRESENT) => entry.get_pfn(),
                _ => {
                    let frame = self.alloc.alloc_table();
                    unsafe {
                        // SAFETY: a fresh table page, good for writing.
                        core::ptr::write_bytes(
                            self.access.ptr_for_pfn(frame.pfn()).as_ptr(),
                            0,
                            PAGE_SIZE,
                        );
                    }
                    let new_pfn = frame.into_raw();
                    entry.set(new_pfn, (table_attr | TableAttribute::PRESENT).into());
                    new_pfn
                }
            };

            self.do_map_range(
                next_pfn,
                rest,
                VRange::new(vaddr, chunk_end),
                pfn,
                attr,
                table_attr,
            );
            pfn = pfn + ((chunk_end - vaddr) >> PAGE_SIZE_BITS);
            vaddr = chunk_end;
        }
    }

    /// Visit the leaf entries covering `range` that already exist, skipping
    /// missing intermediate tables instead of creating them: the read path,
    /// used for unmapping and permission changes. A huge leaf is visited
    /// once, without descending.
    pub fn walk_range<F>(&self, range: VRange, f: &mut F)
    where
        F: FnMut(VAddr, &mut M::Entry),
    {
        assert!(range.start().is_page_aligned() && range.end().is_page_aligned());
        self.do_walk_range(self.root.pfn(), M::LEVELS, range, f);
    }

    fn do_walk_range<F>(
        &self,
        table_pfn: PFN,
        levels: &'static [PageTableLevel],
        range: VRange,
        f: &mut F,
    ) where
        F: FnMut(VAddr, &mut M::Entry),
    {
        let [level, rest @ ..] = levels else { return };

        let mut table = unsafe {
            // SAFETY: `table_pfn` refers to a live page-table page.
            M::RawTable::from_ptr(self.access.ptr_for_pfn(table_pfn))
        };

        let mut vaddr = range.start();
        while vaddr < range.end() {
            let entry_size = level.page_size();
            let entry_start = VAddr::from(vaddr.addr() & !(entry_size - 1));
            let chunk_end = range.end().min(entry_start + entry_size);
            let entry = table.index_mut(level.index_of(vaddr));

            if rest.is_empty() {
                f(vaddr, entry);
                vaddr = chunk_end;
                continue;
            }

            match entry.get_attr().as_table_attr() {
                // A huge leaf covers the whole chunk.
                None => f(vaddr, entry),
                Some(attr) if attr.contains(TableAttribute::PRESENT) => {
                    self.do_walk_range(entry.get_pfn(), rest, VRange::new(vaddr, chunk_end), f);
                }
                // No table below here, so nothing is mapped.
                Some(_) => {}
            }

            vaddr = chunk_end;
        }
    }

    fn drop_tables_recursive(&self, table_pfn: PFN, levels: &'static [PageTableLevel]) {
        let [level, rest @ ..] = levels else { return };
        if rest.is_empty() {
            return;
        }

        let mut table = unsafe {
            // SAFETY: `table_pfn` refers to a live page-table page.
            M::RawTable::from_ptr(self.access.ptr_for_pfn(table_pfn))
        };

        for idx in 0..=level.max_index() {
            let (pfn, raw) = table.index_mut(idx).take();
            let Some(attr) = raw.as_table_attr() else {
                continue;
            };
            if !attr.contains(TableAttribute::PRESENT | TableAttribute::USER) {
                continue;
            }

            self.drop_tables_recursive(pfn, rest);
            drop(unsafe {
                // SAFETY: the pfn came from a table entry we created through
                // `alloc_table` + `into_raw`.
                self.alloc.from_raw(pfn)
            });
        }
    }
}

impl<M, A, X> Drop for PageTable<M, A, X>
where
    M: PagingMode,
    A: TableAlloc,
    X: PhysAccess,
{
    fn drop(&mut self) {
        // Only user-owned intermediate tables are reclaimed; the kernel half
        // is shared with the global table. Leaf frames are the caller's
        // responsibility and must be unmapped first.
        self.drop_tables_recursive(self.root.pfn(), M::LEVELS);
    }
}
