use super::page_table::{PhysAccess, RawPageTable, TableAlloc, TableFrame as _};
use super::paging_mode::{PageTableLevel, PagingMode};
use super::pte::{RawAttribute, TableAttribute, PTE};
use crate::address::{AddrOps as _, VRange};
use crate::paging::PAGE_SIZE;

/// Walks the leaf entries of a page table across table boundaries, creating
/// missing intermediate tables on the way down.
pub struct PageTableIterator<'a, M, A, X>
where
    M: PagingMode,
    M::Entry: 'a,
    A: TableAlloc,
    X: PhysAccess,
{
    levels: &'static [PageTableLevel],
    remaining: usize,

    indices: [u16; 8],
    tables: [Option<M::RawTable<'a>>; 8],

    fill_entry_attr: TableAttribute,

    alloc: A,
    access: X,
}

impl<'a, M, A, X> PageTableIterator<'a, M, A, X>
where
    M: PagingMode,
    M::Entry: 'a,
    A: TableAlloc,
    X: PhysAccess,
{
    pub fn new(
        page_table: M::RawTable<'a>,
        range: VRange,
        fill_entry_attr: TableAttribute,
        alloc: A,
        access: X,
    ) -> Self {
        let levels = M::LEVELS;
        let start = range.start().floor();
        let end = range.end().ceil();

        let mut me = Self {
            levels,
            remaining: (end - start) / PAGE_SIZE,
            indices: [0; 8],
            tables: [const { None }; 8],
            fill_entry_attr: fill_entry_attr | TableAttribute::PRESENT,
            alloc,
            access,
        };

        for (i, level) in levels.iter().enumerate() {
            me.indices[i] = level.index_of(start);
        }

        me.tables[0] = Some(page_table);
        if me.remaining > 0 {
            me.parse_tables_starting_from(0);
        }

        me
    }

    /// Resolve (or create) the chain of tables below `idx_level` for the
    /// current index vector.
    fn parse_tables_starting_from(&mut self, idx_level: usize) {
        for idx in idx_level..self.levels.len() - 1 {
            let pt_idx = self.indices[idx];
            let (upper, lower) = self.tables.split_at_mut(idx + 1);
            let parent_table = upper[idx].as_mut().expect("parent table is None");
            let next_pte = parent_table.index_mut(pt_idx);

            lower[0].replace({
                let attr = next_pte
                    .get_attr()
                    .as_table_attr()
                    .expect("not a page table entry");

                if attr.contains(TableAttribute::PRESENT) {
                    let pfn = next_pte.get_pfn();
                    unsafe {
                        // SAFETY: the pfn was read from a present table
                        // entry, so it refers to a valid table page.
                        M::RawTable::from_ptr(self.access.ptr_for_pfn(pfn))
                    }
                } else {
                    let frame = self.alloc.alloc_table();
                    let table_ptr = unsafe {
                        // SAFETY: `frame` is a live frame.
                        self.access.ptr_for_pfn(frame.pfn())
                    };

                    unsafe {
                        // SAFETY: `table_ptr` is good for writing and
                        // properly aligned.
                        core::ptr::write_bytes(table_ptr.as_ptr(), 0, PAGE_SIZE);
                    }

                    next_pte.set(frame.into_raw(), self.fill_entry_attr.into());

                    unsafe {
                        // SAFETY: `table_ptr` points to the table we just
                        // cleared.
                        M::RawTable::from_ptr(table_ptr)
                    }
                }
            });
        }
    }
}

impl<'a, M, A, X> Iterator for PageTableIterator<'a, M, A, X>
where
    M: PagingMode,
    M::Entry: 'a,
    A: TableAlloc,
    X: PhysAccess,
{
    type Item = &'a mut M::Entry;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;

        let leaf_level = self.levels.len() - 1;
        let retval = self.tables[leaf_level]
            .as_mut()
            .unwrap()
            .index_mut(self.indices[leaf_level]);

        if self.remaining == 0 {
            return Some(retval);
        }

        let idx_level_start_updating = self
            .levels
            .iter()
            .zip(self.indices.iter())
            .enumerate()
            .rev()
            .skip_while(|(_, (level, idx))| **idx == level.max_index())
            .map(|(i, _)| i)
            .next()
            .expect("page table index overflow");

        self.indices[idx_level_start_updating] += 1;
        self.indices[idx_level_start_updating + 1..=leaf_level].fill(0);
        self.parse_tables_starting_from(idx_level_start_updating);

        Some(retval)
    }
}
