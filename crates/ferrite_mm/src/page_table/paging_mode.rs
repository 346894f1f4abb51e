use super::page_table::RawPageTable;
use super::pte::PTE;
use crate::address::{Addr as _, VAddr};

/// A paging mode is the per-architecture description of the page-table
/// hierarchy: the entry format plus the level layout, highest level first.
///
/// The same walker serves any depth from 2 to 5 levels; architectures with
/// fewer levels simply provide a shorter `LEVELS` slice.
pub trait PagingMode: 'static {
    type Entry: PTE;
    type RawTable<'a>: RawPageTable<'a, Entry = Self::Entry>;

    const LEVELS: &'static [PageTableLevel];
}

#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PageTableLevel {
    nth_bit: usize,
    len: usize,
    huge: bool,
}

impl PageTableLevel {
    pub const fn new(nth_bit: usize, len: usize) -> Self {
        Self {
            nth_bit,
            len,
            huge: false,
        }
    }

    /// A level whose entries may be huge leaf mappings.
    pub const fn new_huge(nth_bit: usize, len: usize) -> Self {
        Self {
            nth_bit,
            len,
            huge: true,
        }
    }

    pub const fn nth_bit(self) -> usize {
        self.nth_bit
    }

    pub const fn len(self) -> usize {
        self.len
    }

    /// Bytes covered by one entry at this level.
    pub const fn page_size(self) -> usize {
        1 << self.nth_bit
    }

    pub const fn max_index(self) -> u16 {
        (1 << self.len) - 1
    }

    pub const fn supports_huge(self) -> bool {
        self.huge
    }

    pub fn index_of(self, vaddr: VAddr) -> u16 {
        ((vaddr.addr() >> self.nth_bit) & ((1 << self.len) - 1)) as u16
    }
}
