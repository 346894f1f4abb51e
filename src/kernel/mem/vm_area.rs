use core::borrow::Borrow;
use core::cell::{Cell, UnsafeCell};
use core::cmp;

use bitflags::bitflags;
use ferrite_mm::address::{AddrOps as _, VAddr, VRange};
use ferrite_mm::page_table::PageAttribute;

use crate::kernel::vfs::file::File;
use crate::prelude::*;

bitflags! {
    /// The expected permissions of a region, regardless of the
    /// copy-on-write state of individual pages.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct VmFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        const USER = 1 << 3;
        const GLOBAL = 1 << 4;
        const WRITE_THROUGH = 1 << 5;
        const CACHE_DISABLE = 1 << 6;
    }
}

impl VmFlags {
    /// Leaf attributes a page mapped with these permissions should carry.
    pub fn page_attr(self) -> PageAttribute {
        let mut attr = PageAttribute::empty();
        let pairs = [
            (VmFlags::READ, PageAttribute::READ),
            (VmFlags::WRITE, PageAttribute::WRITE),
            (VmFlags::EXEC, PageAttribute::EXECUTE),
            (VmFlags::USER, PageAttribute::USER),
            (VmFlags::GLOBAL, PageAttribute::GLOBAL),
            (VmFlags::WRITE_THROUGH, PageAttribute::WRITE_THROUGH),
            (VmFlags::CACHE_DISABLE, PageAttribute::CACHE_DISABLE),
        ];
        for (flag, bit) in pairs {
            if self.contains(flag) {
                attr |= bit;
            }
        }
        attr
    }
}

/// What a region holds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmaContent {
    Unknown,
    Stack,
    File,
    Mmap,
    Dma,
}

/// Fork behaviour of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmaType {
    Private,
    Shared,
}

/// Per-region page accounting: `regular` privately- or shared-writable
/// pages, `pagecache` entries pointing into a page cache, `cow` read-only
/// shared pages (zero page, fork CoW, private cache maps).
#[derive(Default)]
pub struct VmaStat {
    pub regular: Cell<usize>,
    pub pagecache: Cell<usize>,
    pub cow: Cell<usize>,
}

impl Clone for VmaStat {
    fn clone(&self) -> Self {
        Self {
            regular: self.regular.clone(),
            pagecache: self.pagecache.clone(),
            cow: self.cow.clone(),
        }
    }
}

#[derive(Clone)]
pub struct FileMapping {
    pub file: Arc<File>,
    /// Byte offset into the file, page-aligned.
    pub offset: usize,
}

impl FileMapping {
    pub fn new(file: Arc<File>, offset: usize) -> Self {
        Self { file, offset }
    }

    /// The mapping for the second half of a split, `bytes` into this one.
    /// Takes a fresh reference on the backing file.
    pub fn offset_by(&self, bytes: usize) -> Self {
        Self {
            file: self.file.clone(),
            offset: self.offset + bytes,
        }
    }
}

#[derive(Clone)]
pub enum Mapping {
    Anonymous,
    File(FileMapping),
}

pub struct VmArea {
    range: UnsafeCell<VRange>,
    pub flags: Cell<VmFlags>,
    pub content: Cell<VmaContent>,
    pub vma_type: VmaType,
    pub mapping: Mapping,
    pub stat: VmaStat,
}

// SAFETY: areas are only reachable through the owning address space, whose
// lock guards every non-atomic field.
unsafe impl Send for VmArea {}
unsafe impl Sync for VmArea {}

impl Clone for VmArea {
    fn clone(&self) -> Self {
        Self {
            range: UnsafeCell::new(self.range()),
            flags: self.flags.clone(),
            content: self.content.clone(),
            vma_type: self.vma_type,
            mapping: self.mapping.clone(),
            stat: self.stat.clone(),
        }
    }
}

impl VmArea {
    pub fn new(range: VRange, mapping: Mapping, flags: VmFlags, vma_type: VmaType) -> Self {
        Self {
            range: UnsafeCell::new(range),
            flags: Cell::new(flags | VmFlags::USER),
            content: Cell::new(VmaContent::Unknown),
            vma_type,
            mapping,
            stat: VmaStat::default(),
        }
    }

    fn range_borrow(&self) -> &VRange {
        // SAFETY: references to areas only exist under the address-space
        // lock, and mutation happens through `split` which owns the area.
        unsafe { self.range.get().as_ref().unwrap() }
    }

    pub fn range(&self) -> VRange {
        *self.range_borrow()
    }

    pub fn start(&self) -> VAddr {
        self.range().start()
    }

    pub fn npages(&self) -> usize {
        self.range().len() >> ferrite_mm::paging::PAGE_SIZE_BITS
    }

    pub fn backing_file(&self) -> Option<&FileMapping> {
        match &self.mapping {
            Mapping::Anonymous => None,
            Mapping::File(mapping) => Some(mapping),
        }
    }

    /// Cut into two adjacent areas at `at`. The second half inherits a
    /// bumped file offset and a fresh file reference.
    pub fn split(mut self, at: VAddr) -> (Option<Self>, Option<Self>) {
        assert!(at.is_page_aligned());

        match self.range_borrow().cmp(&VRange::from(at)) {
            cmp::Ordering::Less => (Some(self), None),
            cmp::Ordering::Greater => (None, Some(self)),
            cmp::Ordering::Equal => {
                let diff = at - self.range_borrow().start();
                if diff == 0 {
                    return (None, Some(self));
                }

                let right = Self {
                    range: UnsafeCell::new(VRange::new(at, self.range_borrow().end())),
                    flags: self.flags.clone(),
                    content: self.content.clone(),
                    vma_type: self.vma_type,
                    mapping: match &self.mapping {
                        Mapping::Anonymous => Mapping::Anonymous,
                        Mapping::File(mapping) => Mapping::File(mapping.offset_by(diff)),
                    },
                    stat: VmaStat::default(),
                };

                let new_range = self.range_borrow().shrink(self.range_borrow().end() - at);
                *self.range.get_mut() = new_range;
                (Some(self), Some(right))
            }
        }
    }
}

impl core::fmt::Debug for VmArea {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmArea")
            .field("range", self.range_borrow())
            .field("flags", &self.flags.get())
            .field("type", &self.vma_type)
            .finish()
    }
}

impl Eq for VmArea {}
impl PartialEq for VmArea {
    fn eq(&self, other: &Self) -> bool {
        self.range_borrow().eq(other.range_borrow())
    }
}
impl PartialOrd for VmArea {
    fn partial_cmp(&self, other: &Self) -> Option<cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for VmArea {
    fn cmp(&self, other: &Self) -> cmp::Ordering {
        self.range_borrow().cmp(other.range_borrow())
    }
}

impl Borrow<VRange> for VmArea {
    fn borrow(&self) -> &VRange {
        self.range_borrow()
    }
}
