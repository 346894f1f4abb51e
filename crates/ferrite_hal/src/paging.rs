use core::ptr::NonNull;

use ferrite_mm::page_table::{
    PageAttribute, PageTableLevel, PagingMode, RawAttribute, RawPageTable, TableAttribute, PTE,
};
use ferrite_mm::paging::PFN;

const PA_PRESENT: u64 = 1 << 0;
const PA_WRITE: u64 = 1 << 1;
const PA_USER: u64 = 1 << 2;
const PA_WRITE_THROUGH: u64 = 1 << 3;
const PA_CACHE_DISABLE: u64 = 1 << 4;
const PA_ACCESSED: u64 = 1 << 5;
const PA_DIRTY: u64 = 1 << 6;
const PA_HUGE: u64 = 1 << 7;
const PA_GLOBAL: u64 = 1 << 8;

const PFN_MASK: u64 = 0x000f_ffff_ffff_f000;

// Software bits above the frame number.
const PA_READ: u64 = 1 << 52;
const PA_EXECUTE: u64 = 1 << 53;
const PA_COW: u64 = 1 << 54;
const PA_MAPPED: u64 = 1 << 55;
const PA_ANONYMOUS: u64 = 1 << 56;

const ATTR_MASK: u64 = !PFN_MASK;

#[derive(Clone, Copy)]
pub struct SoftAttr(u64);

#[repr(transparent)]
pub struct SoftPte(u64);

impl From<PageAttribute> for SoftAttr {
    fn from(attr: PageAttribute) -> Self {
        let mut raw = 0;
        let pairs = [
            (PageAttribute::PRESENT, PA_PRESENT),
            (PageAttribute::WRITE, PA_WRITE),
            (PageAttribute::USER, PA_USER),
            (PageAttribute::WRITE_THROUGH, PA_WRITE_THROUGH),
            (PageAttribute::CACHE_DISABLE, PA_CACHE_DISABLE),
            (PageAttribute::ACCESSED, PA_ACCESSED),
            (PageAttribute::DIRTY, PA_DIRTY),
            (PageAttribute::HUGE, PA_HUGE),
            (PageAttribute::GLOBAL, PA_GLOBAL),
            (PageAttribute::READ, PA_READ),
            (PageAttribute::EXECUTE, PA_EXECUTE),
            (PageAttribute::COPY_ON_WRITE, PA_COW),
            (PageAttribute::MAPPED, PA_MAPPED),
            (PageAttribute::ANONYMOUS, PA_ANONYMOUS),
        ];
        for (flag, bit) in pairs {
            if attr.contains(flag) {
                raw |= bit;
            }
        }
        Self(raw)
    }
}

impl From<TableAttribute> for SoftAttr {
    fn from(attr: TableAttribute) -> Self {
        let mut raw = 0;
        if attr.contains(TableAttribute::PRESENT) {
            raw |= PA_PRESENT;
        }
        if attr.contains(TableAttribute::USER) {
            raw |= PA_USER;
        }
        if attr.contains(TableAttribute::GLOBAL) {
            raw |= PA_GLOBAL;
        }
        Self(raw)
    }
}

impl RawAttribute for SoftAttr {
    fn null() -> Self {
        Self(0)
    }

    fn as_table_attr(self) -> Option<TableAttribute> {
        if self.0 & PA_HUGE != 0 {
            return None;
        }
        let mut attr = TableAttribute::empty();
        if self.0 & PA_PRESENT != 0 {
            attr |= TableAttribute::PRESENT;
        }
        if self.0 & PA_USER != 0 {
            attr |= TableAttribute::USER;
        }
        if self.0 & PA_GLOBAL != 0 {
            attr |= TableAttribute::GLOBAL;
        }
        Some(attr)
    }

    fn as_page_attr(self) -> Option<PageAttribute> {
        let mut attr = PageAttribute::empty();
        let pairs = [
            (PA_PRESENT, PageAttribute::PRESENT),
            (PA_WRITE, PageAttribute::WRITE),
            (PA_USER, PageAttribute::USER),
            (PA_WRITE_THROUGH, PageAttribute::WRITE_THROUGH),
            (PA_CACHE_DISABLE, PageAttribute::CACHE_DISABLE),
            (PA_ACCESSED, PageAttribute::ACCESSED),
            (PA_DIRTY, PageAttribute::DIRTY),
            (PA_HUGE, PageAttribute::HUGE),
            (PA_GLOBAL, PageAttribute::GLOBAL),
            (PA_READ, PageAttribute::READ),
            (PA_EXECUTE, PageAttribute::EXECUTE),
            (PA_COW, PageAttribute::COPY_ON_WRITE),
            (PA_MAPPED, PageAttribute::MAPPED),
            (PA_ANONYMOUS, PageAttribute::ANONYMOUS),
        ];
        for (bit, flag) in pairs {
            if self.0 & bit != 0 {
                attr |= flag;
            }
        }
        Some(attr)
    }
}

impl PTE for SoftPte {
    type Attr = SoftAttr;

    fn get(&self) -> (PFN, SoftAttr) {
        (
            PFN::from(((self.0 & PFN_MASK) >> 12) as usize),
            SoftAttr(self.0 & ATTR_MASK),
        )
    }

    fn set(&mut self, pfn: PFN, attr: SoftAttr) {
        self.0 = (((usize::from(pfn) as u64) << 12) & PFN_MASK) | (attr.0 & ATTR_MASK);
    }
}

pub struct SoftRawTable<'a> {
    entries: NonNull<SoftPte>,
    _lifetime: core::marker::PhantomData<&'a mut SoftPte>,
}

impl<'a> RawPageTable<'a> for SoftRawTable<'a> {
    type Entry = SoftPte;

    fn index(&self, index: u16) -> &'a SoftPte {
        unsafe { &*self.entries.as_ptr().add(index as usize) }
    }

    fn index_mut(&mut self, index: u16) -> &'a mut SoftPte {
        unsafe { &mut *self.entries.as_ptr().add(index as usize) }
    }

    unsafe fn from_ptr(ptr: NonNull<u8>) -> Self {
        Self {
            entries: ptr.cast(),
            _lifetime: core::marker::PhantomData,
        }
    }
}

/// 4-level, 9 bits a level, huge entries at the 1 GiB and 2 MiB levels.
pub struct ArchPagingMode;

impl PagingMode for ArchPagingMode {
    type Entry = SoftPte;
    type RawTable<'a> = SoftRawTable<'a>;

    const LEVELS: &'static [PageTableLevel] = &[
        PageTableLevel::new(39, 9),
        PageTableLevel::new_huge(30, 9),
        PageTableLevel::new_huge(21, 9),
        PageTableLevel::new(12, 9),
    ];
}
