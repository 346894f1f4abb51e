use bitflags::bitflags;

use crate::paging::PFN;

bitflags! {
    /// Architecture-independent view of a leaf page-table entry.
    ///
    /// `COPY_ON_WRITE`, `MAPPED` and `ANONYMOUS` are software bits: the
    /// architecture backend must provide storage for them but never
    /// interprets them.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct PageAttribute: u64 {
        const PRESENT = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        const WRITE_THROUGH = 1 << 8;
        const CACHE_DISABLE = 1 << 9;
        const HUGE = 1 << 10;
        const COPY_ON_WRITE = 1 << 11;
        const MAPPED = 1 << 12;
        const ANONYMOUS = 1 << 13;
    }
}

bitflags! {
    /// Attributes of an entry that points to a next-level table.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TableAttribute: u64 {
        const PRESENT = 1 << 0;
        const USER = 1 << 1;
        const GLOBAL = 1 << 2;
    }
}

/// The raw, architecture-specific attribute word of a page-table entry.
pub trait RawAttribute: Copy + From<PageAttribute> + From<TableAttribute> {
    fn null() -> Self;

    /// `None` if the entry cannot point to a next-level table (e.g. it is a
    /// huge leaf).
    fn as_table_attr(self) -> Option<TableAttribute>;

    /// `None` if the entry cannot be a leaf mapping.
    fn as_page_attr(self) -> Option<PageAttribute>;
}

pub trait PTE: Sized {
    type Attr: RawAttribute;

    fn get(&self) -> (PFN, Self::Attr);
    fn set(&mut self, pfn: PFN, attr: Self::Attr);

    fn take(&mut self) -> (PFN, Self::Attr) {
        let value = self.get();
        self.set(PFN::from(0), Self::Attr::null());
        value
    }

    fn get_pfn(&self) -> PFN {
        self.get().0
    }

    fn get_attr(&self) -> Self::Attr {
        self.get().1
    }

    fn set_pfn(&mut self, pfn: PFN) {
        let attr = self.get_attr();
        self.set(pfn, attr);
    }

    fn set_attr(&mut self, attr: Self::Attr) {
        let pfn = self.get_pfn();
        self.set(pfn, attr);
    }
}
