use ferrite_hal::{ArchPagingMode, ArchPhysAccess, DIRECT_MAP_BASE};
use ferrite_mm::address::VRange;
use ferrite_mm::page_table::{PageAttribute, PageTable, TableAlloc, TableAttribute, TableFrame};
use ferrite_mm::paging::{PAGE_SIZE, PFN};
use spin::Once;

use super::mmstat::{self, MemUsage};
use super::page::Page;

pub type KernelPageTable = PageTable<ArchPagingMode, TablePageAlloc, ArchPhysAccess>;

impl TableFrame for Page {
    fn pfn(&self) -> PFN {
        Page::pfn(self)
    }

    fn into_raw(self) -> PFN {
        Page::into_raw(self)
    }
}

/// Page-table pages are ordinary frames; creating one bumps the kernel
/// statistic, reclaiming one (the walker only does that through `from_raw`
/// on teardown) drops it.
#[derive(Clone, Copy, Default)]
pub struct TablePageAlloc;

impl TableAlloc for TablePageAlloc {
    type Frame = Page;

    fn alloc_table(&self) -> Page {
        mmstat::inc(MemUsage::PageTable);
        Page::alloc()
    }

    unsafe fn from_raw(&self, pfn: PFN) -> Page {
        mmstat::dec(MemUsage::PageTable);
        Page::from_raw(pfn)
    }
}

static GLOBAL_PAGE_TABLE: Once<KernelPageTable> = Once::new();

/// Build the kernel page table: the whole of physical memory appears at
/// `DIRECT_MAP_BASE`, using huge entries wherever alignment allows, shared
/// into every address space through the global top-level entries.
pub fn init_global_page_table() {
    GLOBAL_PAGE_TABLE.call_once(|| {
        let table = KernelPageTable::new_root(TablePageAlloc, ArchPhysAccess);

        let nframes = ferrite_hal::phys_frames();
        table.map_range(
            VRange::new(DIRECT_MAP_BASE, DIRECT_MAP_BASE + nframes * PAGE_SIZE),
            PFN::from(0),
            PageAttribute::READ | PageAttribute::WRITE | PageAttribute::GLOBAL,
            TableAttribute::GLOBAL,
        );

        ferrite_hal::switch_mm(table.addr());
        table
    });
}

pub fn global_page_table() -> &'static KernelPageTable {
    GLOBAL_PAGE_TABLE.get().expect("global page table not initialised")
}
