use ferrite_mm::page_table::PageAttribute;
use spin::Once;

use super::page::Page;
use super::page_fault::{Fault, FaultResolution};
use super::vm_area::VmArea;

static ZERO_PAGE: Once<Page> = Once::new();

/// The single, globally shared zero-filled frame. It is only ever mapped
/// read-only; a write fault replaces it with a private copy.
pub fn zero_page() -> Page {
    ZERO_PAGE.call_once(Page::zeroed).clone()
}

/// The zero-on-demand / copy-on-write handler: the default for anonymous
/// areas.
pub(super) fn anonymous_fault(area: &VmArea, fault: &mut Fault) -> FaultResolution {
    let stat = &area.stat;

    if fault.present && fault.write {
        // The page was mapped read-only because it is CoW or the zero page;
        // copy it into a fresh writable frame.
        stat.cow.set(stat.cow.get() - 1);
        stat.regular.set(stat.regular.get() + 1);

        fault.map_extra |= PageAttribute::ANONYMOUS;
        fault.backing_page = fault.faulting_page.clone();
        return FaultResolution::CopyBacking;
    }

    debug_assert!(!fault.present, "present read fault on an anonymous area");

    if fault.write {
        let Some(page) = Page::try_alloc() else {
            return FaultResolution::CannotHandle;
        };
        unsafe {
            // SAFETY: freshly allocated, we are the only owner.
            page.as_bytes_mut().fill(0);
        }

        stat.regular.set(stat.regular.get() + 1);
        fault.map_extra |= PageAttribute::ANONYMOUS;
        fault.backing_page = Some(page);
        FaultResolution::MapBacking
    } else {
        stat.cow.set(stat.cow.get() + 1);
        fault.map_extra |= PageAttribute::ANONYMOUS | PageAttribute::COPY_ON_WRITE;
        fault.backing_page = Some(zero_page());
        FaultResolution::MapBackingRo
    }
}
