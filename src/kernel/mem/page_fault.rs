use ferrite_hal::USER_SPACE_END;
use ferrite_mm::address::{AddrOps as _, VAddr, VRange};
use ferrite_mm::page_table::{PageAttribute, RawAttribute as _, PTE as _};
use ferrite_mm::paging::PAGE_SIZE;
use log::error;

use super::address_space::AddressSpace;
use super::page::Page;
use super::vm_area::{Mapping, VmArea, VmFlags};

/// Everything the dispatcher knows about one fault.
pub struct Fault {
    pub present: bool,
    pub write: bool,
    pub user: bool,
    pub exec: bool,
    /// Instruction pointer at the time of the fault, for diagnostics.
    pub ip: VAddr,
    /// The currently mapped frame, filled in by the dispatcher when the
    /// fault hit a present page.
    pub faulting_page: Option<Page>,
    /// The frame the handler wants mapped (or copied), set by the handler.
    pub backing_page: Option<Page>,
    /// Software attributes the handler wants on the final mapping.
    pub map_extra: PageAttribute,
}

impl Fault {
    pub fn access(present: bool, write: bool) -> Self {
        Self {
            present,
            write,
            user: true,
            exec: false,
            ip: VAddr::NULL,
            faulting_page: None,
            backing_page: None,
            map_extra: PageAttribute::empty(),
        }
    }

    pub fn exec(present: bool) -> Self {
        Self {
            exec: true,
            ..Self::access(present, false)
        }
    }
}

/// The verdict of a per-area fault handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// The handler already fixed the mapping.
    Complete,
    /// Map `backing_page` at the fault address, read-only.
    MapBackingRo,
    /// Map `backing_page` at the fault address.
    MapBacking,
    /// Allocate a fresh frame, copy `backing_page` into it, map that.
    CopyBacking,
    CannotHandle,
}

/// An unhandled user fault; the caller delivers the architectural
/// equivalent of SIGSEGV to the current thread.
#[derive(Debug, Clone)]
pub struct InvalidFault {
    pub vaddr: VAddr,
    pub ip: VAddr,
    pub reason: &'static str,
}

impl VmArea {
    pub(super) fn handle_fault(&self, fault: &mut Fault, offset: usize) -> FaultResolution {
        match &self.mapping {
            Mapping::Anonymous => super::cow::anonymous_fault(self, fault),
            Mapping::File(mapping) => {
                crate::kernel::vfs::file::file_fault_handler(self, mapping, offset, fault)
            }
        }
    }
}

fn report_invalid(
    vaddr: VAddr,
    fault: &Fault,
    area: Option<(VRange, usize)>,
    reason: &'static str,
) -> InvalidFault {
    error!("unhandled page fault: {}", reason);
    error!(
        "  invalid {} mode {} {} page at {:?}, ip={:?}",
        if fault.user { "user" } else { "kernel" },
        if fault.write {
            "write to"
        } else if fault.exec {
            "execute of"
        } else {
            "read from"
        },
        if fault.present { "present" } else { "non-present" },
        vaddr,
        fault.ip,
    );

    use ferrite_mm::address::Addr as _;
    if vaddr.addr() < 1024 {
        if fault.write {
            error!("  possible write to NULL pointer");
        } else if fault.exec && vaddr == VAddr::NULL {
            error!("  attempted to execute NULL pointer");
        } else {
            error!("  possible NULL pointer dereference");
        }
    }
    if fault.user && vaddr >= USER_SPACE_END {
        error!("  kernel address dereference from user mode");
    }
    if let Some((range, offset)) = area {
        error!("  in area {:?}, offset {:#x}", range, offset);
    }

    if !fault.user {
        panic!(
            "kernel mode page fault at {:?} (ip {:?}): {}",
            vaddr, fault.ip, reason
        );
    }

    InvalidFault {
        vaddr,
        ip: fault.ip,
        reason,
    }
}

/// Classify a fault, route it to the area's handler, and apply the verdict.
pub fn handle_page_fault(
    mm: &AddressSpace,
    vaddr: VAddr,
    fault: &mut Fault,
) -> Result<(), InvalidFault> {
    if fault.write && fault.exec {
        panic!("cannot write and execute at the same time");
    }

    let areas = mm.areas_lock();

    let Some(area) = areas.get(&VRange::from(vaddr)) else {
        drop(areas);
        return Err(report_invalid(
            vaddr,
            fault,
            None,
            "page fault in unmapped area",
        ));
    };
    let area_range = area.range();
    let offset = vaddr.floor() - area_range.start();
    let area_info = Some((area_range, offset));

    if fault.exec && !area.flags.get().contains(VmFlags::EXEC) {
        drop(areas);
        return Err(report_invalid(
            vaddr,
            fault,
            area_info,
            "page fault in non-executable area",
        ));
    }

    let pte_entry = mm.page_table().lookup(vaddr);

    // `vm_protect` grants execute lazily: a present page whose area allows
    // exec but whose PTE lacks it only needs the bit set.
    if fault.present && fault.exec {
        if let Some((_, attr)) = pte_entry {
            if attr.contains(PageAttribute::PRESENT) && !attr.contains(PageAttribute::EXECUTE) {
                let page_range = VRange::new(vaddr.floor(), vaddr.floor() + PAGE_SIZE);
                for pte in mm.page_table().iter_user(page_range) {
                    let mut attr = pte.get_attr().as_page_attr().expect("not a page attribute");
                    attr.insert(PageAttribute::EXECUTE);
                    pte.set_attr(attr.into());
                }
                ferrite_hal::flush_tlb(vaddr);
                drop(areas);
                ferrite_hal::tlb_shootdown();
                return Ok(());
            }
        }
    }

    if fault.write && !area.flags.get().contains(VmFlags::WRITE) {
        drop(areas);
        return Err(report_invalid(
            vaddr,
            fault,
            area_info,
            "page fault in read-only area",
        ));
    }

    if let Some((_, attr)) = pte_entry {
        if attr.contains(PageAttribute::PRESENT) {
            // Spurious fault: the mapping is already good.
            if !fault.write && (!fault.exec || attr.contains(PageAttribute::EXECUTE)) {
                drop(areas);
                return Ok(());
            }

            // A page that lost its write bit to `vm_protect` without being
            // CoW or cache-shadowed just gets the bit back.
            if fault.write
                && !attr.intersects(PageAttribute::COPY_ON_WRITE | PageAttribute::MAPPED)
            {
                let page_range = VRange::new(vaddr.floor(), vaddr.floor() + PAGE_SIZE);
                for pte in mm.page_table().iter_user(page_range) {
                    let mut attr = pte.get_attr().as_page_attr().expect("not a page attribute");
                    attr.insert(
                        PageAttribute::WRITE | PageAttribute::DIRTY | PageAttribute::ACCESSED,
                    );
                    pte.set_attr(attr.into());
                }
                ferrite_hal::flush_tlb(vaddr);
                drop(areas);
                ferrite_hal::tlb_shootdown();
                return Ok(());
            }
        }
    }

    if fault.present {
        if let Some((pfn, attr)) = pte_entry {
            if attr.contains(PageAttribute::PRESENT) {
                fault.faulting_page = Some(unsafe {
                    // SAFETY: a present PTE keeps its frame referenced.
                    Page::with_raw(pfn, |page| page.clone())
                });
            }
        }
    }

    let verdict = area.handle_fault(fault, offset);
    let vm_attr = area.flags.get().page_attr();

    let failure: Option<&'static str> = match verdict {
        FaultResolution::Complete => None,
        FaultResolution::CannotHandle => Some("the area's fault handler cannot handle this"),
        FaultResolution::MapBackingRo
        | FaultResolution::MapBacking
        | FaultResolution::CopyBacking => 'map: {
            let Some(backing) = fault.backing_page.take() else {
                break 'map Some("out of memory");
            };

            let (page, attr) = match verdict {
                FaultResolution::CopyBacking => {
                    let Some(copy) = Page::try_alloc() else {
                        break 'map Some("out of memory");
                    };
                    copy.copy_from(&backing);
                    (copy, vm_attr | fault.map_extra)
                }
                FaultResolution::MapBackingRo => {
                    (backing, (vm_attr - PageAttribute::WRITE) | fault.map_extra)
                }
                _ => (backing, vm_attr | fault.map_extra),
            };

            let mut attr = attr | PageAttribute::PRESENT | PageAttribute::ACCESSED;
            if fault.write {
                attr |= PageAttribute::DIRTY;
            }

            let page_range = VRange::new(vaddr.floor(), vaddr.floor() + PAGE_SIZE);
            let pte = mm
                .page_table()
                .iter_user(page_range)
                .next()
                .expect("fault address has no PTE slot");

            let (old_pfn, old_raw) = pte.take();
            let was_present = old_raw
                .as_page_attr()
                .map_or(false, |a| a.contains(PageAttribute::PRESENT));
            if was_present {
                drop(unsafe {
                    // SAFETY: the replaced PTE held one reference.
                    Page::from_raw(old_pfn)
                });
            }

            pte.set(page.into_raw(), attr.into());
            ferrite_hal::flush_tlb(vaddr);

            None
        }
    };

    drop(areas);

    if let Some(reason) = failure {
        return Err(report_invalid(vaddr, fault, area_info, reason));
    }

    ferrite_hal::tlb_shootdown();
    Ok(())
}
