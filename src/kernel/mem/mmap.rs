use alloc::collections::btree_set::BTreeSet;
use core::ops::Bound;

use bitflags::bitflags;
use ferrite_hal::USER_SPACE_END;
use ferrite_mm::address::{AddrOps as _, VAddr, VRange};
use ferrite_mm::page_table::{PageAttribute, RawAttribute as _, PTE as _};
use ferrite_mm::paging::PAGE_SIZE;
use log::warn;

use super::address_space::{recount_stats, user_range_ok, AddressSpace, BreakState};
use super::page::Page;
use super::vm_area::{FileMapping, Mapping, VmArea, VmFlags, VmaContent, VmaType};
use super::VmError;
use crate::kernel::vfs::file::File;
use crate::prelude::*;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MmapFlags: u32 {
        /// Shared between parent and child across fork.
        const SHARED = 1 << 0;
        /// Copy-on-write across fork.
        const PRIVATE = 1 << 1;
        /// Fail rather than pick another address.
        const EXACT = 1 << 2;
    }
}

/// Default placement for mappings without a hint.
const MMAP_BASE: VAddr = VAddr::from_val(0x1000_0000);

fn verify_mmap_arguments(hint: &mut VAddr, flags: MmapFlags) -> Result<(), VmError> {
    if !hint.is_page_aligned() {
        warn!("mmap: hint address must be page-aligned");
        return Err(VmError::InvalidArgument);
    }

    let shared = flags.contains(MmapFlags::SHARED);
    let private = flags.contains(MmapFlags::PRIVATE);
    if shared == private {
        warn!("mmap: exactly one of SHARED and PRIVATE must be given");
        return Err(VmError::InvalidArgument);
    }

    if !flags.contains(MmapFlags::EXACT) && *hint == VAddr::NULL {
        *hint = MMAP_BASE;
    }

    Ok(())
}

fn range_is_free(areas: &BTreeSet<VmArea>, range: VRange) -> bool {
    areas
        .range::<VRange, _>((Bound::Included(&VRange::from(range.start())), Bound::Unbounded))
        .take_while(|area| area.range().start() < range.end())
        .next()
        .is_none()
}

/// Lowest free run of `len` bytes at or above `hint`.
fn find_available(areas: &BTreeSet<VmArea>, hint: VAddr, len: usize) -> Option<VAddr> {
    let mut at = hint.floor();
    if at == VAddr::NULL {
        at = MMAP_BASE;
    }

    loop {
        let range = VRange::new(at, at + len);
        if range.end() > USER_SPACE_END {
            return None;
        }

        let last_overlap = areas
            .range::<VRange, _>((Bound::Included(&VRange::from(at)), Bound::Unbounded))
            .take_while(|area| area.range().start() < range.end())
            .last();

        match last_overlap {
            None => return Some(at),
            Some(area) => at = area.range().end().ceil(),
        }
    }
}

impl AddressSpace {
    fn place(
        &self,
        areas: &mut BTreeSet<VmArea>,
        hint: VAddr,
        len: usize,
        exact: bool,
    ) -> Result<VAddr, VmError> {
        if exact {
            let range = VRange::new(hint, hint + len);
            if range.end() > USER_SPACE_END {
                return Err(VmError::OutOfVirtual);
            }
            if !range_is_free(areas, range) {
                return Err(VmError::Overlap);
            }
            return Ok(hint);
        }

        if hint + len > USER_SPACE_END {
            return Err(VmError::OutOfVirtual);
        }
        find_available(areas, hint, len).ok_or(VmError::OutOfVirtual)
    }

    fn insert_area(&self, areas: &mut BTreeSet<VmArea>, area: VmArea) {
        // Overlap here means placement is broken, not a user error.
        assert!(
            range_is_free(areas, area.range()),
            "overlapping area insertion: {:?}",
            area
        );
        areas.insert(area);
    }

    /// Map `npages` of zero-on-demand anonymous memory. No frame is
    /// allocated here; the first touch faults the pages in.
    pub fn mmap_anonymous(
        &self,
        mut hint: VAddr,
        flags: MmapFlags,
        prot: VmFlags,
        npages: usize,
    ) -> Result<VAddr, VmError> {
        verify_mmap_arguments(&mut hint, flags)?;
        if npages == 0 {
            return Err(VmError::InvalidArgument);
        }

        let len = npages * PAGE_SIZE;
        let vma_type = if flags.contains(MmapFlags::SHARED) {
            VmaType::Shared
        } else {
            VmaType::Private
        };

        let mut areas = self.areas_lock();
        let at = self.place(&mut areas, hint, len, flags.contains(MmapFlags::EXACT))?;

        let area = VmArea::new(
            VRange::new(at, at + len),
            Mapping::Anonymous,
            prot,
            vma_type,
        );
        area.content.set(VmaContent::Mmap);
        self.insert_area(&mut areas, area);

        Ok(at)
    }

    /// Map `npages` of `file` starting at the page-aligned byte `offset`.
    pub fn mmap_file(
        &self,
        mut hint: VAddr,
        flags: MmapFlags,
        prot: VmFlags,
        npages: usize,
        file: Arc<File>,
        offset: usize,
    ) -> Result<VAddr, VmError> {
        verify_mmap_arguments(&mut hint, flags)?;
        if npages == 0 || offset % PAGE_SIZE != 0 {
            return Err(VmError::InvalidArgument);
        }

        let shared = flags.contains(MmapFlags::SHARED);
        file.check_mmap(prot, shared)?;

        let len = npages * PAGE_SIZE;
        let vma_type = if shared { VmaType::Shared } else { VmaType::Private };

        let mut areas = self.areas_lock();
        let at = self.place(&mut areas, hint, len, flags.contains(MmapFlags::EXACT))?;

        let area = VmArea::new(
            VRange::new(at, at + len),
            Mapping::File(FileMapping::new(file, offset)),
            prot,
            vma_type,
        );
        area.content.set(VmaContent::File);
        self.insert_area(&mut areas, area);

        Ok(at)
    }

    /// Split the covering area so `[range.start, range.end)` is isolated,
    /// reinsert the outer pieces with recounted statistics, and hand back
    /// the middle.
    fn isolate(&self, areas: &mut BTreeSet<VmArea>, range: VRange) -> Option<VmArea> {
        let area = areas.take(&VRange::from(range.start()))?;
        let arange = area.range();
        let end = arange.end().min(range.end());

        let (left, rest) = area.split(range.start());
        if let Some(left) = left {
            recount_stats(self.page_table(), &left);
            areas.insert(left);
        }

        let rest = rest.expect("split start is inside the area");
        let (mid, right) = rest.split(end);
        let mid = mid.expect("split end is past the start");
        if let Some(right) = right {
            recount_stats(self.page_table(), &right);
            areas.insert(right);
        }

        recount_stats(self.page_table(), &mid);
        Some(mid)
    }

    /// Unmap every page of the area covering the range, splitting it first
    /// if the range covers it only partially.
    pub fn munmap(&self, addr: VAddr, size: usize) -> Result<(), VmError> {
        if size == 0 {
            return Err(VmError::InvalidArgument);
        }

        // All pages containing any part of the range go away.
        let range = VRange::new(addr.floor(), (addr + size).ceil());
        if !user_range_ok(range) {
            return Err(VmError::InvalidArgument);
        }

        let mut areas = self.areas_lock();
        let Some(mid) = self.isolate(&mut areas, range) else {
            warn!("munmap: no area at {:?}", addr);
            return Err(VmError::InvalidArgument);
        };

        // Read-path walk: pages that were never faulted in have no tables
        // to visit, and none are created for them.
        self.page_table().walk_range(mid.range(), &mut |vaddr, pte| {
            let (pfn, raw) = pte.take();
            let present = raw
                .as_page_attr()
                .map_or(false, |attr| attr.contains(PageAttribute::PRESENT));
            if present {
                drop(unsafe {
                    // SAFETY: every present user PTE holds one reference.
                    Page::from_raw(pfn)
                });
                ferrite_hal::flush_tlb(vaddr);
            }
        });

        // Dropping the middle area releases its file reference.
        drop(mid);
        drop(areas);

        ferrite_hal::tlb_shootdown();
        Ok(())
    }

    /// Change the permissions of `[addr, addr + size)`. Lost permissions
    /// are removed from the PTEs eagerly; gained ones are granted by the
    /// fault handler on demand so CoW keeps working.
    pub fn protect(&self, addr: VAddr, size: usize, prot: VmFlags) -> Result<(), VmError> {
        if !addr.is_page_aligned() || size == 0 {
            return Err(VmError::InvalidArgument);
        }

        let range = VRange::new(addr, (addr + size).ceil());
        if !user_range_ok(range) {
            return Err(VmError::InvalidArgument);
        }

        let mut areas = self.areas_lock();
        let Some(mid) = self.isolate(&mut areas, range) else {
            return Err(VmError::InvalidArgument);
        };

        if let Some(mapping) = mid.backing_file() {
            let private = mid.vma_type == VmaType::Private;
            if !mapping.file.allows_protection(prot, private) {
                // Put the piece back untouched.
                areas.insert(mid);
                return Err(VmError::PermissionDenied);
            }
        }

        let old = mid.flags.get();
        let mut lost = PageAttribute::empty();
        if old.contains(VmFlags::READ) && !prot.contains(VmFlags::READ) {
            warn!("vm_protect: removing read permission is not supported yet");
            lost |= PageAttribute::READ;
        }
        if old.contains(VmFlags::WRITE) && !prot.contains(VmFlags::WRITE) {
            lost |= PageAttribute::WRITE;
        }
        if old.contains(VmFlags::EXEC) && !prot.contains(VmFlags::EXEC) {
            lost |= PageAttribute::EXECUTE;
        }

        if !lost.is_empty() {
            self.page_table().walk_range(mid.range(), &mut |vaddr, pte| {
                let mut attr = pte.get_attr().as_page_attr().expect("not a page attribute");
                if !attr.intersects(lost) {
                    return;
                }
                attr.remove(lost);
                pte.set_attr(attr.into());
                ferrite_hal::flush_tlb(vaddr);
            });
        }

        mid.flags.set(prot | VmFlags::USER);
        areas.insert(mid);
        drop(areas);

        if !lost.is_empty() {
            ferrite_hal::tlb_shootdown();
        }
        Ok(())
    }

    /// Register the initial program break. Called once per process.
    pub fn register_break(&self, start: VAddr) {
        let mut brk = self.brk.lock();
        assert!(brk.is_none(), "program break registered twice");
        *brk = Some(BreakState {
            start: start.ceil(),
            pos: start.ceil(),
        });
    }

    /// Move the program break. `None` queries the current position; the
    /// break never shrinks.
    pub fn set_break(&self, pos: Option<VAddr>) -> VAddr {
        let mut brk = self.brk.lock();
        let state = brk.as_mut().expect("program break not registered");

        let Some(pos) = pos else {
            return state.pos;
        };
        let pos = pos.ceil();

        if pos <= state.pos {
            return state.pos;
        }

        let current = state.pos;
        let len = pos - current;

        drop(brk);

        let grown = self
            .mmap_anonymous(
                current,
                MmapFlags::PRIVATE | MmapFlags::EXACT,
                VmFlags::READ | VmFlags::WRITE,
                len / PAGE_SIZE,
            )
            .is_ok();

        let mut brk = self.brk.lock();
        let state = brk.as_mut().expect("program break not registered");
        if grown {
            state.pos = pos;
        }
        state.pos
    }
}
