use alloc::collections::btree_set::BTreeSet;

use ferrite_hal::{ArchPhysAccess, USER_SPACE_END};
use ferrite_mm::address::{AddrOps as _, VAddr, VRange};
use ferrite_mm::page_table::{PageAttribute, RawAttribute as _, PTE as _};
use ferrite_mm::paging::{PAGE_SIZE, PFN};
use spin::{Mutex, MutexGuard};

use super::page::Page;
use super::page_fault::{handle_page_fault, Fault, InvalidFault};
use super::page_table::{global_page_table, KernelPageTable, TablePageAlloc};
use super::vm_area::{VmArea, VmaType};

pub(super) struct BreakState {
    pub start: VAddr,
    pub pos: VAddr,
}

/// A user address space: a page table whose upper half aliases the kernel's
/// top-level entries, plus an ordered, non-overlapping set of areas.
///
/// One lock covers the area set and the page-table updates made under it.
/// When two address spaces must be held at once (fork), they are locked in
/// ascending address order.
pub struct AddressSpace {
    page_table: KernelPageTable,
    areas: Mutex<BTreeSet<VmArea>>,
    pub(super) brk: Mutex<Option<BreakState>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self {
            page_table: global_page_table().clone_in(TablePageAlloc),
            areas: Mutex::new(BTreeSet::new()),
            brk: Mutex::new(None),
        }
    }

    pub fn page_table(&self) -> &KernelPageTable {
        &self.page_table
    }

    /// Make this the active address space on the current CPU.
    pub fn activate(&self) {
        ferrite_hal::switch_mm(self.page_table.addr());
    }

    pub(super) fn areas_lock(&self) -> MutexGuard<'_, BTreeSet<VmArea>> {
        self.areas.lock()
    }

    pub fn area_count(&self) -> usize {
        self.areas.lock().len()
    }

    /// The range of the area containing `addr`.
    pub fn area_range(&self, addr: VAddr) -> Option<VRange> {
        self.areas.lock().get(&VRange::from(addr)).map(|a| a.range())
    }

    /// `(regular, pagecache, cow)` of the area containing `addr`.
    pub fn area_stat(&self, addr: VAddr) -> Option<(usize, usize, usize)> {
        self.areas.lock().get(&VRange::from(addr)).map(|a| {
            (
                a.stat.regular.get(),
                a.stat.pagecache.get(),
                a.stat.cow.get(),
            )
        })
    }

    pub fn area_flags(&self, addr: VAddr) -> Option<super::VmFlags> {
        self.areas.lock().get(&VRange::from(addr)).map(|a| a.flags.get())
    }

    /// Duplicate the address space for `fork`. Shared areas alias the same
    /// frames; private areas turn copy-on-write on both sides.
    pub fn fork(&self) -> AddressSpace {
        let forked = AddressSpace::new();

        // Lock discipline: two address spaces are taken in ascending address
        // order. `forked` is still private to us, but keep the order anyway.
        let (first, second): (&AddressSpace, &AddressSpace) =
            if (self as *const _ as usize) < (&forked as *const _ as usize) {
                (self, &forked)
            } else {
                (&forked, self)
            };
        let _first_guard = first.areas.lock();
        let second_guard = second.areas.lock();

        let (src_areas, mut dst_areas) = if core::ptr::eq(first, self) {
            (_first_guard, second_guard)
        } else {
            (second_guard, _first_guard)
        };

        for area in src_areas.iter() {
            let range = area.range();
            let src_iter = self.page_table.iter_user(range);
            let dst_iter = forked.page_table.iter_user(range);

            match area.vma_type {
                VmaType::Shared => {
                    for (src, dst) in src_iter.zip(dst_iter) {
                        let (pfn, raw) = src.get();
                        let attr = raw.as_page_attr().expect("not a page attribute");
                        if !attr.contains(PageAttribute::PRESENT) {
                            continue;
                        }
                        bump_frame_ref(pfn);
                        dst.set(pfn, raw);
                    }
                }
                VmaType::Private => {
                    for (src, dst) in src_iter.zip(dst_iter) {
                        let (pfn, raw) = src.get();
                        let mut attr = raw.as_page_attr().expect("not a page attribute");
                        if !attr.contains(PageAttribute::PRESENT) {
                            continue;
                        }

                        attr.remove(
                            PageAttribute::WRITE
                                | PageAttribute::DIRTY
                                | PageAttribute::ACCESSED,
                        );
                        attr.insert(PageAttribute::COPY_ON_WRITE);

                        src.set(pfn, attr.into());
                        bump_frame_ref(pfn);
                        dst.set(pfn, attr.into());
                    }

                    let stat = &area.stat;
                    stat.cow.set(stat.cow.get() + stat.regular.get());
                    stat.regular.set(0);
                }
            }

            dst_areas.insert(area.clone());
        }

        drop(src_areas);
        drop(dst_areas);

        // Both sides may hold read-only views of pages that used to be
        // writable, so every CPU's stale translations must go.
        ferrite_hal::tlb_shootdown();

        forked
    }

    /// Emulated user store: drives the fault path exactly like a CPU write
    /// to the mapping would, then copies the bytes.
    pub fn write_user(&self, addr: VAddr, data: &[u8]) -> Result<(), InvalidFault> {
        let mut done = 0;
        self.access_user(addr, data.len(), true, |chunk| {
            chunk.copy_from_slice(&data[done..done + chunk.len()]);
            done += chunk.len();
        })
    }

    /// Emulated user load.
    pub fn read_user(&self, addr: VAddr, buf: &mut [u8]) -> Result<(), InvalidFault> {
        let mut done = 0;
        let len = buf.len();
        self.access_user(addr, len, false, |chunk| {
            buf[done..done + chunk.len()].copy_from_slice(chunk);
            done += chunk.len();
        })
    }

    fn access_user(
        &self,
        addr: VAddr,
        len: usize,
        write: bool,
        mut f: impl FnMut(&mut [u8]),
    ) -> Result<(), InvalidFault> {
        let end = addr + len;
        let mut cur = addr;

        while cur < end {
            let page_start = cur.floor();
            let chunk_end = end.min(page_start + PAGE_SIZE);
            let pfn = self.ensure_mapped(cur, write)?;

            let chunk = unsafe {
                // SAFETY: `ensure_mapped` faulted the page in; the address
                // space lock is not held, matching a real user access.
                core::slice::from_raw_parts_mut(
                    ArchPhysAccess::as_ptr(pfn).as_ptr().add(cur - page_start),
                    chunk_end - cur,
                )
            };
            f(chunk);

            cur = chunk_end;
        }

        Ok(())
    }

    fn ensure_mapped(&self, vaddr: VAddr, write: bool) -> Result<PFN, InvalidFault> {
        for _ in 0..2 {
            if let Some((pfn, attr)) = self.page_table.lookup(vaddr) {
                let usable = attr.contains(PageAttribute::PRESENT)
                    && (!write || attr.contains(PageAttribute::WRITE));
                if usable {
                    return Ok(pfn);
                }

                let mut fault = Fault::access(attr.contains(PageAttribute::PRESENT), write);
                handle_page_fault(self, vaddr, &mut fault)?;
            } else {
                let mut fault = Fault::access(false, write);
                handle_page_fault(self, vaddr, &mut fault)?;
            }
        }

        // A second fault would mean the handler lied about completing.
        panic!("page fault did not produce a usable mapping at {:?}", vaddr);
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        // Tear down only the user half: drop every mapped page's reference
        // with a read-path walk (nothing is created for ranges that were
        // never faulted in); the user-owned intermediate tables die with
        // the page table, the shared kernel half stays untouched.
        let areas = self.areas.get_mut();
        for area in areas.iter() {
            self.page_table.walk_range(area.range(), &mut |_, pte| {
                let (pfn, raw) = pte.take();
                let present = raw
                    .as_page_attr()
                    .map_or(false, |attr| attr.contains(PageAttribute::PRESENT));
                if present {
                    drop(unsafe {
                        // SAFETY: every present user PTE holds one reference.
                        Page::from_raw(pfn)
                    });
                }
            });
        }
        areas.clear();
    }
}

fn bump_frame_ref(pfn: PFN) {
    unsafe {
        // SAFETY: the pfn comes from a present PTE holding a reference.
        Page::with_raw(pfn, |page| core::mem::forget(page.clone()));
    }
}

/// Recompute an area's counters from its leaf entries; used after splits so
/// both pieces carry accurate statistics.
pub(super) fn recount_stats(page_table: &KernelPageTable, area: &VmArea) {
    let (mut regular, mut pagecache, mut cow) = (0, 0, 0);

    for vaddr in area.range().iter_pages() {
        let Some((_, attr)) = page_table.lookup(vaddr) else {
            continue;
        };
        if !attr.contains(PageAttribute::PRESENT) {
            continue;
        }

        if attr.contains(PageAttribute::MAPPED) {
            pagecache += 1;
        }
        if attr.contains(PageAttribute::COPY_ON_WRITE) {
            cow += 1;
        } else {
            regular += 1;
        }
    }

    area.stat.regular.set(regular);
    area.stat.pagecache.set(pagecache);
    area.stat.cow.set(cow);
}

/// Sanity bound used by mmap placement and unmap argument checks.
pub(super) fn user_range_ok(range: VRange) -> bool {
    range.end() <= USER_SPACE_END && range.start() < range.end()
}
