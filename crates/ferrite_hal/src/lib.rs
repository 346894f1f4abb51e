//! Software-emulated platform backend.
//!
//! Physical memory is a page-aligned arena owned by this crate; "physical"
//! addresses are offsets into it and the direct map degenerates to pointer
//! arithmetic. Paging is a 4-level software layout with the same shape as
//! x86_64. TLB maintenance is recorded in counters so the ordering
//! guarantees can be observed from tests.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

mod paging;
mod phys;

use core::sync::atomic::{AtomicUsize, Ordering};

use ferrite_mm::address::{PAddr, VAddr};

pub use paging::{ArchPagingMode, SoftAttr, SoftPte, SoftRawTable};
pub use phys::{init_phys_memory, phys_frames, ArchPhysAccess};

/// End of the user half of the address space: the lower half of the root
/// page table.
pub const USER_SPACE_END: VAddr = VAddr::from_val(1 << 47);

/// Virtual base of the kernel direct map of all physical memory.
pub const DIRECT_MAP_BASE: VAddr = VAddr::from_val(1 << 47);

static TLB_FLUSHES: AtomicUsize = AtomicUsize::new(0);
static TLB_SHOOTDOWNS: AtomicUsize = AtomicUsize::new(0);
static CURRENT_ROOT: AtomicUsize = AtomicUsize::new(0);

/// Invalidate one page's translation on the current CPU.
pub fn flush_tlb(_vaddr: VAddr) {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

pub fn flush_tlb_all() {
    TLB_FLUSHES.fetch_add(1, Ordering::Relaxed);
}

/// Broadcast an invalidate-TLB IPI to all CPUs. Delivery is ordered with the
/// page-table modification that preceded it.
pub fn tlb_shootdown() {
    TLB_SHOOTDOWNS.fetch_add(1, Ordering::SeqCst);
}

pub fn tlb_shootdown_count() -> usize {
    TLB_SHOOTDOWNS.load(Ordering::SeqCst)
}

/// Install a new root page table, i.e. the emulated `mov cr3`.
pub fn switch_mm(root: PAddr) {
    use ferrite_mm::address::Addr as _;
    CURRENT_ROOT.store(root.addr(), Ordering::Release);
    flush_tlb_all();
}

pub fn current_root() -> PAddr {
    PAddr::from(CURRENT_ROOT.load(Ordering::Acquire))
}
