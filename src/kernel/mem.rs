mod address_space;
mod cow;
mod dma;
mod mmap;
mod mmstat;
mod page;
mod page_alloc;
mod page_cache;
mod page_fault;
mod page_table;
mod vm_area;

use crate::kernel::constants::{EACCES, EEXIST, EFAULT, EINVAL, ENOMEM};

pub use address_space::AddressSpace;
pub use cow::zero_page;
pub use dma::{dma_unshare, DmaBuffer};
pub use mmap::MmapFlags;
pub use mmstat::MemUsage;
pub use page::{Page, PageExcl};
pub use page_alloc::{frame_allocator, init_frames};
pub use page_cache::{CacheBackend, PageCache};
pub use page_fault::{handle_page_fault, Fault, FaultResolution, InvalidFault};
pub use page_table::{global_page_table, KernelPageTable, TablePageAlloc};
pub use vm_area::{FileMapping, Mapping, VmArea, VmFlags, VmaContent, VmaType};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmError {
    OutOfVirtual,
    OutOfPhysical,
    Overlap,
    PermissionDenied,
    InvalidArgument,
    BadAddress,
}

impl VmError {
    pub fn errno(self) -> u32 {
        match self {
            VmError::OutOfVirtual | VmError::OutOfPhysical => ENOMEM,
            VmError::Overlap => EEXIST,
            VmError::PermissionDenied => EACCES,
            VmError::InvalidArgument => EINVAL,
            VmError::BadAddress => EFAULT,
        }
    }
}

/// Bring up the memory core: physical memory, the frame table, the global
/// kernel page table. Safe to call more than once; only the first call
/// sizes the machine.
pub fn init(nframes: usize) {
    page_alloc::init_frames(nframes);
    page_table::init_global_page_table();
}
