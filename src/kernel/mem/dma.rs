use ferrite_mm::address::{PAddr, VAddr};
use ferrite_mm::paging::PAGE_SIZE;

use super::address_space::AddressSpace;
use super::mmstat::{self, MemUsage};
use super::page::Page;
use super::VmError;

/// A pinned, physically contiguous buffer, kernel-addressable through the
/// direct map. Devices get `paddr()`, the kernel gets the byte slices.
pub struct DmaBuffer {
    pages: Page,
}

impl DmaBuffer {
    pub fn alloc(npages: usize) -> Result<Self, VmError> {
        let pages = Page::alloc_many(npages).ok_or(VmError::OutOfPhysical)?;
        for _ in 0..npages {
            mmstat::inc(MemUsage::Dma);
        }
        Ok(Self { pages })
    }

    pub fn paddr(&self) -> PAddr {
        self.pages.paddr()
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            // SAFETY: the buffer is exclusively owned.
            self.pages.as_bytes()
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            // SAFETY: the buffer is exclusively owned and we are `&mut`.
            self.pages.as_bytes_mut()
        }
    }
}

impl Drop for DmaBuffer {
    fn drop(&mut self) {
        for _ in 0..self.pages.npages() {
            mmstat::dec(MemUsage::Dma);
        }
    }
}

/// Detach `npages` at `vaddr` from the current address space into a private
/// DMA buffer: copy the contents out, then unmap the range.
pub fn dma_unshare(
    mm: &AddressSpace,
    vaddr: VAddr,
    npages: usize,
) -> Result<DmaBuffer, VmError> {
    let mut buffer = DmaBuffer::alloc(npages)?;

    mm.read_user(vaddr, buffer.as_bytes_mut())
        .map_err(|_| VmError::BadAddress)?;
    mm.munmap(vaddr, npages * PAGE_SIZE)?;

    Ok(buffer)
}
