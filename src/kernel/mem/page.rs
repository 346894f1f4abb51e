use core::mem::ManuallyDrop;
use core::ops::Deref;

use ferrite_hal::ArchPhysAccess;
use ferrite_mm::address::PAddr;
use ferrite_mm::paging::{PAGE_SIZE, PFN};

use super::page_alloc::frame_allocator;

/// An owned reference to a run of physical frames. Cloning bumps the frame
/// refcounts, dropping releases them; a frame whose count reaches zero goes
/// back to the buddy.
pub struct Page {
    pfn: PFN,
    npages: usize,
}

/// A page known to be exclusively owned, giving safe access to its bytes.
#[repr(transparent)]
pub struct PageExcl(Page);

impl Page {
    pub fn alloc() -> Self {
        Self::alloc_many(1).expect("out of physical memory")
    }

    pub fn try_alloc() -> Option<Self> {
        Self::alloc_many(1)
    }

    /// Allocate `npages` contiguous frames; the returned handle holds one
    /// reference on each.
    pub fn alloc_many(npages: usize) -> Option<Self> {
        let allocator = frame_allocator();
        let pfn = allocator.alloc_exact(npages)?;
        allocator.ref_frames(pfn, npages);
        Some(Self { pfn, npages })
    }

    pub fn zeroed() -> Self {
        let page = Self::alloc();
        unsafe {
            // SAFETY: freshly allocated, nobody else holds a reference.
            page.as_bytes_mut().fill(0);
        }
        page
    }

    pub fn pfn(&self) -> PFN {
        self.pfn
    }

    pub fn npages(&self) -> usize {
        self.npages
    }

    pub fn len(&self) -> usize {
        self.npages * PAGE_SIZE
    }

    pub fn paddr(&self) -> PAddr {
        PAddr::from(self.pfn)
    }

    /// Give up ownership without dropping the reference; used to park the
    /// reference in a page-table entry.
    pub fn into_raw(self) -> PFN {
        let pfn = self.pfn;
        core::mem::forget(self);
        pfn
    }

    /// Adopt a reference previously leaked with [`Self::into_raw`].
    ///
    /// # Safety
    /// `pfn` must carry a leaked reference that nobody else will adopt.
    pub unsafe fn from_raw(pfn: PFN) -> Self {
        Self { pfn, npages: 1 }
    }

    /// Borrow the frame behind `pfn` without adopting its reference.
    ///
    /// # Safety
    /// `pfn` must be a live, referenced frame for the duration of `f`.
    pub unsafe fn with_raw<R>(pfn: PFN, f: impl FnOnce(&Page) -> R) -> R {
        let page = ManuallyDrop::new(Page { pfn, npages: 1 });
        f(&page)
    }

    /// Whether we hold the only reference.
    pub fn is_exclusive(&self) -> bool {
        self.npages == 1
            && frame_allocator()
                .frame(self.pfn)
                .refcount()
                .load(core::sync::atomic::Ordering::Acquire)
                == 1
    }

    /// # Safety
    /// The caller must ensure nobody writes the pages concurrently.
    pub unsafe fn as_bytes(&self) -> &[u8] {
        core::slice::from_raw_parts(ArchPhysAccess::as_ptr(self.pfn).as_ptr(), self.len())
    }

    /// # Safety
    /// The caller must ensure exclusive access to the pages.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn as_bytes_mut(&self) -> &mut [u8] {
        core::slice::from_raw_parts_mut(ArchPhysAccess::as_ptr(self.pfn).as_ptr(), self.len())
    }

    /// Copy the contents of `src` into this page.
    pub fn copy_from(&self, src: &Page) {
        assert_eq!(self.npages, src.npages);
        unsafe {
            // SAFETY: distinct frames; the destination is owned by us.
            core::ptr::copy_nonoverlapping(
                ArchPhysAccess::as_ptr(src.pfn).as_ptr(),
                ArchPhysAccess::as_ptr(self.pfn).as_ptr(),
                self.len(),
            );
        }
    }

    pub fn is_dirty(&self) -> bool {
        frame_allocator().frame(self.pfn).is_dirty()
    }

    pub fn set_dirty(&self, dirty: bool) {
        frame_allocator().frame(self.pfn).set_dirty(dirty);
    }
}

impl Clone for Page {
    fn clone(&self) -> Self {
        frame_allocator().ref_frames(self.pfn, self.npages);
        Self {
            pfn: self.pfn,
            npages: self.npages,
        }
    }
}

impl Drop for Page {
    fn drop(&mut self) {
        frame_allocator().unref_frames(self.pfn, self.npages);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:?}, {} pages)", self.pfn, self.npages)
    }
}

impl PageExcl {
    pub fn alloc() -> Self {
        Self(Page::alloc())
    }

    pub fn try_alloc() -> Option<Self> {
        Page::try_alloc().map(Self)
    }

    pub fn zeroed() -> Self {
        Self(Page::zeroed())
    }

    pub fn as_bytes(&self) -> &[u8] {
        debug_assert!(self.0.is_exclusive());
        unsafe {
            // SAFETY: exclusively owned.
            self.0.as_bytes()
        }
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        debug_assert!(self.0.is_exclusive());
        unsafe {
            // SAFETY: exclusively owned.
            self.0.as_bytes_mut()
        }
    }

    pub fn into_page(self) -> Page {
        self.0
    }
}

impl Deref for PageExcl {
    type Target = Page;

    fn deref(&self) -> &Page {
        &self.0
    }
}
