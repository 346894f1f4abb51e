use align_ext::AlignExt;
use ferrite_mm::paging::{PAGE_SIZE, PAGE_SIZE_BITS};
use hashbrown::HashMap;
use log::warn;
use spin::Mutex;

use super::mmstat::{self, MemUsage};
use super::page::{Page, PageExcl};
use crate::kernel::vfs::FsError;
use crate::prelude::*;

/// The per-inode operations the cache delegates to. `write_begin` and
/// `write_end` have generic defaults that go through `fill_cache` and extend
/// the size on writes past EOF; `flush_page` defaults to a discard.
pub trait CacheBackend: Send + Sync {
    /// Read the page at file offset `pgoff * PAGE_SIZE` from the backing
    /// store into a fresh frame.
    fn fill_cache(&self, pgoff: usize) -> Result<Page, FsError>;

    /// Write one dirty page back. The default keeps the data in the cache
    /// only, which is correct for memory-backed filesystems.
    fn flush_page(&self, _pgoff: usize, _page: &Page) -> Result<(), FsError> {
        Ok(())
    }

    fn size(&self) -> usize;
    fn set_size(&self, size: usize);
}

/// Per-inode mapping from page index to frame. Every frame in the map is
/// kept alive by one reference owned by the cache; mappers take their own.
///
/// The lock below is the only place in the core where callers may block:
/// filesystem upcalls run under it.
pub struct PageCache {
    pages: Mutex<HashMap<usize, Page>>,
    backend: Weak<dyn CacheBackend>,
}

impl PageCache {
    pub fn new(backend: Weak<dyn CacheBackend>) -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(HashMap::new()),
            backend,
        })
    }

    fn backend(&self) -> Result<Arc<dyn CacheBackend>, FsError> {
        self.backend.upgrade().ok_or(FsError::IoError)
    }

    fn get_locked(
        &self,
        pages: &mut HashMap<usize, Page>,
        pgoff: usize,
    ) -> Result<Page, FsError> {
        if let Some(page) = pages.get(&pgoff) {
            return Ok(page.clone());
        }

        let page = self.backend()?.fill_cache(pgoff)?;
        mmstat::inc(MemUsage::PageCache);
        pages.insert(pgoff, page.clone());
        Ok(page)
    }

    /// The frame for `pgoff`, filling the cache on a miss. The returned
    /// reference belongs to the caller.
    pub fn get_for_read(&self, pgoff: usize) -> Result<Page, FsError> {
        let mut pages = self.pages.lock();
        self.get_locked(&mut pages, pgoff)
    }

    pub fn get_for_write(&self, pgoff: usize) -> Result<Page, FsError> {
        self.get_for_read(pgoff)
    }

    /// Copy out of successive cached pages, clamped to the inode size.
    pub fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize, FsError> {
        let mut pages = self.pages.lock();
        let size = self.backend()?.size();

        let mut done = 0;
        while done < buf.len() {
            let offset = offset + done;
            if offset >= size {
                break;
            }

            let in_page = offset % PAGE_SIZE;
            let count = (PAGE_SIZE - in_page).min(buf.len() - done).min(size - offset);

            let page = self.get_locked(&mut pages, offset >> PAGE_SIZE_BITS)?;
            unsafe {
                // SAFETY: reads of cached data race only with explicit
                // writers, exactly as on real shared memory.
                buf[done..done + count].copy_from_slice(&page.as_bytes()[in_page..in_page + count]);
            }

            done += count;
        }

        Ok(done)
    }

    /// The `write_begin`/`write_end` bracket for one page of a write.
    fn write_begin(
        &self,
        pages: &mut HashMap<usize, Page>,
        old_size: usize,
        pgoff: usize,
    ) -> Result<Page, FsError> {
        // A page entirely past the current EOF has no backing data yet.
        if pgoff > old_size.align_up(PAGE_SIZE) >> PAGE_SIZE_BITS {
            if let Some(page) = pages.get(&pgoff) {
                return Ok(page.clone());
            }
            let page = PageExcl::zeroed().into_page();
            mmstat::inc(MemUsage::PageCache);
            pages.insert(pgoff, page.clone());
            return Ok(page);
        }

        self.get_locked(pages, pgoff)
    }

    fn write_end(&self, offset: usize, copied: usize) -> Result<(), FsError> {
        let backend = self.backend()?;
        if offset + copied > backend.size() {
            backend.set_size(offset + copied);
        }
        Ok(())
    }

    /// Copy into successive cached pages, dirtying them and extending the
    /// inode on writes past EOF.
    pub fn write(&self, data: &[u8], offset: usize) -> Result<usize, FsError> {
        let mut pages = self.pages.lock();
        let old_size = self.backend()?.size();

        let mut done = 0;
        while done < data.len() {
            let offset = offset + done;
            let in_page = offset % PAGE_SIZE;
            let count = (PAGE_SIZE - in_page).min(data.len() - done);

            let page = self.write_begin(&mut pages, old_size, offset >> PAGE_SIZE_BITS)?;
            unsafe {
                // SAFETY: the cache lock serialises writers.
                page.as_bytes_mut()[in_page..in_page + count]
                    .copy_from_slice(&data[done..done + count]);
            }
            page.set_dirty(true);
            self.write_end(offset, count)?;

            done += count;
        }

        Ok(done)
    }

    fn flush_one(
        &self,
        backend: &Arc<dyn CacheBackend>,
        pgoff: usize,
        page: &Page,
    ) -> Result<(), FsError> {
        if page.is_dirty() {
            backend.flush_page(pgoff, page)?;
            page.set_dirty(false);
        }
        Ok(())
    }

    /// Flush `npages` starting at `pgoff`; with `drop_pages` also evict
    /// them, dropping the cache's frame reference.
    pub fn flush_or_drop(
        &self,
        pgoff: usize,
        npages: usize,
        drop_pages: bool,
    ) -> Result<(), FsError> {
        let backend = self.backend()?;
        let mut pages = self.pages.lock();

        for pgoff in pgoff..pgoff + npages {
            let Some(page) = pages.get(&pgoff) else {
                continue;
            };
            self.flush_one(&backend, pgoff, page)?;
            if drop_pages {
                pages.remove(&pgoff);
                mmstat::dec(MemUsage::PageCache);
            }
        }

        Ok(())
    }

    pub fn flush_or_drop_all(&self, drop_pages: bool) -> Result<(), FsError> {
        let backend = self.backend()?;
        let mut pages = self.pages.lock();

        let offsets: Vec<usize> = pages.keys().copied().collect();
        for pgoff in offsets {
            let page = pages.get(&pgoff).expect("page vanished under the lock");
            self.flush_one(&backend, pgoff, page)?;
            if drop_pages {
                pages.remove(&pgoff);
                mmstat::dec(MemUsage::PageCache);
            }
        }

        Ok(())
    }

    /// Truncate or extend to `new_size`, evicting cached pages past the new
    /// end and zeroing the tail of the boundary page.
    pub fn resize(&self, new_size: usize) -> Result<(), FsError> {
        let backend = self.backend()?;
        let mut pages = self.pages.lock();
        let old_size = backend.size();

        if new_size < old_size {
            let keep = new_size.align_up(PAGE_SIZE) >> PAGE_SIZE_BITS;
            pages.retain(|&pgoff, _| {
                if pgoff < keep {
                    true
                } else {
                    mmstat::dec(MemUsage::PageCache);
                    false
                }
            });

            let tail = new_size % PAGE_SIZE;
            if tail != 0 {
                if let Some(page) = pages.get(&(new_size >> PAGE_SIZE_BITS)) {
                    unsafe {
                        // SAFETY: the cache lock serialises writers.
                        page.as_bytes_mut()[tail..].fill(0);
                    }
                    page.set_dirty(true);
                }
            }
        }

        backend.set_size(new_size);
        Ok(())
    }

    /// Number of cached pages; diagnostic.
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }
}

impl Drop for PageCache {
    fn drop(&mut self) {
        // The owning inode may already be gone; flush what we can and keep
        // the counters straight either way.
        if self.backend.upgrade().is_some() {
            if let Err(err) = self.flush_or_drop_all(false) {
                warn!("page cache flush on drop failed: {:?}", err);
            }
        }

        let mut pages = self.pages.lock();
        for _ in pages.drain() {
            mmstat::dec(MemUsage::PageCache);
        }
    }
}
