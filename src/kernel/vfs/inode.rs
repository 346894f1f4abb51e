use core::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};

use spin::Once;

use super::dentry::Dentry;
use super::{FsError, FsResult, Superblock};
use crate::io::Buffer;
use crate::kernel::mem::{CacheBackend, Page, PageCache};
use crate::prelude::*;

pub type Ino = u64;
pub type DevId = u64;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Format {
    Unknown,
    Regular,
    Directory,
    Symlink,
    CharDevice,
    BlockDevice,
    Fifo,
    Socket,
}

impl Format {
    /// The `d_type` code used in directory entry streams.
    pub fn dirent_type(self) -> u8 {
        match self {
            Format::Unknown => 0,
            Format::Fifo => 1,
            Format::CharDevice => 2,
            Format::Directory => 4,
            Format::BlockDevice => 6,
            Format::Regular => 8,
            Format::Symlink => 10,
            Format::Socket => 12,
        }
    }
}

/// Monotonic timestamp source; the platform has no wall clock.
static CLOCK: AtomicU64 = AtomicU64::new(1);

pub fn now() -> u64 {
    CLOCK.fetch_add(1, Ordering::Relaxed)
}

#[derive(Debug)]
pub struct FileStat {
    pub ino: Ino,
    pub format: Format,
    pub perm: u32,
    pub size: usize,
    pub uid: u32,
    pub gid: u32,
    pub nlink: usize,
    pub accessed: u64,
    pub modified: u64,
    pub created: u64,
}

/// Operations a filesystem provides for one inode. Everything defaults to
/// "not supported" so filesystems implement only what they mean.
pub trait InodeOps: Send + Sync {
    /// Bind the inode for `child` if the name exists. `Ok(true)` means the
    /// dentry was made positive.
    fn lookup(&self, _dir: &Arc<Inode>, _child: &Arc<Dentry>) -> FsResult<bool> {
        Err(FsError::NotSupported)
    }

    fn create(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>, _perm: u32) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn mkdir(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>, _perm: u32) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn rmdir(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn symlink(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>, _target: &[u8]) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn hardlink(
        &self,
        _dir: &Arc<Inode>,
        _at: &Arc<Dentry>,
        _existing: &Arc<Dentry>,
    ) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn mknod(
        &self,
        _dir: &Arc<Inode>,
        _at: &Arc<Dentry>,
        _format: Format,
        _perm: u32,
        _dev: DevId,
    ) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn rename(
        &self,
        _old_dir: &Arc<Inode>,
        _old: &Arc<Dentry>,
        _new_dir: &Arc<Inode>,
        _new: &Arc<Dentry>,
    ) -> FsResult<()> {
        Err(FsError::NotSupported)
    }

    fn readlink(&self, _inode: &Arc<Inode>, _buffer: &mut dyn Buffer) -> FsResult<usize> {
        Err(FsError::InvalidArgument)
    }

    /// Emit the directory entries. The default iterates the dentry tree,
    /// which is right for filesystems whose directories live in the dcache.
    fn iterate_dir(
        &self,
        dentry: &Arc<Dentry>,
        emit: &mut dyn FnMut(Ino, &[u8], Format),
    ) -> FsResult<()> {
        dentry.for_each_child(&mut |name, inode| emit(inode.ino, name, inode.format));
        Ok(())
    }

    /// Read the page at file offset `pgoff * PAGE_SIZE` into a fresh frame.
    fn fill_cache(&self, _inode: &Arc<Inode>, _pgoff: usize) -> FsResult<Page> {
        Err(FsError::InvalidArgument)
    }

    /// Write one dirty page back; the default discards (cache is
    /// authoritative).
    fn flush_page(&self, _inode: &Arc<Inode>, _pgoff: usize, _page: &Page) -> FsResult<()> {
        Ok(())
    }

    fn devid(&self) -> FsResult<DevId> {
        Err(FsError::InvalidArgument)
    }
}

pub struct Inode {
    pub ino: Ino,
    pub format: Format,
    perm: AtomicU32,
    uid: AtomicU32,
    gid: AtomicU32,
    size: AtomicUsize,
    nlink: AtomicUsize,
    atime: AtomicU64,
    mtime: AtomicU64,
    ctime: AtomicU64,
    sb: Weak<Superblock>,
    ops: Box<dyn InodeOps>,
    cache: Once<Arc<PageCache>>,
    this: Weak<Inode>,
}

impl Inode {
    pub fn new(
        sb: &Arc<Superblock>,
        ino: Ino,
        format: Format,
        perm: u32,
        ops: Box<dyn InodeOps>,
    ) -> Arc<Self> {
        let created = now();
        Arc::new_cyclic(|this| Self {
            ino,
            format,
            perm: AtomicU32::new(perm),
            uid: AtomicU32::new(0),
            gid: AtomicU32::new(0),
            size: AtomicUsize::new(0),
            nlink: AtomicUsize::new(1),
            atime: AtomicU64::new(created),
            mtime: AtomicU64::new(created),
            ctime: AtomicU64::new(created),
            sb: Arc::downgrade(sb),
            ops,
            cache: Once::new(),
            this: this.clone(),
        })
    }

    pub fn ops(&self) -> &dyn InodeOps {
        &*self.ops
    }

    pub fn superblock(&self) -> Option<Arc<Superblock>> {
        self.sb.upgrade()
    }

    pub fn perm(&self) -> u32 {
        self.perm.load(Ordering::Relaxed)
    }

    pub fn set_perm(&self, perm: u32) {
        self.perm.store(perm, Ordering::Relaxed);
        self.ctime.store(now(), Ordering::Relaxed);
    }

    pub fn size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub(crate) fn store_size(&self, size: usize) {
        self.size.store(size, Ordering::Release);
    }

    pub fn nlink(&self) -> usize {
        self.nlink.load(Ordering::Acquire)
    }

    pub fn inc_nlink(&self) {
        self.nlink.fetch_add(1, Ordering::AcqRel);
    }

    pub fn dec_nlink(&self) -> usize {
        self.nlink.fetch_sub(1, Ordering::AcqRel) - 1
    }

    /// The embedded page cache, created on first use. Every regular file's
    /// data I/O goes through it.
    pub fn page_cache(&self) -> Arc<PageCache> {
        self.cache
            .call_once(|| {
                let backend: Weak<dyn CacheBackend> = self.this.clone();
                PageCache::new(backend)
            })
            .clone()
    }

    /// Generic read through the page cache.
    pub fn read(&self, buf: &mut [u8], offset: usize) -> FsResult<usize> {
        let n = self.page_cache().read(buf, offset)?;
        self.atime.store(now(), Ordering::Relaxed);
        Ok(n)
    }

    /// Generic write through the page cache; extends the size on writes
    /// past EOF.
    pub fn write(&self, data: &[u8], offset: usize) -> FsResult<usize> {
        let n = self.page_cache().write(data, offset)?;
        self.mtime.store(now(), Ordering::Relaxed);
        Ok(n)
    }

    pub fn truncate(&self, length: usize) -> FsResult<()> {
        self.page_cache().resize(length)?;
        self.mtime.store(now(), Ordering::Relaxed);
        Ok(())
    }

    pub fn stat(&self) -> FileStat {
        FileStat {
            ino: self.ino,
            format: self.format,
            perm: self.perm(),
            size: self.size(),
            uid: self.uid.load(Ordering::Relaxed),
            gid: self.gid.load(Ordering::Relaxed),
            nlink: self.nlink(),
            accessed: self.atime.load(Ordering::Relaxed),
            modified: self.mtime.load(Ordering::Relaxed),
            created: self.ctime.load(Ordering::Relaxed),
        }
    }
}

impl CacheBackend for Inode {
    fn fill_cache(&self, pgoff: usize) -> FsResult<Page> {
        let this = self.this.upgrade().ok_or(FsError::IoError)?;
        self.ops.fill_cache(&this, pgoff)
    }

    fn flush_page(&self, pgoff: usize, page: &Page) -> FsResult<()> {
        let this = self.this.upgrade().ok_or(FsError::IoError)?;
        self.ops.flush_page(&this, pgoff, page)
    }

    fn size(&self) -> usize {
        Inode::size(self)
    }

    fn set_size(&self, size: usize) {
        self.store_size(size);
    }
}

impl Drop for Inode {
    fn drop(&mut self) {
        // nlink 0 and the last reference gone: let the superblock see it off.
        if self.nlink() == 0 {
            if let Some(sb) = self.sb.upgrade() {
                let _ = sb.ops.drop_inode(self);
            }
        }
    }
}

impl core::fmt::Debug for Inode {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Inode(ino={}, {:?})", self.ino, self.format)
    }
}
