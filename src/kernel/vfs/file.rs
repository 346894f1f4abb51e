use bitflags::bitflags;
use ferrite_mm::paging::PAGE_SIZE_BITS;
use log::warn;
use spin::Mutex;

use super::dentry::{dentry_unref, Dentry};
use super::inode::{FileStat, Format, Ino, Inode};
use super::{FsContext, FsError, FsResult};
use crate::kernel::mem::{
    Fault, FaultResolution, FileMapping, VmArea, VmError, VmFlags, VmaType,
};
use crate::prelude::*;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const CREATE = 1 << 2;
        const NOFOLLOW = 1 << 3;
        const DIRECTORY = 1 << 4;
        const TRUNCATE = 1 << 5;
        const EXECUTE = 1 << 6;
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    struct IoFlags: u32 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const SEEKABLE = 1 << 2;
        const EXECUTABLE = 1 << 3;
        const MMAPABLE = 1 << 4;
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoType {
    File,
    Dir,
}

pub enum SeekOption {
    Set(usize),
    Current(isize),
    End(isize),
}

struct ListDirEntry {
    ino: Ino,
    name: Box<[u8]>,
    format: Format,
}

struct ListDirState {
    entries: Vec<ListDirEntry>,
    read_offset: usize,
}

/// An open file: a dentry, a cursor, and the io capability flags. Closing a
/// writable file flushes its cached pages and syncs the inode first.
pub struct File {
    ctx: Arc<FsContext>,
    dentry: Arc<Dentry>,
    inode: Arc<Inode>,
    kind: IoType,
    flags: IoFlags,
    offset: Mutex<usize>,
    listdir: Mutex<Option<ListDirState>>,
}

impl File {
    /// Build the io object for an already-resolved, referenced dentry.
    /// Takes over the caller's dentry reference.
    pub(super) fn open(
        ctx: Arc<FsContext>,
        dentry: Arc<Dentry>,
        flags: OpenFlags,
        _created: bool,
    ) -> FsResult<Arc<File>> {
        let inode = dentry.inode()?;

        let mut io_flags = IoFlags::SEEKABLE;
        if flags.contains(OpenFlags::READ) {
            io_flags |= IoFlags::READABLE;
        }
        if flags.contains(OpenFlags::WRITE) {
            io_flags |= IoFlags::WRITABLE;
        }
        if flags.contains(OpenFlags::EXECUTE) {
            io_flags |= IoFlags::EXECUTABLE;
        }
        // Only regular files can be mapped.
        if inode.format == Format::Regular {
            io_flags |= IoFlags::MMAPABLE;
        }

        let kind = if inode.format == Format::Directory {
            io_flags |= IoFlags::READABLE;
            io_flags -= IoFlags::SEEKABLE;
            IoType::Dir
        } else {
            IoType::File
        };

        if flags.contains(OpenFlags::DIRECTORY) && kind != IoType::Dir {
            return Err(FsError::NotDir);
        }

        // Do this before constructing the handle: open errors leave the
        // caller owning the dentry reference.
        if flags.contains(OpenFlags::TRUNCATE) && flags.contains(OpenFlags::WRITE) {
            inode.truncate(0)?;
        }

        Ok(Arc::new(File {
            ctx,
            dentry,
            inode,
            kind,
            flags: io_flags,
            offset: Mutex::new(0),
            listdir: Mutex::new(None),
        }))
    }

    pub fn dentry(&self) -> &Arc<Dentry> {
        &self.dentry
    }

    pub fn inode(&self) -> &Arc<Inode> {
        &self.inode
    }

    pub fn kind(&self) -> IoType {
        self.kind
    }

    pub fn readable(&self) -> bool {
        self.flags.contains(IoFlags::READABLE)
    }

    pub fn writable(&self) -> bool {
        self.flags.contains(IoFlags::WRITABLE)
    }

    pub fn mmapable(&self) -> bool {
        self.flags.contains(IoFlags::MMAPABLE)
    }

    fn io_check(&self, format_io: IoFlags) -> FsResult<()> {
        if !self.flags.contains(format_io) {
            return Err(FsError::BadHandle);
        }
        Ok(())
    }

    /// Read at the cursor, advancing it.
    pub fn read(&self, buf: &mut [u8]) -> FsResult<usize> {
        self.io_check(IoFlags::READABLE)?;
        if self.kind == IoType::Dir {
            return Err(FsError::IsDir);
        }

        let mut offset = self.offset.lock();
        let n = self.inode.read(buf, *offset)?;
        *offset += n;
        Ok(n)
    }

    /// Write at the cursor, advancing it.
    pub fn write(&self, data: &[u8]) -> FsResult<usize> {
        self.io_check(IoFlags::WRITABLE)?;
        if self.kind == IoType::Dir {
            return Err(FsError::IsDir);
        }

        let mut offset = self.offset.lock();
        let n = self.inode.write(data, *offset)?;
        *offset += n;
        Ok(n)
    }

    pub fn read_at(&self, buf: &mut [u8], offset: usize) -> FsResult<usize> {
        self.io_check(IoFlags::READABLE)?;
        if self.kind == IoType::Dir {
            return Err(FsError::IsDir);
        }
        self.inode.read(buf, offset)
    }

    pub fn write_at(&self, data: &[u8], offset: usize) -> FsResult<usize> {
        self.io_check(IoFlags::WRITABLE)?;
        if self.kind == IoType::Dir {
            return Err(FsError::IsDir);
        }
        self.inode.write(data, offset)
    }

    pub fn seek(&self, option: SeekOption) -> FsResult<usize> {
        self.io_check(IoFlags::SEEKABLE)?;

        let mut offset = self.offset.lock();
        let new = match option {
            SeekOption::Set(pos) => pos as isize,
            SeekOption::Current(delta) => *offset as isize + delta,
            SeekOption::End(delta) => self.inode.size() as isize + delta,
        };

        if new < 0 {
            return Err(FsError::InvalidArgument);
        }
        *offset = new as usize;
        Ok(*offset)
    }

    pub fn stat(&self) -> FileStat {
        self.inode.stat()
    }

    pub fn truncate(&self, length: usize) -> FsResult<()> {
        self.io_check(IoFlags::WRITABLE)?;
        self.inode.truncate(length)
    }

    /// Flush the page cache to the backing store and sync the inode.
    pub fn fsync(&self) -> FsResult<()> {
        self.inode.page_cache().flush_or_drop_all(false)?;
        if let Some(sb) = self.inode.superblock() {
            sb.ops.sync_inode(&self.inode)?;
        }
        Ok(())
    }

    /// Produce directory entries in the packed record format
    /// `{ino: u64, off: i64, reclen: u16, type: u8, name, NUL}`. The first
    /// call snapshots the directory; later calls continue the stream.
    pub fn list_dir(&self, buf: &mut [u8]) -> FsResult<usize> {
        if self.kind != IoType::Dir {
            return Err(FsError::NotDir);
        }

        let mut state_slot = self.listdir.lock();
        if state_slot.is_none() {
            let mut entries = Vec::new();
            self.inode.ops().iterate_dir(
                &self.dentry,
                &mut |ino, name, format| {
                    entries.push(ListDirEntry {
                        ino,
                        name: Box::from(name),
                        format,
                    });
                },
            )?;
            *state_slot = Some(ListDirState {
                entries,
                read_offset: 0,
            });
        }

        let state = state_slot.as_mut().unwrap();
        let mut copied = 0;

        while state.read_offset < state.entries.len() {
            let entry = &state.entries[state.read_offset];
            let reclen = 8 + 8 + 2 + 1 + entry.name.len() + 1;
            if copied + reclen > buf.len() {
                break;
            }

            let record = &mut buf[copied..copied + reclen];
            record[0..8].copy_from_slice(&entry.ino.to_le_bytes());
            record[8..16].copy_from_slice(&(state.read_offset as i64 + 1).to_le_bytes());
            record[16..18].copy_from_slice(&(reclen as u16).to_le_bytes());
            record[18] = entry.format.dirent_type();
            record[19..19 + entry.name.len()].copy_from_slice(&entry.name);
            record[19 + entry.name.len()] = 0;

            copied += reclen;
            state.read_offset += 1;
        }

        Ok(copied)
    }

    /// Whether the file may be mapped with `prot`.
    pub fn check_mmap(&self, prot: VmFlags, shared: bool) -> Result<(), VmError> {
        if !self.mmapable() || !self.readable() {
            return Err(VmError::PermissionDenied);
        }
        if shared && prot.contains(VmFlags::WRITE) && !self.writable() {
            return Err(VmError::PermissionDenied);
        }
        Ok(())
    }

    /// `vm_protect` permission query: private writes always work (CoW);
    /// shared writes need a writable file.
    pub fn allows_protection(&self, prot: VmFlags, private: bool) -> bool {
        if prot.contains(VmFlags::WRITE) && !private {
            return self.writable();
        }
        true
    }
}

impl Drop for File {
    fn drop(&mut self) {
        if self.writable() && self.kind == IoType::File {
            // Data may be lost if the flush fails, but the close completes.
            if let Err(err) = self.inode.page_cache().flush_or_drop_all(false) {
                warn!("flush on close failed: {:?}", err);
            }
            if let Some(sb) = self.inode.superblock() {
                if let Err(err) = sb.ops.sync_inode(&self.inode) {
                    warn!("inode sync on close failed: {:?}", err);
                }
            }
        }

        dentry_unref(&self.ctx, &self.dentry);
    }
}

impl core::fmt::Debug for File {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("File")
            .field("dentry", &self.dentry)
            .field("kind", &self.kind)
            .finish()
    }
}

/// The fault handler for file-backed areas: consult the inode's page cache
/// and decide between sharing the cache frame and copying it.
pub(crate) fn file_fault_handler(
    area: &VmArea,
    mapping: &FileMapping,
    offset: usize,
    fault: &mut Fault,
) -> FaultResolution {
    use ferrite_mm::page_table::PageAttribute;

    let inode = mapping.file.inode();
    let cache = inode.page_cache();
    let pgoff = (mapping.offset + offset) >> PAGE_SIZE_BITS;

    let cache_page = match cache.get_for_read(pgoff) {
        Ok(page) => page,
        Err(err) => {
            warn!("page cache fill failed at pgoff {}: {:?}", pgoff, err);
            return FaultResolution::CannotHandle;
        }
    };

    let stat = &area.stat;
    let shared = area.vma_type == VmaType::Shared;

    if fault.present && fault.write {
        if shared {
            // The PTE lost its write bit (vm_protect); re-grant it on the
            // shared cache page.
            cache_page.set_dirty(true);
            fault.map_extra |= PageAttribute::MAPPED;
            fault.backing_page = Some(cache_page);
            return FaultResolution::MapBacking;
        }

        // Writing a CoW-shadowed page on a private mapping.
        let faulting = fault
            .faulting_page
            .as_ref()
            .expect("present fault without a faulting page");
        if faulting.pfn() == cache_page.pfn() {
            stat.pagecache.set(stat.pagecache.get() - 1);
        } else {
            stat.cow.set(stat.cow.get() - 1);
        }
        stat.regular.set(stat.regular.get() + 1);

        fault.backing_page = fault.faulting_page.clone();
        return FaultResolution::CopyBacking;
    }

    fault.backing_page = Some(cache_page.clone());

    if !shared {
        if fault.write {
            debug_assert!(!fault.present);
            stat.regular.set(stat.regular.get() + 1);
            // Copy-on-first-write.
            FaultResolution::CopyBacking
        } else {
            stat.pagecache.set(stat.pagecache.get() + 1);
            stat.cow.set(stat.cow.get() + 1);
            fault.map_extra |= PageAttribute::MAPPED | PageAttribute::COPY_ON_WRITE;
            FaultResolution::MapBackingRo
        }
    } else {
        if fault.write {
            cache_page.set_dirty(true);
        }
        stat.pagecache.set(stat.pagecache.get() + 1);
        stat.regular.set(stat.regular.get() + 1);
        fault.map_extra |= PageAttribute::MAPPED;
        FaultResolution::MapBacking
    }
}
