pub mod dentry;
pub mod file;
pub mod inode;
pub mod mount;

use alloc::collections::btree_map::BTreeMap;
use bitflags::bitflags;
use spin::{Mutex, Once};

use crate::io::{Buffer, ByteBuffer};
use crate::kernel::constants::{
    EACCES, EBADF, EBUSY, EEXIST, EINVAL, EIO, EISDIR, ELOOP, ENAMETOOLONG, ENOENT, ENOMEM,
    ENOTDIR, ENOTEMPTY, ENOTSUP, EROFS, ETXTBSY, PATH_MAX,
};
use crate::path::Path;
use crate::prelude::*;

use dentry::{dentry_unref, Dentry, ResolveFlags};
use file::{File, OpenFlags};
use inode::{FileStat, Format, Inode};
use mount::MountTable;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    Exists,
    IsDir,
    NotDir,
    NameTooLong,
    LoopTooDeep,
    IoError,
    ReadOnly,
    NotSupported,
    Busy,
    InvalidArgument,
    PermissionDenied,
    BadHandle,
    TextBusy,
    OutOfMemory,
    NotEmpty,
}

impl FsError {
    pub fn errno(self) -> u32 {
        match self {
            FsError::NotFound => ENOENT,
            FsError::Exists => EEXIST,
            FsError::IsDir => EISDIR,
            FsError::NotDir => ENOTDIR,
            FsError::NameTooLong => ENAMETOOLONG,
            FsError::LoopTooDeep => ELOOP,
            FsError::IoError => EIO,
            FsError::ReadOnly => EROFS,
            FsError::NotSupported => ENOTSUP,
            FsError::Busy => EBUSY,
            FsError::InvalidArgument => EINVAL,
            FsError::PermissionDenied => EACCES,
            FsError::BadHandle => EBADF,
            FsError::TextBusy => ETXTBSY,
            FsError::OutOfMemory => ENOMEM,
            FsError::NotEmpty => ENOTEMPTY,
        }
    }
}

pub type FsResult<T> = Result<T, FsError>;

/// A mountable filesystem type, registered by name.
pub trait Filesystem: Send + Sync {
    fn name(&self) -> &str;

    /// Create a superblock for `device` and return it with its root dentry.
    /// The root dentry carries no name.
    fn mount(&self, device: &str, options: &str) -> FsResult<(Arc<Superblock>, Arc<Dentry>)>;

    fn unmount(&self, _root: &Arc<Dentry>) -> FsResult<()> {
        Ok(())
    }
}

pub trait SuperblockOps: Send + Sync {
    /// The inode has zero links and its last reference is going away.
    fn drop_inode(&self, _inode: &Inode) -> FsResult<()> {
        Ok(())
    }

    /// Flush the inode's metadata to the backing store.
    fn sync_inode(&self, _inode: &Inode) -> FsResult<()> {
        Ok(())
    }
}

/// One mounted filesystem instance.
pub struct Superblock {
    pub fs_name: &'static str,
    pub readonly: bool,
    pub ops: Box<dyn SuperblockOps>,
    root: Once<Weak<Dentry>>,
}

impl Superblock {
    pub fn new(fs_name: &'static str, readonly: bool, ops: Box<dyn SuperblockOps>) -> Arc<Self> {
        Arc::new(Self {
            fs_name,
            readonly,
            ops,
            root: Once::new(),
        })
    }

    pub(crate) fn set_root(&self, root: &Arc<Dentry>) {
        self.root.call_once(|| Arc::downgrade(root));
    }

    pub fn root(&self) -> Option<Arc<Dentry>> {
        self.root.get().and_then(Weak::upgrade)
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct StatFlags: u32 {
        /// Stat the handle itself; the path is ignored.
        const STAT_FILE = 1 << 0;
        const NOFOLLOW = 1 << 1;
    }
}

/// The filesystem view of a process: root, working directory, mount table,
/// and the registry of mountable filesystems. The root is write-once after
/// the first mount.
pub struct FsContext {
    pub mounts: MountTable,
    root: Once<Arc<Dentry>>,
    cwd: Mutex<Option<Arc<Dentry>>>,
    filesystems: Mutex<BTreeMap<String, Arc<dyn Filesystem>>>,
}

impl FsContext {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mounts: MountTable::new(),
            root: Once::new(),
            cwd: Mutex::new(None),
            filesystems: Mutex::new(BTreeMap::new()),
        })
    }

    pub fn register_filesystem(&self, fs: Arc<dyn Filesystem>) -> FsResult<()> {
        let mut registry = self.filesystems.lock();
        let name = String::from(fs.name());
        if registry.contains_key(&name) {
            return Err(FsError::Exists);
        }
        registry.insert(name, fs);
        Ok(())
    }

    fn find_filesystem(&self, name: &str) -> FsResult<Arc<dyn Filesystem>> {
        self.filesystems
            .lock()
            .get(name)
            .cloned()
            .ok_or(FsError::NotSupported)
    }

    pub fn root(&self) -> FsResult<Arc<Dentry>> {
        self.root.get().cloned().ok_or(FsError::NotFound)
    }

    pub fn cwd(&self) -> FsResult<Arc<Dentry>> {
        if let Some(cwd) = self.cwd.lock().clone() {
            return Ok(cwd);
        }
        self.root()
    }
}

fn base_dentry(ctx: &FsContext, at: Option<&Arc<File>>, path: &Path) -> FsResult<Arc<Dentry>> {
    if path.is_absolute() {
        return ctx.root();
    }
    match at {
        Some(file) => Ok(file.dentry().clone()),
        None => ctx.cwd(),
    }
}

/// Mount `fstype` at `path`. Mounting at `/` establishes the root
/// filesystem; the root dentry then is its own mountpoint.
pub fn vfs_mount(
    ctx: &Arc<FsContext>,
    device: &str,
    path: &[u8],
    fstype: &str,
    options: &str,
) -> FsResult<()> {
    let fs = ctx.find_filesystem(fstype)?;

    if path == b"/" {
        if ctx.root.get().is_some() {
            log::warn!("root filesystem is already mounted");
            return Err(FsError::Busy);
        }

        let (sb, root) = fs.mount(device, options)?;
        assert!(root.name().is_empty(), "mounted root carries a name");
        sb.set_root(&root);

        ctx.mounts.mount(&root, &root, &sb, &fs)?;
        ctx.root.call_once(|| {
            dentry::dentry_ref(&root);
            root.clone()
        });
        return Ok(());
    }

    let path = Path::new(path)?;
    let base = base_dentry(ctx, None, path)?;
    let mountpoint = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST,
    )?;

    if mountpoint.is_mountpoint() {
        // No overlay mounts.
        dentry_unref(ctx, &mountpoint);
        return Err(FsError::NotSupported);
    }

    let (sb, root) = fs.mount(device, options)?;
    assert!(root.name().is_empty(), "mounted root carries a name");
    sb.set_root(&root);

    // The mountpoint keeps the resolver's reference for the lifetime of the
    // mount; the mounted root's parent is wired past the mountpoint.
    ctx.mounts.mount(&mountpoint, &root, &sb, &fs)
}

pub fn vfs_unmount(ctx: &Arc<FsContext>, path: &[u8]) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, None, path)?;
    let mounted_root = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST,
    )?;

    // One reference from the mount itself, one from this resolve.
    if mounted_root.refcount() != 2 {
        log::warn!(
            "unmount: {} references still held on {:?}",
            mounted_root.refcount(),
            mounted_root
        );
        dentry_unref(ctx, &mounted_root);
        return Err(FsError::Busy);
    }

    dentry_unref(ctx, &mounted_root);

    let mount = ctx.mounts.unmount(&mounted_root)?;
    mount.fs.unmount(&mounted_root)?;
    dentry::dentry_unref_one(&mounted_root);

    // Release the resolver reference the mountpoint kept since the mount.
    if !Arc::ptr_eq(&mount.mountpoint, &mounted_root) {
        dentry_unref(ctx, &mount.mountpoint);
    }
    Ok(())
}

pub fn vfs_openat(
    ctx: &Arc<FsContext>,
    at: Option<&Arc<File>>,
    path: &[u8],
    flags: OpenFlags,
) -> FsResult<Arc<File>> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, at, path)?;

    let mut resolve_flags = ResolveFlags::EXPECT_FILE;
    if flags.contains(OpenFlags::DIRECTORY) {
        resolve_flags |= ResolveFlags::EXPECT_DIR;
    }
    if flags.contains(OpenFlags::NOFOLLOW) {
        resolve_flags |= ResolveFlags::NOFOLLOW;
    }
    resolve_flags |= ResolveFlags::EXPECT_EXIST;
    if flags.contains(OpenFlags::CREATE) {
        resolve_flags |= ResolveFlags::EXPECT_NONEXIST;
    }

    let dentry = dentry::dentry_resolve(ctx, &base, path, resolve_flags)?;

    let mut created = false;
    if dentry.inode_opt().is_none() {
        // Negative dentry under OpenFlags::CREATE.
        let parent = dentry.parent().ok_or(FsError::NotFound)?;
        let parent_inode = parent.inode()?;
        match parent_inode.ops().create(&parent_inode, &dentry, 0o666) {
            Ok(()) => created = true,
            Err(FsError::NotSupported) => {
                dentry_unref(ctx, &dentry);
                return Err(FsError::ReadOnly);
            }
            Err(err) => {
                dentry_unref(ctx, &dentry);
                return Err(err);
            }
        }
    }

    let inode = dentry.inode()?;

    if flags.contains(OpenFlags::WRITE) {
        let readonly = dentry
            .superblock()
            .map_or(false, |sb| sb.readonly);
        if readonly || inode.format == Format::Directory {
            dentry_unref(ctx, &dentry);
            return Err(if readonly { FsError::ReadOnly } else { FsError::IsDir });
        }
    }

    if flags.contains(OpenFlags::EXECUTE) && inode.perm() & 0o111 == 0 {
        dentry_unref(ctx, &dentry);
        return Err(FsError::PermissionDenied);
    }

    match File::open(ctx.clone(), dentry.clone(), flags, created) {
        Ok(file) => Ok(file),
        Err(err) => {
            dentry_unref(ctx, &dentry);
            Err(err)
        }
    }
}

pub fn vfs_fstatat(
    ctx: &Arc<FsContext>,
    at: Option<&Arc<File>>,
    path: &[u8],
    flags: StatFlags,
) -> FsResult<FileStat> {
    if flags.contains(StatFlags::STAT_FILE) {
        let file = at.ok_or(FsError::BadHandle)?;
        return Ok(file.inode().stat());
    }

    let path = Path::new(path)?;
    let base = base_dentry(ctx, at, path)?;

    let mut resolve_flags =
        ResolveFlags::EXPECT_FILE | ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST;
    if flags.contains(StatFlags::NOFOLLOW) {
        resolve_flags |= ResolveFlags::NOFOLLOW;
    }

    let dentry = dentry::dentry_resolve(ctx, &base, path, resolve_flags)?;
    let stat = dentry.inode()?.stat();
    dentry_unref(ctx, &dentry);
    Ok(stat)
}

pub fn vfs_readlinkat(
    ctx: &Arc<FsContext>,
    at: Option<&Arc<File>>,
    path: &[u8],
    buf: &mut [u8],
) -> FsResult<usize> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, at, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_FILE | ResolveFlags::EXPECT_EXIST | ResolveFlags::NOFOLLOW,
    )?;

    let inode = dentry.inode()?;
    if inode.format != Format::Symlink {
        dentry_unref(ctx, &dentry);
        return Err(FsError::InvalidArgument);
    }

    let mut buffer = ByteBuffer::new(buf);
    let result = inode.ops().readlink(&inode, &mut buffer);
    dentry_unref(ctx, &dentry);

    let len = result?;
    if len >= buffer.total() {
        return Err(FsError::NameTooLong);
    }
    Ok(len)
}

pub fn vfs_symlink(ctx: &Arc<FsContext>, path: &[u8], target: &[u8]) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, None, path)?;

    let dentry = dentry::dentry_resolve(ctx, &base, path, ResolveFlags::EXPECT_NONEXIST)?;
    let parent = dentry.parent().ok_or(FsError::NotFound)?;
    let parent_inode = parent.inode()?;

    let result = parent_inode.ops().symlink(&parent_inode, &dentry, target);
    dentry_unref(ctx, &dentry);
    result
}

pub fn vfs_mkdir(ctx: &Arc<FsContext>, path: &[u8]) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, None, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_NONEXIST | ResolveFlags::EXPECT_DIR,
    )?;
    let parent = dentry.parent().ok_or(FsError::NotFound)?;
    let parent_inode = parent.inode()?;

    let result = parent_inode
        .ops()
        .mkdir(&parent_inode, &dentry, parent_inode.perm());
    dentry_unref(ctx, &dentry);
    result
}

pub fn vfs_rmdir(ctx: &Arc<FsContext>, path: &[u8]) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, None, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST,
    )?;

    if dentry.is_mountpoint() {
        dentry_unref(ctx, &dentry);
        return Err(FsError::Busy);
    }

    let parent = dentry.parent().ok_or(FsError::NotFound)?;
    let parent_inode = parent.inode()?;

    let result = parent_inode.ops().rmdir(&parent_inode, &dentry);
    dentry_unref(ctx, &dentry);
    result
}

pub fn vfs_unlinkat(ctx: &Arc<FsContext>, at: Option<&Arc<File>>, path: &[u8]) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, at, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_FILE | ResolveFlags::EXPECT_EXIST | ResolveFlags::NOFOLLOW,
    )?;

    let parent = dentry.parent().ok_or(FsError::NotFound)?;
    let parent_inode = parent.inode()?;

    if let Err(err) = parent_inode.ops().unlink(&parent_inode, &dentry) {
        dentry_unref(ctx, &dentry);
        return Err(err);
    }

    // The name is gone; open files and mappings keep the inode alive.
    dentry_unref(ctx, &dentry);
    dentry.detach();
    dentry::dentry_try_release(&dentry);
    Ok(())
}

pub fn vfs_chdirat(ctx: &Arc<FsContext>, at: Option<&Arc<File>>, path: &[u8]) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, at, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST,
    )?;

    let old = ctx.cwd.lock().replace(dentry);
    if let Some(old) = old {
        dentry_unref(ctx, &old);
    }
    Ok(())
}

pub fn vfs_getcwd(ctx: &Arc<FsContext>, buf: &mut [u8]) -> FsResult<usize> {
    let cwd = ctx.cwd()?;
    dentry::dentry_path(ctx, &cwd, buf)
}

pub fn vfs_fchmodat(
    ctx: &Arc<FsContext>,
    at: Option<&Arc<File>>,
    path: &[u8],
    perm: u32,
) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, at, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_FILE | ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST,
    )?;

    let result = dentry.inode().map(|inode| inode.set_perm(perm & 0o7777));
    dentry_unref(ctx, &dentry);
    result
}

pub fn vfs_fsync(file: &Arc<File>) -> FsResult<()> {
    file.fsync()
}

pub fn vfs_truncate(ctx: &Arc<FsContext>, path: &[u8], length: usize) -> FsResult<()> {
    let path = Path::new(path)?;
    let base = base_dentry(ctx, None, path)?;

    let dentry = dentry::dentry_resolve(
        ctx,
        &base,
        path,
        ResolveFlags::EXPECT_FILE | ResolveFlags::EXPECT_EXIST,
    )?;

    let result = (|| {
        let inode = dentry.inode()?;
        if inode.format != Format::Regular {
            return Err(FsError::InvalidArgument);
        }
        if dentry.superblock().map_or(false, |sb| sb.readonly) {
            return Err(FsError::ReadOnly);
        }
        inode.truncate(length)
    })();

    dentry_unref(ctx, &dentry);
    result
}

/// Stream directory entries into `buf` in the packed record format
/// `{ino: u64, off: i64, reclen: u16, type: u8, name, NUL}`.
pub fn vfs_list_dir(file: &Arc<File>, buf: &mut [u8]) -> FsResult<usize> {
    file.list_dir(buf)
}

/// Longest symlink target the resolver accepts; a target of exactly this
/// length reports `NameTooLong`.
pub(crate) const SYMLINK_SCRATCH: usize = PATH_MAX;
