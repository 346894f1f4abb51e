use alloc::collections::btree_map::BTreeMap;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::inode::{Format, Inode};
use super::{FsContext, FsError, FsResult, Superblock, SYMLINK_SCRATCH};
use crate::io::ByteBuffer;
use crate::kernel::constants::SYMLINK_MAX_DEPTH;
use crate::path::{Path, PathComponent};
use crate::prelude::*;

/// A name node in the path tree. May be positive (bound to an inode) or
/// negative (a cached miss). The parent owns its children; the parent link
/// is a non-owning back-reference.
///
/// The refcount counts each live path through the dentry, plus one per
/// direct open, plus one per mount. A dentry with refcount zero, no inode
/// and no children is released from its parent.
pub struct Dentry {
    name: Box<[u8]>,
    parent: Mutex<Weak<Dentry>>,
    children: Mutex<BTreeMap<Box<[u8]>, Arc<Dentry>>>,
    inode: Mutex<Option<Arc<Inode>>>,
    sb: Mutex<Weak<Superblock>>,
    is_mountpoint: AtomicBool,
    refcount: AtomicUsize,
}

impl Dentry {
    /// The root of a (to be) mounted filesystem: no name, no parent.
    pub fn new_root(sb: &Arc<Superblock>) -> Arc<Self> {
        Arc::new(Self {
            name: Box::from(&b""[..]),
            parent: Mutex::new(Weak::new()),
            children: Mutex::new(BTreeMap::new()),
            inode: Mutex::new(None),
            sb: Mutex::new(Arc::downgrade(sb)),
            is_mountpoint: AtomicBool::new(false),
            refcount: AtomicUsize::new(0),
        })
    }

    /// A (negative) child of `parent`, cached in its children list.
    pub fn create(parent: &Arc<Dentry>, name: &[u8]) -> Arc<Self> {
        let dentry = Arc::new(Self {
            name: Box::from(name),
            parent: Mutex::new(Arc::downgrade(parent)),
            children: Mutex::new(BTreeMap::new()),
            inode: Mutex::new(None),
            sb: Mutex::new(parent.sb.lock().clone()),
            is_mountpoint: AtomicBool::new(false),
            refcount: AtomicUsize::new(0),
        });

        parent
            .children
            .lock()
            .insert(Box::from(name), dentry.clone());
        dentry
    }

    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn parent(&self) -> Option<Arc<Dentry>> {
        self.parent.lock().upgrade()
    }

    pub(crate) fn set_parent(&self, parent: &Arc<Dentry>) {
        *self.parent.lock() = Arc::downgrade(parent);
    }

    pub fn superblock(&self) -> Option<Arc<Superblock>> {
        self.sb.lock().upgrade()
    }

    pub fn inode(&self) -> FsResult<Arc<Inode>> {
        self.inode.lock().clone().ok_or(FsError::NotFound)
    }

    pub fn inode_opt(&self) -> Option<Arc<Inode>> {
        self.inode.lock().clone()
    }

    /// Bind an inode; turns a negative dentry positive.
    pub fn attach(&self, inode: Arc<Inode>) {
        let old = self.inode.lock().replace(inode);
        assert!(old.is_none(), "reattaching an inode to a dentry");
    }

    pub fn detach(&self) {
        self.inode.lock().take();
    }

    pub fn is_directory(&self) -> bool {
        self.inode_opt()
            .map_or(false, |inode| inode.format == Format::Directory)
    }

    pub fn is_symlink(&self) -> bool {
        self.inode_opt()
            .map_or(false, |inode| inode.format == Format::Symlink)
    }

    pub fn is_mountpoint(&self) -> bool {
        self.is_mountpoint.load(Ordering::Acquire)
    }

    pub(crate) fn set_mountpoint(&self, value: bool) {
        self.is_mountpoint.store(value, Ordering::Release);
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::Acquire)
    }

    fn ref_raw(&self) {
        self.refcount.fetch_add(1, Ordering::AcqRel);
    }

    pub fn children_count(&self) -> usize {
        self.children.lock().len()
    }

    pub(crate) fn get_child(&self, name: &[u8]) -> Option<Arc<Dentry>> {
        self.children.lock().get(name).cloned()
    }

    pub(crate) fn remove_child(&self, name: &[u8]) {
        self.children.lock().remove(name);
    }

    /// Visit the positive children; the default directory iteration.
    pub fn for_each_child(&self, f: &mut dyn FnMut(&[u8], &Arc<Inode>)) {
        for (name, child) in self.children.lock().iter() {
            if let Some(inode) = child.inode_opt() {
                f(name, &inode);
            }
        }
    }
}

impl core::fmt::Debug for Dentry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Dentry")
            .field("name", &String::from_utf8_lossy(&self.name))
            .field("refcount", &self.refcount())
            .finish()
    }
}

bitflags! {
    /// Last-segment policy for [`dentry_resolve`].
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct ResolveFlags: u32 {
        const EXPECT_FILE = 1 << 0;
        const EXPECT_DIR = 1 << 1;
        /// Do not follow a symlink in the last segment.
        const NOFOLLOW = 1 << 2;
        const EXPECT_EXIST = 1 << 3;
        const EXPECT_NONEXIST = 1 << 4;
    }
}

/// Take a reference on a positive dentry.
pub fn dentry_ref(dentry: &Arc<Dentry>) -> Arc<Dentry> {
    dentry.ref_raw();
    dentry.clone()
}

/// Reference the chain from `dentry` up to (and including) the context
/// root, crossing into the mountpoint wherever an empty-named mount root is
/// traversed.
pub fn dentry_ref_up_to(ctx: &FsContext, dentry: &Arc<Dentry>, root: &Arc<Dentry>) -> Arc<Dentry> {
    let mut cur = dentry.clone();
    loop {
        cur.ref_raw();
        if Arc::ptr_eq(&cur, root) {
            break;
        }

        if cur.name().is_empty() {
            match ctx.mounts.mountpoint_of_root(&cur) {
                Some(mountpoint) if !Arc::ptr_eq(&mountpoint, &cur) => {
                    cur = mountpoint;
                    continue;
                }
                _ => break,
            }
        }

        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }
    dentry.clone()
}

/// Drop one reference on each dentry in the chain from `dentry` up to the
/// root, mirroring [`dentry_ref_up_to`], and release whatever has become
/// unused. The walk is iterative.
pub fn dentry_unref(ctx: &FsContext, dentry: &Arc<Dentry>) {
    let Ok(root) = ctx.root() else {
        dentry_unref_one(dentry);
        return;
    };

    let mut cur = dentry.clone();
    loop {
        dentry_unref_one(&cur);
        if Arc::ptr_eq(&cur, &root) {
            break;
        }

        if cur.name().is_empty() {
            match ctx.mounts.mountpoint_of_root(&cur) {
                Some(mountpoint) if !Arc::ptr_eq(&mountpoint, &cur) => {
                    cur = mountpoint;
                    continue;
                }
                _ => break,
            }
        }

        let Some(parent) = cur.parent() else { break };
        cur = parent;
    }
}

/// Drop a single reference without walking the chain.
pub fn dentry_unref_one(dentry: &Arc<Dentry>) {
    let old = dentry.refcount.fetch_sub(1, Ordering::AcqRel);
    assert!(old > 0, "dentry refcount underflow on {:?}", dentry);
    dentry_try_release(dentry);
}

/// Free a dentry that is unused, negative, and childless.
pub fn dentry_try_release(dentry: &Arc<Dentry>) {
    if dentry.refcount() == 0 && dentry.inode_opt().is_none() && dentry.children_count() == 0 {
        if let Some(parent) = dentry.parent() {
            parent.remove_child(dentry.name());
        }
    }
}

/// Find `name` under `parent`: first the in-memory children list, then the
/// filesystem's `lookup`. A negative dentry comes back without a reference
/// so callers can tell existence apart.
pub fn lookup_child(
    _ctx: &FsContext,
    parent: &Arc<Dentry>,
    name: &[u8],
) -> FsResult<Arc<Dentry>> {
    if !parent.is_directory() {
        return Err(FsError::NotDir);
    }

    let child = match parent.get_child(name) {
        Some(child) => child,
        None => Dentry::create(parent, name),
    };

    if child.inode_opt().is_some() {
        return Ok(dentry_ref(&child));
    }

    let parent_inode = parent.inode()?;
    match parent_inode.ops().lookup(&parent_inode, &child) {
        Ok(true) => Ok(dentry_ref(&child)),
        Ok(false) | Err(FsError::NotSupported) => Ok(child),
        Err(err) => {
            dentry_try_release(&child);
            Err(err)
        }
    }
}

struct Leaf {
    name: Vec<u8>,
    trailing: bool,
}

/// Substitute the mounted filesystem's root when landing on a mountpoint.
fn enter_mounts(ctx: &FsContext, child: Arc<Dentry>) -> FsResult<Arc<Dentry>> {
    if !child.is_mountpoint() {
        return Ok(child);
    }
    let mount = ctx
        .mounts
        .get_mount(&child)
        .ok_or(FsError::IoError)?;
    Ok(dentry_ref(&mount.root))
}

/// One `..` step: bounded by the context root, and jumping back through the
/// mountpoint when leaving a mounted root.
fn step_up(ctx: &FsContext, root: &Arc<Dentry>, cur: Arc<Dentry>) -> Arc<Dentry> {
    if Arc::ptr_eq(&cur, root) {
        return cur;
    }

    let mut cur = cur;
    if cur.name().is_empty() {
        if let Some(mountpoint) = ctx.mounts.mountpoint_of_root(&cur) {
            if !Arc::ptr_eq(&mountpoint, &cur) {
                dentry_unref_one(&cur);
                cur = mountpoint;
            }
        }
    }

    if Arc::ptr_eq(&cur, root) {
        return cur;
    }

    match cur.parent() {
        Some(parent) => {
            dentry_unref_one(&cur);
            parent
        }
        None => cur,
    }
}

/// Walk everything but the last segment. Returns the referenced parent and
/// the last segment (`None` when the path is `/` or only dots).
fn resolve_to_parent(
    ctx: &FsContext,
    base: &Arc<Dentry>,
    root: &Arc<Dentry>,
    path: &Path,
    nrecur: u32,
) -> FsResult<(Arc<Dentry>, Option<Leaf>)> {
    let start = if path.is_absolute() {
        root.clone()
    } else {
        base.clone()
    };
    let start = enter_mounts_noref(ctx, start)?;
    let mut cur = dentry_ref_up_to(ctx, &start, root);

    let parts: Vec<PathComponent> = path
        .iter()
        .filter(|part| !matches!(part, PathComponent::TrailingEmpty))
        .collect();

    if parts.is_empty() {
        return Ok((cur, None));
    }

    for part in &parts[..parts.len() - 1] {
        match part {
            PathComponent::TrailingEmpty => unreachable!(),
            PathComponent::Current => {}
            PathComponent::Parent => cur = step_up(ctx, root, cur),
            PathComponent::Name(name) => {
                let child = match lookup_child(ctx, &cur, *name) {
                    Ok(child) => child,
                    Err(err) => {
                        dentry_unref(ctx, &cur);
                        return Err(err);
                    }
                };

                if child.inode_opt().is_none() {
                    dentry_try_release(&child);
                    dentry_unref(ctx, &cur);
                    return Err(FsError::NotFound);
                }

                let child = match enter_mounts(ctx, child) {
                    Ok(child) => child,
                    Err(err) => {
                        dentry_unref(ctx, &cur);
                        return Err(err);
                    }
                };
                cur = child;

                if cur.is_symlink() {
                    let real = follow_symlink(
                        ctx,
                        &cur,
                        root,
                        ResolveFlags::EXPECT_DIR | ResolveFlags::EXPECT_EXIST,
                        nrecur + 1,
                    );
                    dentry_unref(ctx, &cur);
                    match real {
                        Ok(real) => cur = real,
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    let leaf = match parts.last().unwrap() {
        PathComponent::Current => Leaf {
            name: b".".to_vec(),
            trailing: path.trailing_slash(),
        },
        PathComponent::Parent => Leaf {
            name: b"..".to_vec(),
            trailing: path.trailing_slash(),
        },
        PathComponent::Name(name) => Leaf {
            name: name.to_vec(),
            trailing: path.trailing_slash(),
        },
        PathComponent::TrailingEmpty => unreachable!(),
    };

    Ok((cur, Some(leaf)))
}

/// Like [`enter_mounts`] but for the walk's starting point, which is not
/// separately referenced yet.
fn enter_mounts_noref(ctx: &FsContext, start: Arc<Dentry>) -> FsResult<Arc<Dentry>> {
    if !start.is_mountpoint() {
        return Ok(start);
    }
    let mount = ctx.mounts.get_mount(&start).ok_or(FsError::IoError)?;
    Ok(mount.root.clone())
}

fn follow_symlink(
    ctx: &FsContext,
    symlink: &Arc<Dentry>,
    root: &Arc<Dentry>,
    flags: ResolveFlags,
    nrecur: u32,
) -> FsResult<Arc<Dentry>> {
    if nrecur >= SYMLINK_MAX_DEPTH {
        return Err(FsError::LoopTooDeep);
    }

    let inode = symlink.inode()?;

    let mut scratch = [0u8; SYMLINK_SCRATCH];
    let mut buffer = ByteBuffer::new(&mut scratch);
    let len = inode.ops().readlink(&inode, &mut buffer)?;
    if len == 0 {
        return Err(FsError::NotFound);
    }
    if len >= SYMLINK_SCRATCH {
        return Err(FsError::NameTooLong);
    }

    let target = Path::new(&scratch[..len])?;
    let parent = symlink.parent().ok_or(FsError::NotFound)?;

    let (target_parent, leaf) = resolve_to_parent(ctx, &parent, root, target, nrecur)?;
    let Some(leaf) = leaf else {
        return Ok(target_parent);
    };

    let mut is_symlink = false;
    let result = resolve_lastseg(ctx, &target_parent, root, &leaf, flags, nrecur, &mut is_symlink);
    if result.is_err() || is_symlink {
        dentry_unref(ctx, &target_parent);
    }
    result
}

fn resolve_lastseg(
    ctx: &FsContext,
    parent: &Arc<Dentry>,
    root: &Arc<Dentry>,
    leaf: &Leaf,
    flags: ResolveFlags,
    nrecur: u32,
    is_symlink: &mut bool,
) -> FsResult<Arc<Dentry>> {
    *is_symlink = false;

    match leaf.name.as_slice() {
        b"." => return Ok(parent.clone()),
        b".." => return Ok(step_up(ctx, root, parent.clone())),
        _ => {}
    }

    let child = lookup_child(ctx, parent, &leaf.name)?;

    if child.inode_opt().is_none() {
        if flags.contains(ResolveFlags::EXPECT_NONEXIST) {
            child.ref_raw();
            return Ok(child);
        }
        dentry_try_release(&child);
        return Err(FsError::NotFound);
    }

    if flags.contains(ResolveFlags::EXPECT_NONEXIST) && !flags.contains(ResolveFlags::EXPECT_EXIST)
    {
        dentry_unref_one(&child);
        return Err(FsError::Exists);
    }

    if child.is_symlink() && !flags.contains(ResolveFlags::NOFOLLOW) {
        let target = follow_symlink(ctx, &child, root, flags, nrecur + 1);
        dentry_unref_one(&child);
        if target.is_ok() {
            *is_symlink = true;
        }
        return target;
    }

    if child.is_directory() {
        if !flags.contains(ResolveFlags::EXPECT_DIR) {
            dentry_unref_one(&child);
            return Err(FsError::IsDir);
        }
        return enter_mounts(ctx, child);
    }

    // A trailing slash promises a directory.
    if leaf.trailing {
        dentry_unref_one(&child);
        return Err(FsError::NotDir);
    }
    if !flags.contains(ResolveFlags::EXPECT_FILE) {
        dentry_unref_one(&child);
        return Err(FsError::NotDir);
    }

    Ok(child)
}

/// Resolve `path` from `start`, bounded by the context root. The returned
/// dentry carries a referenced chain; release it with [`dentry_unref`].
pub fn dentry_resolve(
    ctx: &FsContext,
    start: &Arc<Dentry>,
    path: &Path,
    flags: ResolveFlags,
) -> FsResult<Arc<Dentry>> {
    let root = ctx.root()?;

    let (parent, leaf) = resolve_to_parent(ctx, start, &root, path, 0)?;

    let Some(leaf) = leaf else {
        // The path was "/" (or equivalent): the parent is the answer.
        if !flags.contains(ResolveFlags::EXPECT_DIR) {
            dentry_unref(ctx, &parent);
            return Err(FsError::IsDir);
        }
        return Ok(parent);
    };

    let mut is_symlink = false;
    let result = resolve_lastseg(ctx, &parent, &root, &leaf, flags, 0, &mut is_symlink);
    if result.is_err() || is_symlink {
        dentry_unref(ctx, &parent);
    }
    result
}

/// Write the absolute path of `dentry` into `buf`, NUL-terminated.
/// Returns the number of bytes written excluding the NUL.
pub fn dentry_path(ctx: &FsContext, dentry: &Arc<Dentry>, buf: &mut [u8]) -> FsResult<usize> {
    let root = ctx.root()?;

    let mut names: Vec<Box<[u8]>> = Vec::new();
    let mut cur = dentry.clone();

    while !Arc::ptr_eq(&cur, &root) {
        if names.len() > 64 {
            return Err(FsError::LoopTooDeep);
        }

        if cur.name().is_empty() {
            match ctx.mounts.mountpoint_of_root(&cur) {
                Some(mountpoint) if !Arc::ptr_eq(&mountpoint, &cur) => {
                    cur = mountpoint;
                    continue;
                }
                _ => break,
            }
        }

        names.push(Box::from(cur.name()));
        match cur.parent() {
            Some(parent) => cur = parent,
            None => break,
        }
    }

    fn append(buf: &mut [u8], pos: &mut usize, bytes: &[u8]) -> FsResult<()> {
        if *pos + bytes.len() > buf.len() {
            return Err(FsError::NameTooLong);
        }
        buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
        *pos += bytes.len();
        Ok(())
    }

    let mut pos = 0;
    append(buf, &mut pos, b"/")?;
    for (idx, name) in names.iter().rev().enumerate() {
        if idx > 0 {
            append(buf, &mut pos, b"/")?;
        }
        append(buf, &mut pos, name)?;
    }
    let written = pos;
    append(buf, &mut pos, &[0])?;

    Ok(written)
}
