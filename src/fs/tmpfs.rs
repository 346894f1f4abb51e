//! Ram-backed filesystem. Directory structure lives in the dentry tree,
//! file contents live in the per-inode page cache, so nothing is ever
//! flushed anywhere.

use core::sync::atomic::{AtomicU64, Ordering};

use crate::io::Buffer;
use crate::kernel::mem::{Page, PageExcl};
use crate::kernel::vfs::dentry::Dentry;
use crate::kernel::vfs::inode::{DevId, Format, Ino, Inode, InodeOps};
use crate::kernel::vfs::{
    Filesystem, FsContext, FsError, FsResult, Superblock, SuperblockOps,
};
use crate::prelude::*;

struct TmpFsState {
    next_ino: AtomicU64,
    readonly: bool,
}

impl TmpFsState {
    fn assign_ino(&self) -> Ino {
        self.next_ino.fetch_add(1, Ordering::AcqRel)
    }

    fn write_check(&self) -> FsResult<()> {
        if self.readonly {
            Err(FsError::ReadOnly)
        } else {
            Ok(())
        }
    }
}

struct TmpFsSuper;

impl SuperblockOps for TmpFsSuper {}

struct DirOps {
    state: Arc<TmpFsState>,
}

impl DirOps {
    fn superblock(dir: &Arc<Inode>) -> FsResult<Arc<Superblock>> {
        dir.superblock().ok_or(FsError::IoError)
    }

    fn link_new(dir: &Arc<Inode>, at: &Arc<Dentry>, inode: Arc<Inode>) {
        dir.store_size(dir.size() + 1);
        at.attach(inode);
    }
}

impl InodeOps for DirOps {
    fn lookup(&self, _dir: &Arc<Inode>, _child: &Arc<Dentry>) -> FsResult<bool> {
        // The dentry tree is the directory store; a cache miss is a miss.
        Ok(false)
    }

    fn create(&self, dir: &Arc<Inode>, at: &Arc<Dentry>, perm: u32) -> FsResult<()> {
        self.state.write_check()?;
        let sb = Self::superblock(dir)?;

        let inode = Inode::new(
            &sb,
            self.state.assign_ino(),
            Format::Regular,
            perm & 0o777,
            Box::new(FileOps),
        );

        Self::link_new(dir, at, inode);
        Ok(())
    }

    fn mkdir(&self, dir: &Arc<Inode>, at: &Arc<Dentry>, perm: u32) -> FsResult<()> {
        self.state.write_check()?;
        let sb = Self::superblock(dir)?;

        let inode = Inode::new(
            &sb,
            self.state.assign_ino(),
            Format::Directory,
            perm & 0o777,
            Box::new(DirOps {
                state: self.state.clone(),
            }),
        );

        Self::link_new(dir, at, inode);
        Ok(())
    }

    fn symlink(&self, dir: &Arc<Inode>, at: &Arc<Dentry>, target: &[u8]) -> FsResult<()> {
        self.state.write_check()?;
        let sb = Self::superblock(dir)?;

        let inode = Inode::new(
            &sb,
            self.state.assign_ino(),
            Format::Symlink,
            0o777,
            Box::new(SymlinkOps {
                target: Box::from(target),
            }),
        );
        inode.store_size(target.len());

        Self::link_new(dir, at, inode);
        Ok(())
    }

    fn mknod(
        &self,
        dir: &Arc<Inode>,
        at: &Arc<Dentry>,
        format: Format,
        perm: u32,
        dev: DevId,
    ) -> FsResult<()> {
        self.state.write_check()?;
        if !matches!(format, Format::CharDevice | Format::BlockDevice | Format::Fifo) {
            return Err(FsError::InvalidArgument);
        }
        let sb = Self::superblock(dir)?;

        let inode = Inode::new(
            &sb,
            self.state.assign_ino(),
            format,
            perm & 0o777,
            Box::new(NodeOps { dev }),
        );

        Self::link_new(dir, at, inode);
        Ok(())
    }

    fn hardlink(
        &self,
        dir: &Arc<Inode>,
        at: &Arc<Dentry>,
        existing: &Arc<Dentry>,
    ) -> FsResult<()> {
        self.state.write_check()?;
        let inode = existing.inode()?;
        if inode.format == Format::Directory {
            return Err(FsError::IsDir);
        }

        inode.inc_nlink();
        dir.store_size(dir.size() + 1);
        at.attach(inode);
        Ok(())
    }

    fn unlink(&self, dir: &Arc<Inode>, at: &Arc<Dentry>) -> FsResult<()> {
        self.state.write_check()?;

        let inode = at.inode()?;
        if inode.format == Format::Directory {
            return Err(FsError::IsDir);
        }

        inode.dec_nlink();
        dir.store_size(dir.size() - 1);

        // Later lookups must miss immediately; the inode itself stays
        // around for open files and mappings.
        if let Some(parent) = at.parent() {
            parent.remove_child(at.name());
        }
        Ok(())
    }

    fn rmdir(&self, dir: &Arc<Inode>, at: &Arc<Dentry>) -> FsResult<()> {
        self.state.write_check()?;

        let inode = at.inode()?;
        if inode.format != Format::Directory {
            return Err(FsError::NotDir);
        }

        let mut live_children = 0;
        at.for_each_child(&mut |_, _| live_children += 1);
        if live_children != 0 {
            return Err(FsError::NotEmpty);
        }

        inode.dec_nlink();
        dir.store_size(dir.size() - 1);

        at.detach();
        if let Some(parent) = at.parent() {
            parent.remove_child(at.name());
        }
        Ok(())
    }
}

struct FileOps;

impl InodeOps for FileOps {
    /// File data lives in the page cache itself; a missing page simply
    /// reads as zeroes.
    fn fill_cache(&self, _inode: &Arc<Inode>, _pgoff: usize) -> FsResult<Page> {
        Ok(PageExcl::zeroed().into_page())
    }
}

struct SymlinkOps {
    target: Box<[u8]>,
}

impl InodeOps for SymlinkOps {
    fn readlink(&self, _inode: &Arc<Inode>, buffer: &mut dyn Buffer) -> FsResult<usize> {
        buffer.fill(&self.target).map(|result| result.allow_partial())
    }
}

struct NodeOps {
    dev: DevId,
}

impl InodeOps for NodeOps {
    fn devid(&self) -> FsResult<DevId> {
        Ok(self.dev)
    }
}

pub struct TmpFs;

impl Filesystem for TmpFs {
    fn name(&self) -> &str {
        "tmpfs"
    }

    fn mount(&self, _device: &str, options: &str) -> FsResult<(Arc<Superblock>, Arc<Dentry>)> {
        let readonly = options.split(',').any(|opt| opt == "ro");

        let state = Arc::new(TmpFsState {
            next_ino: AtomicU64::new(1),
            readonly,
        });

        let sb = Superblock::new("tmpfs", readonly, Box::new(TmpFsSuper));
        let root = Dentry::new_root(&sb);

        let root_inode = Inode::new(
            &sb,
            state.assign_ino(),
            Format::Directory,
            0o755,
            Box::new(DirOps { state }),
        );
        root.attach(root_inode);

        Ok((sb, root))
    }
}

pub fn register(ctx: &FsContext) -> FsResult<()> {
    ctx.register_filesystem(Arc::new(TmpFs))
}
