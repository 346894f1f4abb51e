use hashbrown::HashMap;
use spin::Mutex;

use super::dentry::{dentry_ref, Dentry};
use super::{Filesystem, FsError, FsResult, Superblock};
use crate::prelude::*;

/// One mounted tree: where it hangs, its root, and what it is.
pub struct Mount {
    pub mountpoint: Arc<Dentry>,
    pub root: Arc<Dentry>,
    pub superblock: Arc<Superblock>,
    pub fs: Arc<dyn Filesystem>,
}

/// The global mount state: a list of mounts plus a map keyed by the
/// mountpoint dentry.
pub struct MountTable {
    mounts: Mutex<Vec<Arc<Mount>>>,
    by_mountpoint: Mutex<HashMap<usize, Arc<Mount>>>,
}

fn key_of(dentry: &Arc<Dentry>) -> usize {
    Arc::as_ptr(dentry) as usize
}

impl MountTable {
    pub fn new() -> Self {
        Self {
            mounts: Mutex::new(Vec::new()),
            by_mountpoint: Mutex::new(HashMap::new()),
        }
    }

    /// Attach `root` (an unnamed dentry) at `mountpoint`. The mounted root
    /// gains a reference and its parent is wired past the mountpoint so
    /// upward traversal works.
    pub fn mount(
        &self,
        mountpoint: &Arc<Dentry>,
        root: &Arc<Dentry>,
        superblock: &Arc<Superblock>,
        fs: &Arc<dyn Filesystem>,
    ) -> FsResult<()> {
        assert!(root.name().is_empty(), "mounted root must be unnamed");

        if !Arc::ptr_eq(mountpoint, root) {
            if let Some(parent) = mountpoint.parent() {
                root.set_parent(&parent);
            }
        }

        dentry_ref(root);
        mountpoint.set_mountpoint(true);

        let mount = Arc::new(Mount {
            mountpoint: mountpoint.clone(),
            root: root.clone(),
            superblock: superblock.clone(),
            fs: fs.clone(),
        });

        self.mounts.lock().push(mount.clone());
        self.by_mountpoint.lock().insert(key_of(mountpoint), mount);
        Ok(())
    }

    /// The mount hanging off `mountpoint`.
    pub fn get_mount(&self, mountpoint: &Arc<Dentry>) -> Option<Arc<Mount>> {
        let mount = self.by_mountpoint.lock().get(&key_of(mountpoint)).cloned()?;
        // The map's value must point back at its key.
        assert!(Arc::ptr_eq(&mount.mountpoint, mountpoint));
        Some(mount)
    }

    /// Given a mounted root, the mountpoint dentry that refers to it. The
    /// global root is its own mountpoint.
    pub fn mountpoint_of_root(&self, root: &Arc<Dentry>) -> Option<Arc<Dentry>> {
        self.mounts
            .lock()
            .iter()
            .find(|mount| Arc::ptr_eq(&mount.root, root))
            .map(|mount| mount.mountpoint.clone())
    }

    /// Detach the mount whose root is `root`. At unlink time nothing else
    /// may hold the mount record.
    pub fn unmount(&self, root: &Arc<Dentry>) -> FsResult<Arc<Mount>> {
        let mut mounts = self.mounts.lock();
        let index = mounts
            .iter()
            .position(|mount| Arc::ptr_eq(&mount.root, root))
            .ok_or(FsError::NotFound)?;

        let mount = mounts.remove(index);
        self.by_mountpoint.lock().remove(&key_of(&mount.mountpoint));

        assert_eq!(
            Arc::strong_count(&mount),
            1,
            "mount record still referenced at unmount"
        );

        mount.mountpoint.set_mountpoint(false);
        Ok(mount)
    }

    pub fn mount_count(&self) -> usize {
        self.mounts.lock().len()
    }
}

impl Default for MountTable {
    fn default() -> Self {
        Self::new()
    }
}
