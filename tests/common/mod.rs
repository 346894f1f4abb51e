use std::sync::Arc;

use ferrite_kernel::fs::tmpfs;
use ferrite_kernel::kernel::mem;
use ferrite_kernel::kernel::vfs::{vfs_mount, FsContext};

/// 16 MiB of emulated physical memory, shared by every test in the binary.
pub const TEST_FRAMES: usize = 4096;

pub fn init_mem() {
    mem::init(TEST_FRAMES);
}

/// A fresh filesystem view with its own tmpfs root.
pub fn fresh_fs() -> Arc<FsContext> {
    init_mem();

    let ctx = FsContext::new();
    tmpfs::register(&ctx).unwrap();
    vfs_mount(&ctx, "none", b"/", "tmpfs", "").unwrap();
    ctx
}
