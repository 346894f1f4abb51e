//! The memory & file core of the ferrite kernel: physical frame management,
//! virtual memory (address spaces, page-fault dispatch, CoW and
//! zero-on-demand), and the VFS (dentry cache, mount tree, page cache,
//! file-backed mappings) plus the tmpfs and cpio filesystems.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod fs;
pub mod io;
pub mod kernel;
pub mod path;
mod prelude;
