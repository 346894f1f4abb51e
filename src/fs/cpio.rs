//! Read-only filesystem over a cpio "newc" archive held in memory, used
//! for the initrd. The 110-byte header is six magic bytes followed by
//! thirteen 8-digit ASCII-hex fields; names and data are 4-byte aligned.

use ferrite_mm::paging::PAGE_SIZE;

use crate::io::{copy_offset_count, Buffer};
use crate::kernel::mem::{Page, PageExcl};
use crate::kernel::vfs::dentry::Dentry;
use crate::kernel::vfs::inode::{Format, Inode, InodeOps};
use crate::kernel::vfs::{
    Filesystem, FsContext, FsError, FsResult, Superblock, SuperblockOps,
};
use crate::prelude::*;

const HEADER_LEN: usize = 110;
const TRAILER: &[u8] = b"TRAILER!!!";

const MODE_FILE_TYPE: u32 = 0o170000;
const MODE_SOCKET: u32 = 0o140000;
const MODE_SYMLINK: u32 = 0o120000;
const MODE_FILE: u32 = 0o100000;
const MODE_BLOCKDEV: u32 = 0o060000;
const MODE_DIR: u32 = 0o040000;
const MODE_CHARDEV: u32 = 0o020000;
const MODE_FIFO: u32 = 0o010000;

fn mode_to_format(mode: u32) -> Format {
    match mode & MODE_FILE_TYPE {
        MODE_FILE => Format::Regular,
        MODE_DIR => Format::Directory,
        MODE_SYMLINK => Format::Symlink,
        MODE_CHARDEV => Format::CharDevice,
        MODE_BLOCKDEV => Format::BlockDevice,
        MODE_FIFO => Format::Fifo,
        MODE_SOCKET => Format::Socket,
        _ => Format::Unknown,
    }
}

fn hex_field(bytes: &[u8]) -> FsResult<u32> {
    let mut value = 0u32;
    for &byte in bytes {
        let digit = match byte {
            b'0'..=b'9' => byte - b'0',
            b'a'..=b'f' => byte - b'a' + 10,
            b'A'..=b'F' => byte - b'A' + 10,
            _ => return Err(FsError::IoError),
        };
        value = (value << 4) | digit as u32;
    }
    Ok(value)
}

fn align4(value: usize) -> usize {
    (value + 3) & !3
}

struct Entry<'a> {
    name: &'a [u8],
    ino: u32,
    mode: u32,
    nlink: u32,
    data: &'a [u8],
}

struct EntryIter<'a> {
    image: &'a [u8],
    offset: usize,
    done: bool,
}

fn entries(image: &[u8]) -> EntryIter<'_> {
    EntryIter {
        image,
        offset: 0,
        done: false,
    }
}

impl<'a> Iterator for EntryIter<'a> {
    type Item = FsResult<Entry<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.offset + HEADER_LEN > self.image.len() {
            return None;
        }

        let header = &self.image[self.offset..self.offset + HEADER_LEN];
        if &header[0..5] != b"07070" || (header[5] != b'1' && header[5] != b'2') {
            self.done = true;
            return Some(Err(FsError::IoError));
        }

        let field = |n: usize| hex_field(&header[6 + n * 8..6 + (n + 1) * 8]);
        let parsed = (|| {
            let ino = field(0)?;
            let mode = field(1)?;
            let nlink = field(4)?;
            let filesize = field(6)? as usize;
            let namesize = field(11)? as usize;
            Ok::<_, FsError>((ino, mode, nlink, filesize, namesize))
        })();

        let (ino, mode, nlink, filesize, namesize) = match parsed {
            Ok(fields) => fields,
            Err(err) => {
                self.done = true;
                return Some(Err(err));
            }
        };

        let name_start = self.offset + HEADER_LEN;
        if name_start + namesize > self.image.len() || namesize == 0 {
            self.done = true;
            return Some(Err(FsError::IoError));
        }
        // The name is stored with its NUL terminator.
        let name = &self.image[name_start..name_start + namesize - 1];

        let data_start = align4(name_start + namesize);
        if data_start + filesize > self.image.len() {
            self.done = true;
            return Some(Err(FsError::IoError));
        }
        let data = &self.image[data_start..data_start + filesize];

        self.offset = align4(data_start + filesize);

        if name == TRAILER {
            self.done = true;
            return None;
        }

        Some(Ok(Entry {
            name,
            ino,
            mode,
            nlink,
            data,
        }))
    }
}

/// Byte range of an entry's data inside the image, so inodes don't borrow.
#[derive(Clone, Copy)]
struct DataRange {
    start: usize,
    len: usize,
}

struct DirOps {
    image: Arc<[u8]>,
    /// Path of this directory relative to the archive root, no leading
    /// slash, empty for the root.
    path: Vec<u8>,
}

impl DirOps {
    fn child_path(&self, name: &[u8]) -> Vec<u8> {
        let mut path = self.path.clone();
        if !path.is_empty() {
            path.push(b'/');
        }
        path.extend_from_slice(name);
        path
    }

    fn make_inode(
        &self,
        sb: &Arc<Superblock>,
        entry: &Entry<'_>,
        full_path: &[u8],
        image: &Arc<[u8]>,
    ) -> Arc<Inode> {
        let format = mode_to_format(entry.mode);
        let perm = entry.mode & 0o777;

        let ops: Box<dyn InodeOps> = match format {
            Format::Directory => Box::new(DirOps {
                image: image.clone(),
                path: full_path.to_vec(),
            }),
            Format::Symlink => Box::new(SymlinkOps {
                target: Box::from(entry.data),
            }),
            _ => {
                let start = entry.data.as_ptr() as usize - image.as_ptr() as usize;
                Box::new(FileOps {
                    image: image.clone(),
                    data: DataRange {
                        start,
                        len: entry.data.len(),
                    },
                })
            }
        };

        let inode = Inode::new(sb, entry.ino as u64, format, perm, ops);
        inode.store_size(entry.data.len());
        for _ in 1..entry.nlink.max(1) {
            inode.inc_nlink();
        }
        inode
    }
}

impl InodeOps for DirOps {
    fn create(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>, _perm: u32) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn mkdir(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>, _perm: u32) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn symlink(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>, _target: &[u8]) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn unlink(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn rmdir(&self, _dir: &Arc<Inode>, _at: &Arc<Dentry>) -> FsResult<()> {
        Err(FsError::ReadOnly)
    }

    fn lookup(&self, dir: &Arc<Inode>, child: &Arc<Dentry>) -> FsResult<bool> {
        let sb = dir.superblock().ok_or(FsError::IoError)?;
        let full = self.child_path(child.name());

        let mut implicit_dir = false;
        for entry in entries(&self.image) {
            let entry = entry?;
            if entry.name == full.as_slice() {
                child.attach(self.make_inode(&sb, &entry, &full, &self.image));
                return Ok(true);
            }
            if entry.name.len() > full.len()
                && entry.name.starts_with(&full)
                && entry.name[full.len()] == b'/'
            {
                implicit_dir = true;
            }
        }

        if implicit_dir {
            // Some archives omit directory entries; synthesise one.
            let inode = Inode::new(
                &sb,
                0,
                Format::Directory,
                0o755,
                Box::new(DirOps {
                    image: self.image.clone(),
                    path: full,
                }),
            );
            child.attach(inode);
            return Ok(true);
        }

        Ok(false)
    }

    fn iterate_dir(
        &self,
        _dentry: &Arc<Dentry>,
        emit: &mut dyn FnMut(u64, &[u8], Format),
    ) -> FsResult<()> {
        let prefix_len = if self.path.is_empty() {
            0
        } else {
            self.path.len() + 1
        };

        let mut seen: Vec<&[u8]> = Vec::new();
        for entry in entries(&self.image) {
            let entry = entry?;

            let name = entry.name;
            if prefix_len > 0
                && !(name.len() > prefix_len
                    && name.starts_with(&self.path)
                    && name[self.path.len()] == b'/')
            {
                continue;
            }

            let rest = &name[prefix_len..];
            if rest.is_empty() {
                continue;
            }

            // Only immediate children; deeper paths surface their first
            // component, once.
            let component = match rest.iter().position(|&c| c == b'/') {
                Some(pos) => &rest[..pos],
                None => rest,
            };
            if seen.contains(&component) {
                continue;
            }

            let format = if component.len() == rest.len() {
                mode_to_format(entry.mode)
            } else {
                Format::Directory
            };
            emit(entry.ino as u64, component, format);
        }

        Ok(())
    }
}

struct FileOps {
    image: Arc<[u8]>,
    data: DataRange,
}

impl InodeOps for FileOps {
    fn fill_cache(&self, _inode: &Arc<Inode>, pgoff: usize) -> FsResult<Page> {
        let mut page = PageExcl::zeroed();
        let data = &self.image[self.data.start..self.data.start + self.data.len];
        copy_offset_count(data, page.as_bytes_mut(), pgoff * PAGE_SIZE, PAGE_SIZE);
        Ok(page.into_page())
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

struct CpioSuper;

impl SuperblockOps for CpioSuper {}

/// The initrd filesystem: mounts the archive image it was created with.
pub struct CpioFs {
    image: Arc<[u8]>,
}

impl CpioFs {
    pub fn new(image: impl Into<Arc<[u8]>>) -> Arc<Self> {
        Arc::new(Self {
            image: image.into(),
        })
    }
}

impl Filesystem for CpioFs {
    fn name(&self) -> &str {
        "cpio"
    }

    fn mount(&self, _device: &str, _options: &str) -> FsResult<(Arc<Superblock>, Arc<Dentry>)> {
        // Validate the archive once up front.
        for entry in entries(&self.image) {
            entry?;
        }

        let sb = Superblock::new("cpio", true, Box::new(CpioSuper));
        let root = Dentry::new_root(&sb);

        let root_inode = Inode::new(
            &sb,
            0,
            Format::Directory,
            0o755,
            Box::new(DirOps {
                image: self.image.clone(),
                path: Vec::new(),
            }),
        );
        root.attach(root_inode);

        Ok((sb, root))
    }
}

pub fn register(ctx: &FsContext, image: impl Into<Arc<[u8]>>) -> FsResult<()> {
    ctx.register_filesystem(CpioFs::new(image))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push_entry(image: &mut Vec<u8>, name: &[u8], mode: u32, ino: u32, data: &[u8]) {
        use std::fmt::Write as _;

        let mut header = String::new();
        header.push_str("070701");
        let fields = [
            ino,
            mode,
            0, // uid
            0, // gid
            1, // nlink
            0, // mtime
            data.len() as u32,
            0,
            0,
            0,
            0,
            name.len() as u32 + 1,
            0,
        ];
        for field in fields {
            write!(header, "{:08X}", field).unwrap();
        }

        image.extend_from_slice(header.as_bytes());
        image.extend_from_slice(name);
        image.push(0);
        while image.len() % 4 != 0 {
            image.push(0);
        }
        image.extend_from_slice(data);
        while image.len() % 4 != 0 {
            image.push(0);
        }
    }

    pub(crate) fn sample_image() -> Vec<u8> {
        let mut image = Vec::new();
        push_entry(&mut image, b"dir", MODE_DIR | 0o755, 10, b"");
        push_entry(&mut image, b"dir/hello.txt", MODE_FILE | 0o644, 11, b"hello from the initrd\n");
        push_entry(&mut image, b"dir/link", MODE_SYMLINK | 0o777, 12, b"hello.txt");
        push_entry(&mut image, b"orphan/deep.txt", MODE_FILE | 0o600, 13, b"deep");
        push_entry(&mut image, b"TRAILER!!!", 0, 0, b"");
        image
    }

    #[test]
    fn parses_headers() {
        let image = sample_image();
        let parsed: Vec<_> = entries(&image).collect::<FsResult<Vec<_>>>().unwrap();
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed[0].name, b"dir");
        assert_eq!(parsed[1].name, b"dir/hello.txt");
        assert_eq!(parsed[1].data, b"hello from the initrd\n");
        assert_eq!(mode_to_format(parsed[2].mode), Format::Symlink);
    }

    #[test]
    fn header_is_110_bytes() {
        let mut image = Vec::new();
        push_entry(&mut image, b"x", MODE_FILE, 1, b"");
        assert_eq!(&image[..6], b"070701");
        // header + "x\0" padded to 4
        assert_eq!(image.len() % 4, 0);
        assert!(image.len() >= HEADER_LEN + 2);
    }

    #[test]
    fn rejects_bad_magic() {
        let image = b"080801junk".to_vec();
        assert!(entries(&image).next().unwrap().is_err());
    }
}
