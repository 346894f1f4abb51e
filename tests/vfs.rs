//! VFS behaviour end to end: mounts, resolution, tmpfs and cpio, the page
//! cache, and file-backed mappings.

mod common;

use std::sync::Arc;

use common::{fresh_fs, init_mem};
use ferrite_kernel::fs::cpio;
use ferrite_kernel::kernel::mem::{AddressSpace, MmapFlags, VmFlags};
use ferrite_kernel::kernel::vfs::file::{File, OpenFlags, SeekOption};
use ferrite_kernel::kernel::vfs::inode::Format;
use ferrite_kernel::kernel::vfs::{
    vfs_chdirat, vfs_fchmodat, vfs_fstatat, vfs_fsync, vfs_getcwd, vfs_list_dir, vfs_mkdir,
    vfs_mount, vfs_openat, vfs_readlinkat, vfs_rmdir, vfs_symlink, vfs_unlinkat, vfs_unmount,
    FsContext, FsError, StatFlags,
};
use ferrite_mm::address::VAddr;
use ferrite_mm::paging::PAGE_SIZE;

const RW: VmFlags = VmFlags::READ.union(VmFlags::WRITE);

fn open_rw_create(ctx: &Arc<FsContext>, path: &[u8]) -> Arc<File> {
    vfs_openat(
        ctx,
        None,
        path,
        OpenFlags::READ | OpenFlags::WRITE | OpenFlags::CREATE,
    )
    .unwrap()
}

#[test]
fn write_then_read_round_trips() {
    let ctx = fresh_fs();
    let file = open_rw_create(&ctx, b"/data");

    assert_eq!(file.write(b"hello, page cache").unwrap(), 17);
    file.seek(SeekOption::Set(0)).unwrap();

    let mut buf = [0u8; 32];
    let n = file.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"hello, page cache");

    // Reads at EOF return nothing.
    assert_eq!(file.read(&mut buf).unwrap(), 0);

    // Offsets within a page and across pages.
    let mut big = vec![0u8; 2 * PAGE_SIZE];
    big.iter_mut().enumerate().for_each(|(i, b)| *b = i as u8);
    file.write_at(&big, 100).unwrap();

    let mut readback = vec![0u8; 2 * PAGE_SIZE];
    assert_eq!(file.read_at(&mut readback, 100).unwrap(), 2 * PAGE_SIZE);
    assert_eq!(readback, big);

    assert_eq!(file.stat().size, 100 + 2 * PAGE_SIZE);
}

#[test]
fn seek_options() {
    let ctx = fresh_fs();
    let file = open_rw_create(&ctx, b"/seek");
    file.write(b"0123456789").unwrap();

    assert_eq!(file.seek(SeekOption::Set(4)).unwrap(), 4);
    assert_eq!(file.seek(SeekOption::Current(-2)).unwrap(), 2);
    assert_eq!(file.seek(SeekOption::End(-1)).unwrap(), 9);
    assert!(file.seek(SeekOption::Current(-100)).is_err());
}

#[test]
fn truncating_open_discards_contents() {
    let ctx = fresh_fs();
    let file = open_rw_create(&ctx, b"/t");
    file.write(b"old contents").unwrap();
    drop(file);

    let file = vfs_openat(
        &ctx,
        None,
        b"/t",
        OpenFlags::READ | OpenFlags::WRITE | OpenFlags::TRUNCATE,
    )
    .unwrap();
    assert_eq!(file.stat().size, 0);

    let mut buf = [0u8; 8];
    assert_eq!(file.read(&mut buf).unwrap(), 0);
}

#[test]
fn mkdir_symlink_and_dir_open_through_mounts() {
    let ctx = fresh_fs();

    // Mount a second tmpfs at /tmp.
    vfs_mkdir(&ctx, b"/tmp").unwrap();
    vfs_mount(&ctx, "none", b"/tmp", "tmpfs", "").unwrap();

    vfs_mkdir(&ctx, b"/tmp/a").unwrap();
    vfs_symlink(&ctx, b"/tmp/b", b"/tmp/a").unwrap();

    let dir = vfs_openat(
        &ctx,
        None,
        b"/tmp/b",
        OpenFlags::READ | OpenFlags::DIRECTORY,
    )
    .unwrap();
    assert_eq!(dir.stat().format, Format::Directory);

    // The file visible through /tmp/b is the one in /tmp/a.
    let f = open_rw_create(&ctx, b"/tmp/a/inner");
    f.write(b"via a").unwrap();
    drop(f);

    let stat_a = vfs_fstatat(&ctx, None, b"/tmp/a/inner", StatFlags::empty()).unwrap();
    let stat_b = vfs_fstatat(&ctx, None, b"/tmp/b/inner", StatFlags::empty()).unwrap();
    assert_eq!(stat_a.ino, stat_b.ino);
}

#[test]
fn dotdot_is_bounded_by_root_and_crosses_mounts() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/tmp").unwrap();
    vfs_mount(&ctx, "none", b"/tmp", "tmpfs", "").unwrap();
    vfs_mkdir(&ctx, b"/etc").unwrap();

    // `..` from inside the mounted tree lands in the parent filesystem.
    let stat = vfs_fstatat(&ctx, None, b"/tmp/../etc", StatFlags::empty()).unwrap();
    assert_eq!(stat.format, Format::Directory);

    // `..` above the root stays at the root.
    let root = vfs_fstatat(&ctx, None, b"/", StatFlags::empty()).unwrap();
    let above = vfs_fstatat(&ctx, None, b"/../../..", StatFlags::empty()).unwrap();
    assert_eq!(root.ino, above.ino);
}

#[test]
fn path_resolution_equivalences() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/a").unwrap();
    vfs_mkdir(&ctx, b"/a/c").unwrap();
    let f = open_rw_create(&ctx, b"/a/b");
    drop(f);

    let plain = vfs_fstatat(&ctx, None, b"/a/b", StatFlags::empty()).unwrap();
    let dotted = vfs_fstatat(&ctx, None, b"/a/./b", StatFlags::empty()).unwrap();
    let parented = vfs_fstatat(&ctx, None, b"/a/c/../b", StatFlags::empty()).unwrap();
    assert_eq!(plain.ino, dotted.ino);
    assert_eq!(plain.ino, parented.ino);

    let zigzag = vfs_fstatat(&ctx, None, b"/a/../a/../a/b", StatFlags::empty()).unwrap();
    assert_eq!(plain.ino, zigzag.ino);
}

#[test]
fn resolution_after_rmdir_misses() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/a").unwrap();
    let f = open_rw_create(&ctx, b"/a/b");
    drop(f);

    assert_eq!(
        vfs_rmdir(&ctx, b"/a").unwrap_err(),
        FsError::NotEmpty,
        "rmdir of a non-empty directory"
    );

    vfs_unlinkat(&ctx, None, b"/a/b").unwrap();
    vfs_rmdir(&ctx, b"/a").unwrap();

    assert_eq!(
        vfs_fstatat(&ctx, None, b"/a/b", StatFlags::empty()).unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn trailing_slash_on_a_file_is_notdir() {
    let ctx = fresh_fs();
    let f = open_rw_create(&ctx, b"/plain");
    drop(f);

    assert_eq!(
        vfs_fstatat(&ctx, None, b"/plain/", StatFlags::empty()).unwrap_err(),
        FsError::NotDir
    );
}

#[test]
fn symlinks_follow_and_nofollow() {
    let ctx = fresh_fs();
    let f = open_rw_create(&ctx, b"/target");
    f.write(b"payload").unwrap();
    drop(f);

    vfs_symlink(&ctx, b"/link", b"/target").unwrap();
    vfs_symlink(&ctx, b"/link2", b"target").unwrap();

    let followed = vfs_fstatat(&ctx, None, b"/link", StatFlags::empty()).unwrap();
    assert_eq!(followed.format, Format::Regular);

    let relative = vfs_fstatat(&ctx, None, b"/link2", StatFlags::empty()).unwrap();
    assert_eq!(relative.ino, followed.ino);

    let nofollow = vfs_fstatat(&ctx, None, b"/link", StatFlags::NOFOLLOW).unwrap();
    assert_eq!(nofollow.format, Format::Symlink);

    let mut buf = [0u8; 64];
    let n = vfs_readlinkat(&ctx, None, b"/link", &mut buf).unwrap();
    assert_eq!(&buf[..n], b"/target");

    // A target that exactly fills the buffer reports NameTooLong.
    let mut tight = [0u8; 7];
    assert_eq!(
        vfs_readlinkat(&ctx, None, b"/link", &mut tight).unwrap_err(),
        FsError::NameTooLong
    );
}

#[test]
fn symlink_loops_are_detected() {
    let ctx = fresh_fs();
    vfs_symlink(&ctx, b"/one", b"/two").unwrap();
    vfs_symlink(&ctx, b"/two", b"/one").unwrap();

    assert_eq!(
        vfs_fstatat(&ctx, None, b"/one", StatFlags::empty()).unwrap_err(),
        FsError::LoopTooDeep
    );
}

#[test]
fn list_dir_streams_packed_records() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/sub").unwrap();
    drop(open_rw_create(&ctx, b"/file.txt"));
    vfs_symlink(&ctx, b"/sl", b"/file.txt").unwrap();

    let dir = vfs_openat(&ctx, None, b"/", OpenFlags::READ | OpenFlags::DIRECTORY).unwrap();

    let mut buf = [0u8; 512];
    let n = vfs_list_dir(&dir, &mut buf).unwrap();
    assert!(n > 0);
    // The stream is exhausted afterwards.
    assert_eq!(vfs_list_dir(&dir, &mut buf).unwrap(), 0);

    let mut entries = Vec::new();
    let mut pos = 0;
    while pos < n {
        let ino = u64::from_le_bytes(buf[pos..pos + 8].try_into().unwrap());
        let _off = i64::from_le_bytes(buf[pos + 8..pos + 16].try_into().unwrap());
        let reclen = u16::from_le_bytes(buf[pos + 16..pos + 18].try_into().unwrap()) as usize;
        let dtype = buf[pos + 18];
        let name_end = buf[pos + 19..pos + reclen]
            .iter()
            .position(|&b| b == 0)
            .unwrap()
            + pos
            + 19;
        let name = buf[pos + 19..name_end].to_vec();
        entries.push((ino, dtype, name));
        pos += reclen;
    }

    let names: Vec<&[u8]> = entries.iter().map(|(_, _, n)| n.as_slice()).collect();
    assert!(names.contains(&b"sub".as_slice()));
    assert!(names.contains(&b"file.txt".as_slice()));
    assert!(names.contains(&b"sl".as_slice()));

    for (ino, dtype, name) in &entries {
        assert_ne!(*ino, 0);
        match name.as_slice() {
            b"sub" => assert_eq!(*dtype, Format::Directory.dirent_type()),
            b"file.txt" => assert_eq!(*dtype, Format::Regular.dirent_type()),
            b"sl" => assert_eq!(*dtype, Format::Symlink.dirent_type()),
            _ => {}
        }
    }
}

#[test]
fn chdir_and_getcwd() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/work").unwrap();
    vfs_mkdir(&ctx, b"/work/deep").unwrap();

    vfs_chdirat(&ctx, None, b"/work/deep").unwrap();

    let mut buf = [0u8; 64];
    let n = vfs_getcwd(&ctx, &mut buf).unwrap();
    assert_eq!(&buf[..n], b"/work/deep");

    // Relative resolution starts at the cwd now.
    drop(open_rw_create(&ctx, b"here"));
    let stat = vfs_fstatat(&ctx, None, b"/work/deep/here", StatFlags::empty()).unwrap();
    assert_eq!(stat.format, Format::Regular);
}

#[test]
fn chmod_changes_permissions() {
    let ctx = fresh_fs();
    drop(open_rw_create(&ctx, b"/bin"));

    assert_eq!(
        vfs_openat(&ctx, None, b"/bin", OpenFlags::EXECUTE).unwrap_err(),
        FsError::PermissionDenied
    );

    vfs_fchmodat(&ctx, None, b"/bin", 0o755).unwrap();
    vfs_openat(&ctx, None, b"/bin", OpenFlags::EXECUTE).unwrap();
}

#[test]
fn unmount_busy_and_success() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/mnt").unwrap();
    vfs_mount(&ctx, "none", b"/mnt", "tmpfs", "").unwrap();

    // An open file below the mount keeps it busy.
    let file = open_rw_create(&ctx, b"/mnt/busy");
    assert_eq!(vfs_unmount(&ctx, b"/mnt").unwrap_err(), FsError::Busy);
    vfs_unlinkat(&ctx, None, b"/mnt/busy").unwrap();
    drop(file);

    vfs_unmount(&ctx, b"/mnt").unwrap();

    // The mountpoint is an ordinary empty directory again.
    assert_eq!(ctx.mounts.mount_count(), 1);
    vfs_rmdir(&ctx, b"/mnt").unwrap();
}

#[test]
fn readonly_tmpfs_rejects_writes() {
    let ctx = fresh_fs();
    vfs_mkdir(&ctx, b"/ro").unwrap();
    vfs_mount(&ctx, "none", b"/ro", "tmpfs", "ro").unwrap();

    assert_eq!(vfs_mkdir(&ctx, b"/ro/x").unwrap_err(), FsError::ReadOnly);
    assert_eq!(
        vfs_openat(
            &ctx,
            None,
            b"/ro/f",
            OpenFlags::WRITE | OpenFlags::CREATE
        )
        .unwrap_err(),
        FsError::ReadOnly
    );
}

#[test]
fn shared_file_mapping_writes_reach_the_file() {
    let ctx = fresh_fs();
    init_mem();

    let file = open_rw_create(&ctx, b"/mapped");
    let contents = vec![0x11u8; 8 * PAGE_SIZE];
    file.write(&contents).unwrap();

    let mm = AddressSpace::new();
    let base = mm
        .mmap_file(
            VAddr::NULL,
            MmapFlags::SHARED,
            RW,
            8,
            file.clone(),
            0,
        )
        .unwrap();

    // Store into the third page through the mapping.
    mm.write_user(base + 2 * PAGE_SIZE, b"through the mapping").unwrap();
    vfs_fsync(&file).unwrap();

    let mut buf = [0u8; 19];
    file.read_at(&mut buf, 2 * PAGE_SIZE).unwrap();
    assert_eq!(&buf, b"through the mapping");

    // And file writes are visible through the mapping.
    file.write_at(b"backwards", 2 * PAGE_SIZE).unwrap();
    let mut via_map = [0u8; 9];
    mm.read_user(base + 2 * PAGE_SIZE, &mut via_map).unwrap();
    assert_eq!(&via_map, b"backwards");
}

#[test]
fn private_file_mapping_copies_on_write() {
    let ctx = fresh_fs();
    init_mem();

    let file = open_rw_create(&ctx, b"/cowfile");
    file.write(&vec![0x22u8; 4 * PAGE_SIZE]).unwrap();

    let mm = AddressSpace::new();
    let base = mm
        .mmap_file(VAddr::NULL, MmapFlags::PRIVATE, RW, 4, file.clone(), 0)
        .unwrap();

    // Read first: the cache page is mapped read-only.
    let mut byte = [0u8; 1];
    mm.read_user(base, &mut byte).unwrap();
    assert_eq!(byte[0], 0x22);
    let (_, pagecache, cow) = mm.area_stat(base).unwrap();
    assert_eq!((pagecache, cow), (1, 1));

    // Write: the page is copied; the file keeps its bytes.
    mm.write_user(base, b"P").unwrap();
    file.read_at(&mut byte, 0).unwrap();
    assert_eq!(byte[0], 0x22);

    let (regular, _, _) = mm.area_stat(base).unwrap();
    assert_eq!(regular, 1);
}

#[test]
fn file_mapping_offset_is_honoured() {
    let ctx = fresh_fs();
    init_mem();

    let file = open_rw_create(&ctx, b"/offsets");
    let mut contents = vec![0u8; 4 * PAGE_SIZE];
    contents[2 * PAGE_SIZE] = 0xab;
    file.write(&contents).unwrap();

    let mm = AddressSpace::new();
    let base = mm
        .mmap_file(
            VAddr::NULL,
            MmapFlags::PRIVATE,
            VmFlags::READ,
            2,
            file.clone(),
            2 * PAGE_SIZE,
        )
        .unwrap();

    let mut byte = [0u8; 1];
    mm.read_user(base, &mut byte).unwrap();
    assert_eq!(byte[0], 0xab);
}

#[test]
fn shared_write_mapping_requires_writable_file() {
    let ctx = fresh_fs();
    init_mem();

    drop(open_rw_create(&ctx, b"/rdonly"));
    let file = vfs_openat(&ctx, None, b"/rdonly", OpenFlags::READ).unwrap();

    let mm = AddressSpace::new();
    assert!(mm
        .mmap_file(VAddr::NULL, MmapFlags::SHARED, RW, 1, file.clone(), 0)
        .is_err());

    // Private CoW mapping of a read-only file is fine.
    mm.mmap_file(VAddr::NULL, MmapFlags::PRIVATE, RW, 1, file, 0)
        .unwrap();
}

#[test]
fn unlinked_file_stays_alive_while_mapped() {
    let ctx = fresh_fs();
    init_mem();

    let file = open_rw_create(&ctx, b"/doomed");
    file.write(&vec![0x33u8; 2 * PAGE_SIZE]).unwrap();
    let ino = file.stat().ino;

    let mm = AddressSpace::new();
    let base = mm
        .mmap_file(VAddr::NULL, MmapFlags::SHARED, RW, 2, file.clone(), 0)
        .unwrap();

    vfs_unlinkat(&ctx, None, b"/doomed").unwrap();
    assert_eq!(
        vfs_fstatat(&ctx, None, b"/doomed", StatFlags::empty()).unwrap_err(),
        FsError::NotFound
    );

    // The inode persists: reads through the mapping and the handle work,
    // and the inode number is unchanged.
    let mut byte = [0u8; 1];
    mm.read_user(base + PAGE_SIZE, &mut byte).unwrap();
    assert_eq!(byte[0], 0x33);

    let stat = vfs_fstatat(&ctx, Some(&file), b"", StatFlags::STAT_FILE).unwrap();
    assert_eq!(stat.ino, ino);
    assert_eq!(stat.nlink, 0);
}

#[test]
fn cache_frames_are_referenced_by_cache_and_mappers() {
    use std::sync::atomic::Ordering;

    let ctx = fresh_fs();
    init_mem();

    let file = open_rw_create(&ctx, b"/counted");
    file.write(&vec![0x44u8; PAGE_SIZE]).unwrap();

    let mm_a = AddressSpace::new();
    let mm_b = AddressSpace::new();
    let base_a = mm_a
        .mmap_file(VAddr::NULL, MmapFlags::SHARED, RW, 1, file.clone(), 0)
        .unwrap();
    let base_b = mm_b
        .mmap_file(VAddr::NULL, MmapFlags::SHARED, RW, 1, file.clone(), 0)
        .unwrap();

    let mut byte = [0u8; 1];
    mm_a.read_user(base_a, &mut byte).unwrap();
    mm_b.read_user(base_b, &mut byte).unwrap();

    let (pfn_a, _) = mm_a.page_table().lookup(base_a).unwrap();
    let (pfn_b, _) = mm_b.page_table().lookup(base_b).unwrap();
    assert_eq!(pfn_a, pfn_b, "shared mappings share the cache frame");

    let allocator = ferrite_kernel::kernel::mem::frame_allocator();
    let count = allocator.frame(pfn_a).refcount().load(Ordering::Acquire);
    assert_eq!(count, 3, "one reference for the cache, one per mapping");

    mm_a.munmap(base_a, PAGE_SIZE).unwrap();
    let count = allocator.frame(pfn_a).refcount().load(Ordering::Acquire);
    assert_eq!(count, 2);
}

mod cpio_image {
    use std::fmt::Write as _;

    pub const MODE_DIR: u32 = 0o040000;
    pub const MODE_FILE: u32 = 0o100000;
    pub const MODE_SYMLINK: u32 = 0o120000;

    pub fn push_entry(image: &mut Vec<u8>, name: &[u8], mode: u32, ino: u32, data: &[u8]) {
        let mut header = String::new();
        header.push_str("070701");
        let fields = [
            ino,
            mode,
            0,
            0,
            1,
            0,
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

    pub fn sample() -> Vec<u8> {
        let mut image = Vec::new();
        push_entry(&mut image, b"etc", MODE_DIR | 0o755, 10, b"");
        push_entry(
            &mut image,
            b"etc/motd",
            MODE_FILE | 0o644,
            11,
            b"welcome to ferrite\n",
        );
        push_entry(&mut image, b"etc/issue", MODE_SYMLINK | 0o777, 12, b"motd");
        push_entry(&mut image, b"sbin/init", MODE_FILE | 0o755, 13, b"\x7fELF");
        push_entry(&mut image, b"TRAILER!!!", 0, 0, b"");
        image
    }
}

#[test]
fn cpio_initrd_mounts_and_reads() {
    let ctx = fresh_fs();
    cpio::register(&ctx, cpio_image::sample()).unwrap();

    vfs_mkdir(&ctx, b"/initrd").unwrap();
    vfs_mount(&ctx, "initrd", b"/initrd", "cpio", "").unwrap();

    let motd = vfs_openat(&ctx, None, b"/initrd/etc/motd", OpenFlags::READ).unwrap();
    let mut buf = [0u8; 64];
    let n = motd.read(&mut buf).unwrap();
    assert_eq!(&buf[..n], b"welcome to ferrite\n");

    // Symlink with a relative target.
    let issue = vfs_fstatat(&ctx, None, b"/initrd/etc/issue", StatFlags::empty()).unwrap();
    assert_eq!(issue.format, Format::Regular);
    assert_eq!(issue.ino, motd.stat().ino);

    // A directory that only exists as a path prefix.
    let sbin = vfs_fstatat(&ctx, None, b"/initrd/sbin", StatFlags::empty()).unwrap();
    assert_eq!(sbin.format, Format::Directory);

    // The archive is read-only.
    assert_eq!(
        vfs_openat(
            &ctx,
            None,
            b"/initrd/etc/motd",
            OpenFlags::READ | OpenFlags::WRITE
        )
        .unwrap_err(),
        FsError::ReadOnly
    );
    assert_eq!(vfs_mkdir(&ctx, b"/initrd/new").unwrap_err(), FsError::ReadOnly);

    // Directory listing by archive scan.
    let dir = vfs_openat(
        &ctx,
        None,
        b"/initrd/etc",
        OpenFlags::READ | OpenFlags::DIRECTORY,
    )
    .unwrap();
    let mut lbuf = [0u8; 256];
    let n = vfs_list_dir(&dir, &mut lbuf).unwrap();
    let listed = String::from_utf8_lossy(&lbuf[..n]).to_string();
    assert!(listed.contains("motd"));
    assert!(listed.contains("issue"));
}

#[test]
fn cpio_files_can_be_mapped_private() {
    let ctx = fresh_fs();
    cpio::register(&ctx, cpio_image::sample()).unwrap();
    vfs_mkdir(&ctx, b"/initrd").unwrap();
    vfs_mount(&ctx, "initrd", b"/initrd", "cpio", "").unwrap();

    let init = vfs_openat(&ctx, None, b"/initrd/sbin/init", OpenFlags::READ).unwrap();

    let mm = AddressSpace::new();
    let base = mm
        .mmap_file(VAddr::NULL, MmapFlags::PRIVATE, VmFlags::READ, 1, init, 0)
        .unwrap();

    let mut buf = [0u8; 4];
    mm.read_user(base, &mut buf).unwrap();
    assert_eq!(&buf, b"\x7fELF");

    // Past EOF within the page reads as zeroes.
    let mut tail = [0xffu8; 4];
    mm.read_user(base + 4, &mut tail).unwrap();
    assert_eq!(tail, [0u8; 4]);
}

#[test]
fn open_missing_without_create_fails() {
    let ctx = fresh_fs();
    assert_eq!(
        vfs_openat(&ctx, None, b"/nope", OpenFlags::READ).unwrap_err(),
        FsError::NotFound
    );
}

#[test]
fn dentry_release_invariant_holds_for_negative_lookups() {
    let ctx = fresh_fs();
    let root = ctx.root().unwrap();

    let before = root.children_count();
    let _ = vfs_fstatat(&ctx, None, b"/missing", StatFlags::empty()).unwrap_err();
    // The failed lookup's negative dentry was released.
    assert_eq!(root.children_count(), before);
}
