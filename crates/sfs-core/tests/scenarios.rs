#![forbid(unsafe_code)]

use sfs_core::{AccessMode, FileHandle, FileKind, FormatOptions, Image, SfsError, Whence};
use std::path::PathBuf;

fn fresh(block_size: u32, blocks: u64) -> (tempfile::TempDir, PathBuf, Image) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fs.img");
    Image::init(&path, block_size, blocks).expect("init");
    let image = Image::open(&path).expect("open");
    (dir, path, image)
}

fn assert_clean(image: &Image) {
    let report = image.check().expect("check");
    assert!(report.is_clean(), "check failed: {:#?}", report.errors);
}

fn read_all(image: &Image, path: &str) -> Vec<u8> {
    let fh = image.open_file(path, AccessMode::ReadOnly).expect("open");
    let mut out = Vec::new();
    let mut buf = [0_u8; 1000];
    loop {
        let n = image.read(fh, &mut buf).expect("read");
        if n == 0 {
            break;
        }
        out.extend_from_slice(&buf[..n]);
    }
    image.close_file(fh).expect("close");
    out
}

// ── Image lifecycle ─────────────────────────────────────────────────────────

#[test]
fn init_rejects_bad_geometry_and_existing_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("fs.img");
    assert!(matches!(
        Image::init(&path, 512, 8),
        Err(SfsError::BlockSizeTooSmall(512))
    ));
    assert!(matches!(
        Image::init(&path, 1100, 8),
        Err(SfsError::WrongBlockSize(1100))
    ));
    assert!(matches!(
        Image::init(&path, 4096, 0),
        Err(SfsError::NumberOfBlocksZero)
    ));
    assert!(!path.exists());

    Image::init_with(&path, &FormatOptions::default()).expect("init");
    let len = std::fs::metadata(&path).expect("meta").len();
    assert!(matches!(
        Image::init(&path, 4096, 8),
        Err(SfsError::FileAlreadyExists)
    ));
    assert_eq!(std::fs::metadata(&path).expect("meta").len(), len);
}

#[test]
fn init_reports_unreachable_host_path() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("missing").join("fs.img");
    assert!(matches!(
        Image::init(&path, 4096, 8),
        Err(SfsError::HostAccess { .. })
    ));
}

#[test]
fn bad_magic_is_rejected_without_writing() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("junk.img");
    let junk: Vec<u8> = (0..16384_u32).map(|i| (i * 7 + 3) as u8).collect();
    std::fs::write(&path, &junk).expect("write junk");

    assert!(matches!(
        Image::open(&path),
        Err(SfsError::BadMagicNumber { .. })
    ));
    assert_eq!(std::fs::read(&path).expect("read back"), junk);
}

#[test]
fn truncated_backing_file_is_a_format_error() {
    let (_dir, path, image) = fresh(1024, 16);
    image.close().expect("close");
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(&path)
        .expect("open host file");
    file.set_len(4096).expect("truncate");
    assert!(matches!(Image::open(&path), Err(SfsError::Format(_))));
}

#[test]
fn reopened_image_keeps_contents() {
    let (_dir, path, image) = fresh(1024, 32);
    image.mkdir("/d").expect("mkdir");
    image.create("/d/f", FileKind::File).expect("create");
    let fh = image.open_file("/d/f", AccessMode::WriteOnly).expect("open");
    image.write(fh, b"persisted").expect("write");
    image.close().expect("close");

    let image = Image::open(&path).expect("reopen");
    assert_eq!(read_all(&image, "/d/f"), b"persisted");
    assert_clean(&image);
}

// ── File I/O ────────────────────────────────────────────────────────────────

#[test]
fn write_seek_read_seventeen_bytes() {
    let (_dir, _path, image) = fresh(4096, 8);
    image.create("/testfile", FileKind::File).expect("create");
    let fh = image
        .open_file("/testfile", AccessMode::WriteOnly)
        .expect("open");
    image.write(fh, b"testing file save").expect("write");
    assert_eq!(image.seek(fh, Whence::Start(0)).expect("seek"), 0);
    let mut buf = [0_u8; 17];
    assert_eq!(image.read(fh, &mut buf).expect("read"), 17);
    assert_eq!(&buf, b"testing file save");
    assert_eq!(image.read(fh, &mut buf).expect("eof"), 0);
    assert_clean(&image);
}

#[test]
fn exhausted_data_area_leaves_file_untouched() {
    let (_dir, _path, image) = fresh(4096, 8);
    let payload = 4096 - 8;
    image.create("/a", FileKind::File).expect("create a");
    image.create("/filler", FileKind::File).expect("create filler");

    let a = image.open_file("/a", AccessMode::ReadWrite).expect("open a");
    let prefix: Vec<u8> = (0..34_u8).collect();
    image.write(a, &prefix).expect("prefix");

    let filler = image
        .open_file("/filler", AccessMode::WriteOnly)
        .expect("open filler");
    image.write(filler, &vec![0xEE; 3 * payload]).expect("fill");
    assert_eq!(image.statfs().expect("statfs").free_blocks, 2);

    // Needs three more blocks with two free.
    assert!(matches!(
        image.write(a, &vec![0x01; 3 * payload]),
        Err(SfsError::NoFreeBlocks)
    ));
    assert_eq!(image.statfs().expect("statfs").free_blocks, 2);

    image.write(filler, &vec![0xEE; 2 * payload]).expect("fill rest");
    assert_eq!(image.statfs().expect("statfs").free_blocks, 0);
    assert!(matches!(
        image.write(a, &[0x01; 4096]),
        Err(SfsError::NoFreeBlocks)
    ));

    let stat = image.stat("/a").expect("stat");
    assert_eq!(stat.size, 34);
    assert_eq!(stat.blocks, 1);
    assert_eq!(read_all(&image, "/a"), prefix);
    // The failed writes did not move the offset.
    image.write(a, b"!").expect("append in place");
    assert_eq!(image.stat("/a").expect("stat").size, 35);
    assert_clean(&image);
}

#[test]
fn multi_block_round_trip() {
    let (_dir, _path, image) = fresh(4096, 8);
    image.create("/big", FileKind::File).expect("create");
    let data: Vec<u8> = (0..16000_u32).map(|i| (i % 251) as u8).collect();
    let fh = image.open_file("/big", AccessMode::ReadWrite).expect("open");
    image.write(fh, &data).expect("write");
    assert_eq!(image.stat("/big").expect("stat").blocks, 4);
    assert_eq!(read_all(&image, "/big"), data);

    // Overwrite across a block boundary preserves neighbours.
    image.seek(fh, Whence::Start(4080)).expect("seek");
    image.write(fh, &[0xAB; 16]).expect("overwrite");
    let mut expected = data;
    expected[4080..4096].fill(0xAB);
    assert_eq!(read_all(&image, "/big"), expected);
    assert_eq!(image.stat("/big").expect("stat").size, 16000);
    assert_clean(&image);
}

#[test]
fn seek_clamps_into_file() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.create("/f", FileKind::File).expect("create");
    let fh = image.open_file("/f", AccessMode::ReadWrite).expect("open");
    image.write(fh, &[7_u8; 50]).expect("write");

    assert_eq!(image.seek(fh, Whence::Current(-100)).expect("seek"), 0);
    assert_eq!(image.seek(fh, Whence::End(-20)).expect("seek"), 30);
    assert_eq!(image.seek(fh, Whence::Current(5)).expect("seek"), 35);
    assert_eq!(image.seek(fh, Whence::Start(1000)).expect("seek"), 50);
    assert_eq!(image.seek(fh, Whence::End(i64::MAX)).expect("seek"), 50);
    assert_eq!(image.seek(fh, Whence::Start(i64::MIN)).expect("seek"), 0);

    image.seek(fh, Whence::End(-20)).expect("seek");
    let mut buf = [0_u8; 64];
    assert_eq!(image.read(fh, &mut buf).expect("read"), 20);
}

#[test]
fn append_mode_writes_at_end() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.create("/log", FileKind::File).expect("create");
    let writer = image.open_file("/log", AccessMode::WriteOnly).expect("open");
    image.write(writer, b"first ").expect("write");

    let appender = image.open_file("/log", AccessMode::Append).expect("open");
    image.write(appender, b"second ").expect("append");
    image.seek(writer, Whence::Start(0)).expect("rewind");
    image.write(writer, b"FIRST").expect("overwrite");
    image.write(appender, b"third").expect("append");

    assert_eq!(read_all(&image, "/log"), b"FIRST second third");
}

#[test]
fn independent_offsets_per_handle() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.create("/f", FileKind::File).expect("create");
    let w = image.open_file("/f", AccessMode::WriteOnly).expect("w");
    image.write(w, b"abcdef").expect("write");
    let r1 = image.open_file("/f", AccessMode::ReadOnly).expect("r1");
    let r2 = image.open_file("/f", AccessMode::ReadOnly).expect("r2");
    let mut two = [0_u8; 2];
    image.read(r1, &mut two).expect("r1");
    assert_eq!(&two, b"ab");
    image.read(r1, &mut two).expect("r1");
    assert_eq!(&two, b"cd");
    image.read(r2, &mut two).expect("r2");
    assert_eq!(&two, b"ab");
}

#[test]
fn mode_and_kind_errors() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.mkdir("/d").expect("mkdir");
    image.create("/f", FileKind::File).expect("create");
    assert!(matches!(
        image.open_file("/d", AccessMode::ReadOnly),
        Err(SfsError::IsDirectory)
    ));
    assert!(matches!(
        image.open_file("/missing", AccessMode::ReadOnly),
        Err(SfsError::FileDoesntExist(_))
    ));
    let ro = image.open_file("/f", AccessMode::ReadOnly).expect("open");
    assert!(matches!(image.write(ro, b"x"), Err(SfsError::WrongMode)));
    assert!(matches!(image.truncate(ro, 0), Err(SfsError::WrongMode)));
    assert!(matches!(image.read_dir("/f"), Err(SfsError::NotDirectory)));
}

#[test]
fn handles_are_reused_lowest_first() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.create("/f", FileKind::File).expect("create");
    let handles: Vec<FileHandle> = (0..3)
        .map(|_| image.open_file("/f", AccessMode::ReadOnly).expect("open"))
        .collect();
    assert_eq!(handles, vec![FileHandle(0), FileHandle(1), FileHandle(2)]);
    image.close_file(handles[1]).expect("close");
    assert!(matches!(
        image.close_file(handles[1]),
        Err(SfsError::UnknownDescriptor(1))
    ));
    let mut buf = [0_u8; 1];
    assert!(matches!(
        image.read(handles[1], &mut buf),
        Err(SfsError::UnknownDescriptor(1))
    ));
    assert_eq!(
        image.open_file("/f", AccessMode::ReadOnly).expect("reopen"),
        FileHandle(1)
    );
}

#[test]
fn truncate_shrinks_and_grows_with_zeros() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.create("/t", FileKind::File).expect("create");
    let fh = image.open_file("/t", AccessMode::ReadWrite).expect("open");
    image.write(fh, &[0x5A; 2500]).expect("write");
    assert_eq!(image.stat("/t").expect("stat").blocks, 3);
    let free_before = image.statfs().expect("statfs").free_blocks;

    image.truncate(fh, 1000).expect("shrink");
    let stat = image.stat("/t").expect("stat");
    assert_eq!((stat.size, stat.blocks), (1000, 1));
    assert_eq!(image.statfs().expect("statfs").free_blocks, free_before + 2);

    image.truncate(fh, 1500).expect("grow");
    let data = read_all(&image, "/t");
    assert_eq!(data.len(), 1500);
    assert!(data[..1000].iter().all(|b| *b == 0x5A));
    assert!(data[1000..].iter().all(|b| *b == 0));

    image.truncate(fh, 0).expect("empty");
    let stat = image.stat("/t").expect("stat");
    assert_eq!((stat.size, stat.blocks), (0, 0));
    assert_clean(&image);
}

// ── Namespace ───────────────────────────────────────────────────────────────

#[test]
fn delete_detection_is_idempotent() {
    let (_dir, _path, image) = fresh(1024, 16);
    assert!(matches!(
        image.unlink("/ghost"),
        Err(SfsError::FileDoesntExist(_))
    ));
    image.create("/once", FileKind::File).expect("create");
    let free = image.statfs().expect("statfs").free_blocks;
    assert!(matches!(
        image.create("/once", FileKind::File),
        Err(SfsError::FileAlreadyExists)
    ));
    assert_eq!(image.statfs().expect("statfs").free_blocks, free);
    image.unlink("/once").expect("unlink");
    assert!(matches!(
        image.unlink("/once"),
        Err(SfsError::FileDoesntExist(_))
    ));
    assert_clean(&image);
}

#[test]
fn compaction_keeps_siblings_resolvable() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.mkdir("/dir").expect("mkdir");
    for name in ["a", "b", "c"] {
        image
            .create(&format!("/dir/{name}"), FileKind::File)
            .expect("create");
    }
    image.unlink("/dir/b").expect("unlink");
    assert!(image.stat("/dir/a").is_ok());
    assert!(image.stat("/dir/c").is_ok());
    let entries = image.read_dir("/dir").expect("read_dir");
    assert_eq!(entries.len(), 2);
    assert_eq!(image.stat("/dir").expect("stat").size, 2 * 256);
    assert_clean(&image);
}

#[test]
fn non_empty_directory_gate() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.mkdir("/d").expect("mkdir");
    image.create("/d/only", FileKind::File).expect("create");
    assert!(matches!(image.unlink("/d"), Err(SfsError::DirNotEmpty)));
    image.unlink("/d/only").expect("unlink child");
    image.unlink("/d").expect("unlink dir");
    assert!(image.read_dir("/").expect("root").is_empty());
    assert_clean(&image);
}

#[test]
fn unlinked_file_handle_reports_missing() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.create("/keep", FileKind::File).expect("create keep");
    image.create("/gone", FileKind::File).expect("create");
    let fh = image.open_file("/gone", AccessMode::ReadWrite).expect("open");
    image.write(fh, &[1_u8; 1500]).expect("write");
    let free = image.statfs().expect("statfs").free_blocks;
    image.unlink("/gone").expect("unlink");
    assert_eq!(image.statfs().expect("statfs").free_blocks, free + 2);

    let mut buf = [0_u8; 4];
    assert!(matches!(
        image.read(fh, &mut buf),
        Err(SfsError::FileDoesntExist(_))
    ));
    // The slot is reused by a new file; the old handle still sees it gone.
    image.create("/new", FileKind::File).expect("create");
    assert!(matches!(
        image.write(fh, b"x"),
        Err(SfsError::FileDoesntExist(_))
    ));
    image.close_file(fh).expect("close");
    assert_clean(&image);
}

#[test]
fn stale_handle_cannot_reach_a_same_named_file_in_the_reused_slot() {
    let (_dir, _path, image) = fresh(1024, 16);
    image.mkdir("/a").expect("mkdir a");
    image.mkdir("/b").expect("mkdir b");
    image.create("/a/f", FileKind::File).expect("create a/f");
    let old_ino = image.stat("/a/f").expect("stat").ino;
    let fh = image.open_file("/a/f", AccessMode::ReadWrite).expect("open");

    image.unlink("/a/f").expect("unlink");
    image.create("/b/f", FileKind::File).expect("create b/f");
    assert_eq!(image.stat("/b/f").expect("stat").ino, old_ino);

    assert!(matches!(
        image.write(fh, b"stale"),
        Err(SfsError::FileDoesntExist(_))
    ));
    let mut buf = [0_u8; 4];
    assert!(matches!(
        image.read(fh, &mut buf),
        Err(SfsError::FileDoesntExist(_))
    ));
    assert!(matches!(
        image.truncate(fh, 10),
        Err(SfsError::FileDoesntExist(_))
    ));
    assert_eq!(image.stat("/b/f").expect("stat").size, 0);

    let fresh_fh = image.open_file("/b/f", AccessMode::ReadWrite).expect("open b/f");
    image.write(fresh_fh, b"new").expect("write");
    assert_eq!(read_all(&image, "/b/f"), b"new");
    assert_clean(&image);
}

#[test]
fn listing_and_stat_report_kinds() {
    let (_dir, _path, image) = fresh(1024, 32);
    image.mkdir("/sub").expect("mkdir");
    image.create("/file", FileKind::File).expect("create");
    let fh = image.open_file("/file", AccessMode::WriteOnly).expect("open");
    image.write(fh, b"12345").expect("write");

    let entries = image.read_dir("/").expect("read_dir");
    let summary: Vec<_> = entries
        .iter()
        .map(|e| (e.name.as_str(), e.kind, e.size))
        .collect();
    assert_eq!(
        summary,
        vec![("sub", FileKind::Directory, 0), ("file", FileKind::File, 5)]
    );
    let root = image.stat("/").expect("stat root");
    assert_eq!(root.kind, FileKind::Directory);
    assert_eq!(root.size, 512);

    let statfs = image.statfs().expect("statfs");
    assert_eq!(statfs.block_size, 1024);
    assert_eq!(statfs.total_blocks, 32);
    assert_eq!(statfs.inode_count - statfs.free_inodes, 4);
    assert_eq!(statfs.dir_mutex_holders, 0);
}

#[test]
fn check_reports_tampering() {
    let (_dir, path, image) = fresh(1024, 16);
    image.create("/f", FileKind::File).expect("create");
    assert_clean(&image);
    image.close().expect("close");

    // Flip a free bitmap bit behind the engine's back.
    let mut bytes = std::fs::read(&path).expect("read");
    bytes[1024 + 1] |= 0x80;
    std::fs::write(&path, &bytes).expect("write");
    let image = Image::open(&path).expect("reopen");
    let report = image.check().expect("check");
    assert!(!report.is_clean());
    assert!(report.errors.iter().any(|e| e.contains("free count")));
    assert!(report.errors.iter().any(|e| e.contains("unreachable")));
}

#[test]
fn close_reports_handles_left_open() {
    let (_dir, path, image) = fresh(1024, 16);
    image.create("/f", FileKind::File).expect("create");
    let first = image.open_file("/f", AccessMode::ReadOnly).expect("open");
    image.open_file("/f", AccessMode::ReadOnly).expect("open");
    image.open_file("/f", AccessMode::Append).expect("open");
    image.close_file(first).expect("close file");
    assert_eq!(image.close().expect("close"), 2);

    let image = Image::open(&path).expect("reopen");
    assert_eq!(image.close().expect("close"), 0);
}

#[test]
fn image_can_be_shared_between_threads() {
    fn is_send_sync<T: Send + Sync>() {}
    is_send_sync::<Image>();
}
