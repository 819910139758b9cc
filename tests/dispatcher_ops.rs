//! Dispatcher-level tests: the `do_*` operations drive the whole stack
//! over real temp-directory trees, no kernel mount required.

use std::ffi::OsStr;
use std::fs;
use std::path::Path;

use tempfile::TempDir;
use wolfs::fsops::Lookup;
use wolfs::{MountDirs, WolfsFs, WolfsOptions, ROOT_INODE};

struct Mounted {
    src: TempDir,
    tmp: TempDir,
    _mnt: TempDir,
    fs: WolfsFs,
}

fn mount_with(src_setup: impl FnOnce(&Path), max_mb: u64) -> Mounted {
    let src = TempDir::new().unwrap();
    let tmp = TempDir::new().unwrap();
    let mnt = TempDir::new().unwrap();
    src_setup(src.path());
    let dirs = MountDirs::new(src.path(), tmp.path(), mnt.path()).unwrap();
    let opts = WolfsOptions {
        max_cache_mb: max_mb,
        ..WolfsOptions::default()
    };
    let fs = WolfsFs::new(dirs, opts).unwrap();
    Mounted { src, tmp, _mnt: mnt, fs }
}

fn found(entry: Lookup) -> fuser::FileAttr {
    match entry {
        Lookup::Found { attr, .. } => attr,
        Lookup::Negative => panic!("expected a positive entry"),
    }
}

#[test]
fn lookup_finds_indexed_files_and_misses_are_negative() {
    let mut m = mount_with(
        |src| {
            fs::create_dir(src.join("dir")).unwrap();
            fs::write(src.join("dir/a"), b"abc").unwrap();
        },
        8,
    );

    let dir = found(m.fs.do_lookup(ROOT_INODE, OsStr::new("dir")).unwrap());
    assert_eq!(dir.kind, fuser::FileType::Directory);

    let a = found(m.fs.do_lookup(dir.ino, OsStr::new("a")).unwrap());
    assert_eq!(a.size, 3);

    match m.fs.do_lookup(dir.ino, OsStr::new("missing")).unwrap() {
        Lookup::Negative => {}
        other => panic!("expected a negative entry, got {other:?}"),
    }
}

#[test]
fn getattr_reports_translator_inos() {
    let mut m = mount_with(|src| fs::write(src.join("f"), b"x").unwrap(), 8);
    let attr = found(m.fs.do_lookup(ROOT_INODE, OsStr::new("f")).unwrap());
    assert_eq!(m.fs.do_getattr(attr.ino).unwrap().ino, attr.ino);
}

#[test]
fn mkdir_twice_reports_eexist_without_side_effects() {
    let mut m = mount_with(|_| {}, 8);

    let attr = found(
        m.fs.do_mkdir(ROOT_INODE, OsStr::new("d"), 0o755, 0, 1000, 1000)
            .unwrap(),
    );
    assert!(m.tmp.path().join("d").is_dir());
    let journal_len = m.fs.journal().len();
    let children: Vec<u64> = m.fs.vfs().dir(ROOT_INODE).unwrap().children().to_vec();

    let err = m
        .fs
        .do_mkdir(ROOT_INODE, OsStr::new("d"), 0o755, 0, 1000, 1000)
        .unwrap_err();
    assert_eq!(err, libc::EEXIST);
    // the failing call must not mutate anything
    assert_eq!(m.fs.journal().len(), journal_len);
    assert_eq!(m.fs.vfs().dir(ROOT_INODE).unwrap().children(), &children[..]);
    assert_eq!(m.fs.do_getattr(attr.ino).unwrap().ino, attr.ino);
}

#[test]
fn mkdir_then_rmdir_cleans_every_index() {
    let mut m = mount_with(|_| {}, 8);
    let attr = found(
        m.fs.do_mkdir(ROOT_INODE, OsStr::new("d"), 0o700, 0, 1000, 1000)
            .unwrap(),
    );

    m.fs.do_rmdir(ROOT_INODE, OsStr::new("d")).unwrap();
    assert!(!m.tmp.path().join("d").exists());
    assert!(!m.fs.vfs().dir(ROOT_INODE).unwrap().contains_child(attr.ino));
    match m.fs.do_lookup(ROOT_INODE, OsStr::new("d")).unwrap() {
        Lookup::Negative => {}
        other => panic!("expected negative after rmdir, got {other:?}"),
    }
}

#[test]
fn rmdir_of_non_empty_directory_is_refused() {
    let mut m = mount_with(
        |src| {
            fs::create_dir(src.join("d")).unwrap();
            fs::write(src.join("d/keep"), b"1").unwrap();
        },
        8,
    );
    assert_eq!(
        m.fs.do_rmdir(ROOT_INODE, OsStr::new("d")).unwrap_err(),
        libc::ENOTEMPTY
    );
}

#[test]
fn rename_keeps_the_inode_and_journals_once() {
    let mut m = mount_with(
        |src| {
            fs::create_dir(src.join("dir")).unwrap();
            fs::write(src.join("dir/a"), b"payload").unwrap();
        },
        8,
    );
    let dir = found(m.fs.do_lookup(ROOT_INODE, OsStr::new("dir")).unwrap());
    let a = found(m.fs.do_lookup(dir.ino, OsStr::new("a")).unwrap());
    let journal_before = m.fs.journal().len();

    m.fs.do_rename(dir.ino, OsStr::new("a"), dir.ino, OsStr::new("b"), 0)
        .unwrap();

    match m.fs.do_lookup(dir.ino, OsStr::new("a")).unwrap() {
        Lookup::Negative => {}
        other => panic!("old name must be gone, got {other:?}"),
    }
    let b = found(m.fs.do_lookup(dir.ino, OsStr::new("b")).unwrap());
    assert_eq!(b.ino, a.ino, "rename preserves the inode");
    assert_eq!(m.fs.journal().len(), journal_before + 1);
    assert!(m.tmp.path().join("dir/b").exists());
    assert!(!m.tmp.path().join("dir/a").exists());
}

#[test]
fn rename_with_flags_is_rejected() {
    let mut m = mount_with(|src| fs::write(src.join("f"), b"1").unwrap(), 8);
    assert_eq!(
        m.fs.do_rename(ROOT_INODE, OsStr::new("f"), ROOT_INODE, OsStr::new("g"), 1)
            .unwrap_err(),
        libc::EINVAL
    );
}

#[test]
fn rename_of_directory_carries_descendants_along() {
    let mut m = mount_with(
        |src| {
            fs::create_dir_all(src.join("dir/sub")).unwrap();
            fs::write(src.join("dir/sub/deep"), b"deep").unwrap();
        },
        8,
    );
    let dir = found(m.fs.do_lookup(ROOT_INODE, OsStr::new("dir")).unwrap());
    let sub = found(m.fs.do_lookup(dir.ino, OsStr::new("sub")).unwrap());
    let deep = found(m.fs.do_lookup(sub.ino, OsStr::new("deep")).unwrap());

    m.fs.do_rename(ROOT_INODE, OsStr::new("dir"), ROOT_INODE, OsStr::new("moved"), 0)
        .unwrap();

    let moved = found(m.fs.do_lookup(ROOT_INODE, OsStr::new("moved")).unwrap());
    assert_eq!(moved.ino, dir.ino);
    let sub2 = found(m.fs.do_lookup(moved.ino, OsStr::new("sub")).unwrap());
    assert_eq!(sub2.ino, sub.ino);
    let deep2 = found(m.fs.do_lookup(sub2.ino, OsStr::new("deep")).unwrap());
    assert_eq!(deep2.ino, deep.ino);
}

#[test]
fn unlink_removes_cache_copy_and_directory_entry() {
    let mut m = mount_with(|src| fs::write(src.join("victim"), b"bytes").unwrap(), 8);
    let attr = found(m.fs.do_lookup(ROOT_INODE, OsStr::new("victim")).unwrap());
    let size_before = m.fs.disk().current_size();

    m.fs.do_unlink(ROOT_INODE, OsStr::new("victim")).unwrap();
    assert!(!m.tmp.path().join("victim").exists());
    assert!(!m.fs.vfs().dir(ROOT_INODE).unwrap().contains_child(attr.ino));
    assert!(m.fs.disk().current_size() < size_before);
    match m.fs.do_lookup(ROOT_INODE, OsStr::new("victim")).unwrap() {
        Lookup::Negative => {}
        other => panic!("expected negative entry, got {other:?}"),
    }
    let _ = &m.src;
}

#[test]
fn readdir_uses_inode_offsets_and_sorted_children() {
    let mut m = mount_with(
        |src| {
            fs::write(src.join("one"), b"1").unwrap();
            fs::write(src.join("two"), b"2").unwrap();
            fs::write(src.join("three"), b"3").unwrap();
        },
        8,
    );

    let all = m.fs.do_readdir(ROOT_INODE, 0).unwrap();
    assert_eq!(all.len(), 3);
    let inos: Vec<u64> = all.iter().map(|e| e.ino).collect();
    let mut sorted = inos.clone();
    sorted.sort_unstable();
    assert_eq!(inos, sorted, "entries come out in inode order");

    // resuming from an entry's offset yields exactly the remainder
    let rest = m.fs.do_readdir(ROOT_INODE, inos[0] as i64).unwrap();
    assert_eq!(rest.len(), 2);
    assert_eq!(rest[0].ino, inos[1]);

    let names: Vec<&str> = all.iter().map(|e| e.name.as_str()).collect();
    for name in ["one", "two", "three"] {
        assert!(names.contains(&name), "{name} missing from readdir");
    }
}

#[test]
fn write_then_read_roundtrip_through_the_cache() {
    let mut m = mount_with(|_| {}, 8);
    let (entry, fh) = m
        .fs
        .do_create(
            ROOT_INODE,
            OsStr::new("note"),
            0o644,
            0,
            libc::O_RDWR,
            1000,
            1000,
        )
        .unwrap();
    let attr = found(entry);
    assert_eq!(fh, attr.ino);

    m.fs.do_write(attr.ino, 0, b"hello world").unwrap();
    let data = m.fs.do_read(attr.ino, 6, 5).unwrap();
    assert_eq!(&data, b"world");

    // sizes served through getattr follow the open descriptor
    assert_eq!(m.fs.do_getattr(attr.ino).unwrap().size, 11);
    m.fs.do_release(attr.ino);
}

#[test]
fn statfs_reserves_room_for_the_cache_prefix() {
    let mut m = mount_with(|_| {}, 8);
    let out = m.fs.do_statfs().unwrap();
    let host = nix::sys::statvfs::statvfs(m.tmp.path()).unwrap();
    let prefix = m.tmp.path().as_os_str().len() as u32 + 1;
    assert_eq!(out.namelen, host.name_max() as u32 - prefix);
    assert!(out.blocks > 0);
}
