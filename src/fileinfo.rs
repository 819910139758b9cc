//! File and directory records.
//!
//! Every inode known to the filesystem owns one [`InodeRecord`]: a
//! stat-like attribute block plus, for directories, the ordered list of
//! child inodes. The records are what `getattr`/`lookup` serve when the
//! source is unreachable, so they mirror the backing store faithfully.

use std::fs::{File, Metadata, OpenOptions};
use std::io;
use std::os::unix::fs::MetadataExt;
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use fuser::{FileAttr, FileType, TimeOrNow};
use serde::{Deserialize, Serialize};

/// Reported block size; matches what the original tree advertised.
pub const BLOCK_SIZE: u32 = 512;

/// How long the kernel may cache a positive entry or its attributes.
pub const ATTR_TTL: Duration = Duration::from_secs(1);

/// TTL of a negative (`NOENT`) lookup entry.
pub const NEGATIVE_TTL: Duration = Duration::from_secs(1);

fn kind_of(meta: &Metadata) -> FileType {
    let ft = meta.file_type();
    if ft.is_dir() {
        FileType::Directory
    } else if ft.is_symlink() {
        FileType::Symlink
    } else {
        FileType::RegularFile
    }
}

fn attr_from_meta(meta: &Metadata, ino: u64) -> FileAttr {
    FileAttr {
        ino,
        size: meta.size(),
        blocks: meta.size().div_ceil(u64::from(BLOCK_SIZE)),
        atime: meta.accessed().unwrap_or(UNIX_EPOCH),
        mtime: meta.modified().unwrap_or(UNIX_EPOCH),
        ctime: UNIX_EPOCH + Duration::from_secs(meta.ctime().max(0) as u64),
        crtime: meta.created().unwrap_or(UNIX_EPOCH),
        kind: kind_of(meta),
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Stat `path` (without following a final symlink) into a [`FileAttr`]
/// carrying our own inode number instead of the host filesystem's.
pub fn getattr_path(path: &Path, ino: u64) -> io::Result<FileAttr> {
    let meta = std::fs::symlink_metadata(path)?;
    Ok(attr_from_meta(&meta, ino))
}

/// Stat an open descriptor; used while a file has an open handle so sizes
/// reflect unflushed writes.
pub fn getattr_file(file: &File, ino: u64) -> io::Result<FileAttr> {
    let meta = file.metadata()?;
    Ok(attr_from_meta(&meta, ino))
}

/// The all-zero attribute block of a negative lookup entry. `ino == 0`
/// tells the kernel to cache the absence of the name.
pub fn negative_attr() -> FileAttr {
    FileAttr {
        ino: 0,
        size: 0,
        blocks: 0,
        atime: UNIX_EPOCH,
        mtime: UNIX_EPOCH,
        ctime: UNIX_EPOCH,
        crtime: UNIX_EPOCH,
        kind: FileType::RegularFile,
        perm: 0,
        nlink: 0,
        uid: 0,
        gid: 0,
        rdev: 0,
        blksize: BLOCK_SIZE,
        flags: 0,
    }
}

/// Attribute record of a regular file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileRecord {
    pub attr: FileAttr,
    pub entry_ttl: Duration,
    /// Reserved for NFS-style inode reuse detection.
    pub generation: u64,
}

/// A file record plus the ordered child-inode list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirRecord {
    pub attr: FileAttr,
    pub entry_ttl: Duration,
    pub generation: u64,
    children: Vec<u64>,
}

impl DirRecord {
    pub fn new(attr: FileAttr) -> Self {
        DirRecord {
            attr,
            entry_ttl: ATTR_TTL,
            generation: 0,
            children: Vec::new(),
        }
    }

    /// Children, strictly sorted by inode at all times.
    pub fn children(&self) -> &[u64] {
        &self.children
    }

    pub fn contains_child(&self, ino: u64) -> bool {
        self.children.binary_search(&ino).is_ok()
    }

    /// Insert keeping the list sorted. Inserting a child twice is a
    /// programmer error; callers that may legitimately re-add check
    /// [`DirRecord::contains_child`] first.
    pub fn insert_child(&mut self, ino: u64) {
        match self.children.binary_search(&ino) {
            Ok(_) => debug_assert!(false, "child ino {ino} inserted twice"),
            Err(pos) => self.children.insert(pos, ino),
        }
    }

    pub fn remove_child(&mut self, ino: u64) -> bool {
        match self.children.binary_search(&ino) {
            Ok(pos) => {
                self.children.remove(pos);
                true
            }
            Err(_) => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }
}

/// Tagged record: plain file or directory.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum InodeRecord {
    File(FileRecord),
    Dir(DirRecord),
}

impl InodeRecord {
    pub fn file(attr: FileAttr) -> Self {
        InodeRecord::File(FileRecord {
            attr,
            entry_ttl: ATTR_TTL,
            generation: 0,
        })
    }

    pub fn dir(attr: FileAttr) -> Self {
        InodeRecord::Dir(DirRecord::new(attr))
    }

    pub fn attr(&self) -> &FileAttr {
        match self {
            InodeRecord::File(f) => &f.attr,
            InodeRecord::Dir(d) => &d.attr,
        }
    }

    pub fn attr_mut(&mut self) -> &mut FileAttr {
        match self {
            InodeRecord::File(f) => &mut f.attr,
            InodeRecord::Dir(d) => &mut d.attr,
        }
    }

    pub fn entry_ttl(&self) -> Duration {
        match self {
            InodeRecord::File(f) => f.entry_ttl,
            InodeRecord::Dir(d) => d.entry_ttl,
        }
    }

    pub fn generation(&self) -> u64 {
        match self {
            InodeRecord::File(f) => f.generation,
            InodeRecord::Dir(d) => d.generation,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, InodeRecord::Dir(_))
    }

    pub fn as_dir(&self) -> Option<&DirRecord> {
        match self {
            InodeRecord::Dir(d) => Some(d),
            InodeRecord::File(_) => None,
        }
    }

    pub fn as_dir_mut(&mut self) -> Option<&mut DirRecord> {
        match self {
            InodeRecord::Dir(d) => Some(d),
            InodeRecord::File(_) => None,
        }
    }
}

fn resolve(t: TimeOrNow) -> SystemTime {
    match t {
        TimeOrNow::SpecificTime(t) => t,
        TimeOrNow::Now => SystemTime::now(),
    }
}

/// The attribute subset a `setattr` call may update.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetattrChanges {
    pub mode: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub size: Option<u64>,
    pub atime: Option<TimeOrNow>,
    pub mtime: Option<TimeOrNow>,
}

/// Apply `changes` through an already-open descriptor (the f\* syscall
/// family).
pub fn setattr_file(file: &File, changes: &SetattrChanges) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(size) = changes.size {
        file.set_len(size)?;
    }
    if let Some(mode) = changes.mode {
        file.set_permissions(std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    if changes.uid.is_some() || changes.gid.is_some() {
        std::os::unix::fs::fchown(file, changes.uid, changes.gid)?;
    }
    apply_times_file(file, changes)?;
    Ok(())
}

/// Apply `changes` by path, for inodes without an open handle.
pub fn setattr_path(path: &Path, changes: &SetattrChanges) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    if let Some(size) = changes.size {
        OpenOptions::new().write(true).open(path)?.set_len(size)?;
    }
    if let Some(mode) = changes.mode {
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777))?;
    }
    if changes.uid.is_some() || changes.gid.is_some() {
        std::os::unix::fs::chown(path, changes.uid, changes.gid)?;
    }
    if changes.atime.is_some() || changes.mtime.is_some() {
        let file = File::open(path)?;
        apply_times_file(&file, changes)?;
    }
    Ok(())
}

fn apply_times_file(file: &File, changes: &SetattrChanges) -> io::Result<()> {
    if changes.atime.is_none() && changes.mtime.is_none() {
        return Ok(());
    }
    // futimens sets both values, so fill the missing one from the current
    // state before writing.
    let meta = file.metadata()?;
    let atime = changes
        .atime
        .map(resolve)
        .unwrap_or_else(|| meta.accessed().unwrap_or(UNIX_EPOCH));
    let mtime = changes
        .mtime
        .map(resolve)
        .unwrap_or_else(|| meta.modified().unwrap_or(UNIX_EPOCH));
    let times = std::fs::FileTimes::new().set_accessed(atime).set_modified(mtime);
    file.set_times(times)
}

/// Copy mode, ownership and timestamps from `src` to `dst`, like
/// `shutil.copystat`. Ownership failures are ignored when not running as
/// root.
pub fn copy_stat(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = std::fs::symlink_metadata(src)?;
    std::fs::set_permissions(dst, meta.permissions())?;
    let _ = std::os::unix::fs::chown(dst, Some(meta.uid()), Some(meta.gid()));

    let times = std::fs::FileTimes::new()
        .set_accessed(meta.accessed().unwrap_or(UNIX_EPOCH))
        .set_modified(meta.modified().unwrap_or(UNIX_EPOCH));
    File::open(dst)?.set_times(times)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn children_stay_sorted_and_unique() {
        let dir = TempDir::new().unwrap();
        let attr = getattr_path(dir.path(), 1).unwrap();
        let mut rec = DirRecord::new(attr);
        for ino in [5, 2, 9, 3] {
            rec.insert_child(ino);
        }
        assert_eq!(rec.children(), &[2, 3, 5, 9]);
        assert!(rec.remove_child(5));
        assert!(!rec.remove_child(5));
        assert_eq!(rec.children(), &[2, 3, 9]);
    }

    #[test]
    fn getattr_carries_our_ino() {
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("x");
        std::fs::write(&f, b"hello").unwrap();
        let attr = getattr_path(&f, 42).unwrap();
        assert_eq!(attr.ino, 42);
        assert_eq!(attr.size, 5);
        assert_eq!(attr.kind, FileType::RegularFile);
    }

    #[test]
    fn copy_stat_mirrors_mode_and_times() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("src");
        let dst = dir.path().join("dst");
        let mut f = File::create(&src).unwrap();
        f.write_all(b"data").unwrap();
        drop(f);
        std::fs::set_permissions(&src, std::fs::Permissions::from_mode(0o640)).unwrap();
        std::thread::sleep(Duration::from_millis(10));
        File::create(&dst).unwrap();

        copy_stat(&src, &dst).unwrap();
        let sm = std::fs::metadata(&src).unwrap();
        let dm = std::fs::metadata(&dst).unwrap();
        assert_eq!(sm.permissions().mode() & 0o7777, dm.permissions().mode() & 0o7777);
        assert_eq!(sm.modified().unwrap(), dm.modified().unwrap());
    }

    #[test]
    fn setattr_by_path_truncates_and_chmods() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let f = dir.path().join("t");
        std::fs::write(&f, b"0123456789").unwrap();

        let changes = SetattrChanges {
            size: Some(4),
            mode: Some(0o600),
            ..Default::default()
        };
        setattr_path(&f, &changes).unwrap();
        let meta = std::fs::metadata(&f).unwrap();
        assert_eq!(meta.len(), 4);
        assert_eq!(meta.permissions().mode() & 0o7777, 0o600);
    }
}
