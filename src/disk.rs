//! Bounded cache manager.
//!
//! Tracks which files currently have a copy under the cache directory, how
//! many bytes they occupy, and in what order they fall out when space runs
//! short. Eviction is strict least-recently-used on the configured clock
//! (mtime when the source is mounted `noatime`, else atime) at seconds
//! precision; ties break in insertion order.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, MetadataExt};
use std::path::{Path, PathBuf};

use log::{debug, error, warn};

use crate::errors::WolfsError;
use crate::fileinfo;
use crate::translator::InodeTranslator;

pub const MEGABYTE: u64 = 1024 * 1024;

/// Fraction of `max_size` at which background copy-in stops.
pub const DEFAULT_CACHE_THRESHOLD: f64 = 0.99;

#[derive(Debug)]
pub struct Disk {
    pub trans: InodeTranslator,
    max_size: u64,
    threshold: f64,
    min_dir_size: u64,
    current_size: u64,
    /// `true` selects mtime as the LRU clock (source mounted noatime).
    use_mtime: bool,
    /// access-time seconds -> entries `(rpath, size)`; ties keep insertion
    /// order.
    by_time: BTreeMap<i64, Vec<(String, u64)>>,
    path_timestamp: HashMap<String, i64>,
    cached_inos: HashSet<u64>,
}

impl Disk {
    /// `max_cache_mb` is the cache ceiling in MiB. Probes the host for the
    /// on-disk size of an empty directory once, by creating and removing a
    /// scratch directory under the cache root.
    pub fn new(
        trans: InodeTranslator,
        max_cache_mb: u64,
        noatime: bool,
        threshold: f64,
    ) -> io::Result<Self> {
        let probe = trans.path_spaces().cache_dir().join("wolfs_size_probe");
        fs::create_dir(&probe)?;
        let min_dir_size = fs::metadata(&probe)?.size();
        fs::remove_dir(&probe)?;

        Ok(Disk {
            trans,
            max_size: max_cache_mb * MEGABYTE,
            threshold,
            min_dir_size,
            current_size: 0,
            use_mtime: noatime,
            by_time: BTreeMap::new(),
            path_timestamp: HashMap::new(),
            cached_inos: HashSet::new(),
        })
    }

    pub fn max_size(&self) -> u64 {
        self.max_size
    }

    pub fn current_size(&self) -> u64 {
        self.current_size
    }

    pub fn min_dir_size(&self) -> u64 {
        self.min_dir_size
    }

    pub fn is_cached(&self, ino: u64) -> bool {
        self.cached_inos.contains(&ino)
    }

    pub fn tracked_count(&self) -> usize {
        self.by_time.values().map(Vec::len).sum()
    }

    pub(crate) fn timestamp_of(&self, meta: &fs::Metadata) -> i64 {
        if self.use_mtime {
            meta.mtime()
        } else {
            meta.atime()
        }
    }

    // fullness
    // ========

    /// Would `size` more bytes still fit below the ceiling?
    pub fn can_reserve(&self, size: u64) -> bool {
        size + self.current_size <= self.max_size
    }

    /// Like [`Disk::can_reserve`], but accounts for cache-side parent
    /// directories that do not exist yet: each missing ancestor will cost
    /// one empty directory.
    pub fn can_store(&self, path: &Path) -> io::Result<bool> {
        let src = self.trans.to_src(path);
        assert!(
            !src.is_symlink(),
            "softlinks are currently not implemented: {src:?}"
        );

        let size = match fs::symlink_metadata(&src) {
            Ok(meta) => meta.size(),
            // files created while offline exist only under the cache
            Err(_) => fs::symlink_metadata(self.trans.to_tmp(path))?.size(),
        };

        let mut in_between = 0;
        let mut cursor = self.trans.to_tmp(path);
        while let Some(parent) = cursor.parent() {
            if parent.exists() {
                break;
            }
            in_between += self.min_dir_size;
            cursor = parent.to_path_buf();
        }

        Ok(size + in_between + self.current_size <= self.max_size)
    }

    pub fn is_filled_by(&self, percent: f64) -> bool {
        assert!((0.0..=1.0).contains(&percent), "fill fraction must be in [0, 1]");
        self.current_size as f64 / self.max_size as f64 >= percent
    }

    pub fn is_full(&self, use_threshold: bool) -> bool {
        self.is_filled_by(if use_threshold { self.threshold } else { 1.0 })
    }

    // book-keeping
    // ============

    /// Register `path` in the residency index and reserve its bytes.
    /// Stats the source first; files that only exist in the cache yet
    /// (fresh creates) fall back to their cache copy. Returns the inode,
    /// allocated through the translator (reusing `reuse_ino` if non-zero).
    pub fn track(&mut self, path: &Path, reuse_ino: u64) -> io::Result<u64> {
        let rpath = self.trans.to_root(path);
        if rpath == "/" {
            // the cache root is permanent, never an eviction candidate
            return Ok(crate::translator::ROOT_INODE);
        }
        if self.path_timestamp.contains_key(&rpath) {
            // already tracked; don't double-reserve its bytes
            return Ok(self.trans.path_to_ino(&rpath, reuse_ino));
        }
        let src = self.trans.to_src(&rpath);
        let meta = match fs::symlink_metadata(&src) {
            Ok(meta) => meta,
            Err(_) => fs::symlink_metadata(self.trans.to_tmp(&rpath))?,
        };

        let timestamp = self.timestamp_of(&meta);
        let size = meta.size();
        let ino = self.trans.path_to_ino(&rpath, reuse_ino);

        self.by_time.entry(timestamp).or_default().push((rpath.clone(), size));
        self.path_timestamp.insert(rpath, timestamp);
        self.cached_inos.insert(ino);
        self.current_size += size;
        Ok(ino)
    }

    /// Inverse of [`Disk::track`]: drop the entry and release its bytes.
    /// Unknown paths are ignored.
    pub fn untrack(&mut self, path: &Path) {
        let rpath = self.trans.to_root(path);
        let Some(timestamp) = self.path_timestamp.remove(&rpath) else {
            return;
        };

        let Some(entries) = self.by_time.get_mut(&timestamp) else {
            error!("residency index desync: no by_time slot for {rpath}");
            return;
        };
        let Some(idx) = entries.iter().position(|(p, _)| *p == rpath) else {
            error!("residency index desync: {rpath} missing from slot {timestamp}");
            return;
        };
        let (_, size) = entries.remove(idx);
        if entries.is_empty() {
            self.by_time.remove(&timestamp);
        }

        if let Some(ino) = self.trans.lookup_rpath(&rpath) {
            self.cached_inos.remove(&ino);
        }
        self.current_size -= size;
    }

    /// Move every tracked entry under `old_rpath` to `new_rpath`, keeping
    /// timestamps and sizes. Companion of a rename.
    pub fn retarget_prefix(&mut self, old_rpath: &str, new_rpath: &str) {
        let affected: Vec<(String, i64)> = self
            .path_timestamp
            .iter()
            .filter(|(p, _)| {
                p.as_str() == old_rpath
                    || (p.starts_with(old_rpath)
                        && p.as_bytes().get(old_rpath.len()) == Some(&b'/'))
            })
            .map(|(p, &t)| (p.clone(), t))
            .collect();

        for (old, ts) in affected {
            let new = format!("{new_rpath}{}", &old[old_rpath.len()..]);
            self.path_timestamp.remove(&old);
            self.path_timestamp.insert(new.clone(), ts);
            if let Some(entries) = self.by_time.get_mut(&ts) {
                for entry in entries.iter_mut() {
                    if entry.0 == old {
                        entry.0 = new.clone();
                    }
                }
            }
        }
    }

    // copy-in and eviction
    // ====================

    /// Recreate the directory chain of `src` below the cache root,
    /// mirroring each source directory's mode and metadata. Returns the
    /// accumulated size of the directories created and their source paths,
    /// deepest last.
    pub fn mkdir_p(&self, src: &Path) -> io::Result<(u64, Vec<PathBuf>)> {
        let mut added_size = 0;
        let mut added: Vec<PathBuf> = Vec::new();
        self.mkdir_p_inner(src, &mut added_size, &mut added)?;
        Ok((added_size, added))
    }

    fn mkdir_p_inner(
        &self,
        src: &Path,
        added_size: &mut u64,
        added: &mut Vec<PathBuf>,
    ) -> io::Result<()> {
        let dst = self.trans.to_tmp(src);
        if dst.exists() {
            return Ok(());
        }
        if let Some(parent) = src.parent() {
            if !self.trans.to_tmp(parent).exists() {
                self.mkdir_p_inner(parent, added_size, added)?;
            }
        }

        let meta = fs::metadata(src)?;
        fs::DirBuilder::new().mode(meta.mode()).create(&dst)?;
        *added_size += meta.size();
        added.push(src.to_path_buf());
        fileinfo::copy_stat(src, &dst)?;
        Ok(())
    }

    /// Copy a file (or the directory spine leading to one) from the source
    /// into the cache, preserving metadata, evicting under pressure when
    /// `force` is set. Paths listed in `open_paths` are never evicted.
    ///
    /// Errors: [`WolfsError::NotEnoughSpace`] when unforced and short on
    /// room, [`WolfsError::CacheExhausted`] when eviction ran dry.
    pub fn cp2cache(
        &mut self,
        src_path: &Path,
        force: bool,
        open_paths: &[PathBuf],
    ) -> Result<PathBuf, WolfsError> {
        assert_eq!(
            self.trans.to_src(src_path),
            src_path,
            "cp2cache input must carry the source prefix"
        );

        self.make_room_for_path(force, src_path, open_paths)?;

        if !self.can_store(src_path)? {
            let size = fs::symlink_metadata(src_path).map(|m| m.size()).unwrap_or(0);
            return Err(WolfsError::NotEnoughSpace {
                needed: size,
                available: self.max_size - self.current_size,
            });
        }

        let dst = self.trans.to_tmp(src_path);
        let mut added_dirs: Vec<PathBuf> = Vec::new();
        if src_path == dst {
            // same tree; nothing to copy
            return Ok(dst);
        }

        if src_path.is_dir() {
            (_, added_dirs) = self.mkdir_p(src_path)?;
        } else if src_path.is_file() {
            if let Some(parent) = src_path.parent() {
                if !dst.parent().map(Path::exists).unwrap_or(false) {
                    (_, added_dirs) = self.mkdir_p(parent)?;
                }
            }
            fs::copy(src_path, &dst)?;
            fileinfo::copy_stat(src_path, &dst)?;
        } else {
            error!("unrecognized file type, ignoring: {src_path:?}");
            return Err(WolfsError::Io(io::Error::other(format!(
                "unrecognized file type: {src_path:?}"
            ))));
        }

        for dir in &added_dirs {
            self.track(dir, 0)?;
        }
        if !src_path.is_dir() || added_dirs.is_empty() {
            self.track(src_path, 0)?;
        }
        debug!("cached {src_path:?} -> {dst:?} ({} B used)", self.current_size);
        Ok(dst)
    }

    /// Evict oldest-first until `fits` is satisfied. Entries whose cache
    /// path is in `open_paths` are set aside untouched and re-inserted
    /// afterwards; they keep their reserved bytes.
    fn evict_until(
        &mut self,
        open_paths: &[PathBuf],
        fits: impl Fn(&Self) -> io::Result<bool>,
    ) -> Result<(), WolfsError> {
        let mut deferred: Vec<(i64, String, u64)> = Vec::new();
        let result = loop {
            if fits(self)? {
                break Ok(());
            }
            let Some((timestamp, rpath, size)) = self.pop_oldest() else {
                warn!("evicted every candidate and still could not make room");
                break Err(WolfsError::CacheExhausted);
            };

            let cpath = self.trans.to_tmp(&rpath);
            if open_paths.contains(&cpath) {
                // in use; cannot sync and close it from here
                deferred.push((timestamp, rpath, size));
                continue;
            }

            if cpath.is_dir() {
                if let Err(e) = fs::remove_dir(&cpath) {
                    // non-empty: entries only change when files come and
                    // go, so leave the bytes accounted and move on
                    warn!("evicting directory {cpath:?} failed: {e}");
                    continue;
                }
            } else {
                match fs::remove_file(&cpath) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        warn!("evicting {cpath:?}: already gone");
                    }
                    Err(e) => {
                        self.reinsert(timestamp, rpath, size);
                        break Err(WolfsError::Io(e));
                    }
                }
            }

            if let Some(ino) = self.trans.lookup_rpath(&rpath) {
                self.cached_inos.remove(&ino);
            }
            self.current_size -= size;
            debug!("evicted {rpath} ({size} B)");
        };

        for (timestamp, rpath, size) in deferred {
            self.reinsert(timestamp, rpath, size);
        }
        result
    }

    fn make_room_for_path(
        &mut self,
        force: bool,
        path: &Path,
        open_paths: &[PathBuf],
    ) -> Result<(), WolfsError> {
        if !force {
            return Ok(());
        }
        let target = path.to_path_buf();
        self.evict_until(open_paths, move |disk| disk.can_store(&target))
    }

    /// Public eviction entry point for callers that only know a byte count
    /// (directory creation under pressure).
    pub fn make_room_for_bytes(
        &mut self,
        bytes: u64,
        open_paths: &[PathBuf],
    ) -> Result<(), WolfsError> {
        self.evict_until(open_paths, move |disk| Ok(disk.can_reserve(bytes)))
    }

    /// Remove and return the LRU head: oldest timestamp, first entry of
    /// its collision list. Size stays accounted; callers finish the
    /// untracking.
    fn pop_oldest(&mut self) -> Option<(i64, String, u64)> {
        let (&timestamp, _) = self.by_time.iter().next()?;
        let entries = self.by_time.get_mut(&timestamp).expect("key exists");
        let (rpath, size) = entries.remove(0);
        if entries.is_empty() {
            self.by_time.remove(&timestamp);
        }
        self.path_timestamp.remove(&rpath);
        Some((timestamp, rpath, size))
    }

    fn reinsert(&mut self, timestamp: i64, rpath: String, size: u64) {
        self.path_timestamp.insert(rpath.clone(), timestamp);
        self.by_time.entry(timestamp).or_default().push((rpath, size));
    }

    /// Forget everything and re-index whatever the cache directory holds.
    /// Used after a restart without a usable snapshot or journal.
    pub fn rebuild(&mut self) -> io::Result<()> {
        self.by_time.clear();
        self.path_timestamp.clear();
        self.cached_inos.clear();
        self.current_size = 0;

        fn walk(disk: &mut Disk, dir: &Path) -> io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let entry = entry?;
                let path = entry.path();
                if path.is_symlink() {
                    continue;
                }
                disk.track(&path, 0)?;
                if path.is_dir() {
                    walk(disk, &path)?;
                }
            }
            Ok(())
        }
        let root = self.trans.path_spaces().cache_dir().to_path_buf();
        walk(self, &root)?;
        debug!("{}", self.summary());
        Ok(())
    }

    pub fn summary(&self) -> String {
        format!(
            "cache holds {} entries, {:.4}% full ({} / {} B)",
            self.tracked_count(),
            100.0 * self.current_size as f64 / self.max_size as f64,
            self.current_size,
            self.max_size
        )
    }

    #[cfg(test)]
    pub(crate) fn tracked_bytes(&self) -> u64 {
        self.by_time.values().flatten().map(|(_, s)| s).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::MountDirs;
    use std::fs::File;
    use std::io::Write;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    struct Fixture {
        src: TempDir,
        tmp: TempDir,
        _mnt: TempDir,
    }

    fn fixture(max_mb: u64) -> (Fixture, Disk) {
        let fx = Fixture {
            src: TempDir::new().unwrap(),
            tmp: TempDir::new().unwrap(),
            _mnt: TempDir::new().unwrap(),
        };
        let dirs = MountDirs::new(fx.src.path(), fx.tmp.path(), fx._mnt.path()).unwrap();
        let disk = Disk::new(InodeTranslator::new(dirs), max_mb, true, 0.99).unwrap();
        (fx, disk)
    }

    fn src_file(fx: &Fixture, name: &str, len: usize) -> PathBuf {
        let p = fx.src.path().join(name);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = File::create(&p).unwrap();
        f.write_all(&vec![0u8; len]).unwrap();
        p
    }

    /// Backdate a file's mtime so eviction order is deterministic.
    fn set_mtime_secs_ago(path: &Path, ago: u64) {
        let t = std::time::SystemTime::now() - std::time::Duration::from_secs(ago);
        let times = std::fs::FileTimes::new().set_accessed(t).set_modified(t);
        File::open(path).unwrap().set_times(times).unwrap();
    }

    #[test]
    fn track_untrack_roundtrip_restores_state() {
        let (fx, mut disk) = fixture(1);
        let f = src_file(&fx, "a.bin", 1000);

        assert_eq!(disk.current_size(), 0);
        let ino = disk.track(&f, 0).unwrap();
        assert!(disk.is_cached(ino));
        assert_eq!(disk.current_size(), 1000);
        assert_eq!(disk.tracked_bytes(), disk.current_size());

        disk.untrack(&f);
        assert!(!disk.is_cached(ino));
        assert_eq!(disk.current_size(), 0);
        assert_eq!(disk.tracked_count(), 0);
        assert_eq!(disk.tracked_bytes(), 0);
    }

    #[test]
    fn timestamp_collisions_coalesce() {
        let (fx, mut disk) = fixture(1);
        let a = src_file(&fx, "a", 10);
        let b = src_file(&fx, "b", 20);
        set_mtime_secs_ago(&a, 100);
        set_mtime_secs_ago(&b, 100);

        disk.track(&a, 0).unwrap();
        disk.track(&b, 0).unwrap();
        assert_eq!(disk.tracked_count(), 2);
        assert_eq!(disk.current_size(), 30);
        assert_eq!(disk.tracked_bytes(), 30);

        disk.untrack(&a);
        assert_eq!(disk.tracked_count(), 1);
        assert_eq!(disk.current_size(), 20);
    }

    #[test]
    fn can_reserve_respects_the_ceiling() {
        let (fx, mut disk) = fixture(1);
        assert!(disk.can_reserve(MEGABYTE));
        assert!(!disk.can_reserve(MEGABYTE + 1));

        let f = src_file(&fx, "a", 1000);
        disk.track(&f, 0).unwrap();
        assert!(disk.can_reserve(MEGABYTE - 1000));
        assert!(!disk.can_reserve(MEGABYTE - 999));
    }

    #[test]
    fn can_store_accounts_missing_ancestors() {
        let (fx, disk) = fixture(1);
        let nested = src_file(&fx, "a/b/c/file", 1024);
        // the file alone fits, and so do the three directories that have
        // to appear on the cache side
        assert!(disk.can_store(&nested).unwrap());

        let big = src_file(&fx, "big", MEGABYTE as usize + 1);
        assert!(!disk.can_store(&big).unwrap());
    }

    #[test]
    fn cp2cache_copies_content_and_metadata() {
        let (fx, mut disk) = fixture(4);
        let f = src_file(&fx, "dir/data.bin", 4096);
        set_mtime_secs_ago(&f, 30);

        let dst = disk.cp2cache(&f, false, &[]).unwrap();
        assert!(dst.starts_with(fx.tmp.path()));
        assert_eq!(fs::read(&dst).unwrap().len(), 4096);
        let sm = fs::metadata(&f).unwrap();
        let dm = fs::metadata(&dst).unwrap();
        assert_eq!(sm.modified().unwrap(), dm.modified().unwrap());
        assert_eq!(
            sm.permissions().mode() & 0o7777,
            dm.permissions().mode() & 0o7777
        );
        // the spine directory got tracked along with the file
        assert!(disk.current_size() >= 4096);
        assert_eq!(disk.tracked_bytes(), disk.current_size());
    }

    #[test]
    fn cp2cache_without_force_reports_shortage() {
        let (fx, mut disk) = fixture(1);
        let big = src_file(&fx, "big", MEGABYTE as usize + 1);
        match disk.cp2cache(&big, false, &[]) {
            Err(WolfsError::NotEnoughSpace { .. }) => {}
            other => panic!("expected NotEnoughSpace, got {other:?}"),
        }
    }

    #[test]
    fn lru_eviction_removes_oldest_first() {
        let (fx, mut disk) = fixture(1);
        let kib300 = 300 * 1024;
        let files: Vec<PathBuf> = (1..=4)
            .map(|i| {
                let f = src_file(&fx, &format!("f{i}"), kib300);
                set_mtime_secs_ago(&f, 500 - i as u64 * 100); // f1 oldest
                f
            })
            .collect();
        for f in &files[..3] {
            disk.cp2cache(f, false, &[]).unwrap();
        }

        // fourth file needs room: f1 must go, f2 and f3 stay
        disk.cp2cache(&files[3], true, &[]).unwrap();
        assert!(!disk.trans.to_tmp(&files[0]).exists());
        assert!(disk.trans.to_tmp(&files[1]).exists());
        assert!(disk.trans.to_tmp(&files[2]).exists());
        assert!(disk.trans.to_tmp(&files[3]).exists());
        assert!(disk.current_size() <= MEGABYTE);
        assert_eq!(disk.tracked_bytes(), disk.current_size());
    }

    #[test]
    fn eviction_skips_open_paths() {
        let (fx, mut disk) = fixture(1);
        let kib400 = 400 * 1024;
        let oldest = src_file(&fx, "oldest", kib400);
        let newer = src_file(&fx, "newer", kib400);
        set_mtime_secs_ago(&oldest, 400);
        set_mtime_secs_ago(&newer, 200);
        disk.cp2cache(&oldest, false, &[]).unwrap();
        disk.cp2cache(&newer, false, &[]).unwrap();

        let pinned = disk.trans.to_tmp(&oldest);
        let incoming = src_file(&fx, "incoming", kib400);
        disk.cp2cache(&incoming, true, &[pinned.clone()]).unwrap();

        assert!(pinned.exists(), "open file must not be evicted");
        assert!(!disk.trans.to_tmp(&newer).exists());
        assert_eq!(disk.tracked_bytes(), disk.current_size());
    }

    #[test]
    fn eviction_exhaustion_is_a_quota_error() {
        let (fx, mut disk) = fixture(1);
        let big = src_file(&fx, "big", MEGABYTE as usize + 1);
        match disk.cp2cache(&big, true, &[]) {
            Err(WolfsError::CacheExhausted) => {}
            other => panic!("expected CacheExhausted, got {other:?}"),
        }
    }

    #[test]
    fn rebuild_restores_residency_from_cache_dir() {
        let (fx, mut disk) = fixture(4);
        let f = src_file(&fx, "d/file", 2048);
        disk.cp2cache(&f, false, &[]).unwrap();
        let before = disk.current_size();

        disk.rebuild().unwrap();
        assert_eq!(disk.current_size(), before);
        assert!(disk.trans.to_tmp(&f).exists());
        assert_eq!(disk.tracked_bytes(), disk.current_size());
    }

    #[test]
    fn retarget_prefix_follows_renames() {
        let (fx, mut disk) = fixture(4);
        let f = src_file(&fx, "dir/a", 512);
        disk.cp2cache(&f, false, &[]).unwrap();
        let before = disk.current_size();

        disk.retarget_prefix("/dir", "/moved");
        // untracking through the new name releases the bytes
        disk.untrack(Path::new("/moved/a"));
        assert_eq!(disk.current_size(), before - 512);
    }
}
