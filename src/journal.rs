//! Write journal.
//!
//! Mutations succeed against the cache first and are recorded here; the
//! source is brought up to date later by replaying the log in order. The
//! journal lives in memory for one mount session. Replay is idempotent at
//! the step level so a partial failure can simply be retried.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::errors::WolfsError;
use crate::fileinfo;
use crate::translator::InodeTranslator;

/// One recorded mutation. Paths are root-relative so replay can re-derive
/// both the cache and the source location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEntry {
    Create { ino: u64, rpath: String, flags: i32 },
    Write { ino: u64, rpath: String, offset: u64, len: u64 },
    Unlink { ino: u64, rpath: String },
    Rename { ino: u64, rpath: String, rpath_new: String },
    Mkdir { ino: u64, rpath: String, mode: u32 },
    Rmdir { ino: u64, rpath: String },
}

impl LogEntry {
    pub fn ino(&self) -> u64 {
        match self {
            LogEntry::Create { ino, .. }
            | LogEntry::Write { ino, .. }
            | LogEntry::Unlink { ino, .. }
            | LogEntry::Rename { ino, .. }
            | LogEntry::Mkdir { ino, .. }
            | LogEntry::Rmdir { ino, .. } => *ino,
        }
    }

    fn is_unlink(&self) -> bool {
        matches!(self, LogEntry::Unlink { .. } | LogEntry::Rmdir { .. })
    }
}

/// Descriptor pair kept open across a run of writes against one file.
struct SyncFds {
    rpath: String,
    cache: File,
    remote: File,
}

pub struct Journal {
    history: Vec<LogEntry>,
    /// inode -> size at the moment it first became dirty.
    dirty_inos: HashMap<u64, u64>,
    /// Net bytes the source must accept on the next flush.
    bytes_unwritten: i64,
    /// Free space on the source, read once at mount.
    src_bytes_avail: u64,
    /// Optional plain-text dump of replayed entries (`--log`).
    log_file: Option<PathBuf>,
}

impl Journal {
    /// Reads the source's free space once. An unusable statvfs (block size
    /// of zero) means the source filesystem is not something we can sync
    /// against.
    pub fn new(source_dir: &Path, log_file: Option<PathBuf>) -> Result<Self, WolfsError> {
        let sv = nix::sys::statvfs::statvfs(source_dir)
            .map_err(|e| WolfsError::Mount(format!("statvfs on {source_dir:?}: {e}")))?;
        if sv.block_size() == 0 {
            return Err(WolfsError::Mount(
                "unknown filesystem (statvfs block size == 0)".into(),
            ));
        }
        Ok(Journal {
            history: Vec::new(),
            dirty_inos: HashMap::new(),
            bytes_unwritten: 0,
            src_bytes_avail: sv.blocks_available() as u64 * sv.block_size() as u64,
            log_file,
        })
    }

    // queries
    // =======

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_dirty(&self, ino: u64) -> bool {
        self.dirty_inos.contains_key(&ino)
    }

    pub fn is_completely_clean(&self) -> bool {
        self.dirty_inos.is_empty()
    }

    pub fn bytes_unwritten(&self) -> i64 {
        self.bytes_unwritten
    }

    pub fn src_bytes_avail(&self) -> u64 {
        self.src_bytes_avail
    }

    /// Can the source still take `size` more bytes once everything pending
    /// lands?
    pub fn src_has_room(&self, size: u64) -> bool {
        self.src_bytes_avail as i64 - self.bytes_unwritten >= size as i64
    }

    /// Cache paths touched by pending WRITE entries and the byte total
    /// they reserve. Eviction must leave these alone: they cannot be
    /// synced and dropped right now.
    pub fn dirty_tmp_paths(&self, trans: &InodeTranslator) -> (Vec<PathBuf>, u64) {
        let mut paths = Vec::new();
        let mut reserved = 0;
        for (i, entry) in self.history.iter().enumerate() {
            if let LogEntry::Write { rpath, len, .. } = entry {
                // renames logged later have moved the cache copy
                let current = Self::cache_location(&self.history, i, rpath);
                paths.push(trans.to_tmp(&current));
                reserved += len;
            }
        }
        (paths, reserved)
    }

    #[cfg(test)]
    pub(crate) fn history(&self) -> &[LogEntry] {
        &self.history
    }

    // logging (called after the cache-side operation succeeded)
    // =========================================================

    fn mark_dirty(&mut self, ino: u64, current_size: u64) {
        // only the original, pre-dirty size is remembered
        self.dirty_inos.entry(ino).or_insert(current_size);
    }

    pub fn log_create(&mut self, ino: u64, rpath: &str, flags: i32) {
        self.mark_dirty(ino, 0);
        self.history.push(LogEntry::Create {
            ino,
            rpath: rpath.to_owned(),
            flags,
        });
    }

    pub fn log_write(&mut self, ino: u64, rpath: &str, offset: u64, len: u64, size_before: u64) {
        self.mark_dirty(ino, size_before);
        self.history.push(LogEntry::Write {
            ino,
            rpath: rpath.to_owned(),
            offset,
            len,
        });
    }

    /// A flush point: fold the net growth of `ino` since the last marking
    /// into the unwritten-byte estimate.
    pub fn log_flush(&mut self, ino: u64, current_size: u64) {
        if let Some(marked) = self.dirty_inos.get_mut(&ino) {
            self.bytes_unwritten += current_size as i64 - *marked as i64;
            *marked = current_size;
        }
    }

    pub fn log_rename(&mut self, ino: u64, rpath_old: &str, rpath_new: &str, size: u64) {
        self.mark_dirty(ino, size);
        self.history.push(LogEntry::Rename {
            ino,
            rpath: rpath_old.to_owned(),
            rpath_new: rpath_new.to_owned(),
        });
    }

    pub fn log_unlink(&mut self, parent_ino: u64, ino: u64, rpath: &str, size: u64) {
        self.mark_dirty(ino, size);
        self.mark_dirty(parent_ino, 0);
        self.src_bytes_avail += size;
        self.history.push(LogEntry::Unlink {
            ino,
            rpath: rpath.to_owned(),
        });
    }

    pub fn log_rmdir(&mut self, parent_ino: u64, ino: u64, rpath: &str) {
        self.mark_dirty(ino, 0);
        self.mark_dirty(parent_ino, 0);
        self.history.push(LogEntry::Rmdir {
            ino,
            rpath: rpath.to_owned(),
        });
    }

    pub fn log_mkdir(&mut self, parent_ino: u64, ino: u64, rpath: &str, mode: u32) {
        self.mark_dirty(ino, 0);
        self.mark_dirty(parent_ino, 0);
        self.history.push(LogEntry::Mkdir {
            ino,
            rpath: rpath.to_owned(),
            mode,
        });
    }

    // replay
    // ======

    /// Collapse the history: an inode whose story ends in UNLINK/RMDIR
    /// contributes only that terminal entry, placed where its first entry
    /// stood, so causal order survives.
    fn compact(&self) -> Vec<LogEntry> {
        let mut last_entry: HashMap<u64, &LogEntry> = HashMap::new();
        for entry in &self.history {
            last_entry.insert(entry.ino(), entry);
        }
        let terminal: HashMap<u64, LogEntry> = last_entry
            .into_iter()
            .filter(|(_, e)| e.is_unlink())
            .map(|(ino, e)| (ino, e.clone()))
            .collect();

        let mut seen: Vec<u64> = Vec::new();
        let mut compacted = Vec::with_capacity(self.history.len());
        for entry in &self.history {
            let ino = entry.ino();
            match terminal.get(&ino) {
                None => compacted.push(entry.clone()),
                Some(term) => {
                    if !seen.contains(&ino) {
                        seen.push(ino);
                        compacted.push(term.clone());
                    }
                }
            }
        }
        compacted
    }

    fn dump_to_log_file(&self, compacted: &[LogEntry]) {
        let Some(path) = &self.log_file else { return };
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut f| {
                for entry in compacted {
                    writeln!(f, "{entry:?}")?;
                }
                Ok(())
            });
        if let Err(e) = result {
            warn!("could not append journal dump to {path:?}: {e}");
        }
    }

    /// Where the bytes behind the entry at `index` live in the cache
    /// *now*: the logged path mapped through every rename that came after
    /// it. The source side, by contrast, is replayed in order and always
    /// matches the logged path.
    fn cache_location(history: &[LogEntry], index: usize, rpath: &str) -> String {
        let mut current = rpath.to_owned();
        for entry in &history[index + 1..] {
            if let LogEntry::Rename { rpath, rpath_new, .. } = entry {
                if current == *rpath {
                    current = rpath_new.clone();
                } else if current.starts_with(rpath)
                    && current.as_bytes().get(rpath.len()) == Some(&b'/')
                {
                    current = format!("{rpath_new}{}", &current[rpath.len()..]);
                }
            }
        }
        current
    }

    /// Replay everything against the source, then clear. On error the
    /// history is left untouched so the flush can be retried once the
    /// underlying condition clears.
    pub fn flush(&mut self, trans: &InodeTranslator) -> io::Result<()> {
        let compacted = self.compact();
        info!("flushing complete journal: {} entries", compacted.len());
        self.dump_to_log_file(&compacted);

        let mut sync: Option<SyncFds> = None;
        let mut i = 0;
        while i < compacted.len() {
            match &compacted[i] {
                LogEntry::Create { rpath, .. } => {
                    // the cache-side create already arbitrated O_EXCL, so
                    // replay stays idempotent by plain create
                    let src = trans.to_src(rpath);
                    OpenOptions::new().write(true).create(true).open(&src)?;
                    i += 1;
                }
                LogEntry::Mkdir { rpath, mode, .. } => {
                    let src = trans.to_src(rpath);
                    use std::os::unix::fs::DirBuilderExt;
                    match fs::DirBuilder::new().mode(*mode).create(&src) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                            // a previous partial replay got here already
                        }
                        Err(e) => return Err(e),
                    }
                    i += 1;
                }
                LogEntry::Unlink { rpath, .. } | LogEntry::Rmdir { rpath, .. } => {
                    Self::replay_unlink(&trans.to_src(rpath))?;
                    i += 1;
                }
                LogEntry::Rename { rpath, rpath_new, .. } => {
                    fs::rename(trans.to_src(rpath), trans.to_src(rpath_new))?;
                    i += 1;
                }
                LogEntry::Write { rpath, .. } => {
                    // consume the whole contiguous run against this path
                    let path = rpath.clone();
                    let cache_rpath = Self::cache_location(&compacted, i, &path);
                    let mut writes: Vec<(u64, u64)> = Vec::new();
                    while i < compacted.len() {
                        match &compacted[i] {
                            LogEntry::Write { rpath, offset, len, .. } if *rpath == path => {
                                writes.push((*offset, *len));
                                i += 1;
                            }
                            _ => break,
                        }
                    }
                    self.replay_writes(trans, &cache_rpath, &path, &writes, &mut sync)?;
                }
            }
        }
        if let Some(fds) = sync.take() {
            fds.remote.sync_all()?;
        }

        info!("finished flushing complete journal");
        self.history.clear();
        self.dirty_inos.clear();
        self.bytes_unwritten = 0;
        Ok(())
    }

    fn replay_unlink(src: &Path) -> io::Result<()> {
        match fs::remove_file(src) {
            Ok(()) => Ok(()),
            Err(e) if e.raw_os_error() == Some(libc::EISDIR) => fs::remove_dir(src),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if !src.to_string_lossy().contains(".Trash") {
                    warn!("{src:?} vanished before replay, ignoring");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply a batch of `(offset, len)` copies from the cache file to its
    /// source counterpart, then mirror the cache file's metadata. The
    /// descriptor pair persists across batches that hit the same file.
    /// `cache_rpath` may differ from `remote_rpath` when a later rename
    /// moved the cache copy.
    fn replay_writes(
        &self,
        trans: &InodeTranslator,
        cache_rpath: &str,
        remote_rpath: &str,
        writes: &[(u64, u64)],
        sync: &mut Option<SyncFds>,
    ) -> io::Result<()> {
        let cache_path = trans.to_tmp(cache_rpath);
        let remote_path = trans.to_src(remote_rpath);

        let switch = match sync {
            Some(fds) => fds.rpath != remote_rpath,
            None => true,
        };
        if switch {
            if let Some(old) = sync.take() {
                old.remote.sync_all()?;
            }
            let cache = File::open(&cache_path)?;
            let remote = OpenOptions::new().read(true).write(true).open(&remote_path)?;
            *sync = Some(SyncFds {
                rpath: remote_rpath.to_owned(),
                cache,
                remote,
            });
        }
        let fds = sync.as_ref().expect("descriptor pair installed above");

        let mut buf = Vec::new();
        for &(offset, len) in writes {
            buf.resize(len as usize, 0);
            let n = fds.cache.read_at(&mut buf, offset)?;
            fds.remote.write_all_at(&buf[..n], offset)?;
        }

        // carrying the attributes over here spares us from journaling
        // setattr calls
        fileinfo::copy_stat(&cache_path, &remote_path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::translator::MountDirs;
    use tempfile::TempDir;

    struct Fixture {
        src: TempDir,
        tmp: TempDir,
        _mnt: TempDir,
        trans: InodeTranslator,
    }

    fn fixture() -> (Fixture, Journal) {
        let src = TempDir::new().unwrap();
        let tmp = TempDir::new().unwrap();
        let mnt = TempDir::new().unwrap();
        let dirs = MountDirs::new(src.path(), tmp.path(), mnt.path()).unwrap();
        let trans = InodeTranslator::new(dirs);
        let journal = Journal::new(src.path(), None).unwrap();
        (Fixture { src, tmp, _mnt: mnt, trans }, journal)
    }

    fn cache_file(fx: &Fixture, rpath: &str, data: &[u8]) {
        let p = fx.trans.to_tmp(rpath);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        fs::write(p, data).unwrap();
    }

    #[test]
    fn create_and_writes_reach_the_source() {
        let (fx, mut journal) = fixture();
        cache_file(&fx, "/x", b"hello!");

        journal.log_create(10, "/x", libc::O_WRONLY | libc::O_CREAT);
        journal.log_write(10, "/x", 0, 5, 0);
        journal.log_write(10, "/x", 5, 1, 5);
        assert!(journal.is_dirty(10));
        assert!(!fx.trans.to_src("/x").exists());

        journal.flush(&fx.trans).unwrap();

        assert_eq!(fs::read(fx.src.path().join("x")).unwrap(), b"hello!");
        assert!(journal.is_empty());
        assert!(journal.is_completely_clean());
        assert_eq!(journal.bytes_unwritten(), 0);
    }

    #[test]
    fn flush_mirrors_cache_mode_onto_source() {
        use std::os::unix::fs::PermissionsExt;
        let (fx, mut journal) = fixture();
        cache_file(&fx, "/m", b"abc");
        fs::set_permissions(
            fx.trans.to_tmp("/m"),
            fs::Permissions::from_mode(0o640),
        )
        .unwrap();

        journal.log_create(3, "/m", libc::O_WRONLY | libc::O_CREAT);
        journal.log_write(3, "/m", 0, 3, 0);
        journal.flush(&fx.trans).unwrap();

        let mode = fs::metadata(fx.src.path().join("m")).unwrap().permissions().mode();
        assert_eq!(mode & 0o7777, 0o640);
    }

    #[test]
    fn unlink_then_recreate_compacts_the_first_lifecycle() {
        let (fx, mut journal) = fixture();
        cache_file(&fx, "/y", b"twenty bytes of data");

        // first lifecycle, ino 5: created, written, removed again
        journal.log_create(5, "/y", libc::O_WRONLY | libc::O_CREAT);
        journal.log_write(5, "/y", 0, 10, 0);
        journal.log_unlink(1, 5, "/y", 10);
        // second lifecycle under a fresh ino
        journal.log_create(6, "/y", libc::O_WRONLY | libc::O_CREAT);
        journal.log_write(6, "/y", 0, 20, 0);

        journal.flush(&fx.trans).unwrap();
        assert_eq!(fs::read(fx.src.path().join("y")).unwrap().len(), 20);
        assert!(journal.is_empty());
    }

    #[test]
    fn compaction_keeps_only_the_terminal_unlink() {
        let (fx, mut journal) = fixture();
        journal.log_create(5, "/gone", 0);
        journal.log_write(5, "/gone", 0, 4, 0);
        journal.log_unlink(1, 5, "/gone", 4);
        journal.log_mkdir(1, 7, "/kept", 0o755);

        let compacted = journal.compact();
        assert_eq!(compacted.len(), 2);
        assert!(matches!(compacted[0], LogEntry::Unlink { ino: 5, .. }));
        assert!(matches!(compacted[1], LogEntry::Mkdir { ino: 7, .. }));
        // compaction is pure; the history itself is untouched
        assert_eq!(journal.history().len(), 4);
        let _ = fx;
    }

    #[test]
    fn mkdir_and_rename_replay_in_order() {
        let (fx, mut journal) = fixture();
        fs::create_dir(fx.trans.to_tmp("/d")).unwrap();
        cache_file(&fx, "/d/f", b"zz");

        journal.log_mkdir(1, 2, "/d", 0o750);
        journal.log_create(3, "/d/f", libc::O_WRONLY | libc::O_CREAT);
        journal.log_write(3, "/d/f", 0, 2, 0);
        journal.log_rename(3, "/d/f", "/d/g", 2);
        // the cache was renamed at operation time
        fs::rename(fx.trans.to_tmp("/d/f"), fx.trans.to_tmp("/d/g")).unwrap();

        journal.flush(&fx.trans).unwrap();
        assert!(fx.src.path().join("d").is_dir());
        assert!(!fx.src.path().join("d/f").exists());
        assert_eq!(fs::read(fx.src.path().join("d/g")).unwrap(), b"zz");
    }

    #[test]
    fn unlink_of_never_synced_trash_is_absorbed() {
        let (fx, mut journal) = fixture();
        journal.log_unlink(1, 9, "/.Trash/junk", 0);
        journal.flush(&fx.trans).unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn failed_replay_preserves_history_for_retry() {
        let (fx, mut journal) = fixture();
        // a WRITE whose cache file is missing cannot be replayed
        journal.log_write(4, "/absent", 0, 3, 0);
        assert!(journal.flush(&fx.trans).is_err());
        assert_eq!(journal.len(), 1);
        assert!(journal.is_dirty(4));

        // once the cache file appears (and its source target exists) the
        // same history flushes cleanly
        cache_file(&fx, "/absent", b"abc");
        fs::write(fx.trans.to_src("/absent"), b"").unwrap();
        journal.flush(&fx.trans).unwrap();
        assert!(journal.is_empty());
    }

    #[test]
    fn flush_points_accumulate_net_byte_deltas() {
        let (fx, mut journal) = fixture();
        let _ = &fx;
        journal.log_write(4, "/f", 0, 100, 50); // file was 50 bytes when dirtied
        journal.log_flush(4, 100);
        assert_eq!(journal.bytes_unwritten(), 50);
        journal.log_write(4, "/f", 100, 20, 100);
        journal.log_flush(4, 120);
        assert_eq!(journal.bytes_unwritten(), 70);
    }

    #[test]
    fn unlink_returns_bytes_to_the_source_budget() {
        let (fx, mut journal) = fixture();
        let _ = &fx;
        let before = journal.src_bytes_avail();
        journal.log_unlink(1, 5, "/big", 4096);
        assert_eq!(journal.src_bytes_avail(), before + 4096);
    }
}
