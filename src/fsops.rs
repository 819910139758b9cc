//! Operation dispatcher.
//!
//! [`WolfsFs`] glues the FUSE request stream to the four core layers:
//! translator, record store, cache and journal. Every operation is a thin
//! `do_*` method returning `Result<_, errno>`; the [`fuser::Filesystem`]
//! impl at the bottom only unpacks requests and packs replies, so the
//! whole dispatcher can be driven directly from tests without a mount.

use std::collections::BinaryHeap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use fuser::{
    FileAttr, FileType, Filesystem, KernelConfig, ReplyAttr, ReplyCreate, ReplyData,
    ReplyDirectory, ReplyEmpty, ReplyEntry, ReplyOpen, ReplyStatfs, ReplyWrite, ReplyXattr,
    Request, TimeOrNow,
};
use libc::c_int;
use log::{debug, error, info, warn};

use crate::disk::{Disk, DEFAULT_CACHE_THRESHOLD};
use crate::errors::{errno_of, FsResult, WolfsError};
use crate::fileinfo::{self, SetattrChanges, ATTR_TTL, BLOCK_SIZE, NEGATIVE_TTL};
use crate::journal::Journal;
use crate::remote::{AlwaysOnline, Remote};
use crate::snapshot;
use crate::translator::{InodeTranslator, MountDirs, ROOT_INODE};
use crate::vfs::Vfs;

/// Default cache ceiling in MiB.
pub const DEFAULT_CACHE_SIZE_MB: u64 = 512;

/// Mount-time knobs, mostly straight from the CLI.
#[derive(Debug, Clone)]
pub struct WolfsOptions {
    pub max_cache_mb: u64,
    /// Source is mounted `noatime`, so mtime drives the LRU clock.
    pub noatime: bool,
    /// Inode-table snapshot kept between mounts.
    pub metadb: Option<PathBuf>,
    /// Plain-text dump of replayed journal entries.
    pub journal_log: Option<PathBuf>,
}

impl Default for WolfsOptions {
    fn default() -> Self {
        WolfsOptions {
            max_cache_mb: DEFAULT_CACHE_SIZE_MB,
            noatime: true,
            metadb: None,
            journal_log: None,
        }
    }
}

/// Result of a lookup: a real entry or a cacheable miss.
#[derive(Debug)]
pub enum Lookup {
    Found {
        attr: FileAttr,
        ttl: Duration,
        generation: u64,
    },
    Negative,
}

/// One row handed to the kernel's readdir buffer.
#[derive(Debug)]
pub struct DirEntryOut {
    pub ino: u64,
    pub kind: FileType,
    pub name: String,
}

/// `statvfs` of the cache, shaped for the FUSE reply.
#[derive(Debug)]
pub struct StatfsOut {
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub bsize: u32,
    pub namelen: u32,
    pub frsize: u32,
}

pub struct WolfsFs {
    disk: Disk,
    vfs: Vfs,
    journal: Journal,
    remote: Box<dyn Remote>,
    metadb: Option<PathBuf>,
}

impl WolfsFs {
    /// Build the filesystem over a local, always-reachable source.
    pub fn new(dirs: MountDirs, opts: WolfsOptions) -> Result<Self, WolfsError> {
        Self::with_remote(dirs, opts, Box::new(AlwaysOnline))
    }

    /// Build the filesystem with an explicit remote collaborator.
    ///
    /// Loads the `--metadb` snapshot when possible and falls back to a
    /// full index of the source tree; either way the cache is then warmed
    /// with the most recently used files until the threshold is reached.
    pub fn with_remote(
        dirs: MountDirs,
        opts: WolfsOptions,
        remote: Box<dyn Remote>,
    ) -> Result<Self, WolfsError> {
        let source_dir = dirs.source_dir.clone();
        let cache_dir = dirs.cache_dir.clone();

        let mut trans = InodeTranslator::new(dirs);
        let restored = match &opts.metadb {
            Some(path) => snapshot::load(path, &mut trans),
            None => None,
        };
        let from_snapshot = restored.is_some();

        let journal = Journal::new(&source_dir, opts.journal_log.clone())?;
        let disk = Disk::new(trans, opts.max_cache_mb, opts.noatime, DEFAULT_CACHE_THRESHOLD)?;
        let vfs = match restored {
            Some(vfs) => vfs,
            None => {
                let root_attr = fileinfo::getattr_path(&cache_dir, ROOT_INODE)
                    .map_err(|e| WolfsError::Mount(format!("stat {cache_dir:?}: {e}")))?;
                Vfs::new(root_attr)
            }
        };

        let mut fs = WolfsFs {
            disk,
            vfs,
            journal,
            remote,
            metadb: opts.metadb,
        };

        if from_snapshot {
            // the journal did not survive the restart; residency has to be
            // rebuilt from what the cache directory actually holds
            fs.disk.rebuild()?;
        } else {
            let queue = fs.index_source()?;
            fs.copy_recent_into_cache(queue);
        }
        info!("{}", fs.disk.summary());
        Ok(fs)
    }

    pub fn disk(&self) -> &Disk {
        &self.disk
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    pub fn vfs(&self) -> &Vfs {
        &self.vfs
    }

    // initial indexing
    // ================

    /// Walk the source tree, registering every directory and file.
    /// Returns the transfer queue: most recently used entries first.
    fn index_source(&mut self) -> Result<BinaryHeap<(i64, u64, u64)>, WolfsError> {
        let mut queue = BinaryHeap::new();
        let root = self.disk.trans.path_spaces().source_dir().to_path_buf();

        let meta = fs::metadata(&root)?;
        queue.push((self.disk.timestamp_of(&meta), ROOT_INODE, meta.len()));
        self.index_dir(&root, ROOT_INODE, &mut queue)?;
        Ok(queue)
    }

    fn index_dir(
        &mut self,
        dir: &Path,
        dir_ino: u64,
        queue: &mut BinaryHeap<(i64, u64, u64)>,
    ) -> Result<(), WolfsError> {
        let mut subdirs: Vec<(PathBuf, u64)> = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            if path.is_symlink() {
                // softlinks are deferred; they stay invisible
                continue;
            }
            let ino = self.disk.trans.path_to_ino(&path, 0);
            let attr = fileinfo::getattr_path(&path, ino)?;
            let meta = fs::symlink_metadata(&path)?;
            queue.push((self.disk.timestamp_of(&meta), ino, attr.size));

            match attr.kind {
                FileType::Directory => {
                    self.vfs.add_directory(dir_ino, ino, attr);
                    subdirs.push((path, ino));
                }
                FileType::RegularFile => self.vfs.add_child(dir_ino, ino, attr),
                _ => continue,
            }
        }
        for (path, ino) in subdirs {
            self.index_dir(&path, ino, queue)?;
        }
        Ok(())
    }

    /// Pull the hottest files into the cache until the threshold is hit.
    /// Entries too large to ever fit purge everything at least as big
    /// from the queue.
    fn copy_recent_into_cache(&mut self, mut queue: BinaryHeap<(i64, u64, u64)>) {
        info!("transferring files into cache...");
        while let Some((_, ino, size)) = queue.pop() {
            if self.disk.is_full(true) {
                break;
            }
            let Some(rpath) = self.disk.trans.ino_to_rpath(ino).map(str::to_owned) else {
                continue;
            };
            let src = self.disk.trans.to_src(&rpath);
            if src.is_symlink() {
                continue;
            }
            match self.disk.can_store(&src) {
                Ok(true) => {
                    if let Err(e) = self.disk.cp2cache(&src, false, &[]) {
                        warn!("skipping {rpath}: {e}");
                    }
                }
                Ok(false) => {
                    // everything at least this big will not fit either
                    queue = queue.into_iter().filter(|&(_, _, s)| s < size).collect();
                }
                Err(e) => warn!("skipping {rpath}: {e}"),
            }
        }
        info!("finished transferring. {}", self.disk.summary());
    }

    // small helpers
    // =============

    fn rpath_of(&self, ino: u64) -> FsResult<String> {
        match self.disk.trans.ino_to_rpath(ino) {
            Some(rpath) => Ok(rpath.to_owned()),
            None => {
                error!("no path known for ino {ino}");
                Err(libc::ENOENT)
            }
        }
    }

    fn child_rpath(parent_rpath: &str, name: &OsStr) -> FsResult<String> {
        let name = name.to_str().ok_or(libc::EINVAL)?;
        Ok(if parent_rpath == "/" {
            format!("/{name}")
        } else {
            format!("{parent_rpath}/{name}")
        })
    }

    fn name_of(rpath: &str) -> &str {
        match rpath.rfind('/') {
            Some(idx) => &rpath[idx + 1..],
            None => rpath,
        }
    }

    fn entry_of(&self, ino: u64, attr: FileAttr) -> Lookup {
        let (ttl, generation) = match self.vfs.record(ino) {
            Some(rec) => (rec.entry_ttl(), rec.generation()),
            None => (ATTR_TTL, 0),
        };
        Lookup::Found { attr, ttl, generation }
    }

    /// Stat a path through whichever space currently has it: cache copy
    /// first, source second.
    fn stat_rpath(&self, rpath: &str, ino: u64) -> FsResult<FileAttr> {
        let tmp = self.disk.trans.to_tmp(rpath);
        let target = if tmp.exists() { tmp } else { self.disk.trans.to_src(rpath) };
        fileinfo::getattr_path(&target, ino).map_err(|e| errno_of(&e))
    }

    fn wake_remote(&mut self) -> FsResult<()> {
        if self.remote.is_online() {
            return Ok(());
        }
        self.remote.make_available().map_err(|e| {
            error!("{e}");
            libc::EIO
        })
    }

    /// Make sure `rpath` has a cache copy, fetching from the source (and
    /// evicting) if needed. Dirty files are pinned during eviction.
    fn ensure_cached(&mut self, rpath: &str) -> FsResult<PathBuf> {
        let tmp = self.disk.trans.to_tmp(rpath);
        if tmp.exists() {
            return Ok(tmp);
        }
        self.wake_remote()?;
        let (dirty, _) = self.journal.dirty_tmp_paths(&self.disk.trans);
        let src = self.disk.trans.to_src(rpath);
        self.disk.cp2cache(&src, true, &dirty).map_err(|e| e.errno())?;
        Ok(tmp)
    }

    /// Recreate the directory chain of `rpath` under the cache root. For
    /// directories the source no longer knows (created while offline) the
    /// recorded mode is used.
    fn materialize_dir_spine(&mut self, rpath: &str) -> FsResult<PathBuf> {
        let tmp = self.disk.trans.to_tmp(rpath);
        if tmp.exists() {
            return Ok(tmp);
        }
        let src = self.disk.trans.to_src(rpath);
        if src.exists() {
            let (_, dirs) = self.disk.mkdir_p(&src).map_err(|e| errno_of(&e))?;
            for dir in dirs {
                self.disk.track(&dir, 0).map_err(|e| errno_of(&e))?;
            }
        } else {
            let parent = self.disk.trans.parent(rpath);
            if parent != rpath {
                self.materialize_dir_spine(&parent)?;
            }
            let mode = self
                .disk
                .trans
                .lookup_rpath(rpath)
                .and_then(|ino| self.vfs.record(ino))
                .map(|rec| u32::from(rec.attr().perm))
                .unwrap_or(0o755);
            fs::DirBuilder::new().mode(mode).create(&tmp).map_err(|e| errno_of(&e))?;
            self.disk.track(Path::new(rpath), 0).map_err(|e| errno_of(&e))?;
        }
        Ok(tmp)
    }

    fn touch_parent(&mut self, parent: u64) {
        if let Some(rec) = self.vfs.record_mut(parent) {
            let attr = rec.attr_mut();
            let now = SystemTime::now();
            attr.mtime = now;
            attr.ctime = now;
        }
    }

    fn open_options(flags: i32) -> FsResult<fs::OpenOptions> {
        let mut opts = fs::OpenOptions::new();
        match flags & libc::O_ACCMODE {
            libc::O_RDONLY => {
                opts.read(true);
            }
            libc::O_WRONLY => {
                opts.write(true);
            }
            libc::O_RDWR => {
                opts.read(true).write(true);
            }
            _ => return Err(libc::EINVAL),
        }
        opts.append(flags & libc::O_APPEND != 0);
        if flags & libc::O_ACCMODE != libc::O_RDONLY {
            opts.truncate(flags & libc::O_TRUNC != 0);
        }
        Ok(opts)
    }

    // operations
    // ==========

    pub fn do_lookup(&mut self, parent: u64, name: &OsStr) -> FsResult<Lookup> {
        let parent_rpath = self.rpath_of(parent)?;

        if name == "." {
            let attr = self.vfs.getattr(parent)?;
            return Ok(self.entry_of(parent, attr));
        }
        if name == ".." {
            let up = self.disk.trans.parent(&parent_rpath);
            let ino = self.disk.trans.lookup_rpath(&up).ok_or(libc::ENOENT)?;
            let attr = self.vfs.getattr(ino)?;
            return Ok(self.entry_of(ino, attr));
        }

        let child_rpath = Self::child_rpath(&parent_rpath, name)?;
        let Some(ino) = self.disk.trans.lookup_rpath(&child_rpath) else {
            return Ok(Lookup::Negative);
        };

        if self.vfs.contains(ino) {
            self.vfs.inc_lookup(ino);
        } else {
            // the kernel forgot this entry earlier; rebuild the record
            let attr = self.stat_rpath(&child_rpath, ino)?;
            if attr.kind == FileType::Directory {
                self.vfs.add_directory(parent, ino, attr);
            } else {
                self.vfs.add_child(parent, ino, attr);
            }
        }
        let attr = self.vfs.getattr(ino)?;
        Ok(self.entry_of(ino, attr))
    }

    pub fn do_forget(&mut self, ino: u64, nlookup: u64) {
        if ino == ROOT_INODE {
            return;
        }
        self.vfs.forget(ino, nlookup);
    }

    pub fn do_getattr(&mut self, ino: u64) -> FsResult<FileAttr> {
        self.vfs.getattr(ino)
    }

    pub fn do_setattr(
        &mut self,
        ino: u64,
        changes: SetattrChanges,
        fh: Option<u64>,
    ) -> FsResult<FileAttr> {
        let rpath = self.rpath_of(ino)?;
        let tmp = self.ensure_cached(&rpath)?;

        let use_fd = fh.is_some() && self.vfs.is_open(ino);
        if use_fd {
            let file = self.vfs.open_file(ino).expect("is_open checked");
            fileinfo::setattr_file(file, &changes).map_err(|e| errno_of(&e))?;
        } else {
            fileinfo::setattr_path(&tmp, &changes).map_err(|e| errno_of(&e))?;
        }

        let fresh = fileinfo::getattr_path(&tmp, ino).map_err(|e| errno_of(&e))?;
        match self.vfs.record_mut(ino) {
            Some(rec) => {
                *rec.attr_mut() = fresh;
                Ok(fresh)
            }
            None => {
                error!("setattr on ino {ino} without a record");
                Err(libc::ENOENT)
            }
        }
    }

    pub fn do_mknod(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Lookup> {
        let file_type = mode & libc::S_IFMT;
        if file_type != libc::S_IFREG && file_type != 0 {
            // pipes, sockets and devices have no cache representation
            return Err(libc::EPERM);
        }
        let (entry, ino) =
            self.create_common(parent, name, mode, umask, libc::O_WRONLY, uid, gid)?;
        self.vfs.release(ino);
        Ok(entry)
    }

    pub fn do_mkdir(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        uid: u32,
        gid: u32,
    ) -> FsResult<Lookup> {
        let parent_rpath = self.rpath_of(parent)?;
        let child_rpath = Self::child_rpath(&parent_rpath, name)?;
        debug!("mkdir {child_rpath} mode {mode:o}");

        if self.disk.trans.lookup_rpath(&child_rpath).is_some() {
            return Err(libc::EEXIST);
        }

        let need = self.disk.min_dir_size();
        if !self.journal.src_has_room(need) {
            return Err(libc::ENOSPC);
        }
        if !self.disk.can_reserve(need) {
            // cache is short but the source is not: sync dirty state away,
            // then evict until the directory fits
            if self.wake_remote().is_ok() {
                if let Err(e) = self.journal.flush(&self.disk.trans) {
                    warn!("pre-mkdir journal flush failed: {e}");
                }
            }
            let (dirty, _) = self.journal.dirty_tmp_paths(&self.disk.trans);
            self.disk.make_room_for_bytes(need, &dirty).map_err(|e| e.errno())?;
        }

        self.materialize_dir_spine(&parent_rpath)?;
        let tmp = self.disk.trans.to_tmp(&child_rpath);
        let mode = mode & !umask;
        fs::DirBuilder::new()
            .mode(mode)
            .create(&tmp)
            .map_err(|e| errno_of(&e))?;
        let _ = std::os::unix::fs::chown(&tmp, Some(uid), Some(gid));

        let ino = self.disk.track(Path::new(&child_rpath), 0).map_err(|e| errno_of(&e))?;
        let attr = fileinfo::getattr_path(&tmp, ino).map_err(|e| errno_of(&e))?;
        self.vfs.add_directory(parent, ino, attr);
        self.touch_parent(parent);
        self.journal.log_mkdir(parent, ino, &child_rpath, mode);
        Ok(self.entry_of(ino, attr))
    }

    pub fn do_rmdir(&mut self, parent: u64, name: &OsStr) -> FsResult<()> {
        let parent_rpath = self.rpath_of(parent)?;
        let child_rpath = Self::child_rpath(&parent_rpath, name)?;
        let ino = self.disk.trans.lookup_rpath(&child_rpath).ok_or(libc::ENOENT)?;

        match self.vfs.record(ino) {
            Some(rec) if !rec.is_dir() => return Err(libc::ENOTDIR),
            Some(rec) => {
                if !rec.as_dir().expect("checked").is_empty() {
                    return Err(libc::ENOTEMPTY);
                }
            }
            None => return Err(libc::ENOENT),
        }

        let tmp = self.disk.trans.to_tmp(&child_rpath);
        if tmp.exists() {
            fs::remove_dir(&tmp).map_err(|e| errno_of(&e))?;
        }

        if let Some(dir) = self.vfs.dir_mut(parent) {
            dir.remove_child(ino);
        }
        self.touch_parent(parent);
        self.disk.untrack(Path::new(&child_rpath));
        self.journal.log_rmdir(parent, ino, &child_rpath);

        if let Some(rec) = self.vfs.record_mut(ino) {
            rec.attr_mut().nlink = 0;
        }
        if self.vfs.lookup_count(ino) == 0 {
            self.vfs.remove_record(ino);
        }
        self.disk.trans.remove(ino, &child_rpath);
        Ok(())
    }

    fn create_common(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> FsResult<(Lookup, u64)> {
        let parent_rpath = self.rpath_of(parent)?;
        let child_rpath = Self::child_rpath(&parent_rpath, name)?;
        debug!("create {child_rpath} mode {mode:o}");

        if let Some(existing) = self.disk.trans.lookup_rpath(&child_rpath) {
            if self.vfs.contains(existing) {
                return Err(libc::EEXIST);
            }
        }

        self.materialize_dir_spine(&parent_rpath)?;
        let tmp = self.disk.trans.to_tmp(&child_rpath);
        let file = Self::open_options(flags)?
            .create(true)
            .mode(mode & !umask & 0o7777)
            .open(&tmp)
            .map_err(|e| errno_of(&e))?;
        let _ = std::os::unix::fs::chown(&tmp, Some(uid), Some(gid));

        let ino = self.disk.track(Path::new(&child_rpath), 0).map_err(|e| errno_of(&e))?;
        let attr = fileinfo::getattr_file(&file, ino).map_err(|e| errno_of(&e))?;
        self.vfs.add_child(parent, ino, attr);
        self.vfs.insert_handle(ino, file);
        self.touch_parent(parent);
        self.journal.log_create(ino, &child_rpath, flags | libc::O_CREAT);
        Ok((self.entry_of(ino, attr), ino))
    }

    pub fn do_create(
        &mut self,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        uid: u32,
        gid: u32,
    ) -> FsResult<(Lookup, u64)> {
        self.create_common(parent, name, mode, umask, flags, uid, gid)
    }

    pub fn do_open(&mut self, ino: u64, flags: i32) -> FsResult<u64> {
        debug!("open ino {ino} flags {flags:#o}");
        assert!(flags & libc::O_CREAT == 0, "kernel sends creating opens to create()");

        if self.vfs.share_handle(ino).is_some() {
            return Ok(ino);
        }
        let rpath = self.rpath_of(ino)?;
        let tmp = self.ensure_cached(&rpath)?;
        let file = Self::open_options(flags)?.open(&tmp).map_err(|e| errno_of(&e))?;
        self.vfs.insert_handle(ino, file);
        Ok(ino)
    }

    pub fn do_read(&mut self, ino: u64, offset: i64, size: u32) -> FsResult<Vec<u8>> {
        let file = self.vfs.open_file(ino).ok_or(libc::EBADF)?;
        let mut buf = vec![0u8; size as usize];
        let mut filled = 0usize;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset as u64 + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(errno_of(&e)),
            }
        }
        buf.truncate(filled);
        Ok(buf)
    }

    pub fn do_write(&mut self, ino: u64, offset: i64, data: &[u8]) -> FsResult<u32> {
        let size_before = self.vfs.record(ino).map(|r| r.attr().size).unwrap_or(0);
        {
            let file = self.vfs.open_file(ino).ok_or(libc::EBADF)?;
            file.write_all_at(data, offset as u64).map_err(|e| errno_of(&e))?;
        }

        if let Some(rec) = self.vfs.record_mut(ino) {
            let attr = rec.attr_mut();
            attr.size = attr.size.max(offset as u64 + data.len() as u64);
            attr.blocks = attr.size.div_ceil(u64::from(BLOCK_SIZE));
            let now = SystemTime::now();
            attr.mtime = now;
            attr.ctime = now;
        }

        // unlinked-but-open files have no path anymore; their writes die
        // with them and need no journal entry
        if let Some(rpath) = self.disk.trans.ino_to_rpath(ino).map(str::to_owned) {
            self.journal
                .log_write(ino, &rpath, offset as u64, data.len() as u64, size_before);
        }
        Ok(data.len() as u32)
    }

    pub fn do_flush(&mut self, ino: u64) -> FsResult<()> {
        let file = self.vfs.open_file(ino).ok_or(libc::EBADF)?;
        file.sync_all().map_err(|e| errno_of(&e))?;
        let size = self.vfs.getattr(ino)?.size;
        self.journal.log_flush(ino, size);
        Ok(())
    }

    pub fn do_fsync(&mut self, ino: u64, datasync: bool) -> FsResult<()> {
        let file = self.vfs.open_file(ino).ok_or(libc::EBADF)?;
        if datasync {
            file.sync_data().map_err(|e| errno_of(&e))
        } else {
            file.sync_all().map_err(|e| errno_of(&e))
        }
    }

    pub fn do_release(&mut self, ino: u64) {
        self.vfs.release(ino);
    }

    pub fn do_rename(
        &mut self,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
    ) -> FsResult<()> {
        if flags != 0 {
            return Err(libc::EINVAL);
        }
        let old_rpath = Self::child_rpath(&self.rpath_of(parent)?, name)?;
        let new_rpath = Self::child_rpath(&self.rpath_of(newparent)?, newname)?;
        debug!("rename {old_rpath} -> {new_rpath}");
        if old_rpath == new_rpath {
            return Ok(());
        }

        let ino = self.disk.trans.lookup_rpath(&old_rpath).ok_or(libc::ENOENT)?;
        let size = self.vfs.record(ino).map(|r| r.attr().size).unwrap_or(0);

        self.ensure_cached(&old_rpath)?;
        let new_parent_rpath = self.disk.trans.parent(&new_rpath);
        self.materialize_dir_spine(&new_parent_rpath)?;

        // overwriting rename: clear the target's bookkeeping first
        if let Some(dest) = self.disk.trans.lookup_rpath(&new_rpath) {
            if let Some(rec) = self.vfs.record(dest) {
                if rec.is_dir() && !rec.as_dir().expect("is_dir").is_empty() {
                    return Err(libc::ENOTEMPTY);
                }
            }
            if let Some(dir) = self.vfs.dir_mut(newparent) {
                dir.remove_child(dest);
            }
            self.disk.untrack(Path::new(&new_rpath));
            self.vfs.remove_record(dest);
            self.disk.trans.remove(dest, &new_rpath);
        }

        let tmp_old = self.disk.trans.to_tmp(&old_rpath);
        let tmp_new = self.disk.trans.to_tmp(&new_rpath);
        fs::rename(&tmp_old, &tmp_new).map_err(|e| errno_of(&e))?;

        self.journal.log_rename(ino, &old_rpath, &new_rpath, size);
        self.disk.retarget_prefix(&old_rpath, &new_rpath);
        self.disk.trans.rename_subtree(&old_rpath, &new_rpath);

        if let Some(dir) = self.vfs.dir_mut(parent) {
            dir.remove_child(ino);
        }
        if let Some(dir) = self.vfs.dir_mut(newparent) {
            if !dir.contains_child(ino) {
                dir.insert_child(ino);
            }
        }
        self.touch_parent(parent);
        self.touch_parent(newparent);
        if let Some(rec) = self.vfs.record_mut(ino) {
            rec.attr_mut().ctime = SystemTime::now();
        }
        Ok(())
    }

    pub fn do_unlink(&mut self, parent: u64, name: &OsStr) -> FsResult<()> {
        let parent_rpath = self.rpath_of(parent)?;
        let child_rpath = Self::child_rpath(&parent_rpath, name)?;
        let ino = self.disk.trans.lookup_rpath(&child_rpath).ok_or(libc::ENOENT)?;
        debug!("unlink {child_rpath} (ino {ino})");

        if self.vfs.record(ino).map(|r| r.is_dir()) == Some(true) {
            return Err(libc::EISDIR);
        }
        let size = self.vfs.record(ino).map(|r| r.attr().size).unwrap_or(0);

        let tmp = self.disk.trans.to_tmp(&child_rpath);
        if tmp.exists() {
            fs::remove_file(&tmp).map_err(|e| errno_of(&e))?;
        }

        if let Some(dir) = self.vfs.dir_mut(parent) {
            dir.remove_child(ino);
        }
        self.touch_parent(parent);
        self.disk.untrack(Path::new(&child_rpath));
        self.journal.log_unlink(parent, ino, &child_rpath, size);

        if let Some(rec) = self.vfs.record_mut(ino) {
            rec.attr_mut().nlink = 0;
        }
        if self.vfs.lookup_count(ino) == 0 && !self.vfs.is_open(ino) {
            self.vfs.remove_record(ino);
        }
        self.disk.trans.remove(ino, &child_rpath);
        Ok(())
    }

    pub fn do_readdir(&mut self, ino: u64, offset: i64) -> FsResult<Vec<DirEntryOut>> {
        let Some(rec) = self.vfs.record(ino) else {
            return Err(libc::ENOENT);
        };
        let Some(dir) = rec.as_dir() else {
            return Err(libc::ENOTDIR);
        };

        // child inodes double as readdir offsets: they are unique, sorted
        // and stable across calls
        let mut out = Vec::new();
        for &child in dir.children() {
            if (child as i64) <= offset {
                continue;
            }
            let Some(rpath) = self.disk.trans.ino_to_rpath(child) else {
                continue;
            };
            let kind = match self.vfs.record(child) {
                Some(rec) if rec.is_dir() => FileType::Directory,
                Some(_) => FileType::RegularFile,
                None => continue,
            };
            out.push(DirEntryOut {
                ino: child,
                kind,
                name: Self::name_of(rpath).to_owned(),
            });
        }
        Ok(out)
    }

    pub fn do_statfs(&mut self) -> FsResult<StatfsOut> {
        // statfs doubles as the opportunistic sync point
        if !self.journal.is_empty() && self.remote.is_online() {
            self.journal.flush(&self.disk.trans).map_err(|e| errno_of(&e))?;
        }

        let cache_dir = self.disk.trans.path_spaces().cache_dir();
        let sv = nix::sys::statvfs::statvfs(cache_dir).map_err(|e| e as c_int)?;
        let prefix_len = cache_dir.as_os_str().len() as u32 + 1;
        Ok(StatfsOut {
            blocks: sv.blocks() as u64,
            bfree: sv.blocks_free() as u64,
            bavail: sv.blocks_available() as u64,
            files: sv.files() as u64,
            ffree: sv.files_free() as u64,
            bsize: sv.block_size() as u32,
            namelen: (sv.name_max() as u32).saturating_sub(prefix_len),
            frsize: sv.fragment_size() as u32,
        })
    }

    /// Final teardown: push pending mutations to the source and persist
    /// the inode table for the next mount.
    pub fn shutdown(&mut self) {
        if !self.journal.is_empty() && self.remote.is_online() {
            if let Err(e) = self.journal.flush(&self.disk.trans) {
                error!("final journal flush failed, mutations remain cached: {e}");
            }
        }
        if let Some(path) = self.metadb.clone() {
            if let Err(e) = snapshot::save(&path, &self.disk.trans, &self.vfs) {
                error!("could not persist inode table: {e}");
            }
        }
    }
}

impl Filesystem for WolfsFs {
    fn init(&mut self, _req: &Request<'_>, _config: &mut KernelConfig) -> Result<(), c_int> {
        Ok(())
    }

    fn destroy(&mut self) {
        self.shutdown();
    }

    fn lookup(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEntry) {
        debug!("lookup(parent={parent}, name={name:?})");
        match self.do_lookup(parent, name) {
            Ok(Lookup::Found { attr, ttl, generation }) => reply.entry(&ttl, &attr, generation),
            Ok(Lookup::Negative) => {
                reply.entry(&NEGATIVE_TTL, &fileinfo::negative_attr(), 0)
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn forget(&mut self, _req: &Request<'_>, ino: u64, nlookup: u64) {
        self.do_forget(ino, nlookup);
    }

    fn getattr(&mut self, _req: &Request<'_>, ino: u64, _fh: Option<u64>, reply: ReplyAttr) {
        match self.do_getattr(ino) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn setattr(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        mode: Option<u32>,
        uid: Option<u32>,
        gid: Option<u32>,
        size: Option<u64>,
        atime: Option<TimeOrNow>,
        mtime: Option<TimeOrNow>,
        _ctime: Option<SystemTime>,
        fh: Option<u64>,
        _crtime: Option<SystemTime>,
        _chgtime: Option<SystemTime>,
        _bkuptime: Option<SystemTime>,
        _flags: Option<u32>,
        reply: ReplyAttr,
    ) {
        debug!("setattr(ino={ino}, mode={mode:?}, size={size:?}, fh={fh:?})");
        let changes = SetattrChanges { mode, uid, gid, size, atime, mtime };
        match self.do_setattr(ino, changes, fh) {
            Ok(attr) => reply.attr(&ATTR_TTL, &attr),
            Err(errno) => reply.error(errno),
        }
    }

    fn readlink(&mut self, _req: &Request<'_>, ino: u64, reply: ReplyData) {
        debug!("readlink(ino={ino}): softlinks are deferred");
        reply.error(libc::ENOSYS);
    }

    fn mknod(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        _rdev: u32,
        reply: ReplyEntry,
    ) {
        debug!("mknod(parent={parent}, name={name:?}, mode={mode:o})");
        match self.do_mknod(parent, name, mode, umask, req.uid(), req.gid()) {
            Ok(Lookup::Found { attr, ttl, generation }) => reply.entry(&ttl, &attr, generation),
            Ok(Lookup::Negative) => reply.error(libc::ENOENT),
            Err(errno) => reply.error(errno),
        }
    }

    fn mkdir(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        reply: ReplyEntry,
    ) {
        match self.do_mkdir(parent, name, mode, umask, req.uid(), req.gid()) {
            Ok(Lookup::Found { attr, ttl, generation }) => reply.entry(&ttl, &attr, generation),
            Ok(Lookup::Negative) => reply.error(libc::ENOENT),
            Err(errno) => reply.error(errno),
        }
    }

    fn unlink(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        match self.do_unlink(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn rmdir(&mut self, _req: &Request<'_>, parent: u64, name: &OsStr, reply: ReplyEmpty) {
        debug!("rmdir(parent={parent}, name={name:?})");
        match self.do_rmdir(parent, name) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn symlink(
        &mut self,
        _req: &Request<'_>,
        _parent: u64,
        _link_name: &OsStr,
        _target: &Path,
        reply: ReplyEntry,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn rename(
        &mut self,
        _req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        newparent: u64,
        newname: &OsStr,
        flags: u32,
        reply: ReplyEmpty,
    ) {
        match self.do_rename(parent, name, newparent, newname, flags) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn link(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _newparent: u64,
        _newname: &OsStr,
        reply: ReplyEntry,
    ) {
        // hardlinks are refused end-to-end until the link design settles
        reply.error(libc::ENOSYS);
    }

    fn open(&mut self, _req: &Request<'_>, ino: u64, flags: i32, reply: ReplyOpen) {
        match self.do_open(ino, flags) {
            Ok(fh) => reply.opened(fh, 0),
            Err(errno) => reply.error(errno),
        }
    }

    fn read(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        size: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyData,
    ) {
        debug!("read(ino={ino}, offset={offset}, size={size})");
        match self.do_read(ino, offset, size) {
            Ok(data) => reply.data(&data),
            Err(errno) => reply.error(errno),
        }
    }

    fn write(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        data: &[u8],
        _write_flags: u32,
        _flags: i32,
        _lock_owner: Option<u64>,
        reply: ReplyWrite,
    ) {
        debug!("write(ino={ino}, offset={offset}, len={})", data.len());
        match self.do_write(ino, offset, data) {
            Ok(written) => reply.written(written),
            Err(errno) => reply.error(errno),
        }
    }

    fn flush(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, _lock_owner: u64, reply: ReplyEmpty) {
        match self.do_flush(ino) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn release(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        _flags: i32,
        _lock_owner: Option<u64>,
        _flush: bool,
        reply: ReplyEmpty,
    ) {
        self.do_release(ino);
        reply.ok();
    }

    fn fsync(&mut self, _req: &Request<'_>, ino: u64, _fh: u64, datasync: bool, reply: ReplyEmpty) {
        match self.do_fsync(ino, datasync) {
            Ok(()) => reply.ok(),
            Err(errno) => reply.error(errno),
        }
    }

    fn opendir(&mut self, _req: &Request<'_>, ino: u64, _flags: i32, reply: ReplyOpen) {
        if self.vfs.dir(ino).is_some() {
            reply.opened(ino, 0);
        } else {
            reply.error(libc::ENOENT);
        }
    }

    fn readdir(
        &mut self,
        _req: &Request<'_>,
        ino: u64,
        _fh: u64,
        offset: i64,
        mut reply: ReplyDirectory,
    ) {
        debug!("readdir(ino={ino}, offset={offset})");
        match self.do_readdir(ino, offset) {
            Ok(entries) => {
                for entry in entries {
                    if reply.add(entry.ino, entry.ino as i64, entry.kind, &entry.name) {
                        break;
                    }
                }
                reply.ok();
            }
            Err(errno) => reply.error(errno),
        }
    }

    fn releasedir(&mut self, _req: &Request<'_>, _ino: u64, _fh: u64, _flags: i32, reply: ReplyEmpty) {
        reply.ok();
    }

    fn statfs(&mut self, _req: &Request<'_>, _ino: u64, reply: ReplyStatfs) {
        match self.do_statfs() {
            Ok(s) => reply.statfs(
                s.blocks, s.bfree, s.bavail, s.files, s.ffree, s.bsize, s.namelen, s.frsize,
            ),
            Err(errno) => reply.error(errno),
        }
    }

    fn setxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _value: &[u8],
        _flags: i32,
        _position: u32,
        reply: ReplyEmpty,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn getxattr(
        &mut self,
        _req: &Request<'_>,
        _ino: u64,
        _name: &OsStr,
        _size: u32,
        reply: ReplyXattr,
    ) {
        reply.error(libc::ENOSYS);
    }

    fn listxattr(&mut self, _req: &Request<'_>, _ino: u64, _size: u32, reply: ReplyXattr) {
        reply.error(libc::ENOSYS);
    }

    fn removexattr(&mut self, _req: &Request<'_>, _ino: u64, _name: &OsStr, reply: ReplyEmpty) {
        reply.error(libc::ENOSYS);
    }

    fn access(&mut self, _req: &Request<'_>, _ino: u64, _mask: i32, reply: ReplyEmpty) {
        reply.error(libc::ENOSYS);
    }

    fn create(
        &mut self,
        req: &Request<'_>,
        parent: u64,
        name: &OsStr,
        mode: u32,
        umask: u32,
        flags: i32,
        reply: ReplyCreate,
    ) {
        match self.do_create(parent, name, mode, umask, flags, req.uid(), req.gid()) {
            Ok((Lookup::Found { attr, ttl, generation }, fh)) => {
                reply.created(&ttl, &attr, generation, fh, 0)
            }
            Ok((Lookup::Negative, _)) => reply.error(libc::ENOENT),
            Err(errno) => reply.error(errno),
        }
    }
}
