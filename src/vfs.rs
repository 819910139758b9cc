//! In-memory directory and attribute store.
//!
//! Serves `lookup`/`getattr` metadata without touching the source, which is
//! what keeps the mount usable while the source is offline. Also owns the
//! open-descriptor table: one shared `File` per inode, refcounted across
//! concurrent opens, plus the kernel-facing lookup counts driven by
//! `forget`.

use std::collections::HashMap;
use std::fs::File;

use fuser::FileAttr;
use log::{debug, error};

use crate::errors::FsResult;
use crate::fileinfo::{self, DirRecord, InodeRecord};
use crate::translator::ROOT_INODE;

/// A cached descriptor shared by every open handle of one inode.
#[derive(Debug)]
pub struct OpenFile {
    pub file: File,
    pub open_count: u64,
}

#[derive(Debug, Default)]
pub struct Vfs {
    records: HashMap<u64, InodeRecord>,
    lookup_cnt: HashMap<u64, u64>,
    open_files: HashMap<u64, OpenFile>,
}

impl Vfs {
    /// A store whose root directory carries `root_attr` (the stat of the
    /// cache directory, which is what the guest sees as `/`).
    pub fn new(mut root_attr: FileAttr) -> Self {
        root_attr.ino = ROOT_INODE;
        let mut vfs = Vfs::default();
        vfs.records.insert(ROOT_INODE, InodeRecord::dir(root_attr));
        vfs
    }

    pub(crate) fn empty() -> Self {
        Vfs::default()
    }

    // record access
    // =============

    pub fn record(&self, ino: u64) -> Option<&InodeRecord> {
        self.records.get(&ino)
    }

    pub fn record_mut(&mut self, ino: u64) -> Option<&mut InodeRecord> {
        self.records.get_mut(&ino)
    }

    pub fn dir(&self, ino: u64) -> Option<&DirRecord> {
        self.records.get(&ino).and_then(InodeRecord::as_dir)
    }

    pub fn dir_mut(&mut self, ino: u64) -> Option<&mut DirRecord> {
        self.records.get_mut(&ino).and_then(InodeRecord::as_dir_mut)
    }

    pub fn contains(&self, ino: u64) -> bool {
        self.records.contains_key(&ino)
    }

    pub(crate) fn records(&self) -> impl Iterator<Item = (u64, &InodeRecord)> {
        self.records.iter().map(|(&i, r)| (i, r))
    }

    pub(crate) fn insert_record(&mut self, ino: u64, record: InodeRecord) {
        self.records.insert(ino, record);
    }

    // inode <-> record registration
    // =============================

    /// Create or refresh the record of a plain file and take one lookup
    /// reference. `attr.ino` must already carry the translator's number.
    pub fn add_path(&mut self, ino: u64, attr: FileAttr) {
        assert_eq!(ino, attr.ino, "record attr.ino must equal the map key");
        *self.lookup_cnt.entry(ino).or_insert(0) += 1;

        match self.records.get_mut(&ino) {
            None => {
                self.records.insert(ino, InodeRecord::file(attr));
            }
            Some(rec) => {
                // refresh only; a second *path* for an inode would be a
                // hardlink, which this store refuses end-to-end
                *rec.attr_mut() = attr;
            }
        }
    }

    /// Create a directory record and link it below `parent_ino`.
    pub fn add_directory(&mut self, parent_ino: u64, ino: u64, attr: FileAttr) {
        assert_eq!(ino, attr.ino, "record attr.ino must equal the map key");
        *self.lookup_cnt.entry(ino).or_insert(0) += 1;

        match self.records.get_mut(&ino) {
            None => {
                self.records.insert(ino, InodeRecord::dir(attr));
            }
            Some(rec) => *rec.attr_mut() = attr,
        }

        if parent_ino != ino {
            let parent = self
                .dir_mut(parent_ino)
                .unwrap_or_else(|| panic!("parent ino {parent_ino} is not a directory"));
            if !parent.contains_child(ino) {
                parent.insert_child(ino);
            }
        }
    }

    /// `add_path` plus linking into the parent's child list.
    pub fn add_child(&mut self, parent_ino: u64, ino: u64, attr: FileAttr) {
        assert_ne!(parent_ino, ino, "an inode cannot be its own child");
        self.add_path(ino, attr);
        let parent = self
            .dir_mut(parent_ino)
            .unwrap_or_else(|| panic!("parent ino {parent_ino} is not a directory"));
        if !parent.contains_child(ino) {
            parent.insert_child(ino);
        }
    }

    pub fn remove_record(&mut self, ino: u64) {
        self.records.remove(&ino);
        self.lookup_cnt.remove(&ino);
    }

    // attributes
    // ==========

    /// Attributes of `ino` from the store. While the inode has an open
    /// descriptor the size and timestamps come from `fstat`, so unflushed
    /// writes are visible.
    pub fn getattr(&mut self, ino: u64) -> FsResult<FileAttr> {
        if let Some(open) = self.open_files.get(&ino) {
            let fresh = fileinfo::getattr_file(&open.file, ino)
                .map_err(|e| crate::errors::errno_of(&e))?;
            if let Some(rec) = self.records.get_mut(&ino) {
                let attr = rec.attr_mut();
                attr.size = fresh.size;
                attr.blocks = fresh.blocks;
                attr.atime = fresh.atime;
                attr.mtime = fresh.mtime;
                attr.ctime = fresh.ctime;
            }
        }
        match self.records.get(&ino) {
            Some(rec) => Ok(*rec.attr()),
            None => {
                // translator/store desync; surface as a missing entry
                error!("getattr of unknown ino {ino}");
                Err(libc::ENOENT)
            }
        }
    }

    // kernel lookup counting
    // ======================

    pub fn lookup_count(&self, ino: u64) -> u64 {
        self.lookup_cnt.get(&ino).copied().unwrap_or(0)
    }

    /// Take one more kernel reference on an already-registered inode.
    pub fn inc_lookup(&mut self, ino: u64) {
        *self.lookup_cnt.entry(ino).or_insert(0) += 1;
    }

    pub fn in_lookup(&self, ino: u64) -> bool {
        self.lookup_cnt.contains_key(&ino)
    }

    /// Drop `nlookup` kernel references. Returns `true` when the record was
    /// dropped (count reached zero and no descriptor is open).
    pub fn forget(&mut self, ino: u64, nlookup: u64) -> bool {
        let Some(cnt) = self.lookup_cnt.get_mut(&ino) else {
            return false;
        };
        if *cnt > nlookup {
            *cnt -= nlookup;
            return false;
        }
        if self.open_files.contains_key(&ino) {
            // forgotten by the kernel but still open; keep the record until
            // release drops the last handle
            *cnt = 0;
            return false;
        }
        debug!("forgetting about inode {ino}");
        self.lookup_cnt.remove(&ino);
        self.records.remove(&ino);
        true
    }

    // open descriptor table
    // =====================

    pub fn is_open(&self, ino: u64) -> bool {
        self.open_files.contains_key(&ino)
    }

    pub fn open_file(&self, ino: u64) -> Option<&File> {
        self.open_files.get(&ino).map(|o| &o.file)
    }

    /// Register a freshly opened descriptor, or take another reference on
    /// the descriptor an earlier `open` installed.
    pub fn insert_handle(&mut self, ino: u64, file: File) {
        match self.open_files.get_mut(&ino) {
            Some(open) => open.open_count += 1,
            None => {
                self.open_files.insert(ino, OpenFile { file, open_count: 1 });
            }
        }
    }

    pub fn share_handle(&mut self, ino: u64) -> Option<&File> {
        let open = self.open_files.get_mut(&ino)?;
        open.open_count += 1;
        Some(&open.file)
    }

    /// Drop one reference; closes the descriptor when the count reaches
    /// zero. Returns `true` if this was the last reference.
    pub fn release(&mut self, ino: u64) -> bool {
        let Some(open) = self.open_files.get_mut(&ino) else {
            return false;
        };
        if open.open_count > 1 {
            open.open_count -= 1;
            return false;
        }
        self.open_files.remove(&ino);
        // an inode the kernel already forgot dies with its last handle
        if self.lookup_cnt.get(&ino) == Some(&0) {
            self.lookup_cnt.remove(&ino);
            self.records.remove(&ino);
        }
        true
    }

    /// TMP paths of every open descriptor, for eviction to skip.
    pub fn open_inos(&self) -> Vec<u64> {
        self.open_files.keys().copied().collect()
    }
}
