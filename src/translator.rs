//! Path and inode translation.
//!
//! Three directory roots exist side by side: the authoritative source tree
//! (`src`), the local cache (`tmp`) and the user-visible mountpoint (`mnt`).
//! Everything inside the filesystem is keyed by a *root-relative path*: a
//! canonical string with a leading `/` obtained by stripping whichever root
//! prefix the input carried. [`PathTranslator`] converts between the spaces,
//! [`InodeTranslator`] adds the bijection between root-relative paths and
//! inode numbers.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use log::error;
use serde::{Deserialize, Serialize};

use crate::errors::WolfsError;

/// Inode number of `/`. FUSE reserves 0 as "no entry", so counting starts
/// at one.
pub const ROOT_INODE: u64 = 1;

/// The three configured directory roots, canonicalised.
#[derive(Debug, Clone)]
pub struct MountDirs {
    pub source_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub mount_dir: PathBuf,
}

impl MountDirs {
    /// Canonicalise and validate the three roots. Each must exist and be a
    /// directory; anything else is a fatal configuration error.
    pub fn new<P: AsRef<Path>>(source: P, cache: P, mount: P) -> Result<Self, WolfsError> {
        fn checked(kind: &str, p: &Path) -> Result<PathBuf, WolfsError> {
            let canon = fs::canonicalize(p).map_err(|e| {
                error!("{kind} directory {p:?}: {e}");
                WolfsError::Mount(format!("{kind} directory {p:?}: {e}"))
            })?;
            if !canon.is_dir() {
                error!("{kind} {canon:?} is not a directory");
                return Err(WolfsError::Mount(format!("{kind} {canon:?} is not a directory")));
            }
            Ok(canon)
        }

        Ok(MountDirs {
            source_dir: checked("source", source.as_ref())?,
            cache_dir: checked("cache", cache.as_ref())?,
            mount_dir: checked("mountpoint", mount.as_ref())?,
        })
    }
}

/// Pure conversions between the three path spaces and the root-relative
/// representation.
#[derive(Debug, Clone)]
pub struct PathTranslator {
    dirs: MountDirs,
}

impl PathTranslator {
    pub fn new(dirs: MountDirs) -> Self {
        PathTranslator { dirs }
    }

    pub fn source_dir(&self) -> &Path {
        &self.dirs.source_dir
    }

    pub fn cache_dir(&self) -> &Path {
        &self.dirs.cache_dir
    }

    pub fn mount_dir(&self) -> &Path {
        &self.dirs.mount_dir
    }

    /// Strip any recognised root prefix, yielding the canonical `/`-leading
    /// key. `to_root("/")` is stable and idempotent.
    pub fn to_root<P: AsRef<Path>>(&self, path: P) -> String {
        let p = path.as_ref();
        let stripped = p
            .strip_prefix(&self.dirs.source_dir)
            .or_else(|_| p.strip_prefix(&self.dirs.cache_dir))
            .or_else(|_| p.strip_prefix(&self.dirs.mount_dir))
            .unwrap_or(p);

        let mut s = stripped.to_string_lossy().into_owned();
        if !s.starts_with('/') {
            s.insert(0, '/');
        }
        while s.contains("//") {
            s = s.replace("//", "/");
        }
        if s.len() > 1 && s.ends_with('/') {
            s.pop();
        }
        s
    }

    fn to_dest(&self, root: &Path, path: &Path) -> PathBuf {
        let rpath = self.to_root(path);
        if rpath == "/" {
            root.to_path_buf()
        } else {
            root.join(&rpath[1..])
        }
    }

    pub fn to_src<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.to_dest(&self.dirs.source_dir, path.as_ref())
    }

    pub fn to_tmp<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.to_dest(&self.dirs.cache_dir, path.as_ref())
    }

    pub fn to_mnt<P: AsRef<Path>>(&self, path: P) -> PathBuf {
        self.to_dest(&self.dirs.mount_dir, path.as_ref())
    }

    /// Root-relative path of the parent directory.
    pub fn parent<P: AsRef<Path>>(&self, path: P) -> String {
        let rpath = self.to_root(path);
        match rpath.rfind('/') {
            Some(0) | None => "/".to_owned(),
            Some(idx) => rpath[..idx].to_owned(),
        }
    }
}

/// One inode maps to a single path in the common case and transparently
/// widens to a set once hardlinked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum InodePaths {
    Single(String),
    Multi(BTreeSet<String>),
}

impl InodePaths {
    /// Any one of the paths. Callers that need the full set use
    /// [`InodePaths::all`].
    pub fn any(&self) -> &str {
        match self {
            InodePaths::Single(p) => p,
            InodePaths::Multi(set) => set.iter().next().expect("hardlink set never empty"),
        }
    }

    pub fn all(&self) -> Vec<&str> {
        match self {
            InodePaths::Single(p) => vec![p.as_str()],
            InodePaths::Multi(set) => set.iter().map(String::as_str).collect(),
        }
    }

    pub fn contains(&self, rpath: &str) -> bool {
        match self {
            InodePaths::Single(p) => p == rpath,
            InodePaths::Multi(set) => set.contains(rpath),
        }
    }

    fn widen(&mut self, rpath: String) {
        match self {
            InodePaths::Single(p) if *p == rpath => {}
            InodePaths::Single(p) => {
                let mut set = BTreeSet::new();
                set.insert(std::mem::take(p));
                set.insert(rpath);
                *self = InodePaths::Multi(set);
            }
            InodePaths::Multi(set) => {
                set.insert(rpath);
            }
        }
    }
}

impl fmt::Display for InodePaths {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InodePaths::Single(p) => write!(f, "{p}"),
            InodePaths::Multi(set) => write!(f, "{set:?}"),
        }
    }
}

/// Bijection between root-relative paths and inode numbers.
///
/// Allocation is strictly increasing; deleted inodes land in a freed set
/// from which callers may explicitly reclaim a number (rename keeps its
/// inode that way). `/` maps to [`ROOT_INODE`] from construction.
#[derive(Debug)]
pub struct InodeTranslator {
    paths: PathTranslator,
    last_ino: u64,
    freed_inos: BTreeSet<u64>,
    path_ino: HashMap<String, u64>,
    ino_path: HashMap<u64, InodePaths>,
}

impl InodeTranslator {
    pub fn new(dirs: MountDirs) -> Self {
        let mut trans = InodeTranslator {
            paths: PathTranslator::new(dirs),
            last_ino: ROOT_INODE,
            freed_inos: BTreeSet::new(),
            path_ino: HashMap::new(),
            ino_path: HashMap::new(),
        };
        trans.path_ino.insert("/".to_owned(), ROOT_INODE);
        trans.ino_path.insert(ROOT_INODE, InodePaths::Single("/".to_owned()));
        trans
    }

    // Path-space delegates, so callers don't have to reach through.
    pub fn to_root<P: AsRef<Path>>(&self, p: P) -> String {
        self.paths.to_root(p)
    }
    pub fn to_src<P: AsRef<Path>>(&self, p: P) -> PathBuf {
        self.paths.to_src(p)
    }
    pub fn to_tmp<P: AsRef<Path>>(&self, p: P) -> PathBuf {
        self.paths.to_tmp(p)
    }
    pub fn to_mnt<P: AsRef<Path>>(&self, p: P) -> PathBuf {
        self.paths.to_mnt(p)
    }
    pub fn parent<P: AsRef<Path>>(&self, p: P) -> String {
        self.paths.parent(p)
    }
    pub fn path_spaces(&self) -> &PathTranslator {
        &self.paths
    }

    pub fn last_ino(&self) -> u64 {
        self.last_ino
    }

    pub fn freed_inos(&self) -> &BTreeSet<u64> {
        &self.freed_inos
    }

    /// Look up an already-known path without allocating.
    pub fn lookup_rpath(&self, rpath: &str) -> Option<u64> {
        self.path_ino.get(rpath).copied()
    }

    /// Map a path to its inode, allocating a fresh number if the path is
    /// unknown. A non-zero `reuse_ino` reclaims a previously freed inode;
    /// passing one that was never freed, or that exceeds the largest
    /// allocated number, is a programmer error.
    pub fn path_to_ino<P: AsRef<Path>>(&mut self, path: P, reuse_ino: u64) -> u64 {
        let rpath = self.to_root(path);

        let ino = if let Some(&known) = self.path_ino.get(&rpath) {
            known
        } else if reuse_ino != 0 {
            assert!(
                reuse_ino <= self.last_ino,
                "reused ino {reuse_ino} is larger than largest generated ino {}",
                self.last_ino
            );
            assert!(
                self.freed_inos.remove(&reuse_ino),
                "reused ino {reuse_ino} is not in the freed ino set"
            );
            reuse_ino
        } else {
            self.last_ino += 1;
            self.last_ino
        };

        self.path_ino.insert(rpath.clone(), ino);
        match self.ino_path.get_mut(&ino) {
            Some(paths) => paths.widen(rpath),
            None => {
                self.ino_path.insert(ino, InodePaths::Single(rpath));
            }
        }
        ino
    }

    /// Reverse lookup; any one path when the inode is hardlinked.
    pub fn ino_to_rpath(&self, ino: u64) -> Option<&str> {
        self.ino_path.get(&ino).map(InodePaths::any)
    }

    /// Reverse lookup returning every path of a hardlinked inode.
    pub fn ino_to_rpaths(&self, ino: u64) -> Option<&InodePaths> {
        self.ino_path.get(&ino)
    }

    /// Add a further path to an existing inode. Directories cannot be
    /// hardlinked; the dispatcher refuses `link()` outright, so this is
    /// only reachable from inside the crate.
    pub fn add_hardlink<P: AsRef<Path>>(&mut self, ino: u64, path: P) -> Result<(), libc::c_int> {
        let rpath = self.to_root(path);
        assert!(!self.freed_inos.contains(&ino), "hardlink to a freed ino");
        let Some(existing) = self.ino_path.get(&ino) else {
            panic!("hardlink target ino {ino} has no path yet");
        };
        assert!(
            !self.path_ino.contains_key(&rpath),
            "hardlink path {rpath} is already mapped"
        );
        if self.to_tmp(existing.any()).is_dir() || self.to_src(existing.any()).is_dir() {
            return Err(libc::EPERM);
        }
        self.path_ino.insert(rpath.clone(), ino);
        self.ino_path.get_mut(&ino).expect("checked above").widen(rpath);
        Ok(())
    }

    /// Remove one `(ino, path)` association. Dropping the last path of an
    /// inode returns the number to the freed set; a hardlinked inode merely
    /// narrows back towards a single path.
    pub fn remove<P: AsRef<Path>>(&mut self, ino: u64, path: P) {
        let rpath = self.to_root(path);
        assert_eq!(
            self.path_ino.get(&rpath).copied(),
            Some(ino),
            "translator desync: {rpath} is not mapped to ino {ino}"
        );

        match self.ino_path.get_mut(&ino) {
            Some(InodePaths::Single(_)) => {
                self.ino_path.remove(&ino);
                self.freed_inos.insert(ino);
            }
            Some(InodePaths::Multi(set)) => {
                set.remove(&rpath);
                if set.len() == 1 {
                    let last = set.iter().next().expect("len checked").clone();
                    self.ino_path.insert(ino, InodePaths::Single(last));
                }
            }
            None => panic!("translator desync: ino {ino} has no paths"),
        }
        self.path_ino.remove(&rpath);
    }

    /// Rewrite every key under `old_rpath` to live under `new_rpath`,
    /// keeping all inode numbers. Used when a directory (or file) is
    /// renamed.
    pub fn rename_subtree(&mut self, old_rpath: &str, new_rpath: &str) {
        let affected: Vec<String> = self
            .path_ino
            .keys()
            .filter(|p| {
                p.as_str() == old_rpath
                    || (p.starts_with(old_rpath)
                        && p.as_bytes().get(old_rpath.len()) == Some(&b'/'))
            })
            .cloned()
            .collect();

        for old in affected {
            let new = format!("{new_rpath}{}", &old[old_rpath.len()..]);
            let ino = self.path_ino.remove(&old).expect("key collected above");
            self.path_ino.insert(new.clone(), ino);
            match self.ino_path.get_mut(&ino) {
                Some(InodePaths::Single(p)) => *p = new,
                Some(InodePaths::Multi(set)) => {
                    set.remove(&old);
                    set.insert(new);
                }
                None => panic!("translator desync: ino {ino} has no paths"),
            }
        }
    }

    /// Restore translator state from a snapshot (see `snapshot` module).
    pub(crate) fn restore(
        &mut self,
        last_ino: u64,
        freed: BTreeSet<u64>,
        entries: Vec<(u64, InodePaths)>,
    ) {
        self.path_ino.clear();
        self.ino_path.clear();
        self.last_ino = last_ino;
        self.freed_inos = freed;
        for (ino, paths) in entries {
            for p in paths.all() {
                self.path_ino.insert(p.to_owned(), ino);
            }
            self.ino_path.insert(ino, paths);
        }
    }

    pub(crate) fn export(&self) -> (u64, BTreeSet<u64>, Vec<(u64, InodePaths)>) {
        (
            self.last_ino,
            self.freed_inos.clone(),
            self.ino_path.iter().map(|(&i, p)| (i, p.clone())).collect(),
        )
    }
}
