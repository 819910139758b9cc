//! WOLFS — a write-offline local filesystem.
//!
//! WOLFS interposes between a process and a slow, sometimes-unreachable
//! backing store. The mountpoint mirrors the source tree, but every read
//! and write is served from a size-bounded local cache; mutations land in
//! an in-memory journal and are replayed against the source in batches.
//! When the source goes away, metadata keeps being answered from the
//! in-memory directory model and mutations simply pile up until
//! connectivity returns.
//!
//! Layering, bottom to top: [`translator`] (path spaces and the
//! path-inode bijection), [`vfs`] (attribute records, child lists, open
//! descriptors), [`disk`] (cache residency and LRU eviction), [`journal`]
//! (log, compaction, replay), and [`fsops`] (the FUSE dispatcher tying it
//! all together).

pub mod disk;
pub mod errors;
pub mod fileinfo;
pub mod fsops;
pub mod journal;
pub mod remote;
pub mod snapshot;
pub mod translator;
pub mod vfs;

pub use crate::disk::Disk;
pub use crate::errors::{FsResult, WolfsError};
pub use crate::fsops::{WolfsFs, WolfsOptions, DEFAULT_CACHE_SIZE_MB};
pub use crate::journal::Journal;
pub use crate::remote::{AlwaysOnline, Remote};
pub use crate::translator::{InodeTranslator, MountDirs, PathTranslator, ROOT_INODE};
pub use crate::vfs::Vfs;
