//! Persisted inode-table snapshot (`--metadb`).
//!
//! Written on clean unmount, loaded on the next mount so the source tree
//! does not have to be re-indexed. Any load failure falls back to a full
//! re-index; the snapshot is an optimisation, never a source of truth.

use std::collections::BTreeSet;
use std::fs::File;
use std::io;
use std::path::Path;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::fileinfo::InodeRecord;
use crate::translator::{InodePaths, InodeTranslator};
use crate::vfs::Vfs;

#[derive(Serialize, Deserialize)]
pub struct Snapshot {
    last_ino: u64,
    freed_inos: BTreeSet<u64>,
    paths: Vec<(u64, InodePaths)>,
    records: Vec<(u64, InodeRecord)>,
}

/// Capture translator and record state.
pub fn capture(trans: &InodeTranslator, vfs: &Vfs) -> Snapshot {
    let (last_ino, freed_inos, paths) = trans.export();
    Snapshot {
        last_ino,
        freed_inos,
        paths,
        records: vfs.records().map(|(ino, rec)| (ino, rec.clone())).collect(),
    }
}

pub fn save(path: &Path, trans: &InodeTranslator, vfs: &Vfs) -> io::Result<()> {
    let file = File::create(path)?;
    bincode::serialize_into(file, &capture(trans, vfs))
        .map_err(|e| io::Error::other(format!("snapshot encode: {e}")))?;
    info!("saved inode table snapshot to {path:?}");
    Ok(())
}

/// Load a snapshot into the given translator and a fresh record store.
/// Returns `None` (after a warning) when the file is missing or does not
/// decode, in which case the caller re-indexes the source.
pub fn load(path: &Path, trans: &mut InodeTranslator) -> Option<Vfs> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) => {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("cannot read snapshot {path:?}: {e}");
            }
            return None;
        }
    };
    let snap: Snapshot = match bincode::deserialize_from(file) {
        Ok(s) => s,
        Err(e) => {
            warn!("snapshot {path:?} is corrupt, re-indexing: {e}");
            return None;
        }
    };

    trans.restore(snap.last_ino, snap.freed_inos, snap.paths);
    let mut vfs = Vfs::empty();
    for (ino, rec) in snap.records {
        vfs.insert_record(ino, rec);
    }
    info!("restored inode table snapshot from {path:?}");
    Some(vfs)
}
