//! Value types flowing through the sync pipeline.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// POSIX attributes carried by stores that advertise a filesystem capability.
/// Owner and group are store-level identifiers; they are only ever compared
/// for equality and passed back verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileAttrs {
    pub mode: u32,
    pub owner: String,
    pub group: String,
}

/// Descriptor of one object as emitted by a listing. Listings emit these in
/// strictly ascending key order; directories are zero-size keys ending `/`.
#[derive(Debug, Clone)]
pub struct ObjectEntry {
    pub key: String,
    pub size: u64,
    pub mtime: SystemTime,
    pub is_dir: bool,
    pub is_symlink: bool,
    pub attrs: Option<FileAttrs>,
}

impl ObjectEntry {
    pub fn new(key: impl Into<String>, size: u64, mtime: SystemTime) -> Self {
        let key = key.into();
        let is_dir = key.ends_with('/');
        Self {
            key,
            size,
            mtime,
            is_dir,
            is_symlink: false,
            attrs: None,
        }
    }

    /// Mtime truncated to whole seconds since the epoch. Listing and HEAD
    /// precision differ across stores, so ordering decisions compare at
    /// second granularity.
    pub fn mtime_unix(&self) -> u64 {
        unix_secs(self.mtime)
    }

    /// Milliseconds-within-second part of the mtime.
    pub fn mtime_subsec_millis(&self) -> u32 {
        self.mtime
            .duration_since(UNIX_EPOCH)
            .unwrap_or(Duration::ZERO)
            .subsec_millis()
    }
}

pub fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO).as_secs()
}

/// One decision taken by the diff merger for a key, carried through the task
/// channel to the workers. The wrapped descriptor keeps its original size.
#[derive(Debug, Clone)]
pub enum Action {
    /// Copy the object from source to destination (new or changed).
    Copy(ObjectEntry),
    /// Keys look equal; compare checksums before deciding.
    Checksum(ObjectEntry),
    /// Contents equal, POSIX attributes differ.
    CopyPerms(ObjectEntry),
    /// Verified copy exists on the destination; remove the source.
    DeleteSrc(ObjectEntry),
    /// Extraneous destination key.
    DeleteDst(ObjectEntry),
}

impl Action {
    pub fn entry(&self) -> &ObjectEntry {
        match self {
            Action::Copy(o)
            | Action::Checksum(o)
            | Action::CopyPerms(o)
            | Action::DeleteSrc(o)
            | Action::DeleteDst(o) => o,
        }
    }

    pub fn key(&self) -> &str {
        &self.entry().key
    }
}
