//! Engine configuration. The CLI (or an embedding program) fills this in;
//! the engine never reads flags itself.

use std::time::{Duration, SystemTime};

use crate::rules::Rule;

#[derive(Clone)]
pub struct Config {
    /// First key to sync (inclusive). Empty means from the beginning.
    pub start: String,
    /// Last key to sync (inclusive). Empty means to the end.
    pub end: String,

    /// Concurrent workers, also the capacity of the I/O operation gate.
    pub threads: usize,
    /// Concurrent listers for the prefix fan-out.
    pub list_threads: usize,
    /// Maximum fan-out recursion depth.
    pub list_depth: u32,
    /// Maximum number of source entries to process; negative means no limit.
    pub limit: i64,
    /// Bandwidth limit in bytes per second; 0 disables throttling.
    pub bw_limit: u64,
    /// Abort the process once this many objects failed; 0 disables the watch.
    pub max_failure: u64,

    pub min_size: u64,
    pub max_size: u64,
    /// Only entries modified at least this long before the run started.
    pub min_age: Option<Duration>,
    /// Only entries modified at most this long before the run started.
    pub max_age: Option<Duration>,
    pub start_time: Option<SystemTime>,
    pub end_time: Option<SystemTime>,

    /// Replicate symlinks instead of following them.
    pub links: bool,
    /// Sync directory entries too.
    pub dirs: bool,
    /// Propagate POSIX owner/group/mode.
    pub perms: bool,
    /// Log and count without touching either store.
    pub dry: bool,
    /// Delete source objects after a verified copy exists.
    pub delete_src: bool,
    /// Delete destination objects with no source counterpart.
    pub delete_dst: bool,
    /// Only copy keys that already exist on the destination.
    pub existing: bool,
    /// Never overwrite keys that already exist on the destination.
    pub ignore_existing: bool,
    /// Copy when the source mtime is newer.
    pub update: bool,
    /// Copy unconditionally; skips the destination listing entirely.
    pub force_update: bool,
    /// Compare checksums for all objects that look equal.
    pub check_all: bool,
    /// Verify every newly copied object against the source checksum.
    pub check_new: bool,
    /// After copying, re-HEAD the source to detect mid-sync changes.
    pub check_change: bool,
    /// Evaluate rules against the whole key instead of level by level.
    pub match_full_path: bool,
    /// Ask drivers to write objects in place rather than via rename.
    pub inplace: bool,

    pub verbose: u8,
    pub quiet: bool,

    /// Address of a remote manager dispatching tasks to this process. The
    /// transport is an external collaborator; when set, the task channel is
    /// kept unbuffered so work does not pile up in any single worker.
    pub manager: Option<String>,
    /// Worker addresses a manager would dispatch to.
    pub workers: Vec<String>,

    /// Newline-separated keys/prefixes to sync instead of listing from the
    /// start key. A trailing `/` marks a prefix to list recursively.
    pub files_from: Option<std::path::PathBuf>,
    pub rules: Vec<Rule>,

    /// Metrics sink; when present every counter is exported.
    pub registry: Option<prometheus::Registry>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            start: String::new(),
            end: String::new(),
            threads: 10,
            list_threads: 1,
            list_depth: 1,
            limit: -1,
            bw_limit: 0,
            max_failure: 0,
            min_size: 0,
            max_size: u64::MAX,
            min_age: None,
            max_age: None,
            start_time: None,
            end_time: None,
            links: false,
            dirs: false,
            perms: false,
            dry: false,
            delete_src: false,
            delete_dst: false,
            existing: false,
            ignore_existing: false,
            update: false,
            force_update: false,
            check_all: false,
            check_new: false,
            check_change: false,
            match_full_path: false,
            inplace: false,
            verbose: 0,
            quiet: false,
            manager: None,
            workers: Vec::new(),
            files_from: None,
            rules: Vec::new(),
            registry: None,
        }
    }
}
