//! Sharded progress counters and the end-of-run summary.

use std::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};

use serde::{Deserialize, Serialize};

/// Number of shards per counter. More shards reduce contention but cost
/// memory; 64 shards of one cache line each keep concurrent workers off each
/// other's lines.
const NUM_SHARDS: usize = 64;

/// Atomic padded to cache line size to prevent false sharing. 128-byte
/// alignment covers both x86-64 and ARM line sizes.
#[repr(align(128))]
struct PaddedAtomicU64(AtomicU64);

static NEXT_SHARD_INDEX: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static MY_SHARD: usize =
        NEXT_SHARD_INDEX.fetch_add(1, Ordering::Relaxed) % NUM_SHARDS;
}

/// Sharded counter for concurrent updates from many worker tasks.
pub struct TlsCounter {
    shards: [PaddedAtomicU64; NUM_SHARDS],
}

impl TlsCounter {
    #[must_use]
    pub fn new() -> Self {
        Self {
            shards: std::array::from_fn(|_| PaddedAtomicU64(AtomicU64::new(0))),
        }
    }

    pub fn add(&self, value: u64) {
        let shard = MY_SHARD.with(|&s| s);
        self.shards[shard].0.fetch_add(value, Ordering::Relaxed);
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn get(&self) -> u64 {
        self.shards
            .iter()
            .map(|s| s.0.load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for TlsCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TlsCounter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsCounter")
            .field("value", &self.get())
            .finish()
    }
}

/// All counters of one sync run. Everything here is monotonic except the
/// `pending` gauge.
#[derive(Debug, Default)]
pub struct Counters {
    /// Accumulated scan target ("found"); fed from `batch` so producers do
    /// not contend on one atomic per entry.
    total: AtomicI64,
    batch: AtomicI64,
    pub handled: TlsCounter,
    pub copied: TlsCounter,
    pub copied_bytes: TlsCounter,
    pub checked: TlsCounter,
    pub checked_bytes: TlsCounter,
    pub skipped: TlsCounter,
    pub skipped_bytes: TlsCounter,
    pub excluded: TlsCounter,
    pub excluded_bytes: TlsCounter,
    pub extra: TlsCounter,
    pub extra_bytes: TlsCounter,
    pub deleted: TlsCounter,
    pub failed: TlsCounter,
    pub listed_prefix: TlsCounter,
    pub pending: AtomicI64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `n` newly discovered entries into the pending scan batch.
    pub fn incr_total(&self, n: i64) {
        self.batch.fetch_add(n, Ordering::Relaxed);
    }

    /// Flush the discovery batch into the scan target and mark `n` entries
    /// handled.
    pub fn incr_handled(&self, n: u64) {
        let old = self.batch.swap(0, Ordering::Relaxed);
        self.total.fetch_add(old, Ordering::Relaxed);
        self.handled.add(n);
    }

    /// Total entries discovered by the producers so far.
    pub fn scanned(&self) -> u64 {
        self.total.load(Ordering::Relaxed).max(0) as u64
    }

    pub fn summary(&self) -> Summary {
        let found = self.scanned();
        let handled = self.handled.get();
        let extra = self.extra.get();
        Summary {
            found,
            excluded: self.excluded.get(),
            excluded_bytes: self.excluded_bytes.get(),
            skipped: self.skipped.get(),
            skipped_bytes: self.skipped_bytes.get(),
            copied: self.copied.get(),
            copied_bytes: self.copied_bytes.get(),
            extra,
            extra_bytes: self.extra_bytes.get(),
            checked: self.checked.get(),
            checked_bytes: self.checked_bytes.get(),
            deleted: self.deleted.get(),
            failed: self.failed.get(),
            lost: found.saturating_sub(handled).saturating_sub(extra),
        }
    }
}

/// Aggregate counts of one finished run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Summary {
    pub found: u64,
    pub excluded: u64,
    pub excluded_bytes: u64,
    pub skipped: u64,
    pub skipped_bytes: u64,
    pub copied: u64,
    pub copied_bytes: u64,
    pub extra: u64,
    pub extra_bytes: u64,
    pub checked: u64,
    pub checked_bytes: u64,
    pub deleted: u64,
    pub failed: u64,
    pub lost: u64,
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Found: {}, excluded: {} ({}), skipped: {} ({}), copied: {} ({}), extra: {} ({})",
            self.found,
            self.excluded,
            bytesize::ByteSize(self.excluded_bytes),
            self.skipped,
            bytesize::ByteSize(self.skipped_bytes),
            self.copied,
            bytesize::ByteSize(self.copied_bytes),
            self.extra,
            bytesize::ByteSize(self.extra_bytes),
        )?;
        if self.checked > 0 || self.checked_bytes > 0 {
            write!(
                f,
                ", checked: {} ({})",
                self.checked,
                bytesize::ByteSize(self.checked_bytes)
            )?;
        }
        if self.deleted > 0 {
            write!(f, ", deleted: {}", self.deleted)?;
        }
        if self.failed > 0 {
            write!(f, ", failed: {}", self.failed)?;
        }
        if self.lost > 0 {
            write!(f, ", lost: {}", self.lost)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn threaded_counting() {
        let counter = TlsCounter::new();
        std::thread::scope(|scope| {
            for _ in 0..8 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        counter.inc();
                    }
                });
            }
        });
        assert_eq!(counter.get(), 8000);
    }

    #[test]
    fn batched_scan_accounting() {
        let counters = Counters::new();
        counters.incr_total(3);
        assert_eq!(counters.scanned(), 0);
        counters.incr_handled(1);
        assert_eq!(counters.scanned(), 3);
        counters.incr_handled(2);
        assert_eq!(counters.handled.get(), 3);
        let summary = counters.summary();
        assert_eq!(summary.found, 3);
        assert_eq!(summary.lost, 0);
    }

    #[test]
    fn summary_reports_loss() {
        let counters = Counters::new();
        counters.incr_total(5);
        counters.incr_handled(2);
        counters.extra.inc();
        let summary = counters.summary();
        assert_eq!(summary.found, 5);
        assert_eq!(summary.lost, 2);
        let line = summary.to_string();
        assert!(line.starts_with("Found: 5"));
        assert!(line.contains("lost: 2"));
    }
}
