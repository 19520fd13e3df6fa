//! Per-run state shared by every component, passed explicitly so the engine
//! is re-entrant and embeddable.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::config::Config;
use crate::pool::{BufferPool, SizedPools, STREAM_BUF_SIZE};
use crate::progress::Counters;
use crate::store::ObjectStore;

pub struct SyncContext {
    pub src: Arc<dyn ObjectStore>,
    pub dst: Arc<dyn ObjectStore>,
    pub config: Config,
    pub counters: Counters,
    /// Byte-rate bucket, present when a bandwidth limit is configured.
    pub bw: Option<throttle::RateBucket>,
    /// Admits individual I/O operations; capacity `threads`.
    pub gate: throttle::OpGate,
    /// Bounds open list RPCs during prefix fan-out; capacity `list_threads`.
    pub list_gate: throttle::OpGate,
    pub stream_pool: Arc<BufferPool>,
    pub part_pool: Arc<SizedPools>,
    /// Source directories queued for deletion after all workers finish.
    pub src_delay_del: Mutex<Vec<String>>,
    /// Destination directories queued likewise.
    pub dst_delay_del: Mutex<Vec<String>>,
    /// Remaining entry budget; negative means unlimited.
    limit: AtomicI64,
    pub run_start: SystemTime,
}

impl SyncContext {
    /// Must be called from within a tokio runtime (the rate bucket spawns its
    /// replenish task).
    pub fn new(src: Arc<dyn ObjectStore>, dst: Arc<dyn ObjectStore>, config: Config) -> Arc<Self> {
        let bw = match config.bw_limit {
            0 => None,
            // keep 15% headroom under the configured line rate
            limit => Some(throttle::RateBucket::new((limit as f64 * 0.85) as u64)),
        };
        let gate = throttle::OpGate::new(config.threads.max(1));
        let list_gate = throttle::OpGate::new(config.list_threads.max(1));
        let limit = AtomicI64::new(config.limit);
        Arc::new(Self {
            src,
            dst,
            config,
            counters: Counters::new(),
            bw,
            gate,
            list_gate,
            stream_pool: BufferPool::new(STREAM_BUF_SIZE),
            part_pool: SizedPools::new(),
            src_delay_del: Mutex::new(Vec::new()),
            dst_delay_del: Mutex::new(Vec::new()),
            limit,
            run_start: SystemTime::now(),
        })
    }

    pub async fn bw_wait(&self, n: u64) {
        if let Some(bw) = &self.bw {
            bw.wait(n).await;
        }
    }

    pub fn limit_exhausted(&self) -> bool {
        self.limit.load(Ordering::Relaxed) == 0
    }

    /// Claim one entry from the budget. Returns false once the budget is
    /// spent; an unlimited budget always grants.
    pub fn limit_take(&self) -> bool {
        loop {
            let cur = self.limit.load(Ordering::Relaxed);
            if cur < 0 {
                return true;
            }
            if cur == 0 {
                return false;
            }
            if self
                .limit
                .compare_exchange(cur, cur - 1, Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
            {
                return true;
            }
        }
    }

    pub fn defer_delete_src(&self, key: &str) {
        self.src_delay_del.lock().unwrap().push(key.to_string());
    }

    pub fn defer_delete_dst(&self, key: &str) {
        self.dst_delay_del.lock().unwrap().push(key.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::MemStore;

    #[tokio::test]
    async fn limit_budget() {
        let ctx = SyncContext::new(
            Arc::new(MemStore::new("s")),
            Arc::new(MemStore::new("d")),
            Config {
                limit: 2,
                ..Default::default()
            },
        );
        assert!(ctx.limit_take());
        assert!(!ctx.limit_exhausted());
        assert!(ctx.limit_take());
        assert!(ctx.limit_exhausted());
        assert!(!ctx.limit_take());
    }

    #[tokio::test]
    async fn unlimited_budget_never_runs_out() {
        let ctx = SyncContext::new(
            Arc::new(MemStore::new("s")),
            Arc::new(MemStore::new("d")),
            Config::default(),
        );
        for _ in 0..100 {
            assert!(ctx.limit_take());
        }
        assert!(!ctx.limit_exhausted());
    }
}
