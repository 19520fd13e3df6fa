//! Resource gates for the sync engine: a byte-rate token bucket and a
//! preemptible operation-count semaphore.

use std::sync::Arc;

mod semaphore;

/// Returned by [`OpGate::acquire_cancellable`] when the group's abort signal
/// fired before a permit became available.
#[derive(Debug, thiserror::Error)]
#[error("aborted")]
pub struct Aborted;

/// Byte-rate token bucket.
///
/// Tokens are bytes. The bucket is replenished every 100ms up to its burst
/// capacity (one tenth of the per-second fill rate), so a caller asking for
/// more than one burst simply waits through several fill intervals. Callers
/// are expected to consume tokens for the intended transfer size before
/// issuing the read or write.
pub struct RateBucket {
    sem: Arc<semaphore::Semaphore>,
    burst: u64,
    replenisher: tokio::task::JoinHandle<()>,
}

const REPLENISH_INTERVAL: std::time::Duration = std::time::Duration::from_millis(100);

impl RateBucket {
    /// Create a bucket filling at `bytes_per_sec`. Must be called from within
    /// a tokio runtime; the replenish task lives until the bucket is dropped.
    pub fn new(bytes_per_sec: u64) -> Self {
        let burst = (bytes_per_sec / 10).clamp(1, u32::MAX as u64);
        let sem = Arc::new(semaphore::Semaphore::new());
        sem.setup(burst as usize);
        let replenisher = tokio::spawn(run_replenish(sem.clone(), burst as usize));
        Self {
            sem,
            burst,
            replenisher,
        }
    }

    /// Consume `n` byte tokens, waiting as long as it takes.
    pub async fn wait(&self, n: u64) {
        let mut left = n;
        while left > 0 {
            let take = left.min(self.burst) as u32;
            self.sem.consume_many(take).await;
            left -= u64::from(take);
        }
    }
}

impl Drop for RateBucket {
    fn drop(&mut self) {
        self.replenisher.abort();
    }
}

async fn run_replenish(sem: Arc<semaphore::Semaphore>, burst: usize) {
    loop {
        tokio::time::sleep(REPLENISH_INTERVAL).await;
        let curr = sem.available();
        if curr < burst {
            sem.add_permits(burst - curr);
        }
    }
}

/// Counting semaphore admitting individual I/O operations (whole-object
/// reads, part uploads, part compares). Acquisition can be preempted by the
/// abort token shared across a group of parallel parts, so the first failure
/// drains its peers quickly.
#[derive(Clone)]
pub struct OpGate {
    sem: Arc<tokio::sync::Semaphore>,
}

impl OpGate {
    pub fn new(capacity: usize) -> Self {
        Self {
            sem: Arc::new(tokio::sync::Semaphore::new(capacity)),
        }
    }

    pub async fn acquire(&self) -> tokio::sync::OwnedSemaphorePermit {
        self.sem.clone().acquire_owned().await.unwrap()
    }

    pub async fn acquire_cancellable(
        &self,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<tokio::sync::OwnedSemaphorePermit, Aborted> {
        tokio::select! {
            _ = cancel.cancelled() => Err(Aborted),
            permit = self.sem.clone().acquire_owned() => Ok(permit.unwrap()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_admits_small_requests() {
        let bucket = RateBucket::new(1 << 20);
        // within one burst, no replenish needed
        bucket.wait(1024).await;
        bucket.wait(4096).await;
    }

    #[tokio::test(start_paused = true)]
    async fn bucket_paces_large_requests() {
        let bucket = RateBucket::new(1000);
        // burst is 100 tokens; 350 tokens need at least 3 refills
        let start = tokio::time::Instant::now();
        bucket.wait(350).await;
        assert!(start.elapsed() >= std::time::Duration::from_millis(300));
    }

    #[tokio::test]
    async fn gate_bounds_concurrency() {
        let gate = OpGate::new(2);
        let p1 = gate.acquire().await;
        let _p2 = gate.acquire().await;
        let gate2 = gate.clone();
        let waiter = tokio::spawn(async move { gate2.acquire().await });
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());
        drop(p1);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn gate_acquire_preempted_by_abort() {
        let gate = OpGate::new(1);
        let _held = gate.acquire().await;
        let cancel = tokio_util::sync::CancellationToken::new();
        cancel.cancel();
        assert!(gate.acquire_cancellable(&cancel).await.is_err());
    }
}
