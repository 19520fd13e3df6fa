use std::sync::atomic::{AtomicBool, Ordering};

/// Resettable semaphore that can be disabled entirely. A disabled semaphore
/// admits everything without touching permits.
pub(crate) struct Semaphore {
    flag: AtomicBool,
    sem: tokio::sync::Semaphore,
}

impl Semaphore {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            sem: tokio::sync::Semaphore::const_new(tokio::sync::Semaphore::MAX_PERMITS),
        }
    }

    pub fn setup(&self, value: usize) {
        self.flag.store(value > 0, Ordering::Release);
        if value == 0 {
            return;
        }
        self.sem.forget_permits(self.sem.available_permits());
        self.sem.add_permits(value);
    }

    pub fn available(&self) -> usize {
        self.sem.available_permits()
    }

    pub fn add_permits(&self, n: usize) {
        self.sem.add_permits(n);
    }

    pub fn enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn consume_many(&self, value: u32) {
        if self.enabled() {
            self.sem.acquire_many(value).await.unwrap().forget();
        }
    }
}
