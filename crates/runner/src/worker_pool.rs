//! Bounded concurrency for per-host SSH work, grounded in
//! `engine/process_execution/src/bounded.rs`'s `CommandRunner`: a thin
//! wrapper around `tokio::sync::Semaphore` that hands out one permit per
//! concurrently-running host, so a large fleet doesn't open every
//! connection at once.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Clone)]
pub struct WorkerPool {
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    pub fn new(max_concurrency: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max_concurrency.max(1))),
        }
    }

    /// Acquire a permit, blocking until a worker slot is free. The returned
    /// guard releases the slot on drop, so a cancelled or panicking task
    /// never leaks concurrency headroom.
    pub async fn acquire(&self) -> SemaphorePermit<'_> {
        self.semaphore
            .acquire()
            .await
            .expect("semaphore is never closed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn acquire_limits_outstanding_permits() {
        let pool = WorkerPool::new(1);
        let first = pool.acquire().await;
        assert_eq!(pool.semaphore.available_permits(), 0);
        drop(first);
        assert_eq!(pool.semaphore.available_permits(), 1);
    }
}
