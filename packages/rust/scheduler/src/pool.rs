//! Bounded-concurrency pools.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use storyforge_shared::{Result, StoryforgeError};

use crate::cancel::CancellationToken;

/// Limits how many operations of one category are in flight at once.
///
/// Slots are handed out in request order. A slot is released when the
/// returned permit is dropped.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    name: &'static str,
    size: usize,
    semaphore: Arc<Semaphore>,
}

impl WorkerPool {
    /// Create a pool with `size` slots (at least one).
    pub fn new(name: &'static str, size: usize) -> Self {
        let size = size.max(1);
        Self {
            name,
            size,
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Slots currently held.
    pub fn in_flight(&self) -> usize {
        self.size - self.semaphore.available_permits()
    }

    /// Wait for a free slot, giving up if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit> {
        cancel.check()?;
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(StoryforgeError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => permit,
        };
        // The semaphore is never closed while the pool is alive.
        let permit = permit.map_err(|_| StoryforgeError::Cancelled)?;
        trace!(pool = self.name, in_flight = self.in_flight(), "slot acquired");
        Ok(permit)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[test]
    fn size_is_at_least_one() {
        assert_eq!(WorkerPool::new("llm", 0).size(), 1);
        assert_eq!(WorkerPool::new("llm", 3).size(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_size() {
        let pool = WorkerPool::new("media", 2);
        let cancel = CancellationToken::new();
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            let cancel = cancel.clone();
            let current = current.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _slot = pool.acquire(&cancel).await.expect("slot");
                let now = current.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(50)).await;
                current.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 2);
        assert_eq!(pool.in_flight(), 0);
    }

    #[tokio::test]
    async fn cancel_releases_waiters() {
        let pool = WorkerPool::new("llm", 1);
        let cancel = CancellationToken::new();
        let _held = pool.acquire(&cancel).await.expect("first slot");

        let waiter = {
            let pool = pool.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { pool.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::task::yield_now().await;
        cancel.cancel();

        let result = waiter.await.unwrap();
        assert!(result.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn acquire_after_cancel_fails_fast() {
        let pool = WorkerPool::new("llm", 4);
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(pool.acquire(&cancel).await.is_err());
        assert_eq!(pool.in_flight(), 0);
    }
}
