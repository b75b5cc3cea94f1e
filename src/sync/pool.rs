//! Worker Pool
//!
//! Bounded pool of sync units. Each unit runs on its own tokio task once it
//! holds one of the pool's permits, and receives a token that fires when the
//! unit, the pool, or the parent run is cancelled.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::cancel::CancellationToken;
use crate::error::{Error, Result};

/// Fixed-size pool dispatching homogeneous units of work
pub struct WorkerPool {
    name: String,
    permits: Arc<Semaphore>,
    concurrency: usize,
    token: CancellationToken,
}

impl WorkerPool {
    /// Create a pool running at most `concurrency` units at once
    pub fn new(name: impl Into<String>, concurrency: usize, parent: &CancellationToken) -> Self {
        let concurrency = concurrency.max(1);
        Self {
            name: name.into(),
            permits: Arc::new(Semaphore::new(concurrency)),
            concurrency,
            token: parent.child_token(),
        }
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Queue a unit of work. Units cancelled before they obtain a permit
    /// never run and join as `Cancelled`.
    pub fn submit<T, F, Fut>(&self, name: impl Into<String>, work: F) -> JobHandle<T>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let name = name.into();
        let token = self.token.child_token();
        let permits = Arc::clone(&self.permits);
        let job_token = token.clone();
        let job_name = name.clone();
        let pool_name = self.name.clone();

        let handle = tokio::spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = job_token.cancelled() => return Err(Error::Cancelled),
                permit = permits.acquire_owned() => permit
                    .map_err(|_| Error::Internal(format!("worker pool {} closed", pool_name)))?,
            };
            tracing::trace!("{}: running {}", pool_name, job_name);
            Ok(work(job_token).await)
        });

        JobHandle {
            name,
            token,
            handle,
        }
    }

    /// Cancel every queued and running unit
    pub fn cancel_all(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// Handle to one submitted unit
pub struct JobHandle<T> {
    name: String,
    token: CancellationToken,
    handle: JoinHandle<Result<T>>,
}

impl<T> JobHandle<T> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Ask this unit to stop at its next cancellation check
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Wait for the unit's outcome
    pub async fn join(self) -> Result<T> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(Error::Internal(format!("{} panicked", self.name))),
            Err(_) => Err(Error::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let pool = WorkerPool::new("test", 3, &CancellationToken::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|i| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                pool.submit(format!("unit-{}", i), move |_token| async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                    i
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.join().await.unwrap());
        }
        assert_eq!(results, (0..10).collect::<Vec<_>>());
        assert!(peak.load(Ordering::SeqCst) <= 3);
    }

    #[tokio::test]
    async fn test_cancel_all_stops_queued_units() {
        let run = CancellationToken::new();
        let pool = WorkerPool::new("test", 1, &run);

        let blocker = pool.submit("blocker", |token| async move {
            token.cancelled().await;
            "stopped"
        });
        let queued = pool.submit("queued", |_token| async move { "ran" });

        tokio::time::sleep(Duration::from_millis(10)).await;
        pool.cancel_all();

        assert_eq!(blocker.join().await.unwrap(), "stopped");
        assert!(matches!(queued.join().await, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_single_unit_cancel() {
        let pool = WorkerPool::new("test", 2, &CancellationToken::new());
        let target = pool.submit("target", |token| async move {
            token.cancelled().await;
            1
        });
        let sibling = pool.submit("sibling", |token| async move { token.is_cancelled() });

        target.cancel();
        // Either stopped while waiting or never started
        assert!(matches!(target.join().await, Ok(1) | Err(Error::Cancelled)));
        assert!(!sibling.join().await.unwrap());
    }
}
