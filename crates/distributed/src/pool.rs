//! Bounded worker pool for leaf and intermediate task execution.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};
use tsdq_common::{global_metrics, Result, TsdqError};

/// How a pooled task ended.
#[derive(Debug)]
pub enum TaskOutcome<T> {
    Done(T),
    Panicked(String),
    TimedOut,
}

/// Caps how many tasks a node runs at once. A task that cannot get a slot
/// before its deadline is rejected rather than queued past it.
#[derive(Clone)]
pub struct WorkerPool {
    slots: Arc<Semaphore>,
    max_workers: usize,
}

impl WorkerPool {
    pub fn new(max_workers: usize) -> Self {
        let max_workers = max_workers.max(1);
        Self {
            slots: Arc::new(Semaphore::new(max_workers)),
            max_workers,
        }
    }

    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }

    /// Waits for a free slot until `deadline`, then runs `fut` on it. The
    /// task itself is bounded by the same deadline; a panic is caught and
    /// reported as [`TaskOutcome::Panicked`].
    pub async fn submit<F, T>(&self, deadline: Instant, fut: F) -> Result<JoinHandle<TaskOutcome<T>>>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire(deadline).await?;
        Ok(tokio::spawn(async move {
            let _permit = permit;
            match tokio::time::timeout_at(deadline, AssertUnwindSafe(fut).catch_unwind()).await {
                Ok(Ok(value)) => TaskOutcome::Done(value),
                Ok(Err(panic)) => {
                    let msg = panic_message(panic.as_ref());
                    error!(panic = %msg, "task panicked");
                    TaskOutcome::Panicked(msg)
                }
                Err(_) => TaskOutcome::TimedOut,
            }
        }))
    }

    /// Like [`WorkerPool::submit`] for blocking work: `f` runs on tokio's
    /// blocking threads. At the deadline the caller gets
    /// [`TaskOutcome::TimedOut`]; the slot stays taken until `f` returns.
    pub async fn submit_blocking<F, T>(
        &self,
        deadline: Instant,
        f: F,
    ) -> Result<JoinHandle<TaskOutcome<T>>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = self.acquire(deadline).await?;
        let work = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        });
        Ok(tokio::spawn(async move {
            match tokio::time::timeout_at(deadline, work).await {
                Ok(Ok(value)) => TaskOutcome::Done(value),
                Ok(Err(join)) if join.is_panic() => {
                    let msg = panic_message(join.into_panic().as_ref());
                    error!(panic = %msg, "blocking task panicked");
                    TaskOutcome::Panicked(msg)
                }
                Ok(Err(join)) => TaskOutcome::Panicked(join.to_string()),
                Err(_) => TaskOutcome::TimedOut,
            }
        }))
    }

    async fn acquire(&self, deadline: Instant) -> Result<OwnedSemaphorePermit> {
        match tokio::time::timeout_at(deadline, Arc::clone(&self.slots).acquire_owned()).await {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => {
                global_metrics().record_worker_rejection("closed");
                Err(TsdqError::Execution("worker pool closed".to_string()))
            }
            Err(_) => {
                warn!(max_workers = self.max_workers, "no worker slot before deadline");
                global_metrics().record_worker_rejection("saturated");
                Err(TsdqError::WorkerPoolSaturated)
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn deadline(ms: u64) -> Instant {
        Instant::now() + Duration::from_millis(ms)
    }

    #[tokio::test]
    async fn runs_task_and_releases_slot() {
        let pool = WorkerPool::new(1);
        let handle = pool.submit(deadline(500), async { 7 }).await.expect("submit");
        assert!(matches!(handle.await.expect("join"), TaskOutcome::Done(7)));
        assert_eq!(pool.available(), 1);
    }

    #[tokio::test]
    async fn panic_is_caught() {
        let pool = WorkerPool::new(2);
        let handle = pool
            .submit(deadline(500), async {
                if pool_is_broken() {
                    panic!("shard index corrupted");
                }
            })
            .await
            .expect("submit");
        match handle.await.expect("join") {
            TaskOutcome::Panicked(msg) => assert_eq!(msg, "shard index corrupted"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(pool.available(), 2);
    }

    fn pool_is_broken() -> bool {
        true
    }

    #[tokio::test]
    async fn saturated_pool_rejects_at_deadline() {
        let pool = WorkerPool::new(1);
        let blocker = pool
            .submit(deadline(1_000), tokio::time::sleep(Duration::from_millis(300)))
            .await
            .expect("submit");
        let err = pool
            .submit(deadline(50), async {})
            .await
            .expect_err("saturated");
        assert!(matches!(err, TsdqError::WorkerPoolSaturated));
        assert!(matches!(blocker.await.expect("join"), TaskOutcome::Done(())));
    }

    #[tokio::test]
    async fn task_past_deadline_times_out() {
        let pool = WorkerPool::new(1);
        let handle = pool
            .submit(deadline(30), tokio::time::sleep(Duration::from_secs(5)))
            .await
            .expect("submit");
        assert!(matches!(handle.await.expect("join"), TaskOutcome::TimedOut));
    }

    #[tokio::test]
    async fn blocking_task_past_deadline_times_out() {
        let pool = WorkerPool::new(1);
        let started = Instant::now();
        let handle = pool
            .submit_blocking(deadline(30), || std::thread::sleep(Duration::from_millis(300)))
            .await
            .expect("submit");
        assert!(matches!(handle.await.expect("join"), TaskOutcome::TimedOut));
        assert!(started.elapsed() < Duration::from_millis(250));
    }

    #[tokio::test]
    async fn blocking_panic_is_caught() {
        let pool = WorkerPool::new(1);
        let handle = pool
            .submit_blocking(deadline(500), || -> u32 { panic!("segment checksum mismatch") })
            .await
            .expect("submit");
        match handle.await.expect("join") {
            TaskOutcome::Panicked(msg) => assert_eq!(msg, "segment checksum mismatch"),
            other => panic!("unexpected {other:?}"),
        }
        let handle = pool
            .submit_blocking(deadline(500), || 3)
            .await
            .expect("slot released");
        assert!(matches!(handle.await.expect("join"), TaskOutcome::Done(3)));
    }
}
