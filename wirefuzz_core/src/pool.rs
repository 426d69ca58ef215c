use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    #[error("Work unit was canceled")]
    Canceled,
    #[error("Work unit failed: {0}")]
    Failed(String),
    #[error("Worker pool is closed")]
    Closed,
}

/// Bounded pool for CPU-bound units of work.
///
/// Each unit runs on tokio's blocking thread pool, gated by a semaphore so no
/// more than `workers` units execute at once. Waiting for a permit and
/// waiting for the result both race against the caller's cancellation token;
/// a canceled unit's result is discarded.
#[derive(Clone, Debug)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    workers: usize,
}

impl WorkerPool {
    pub fn new(workers: usize) -> Self {
        let workers = workers.max(1);
        Self {
            permits: Arc::new(Semaphore::new(workers)),
            workers,
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn run<T, F>(&self, cancel: &CancellationToken, unit: F) -> Result<T, PoolError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PoolError::Canceled),
            permit = Arc::clone(&self.permits).acquire_owned() => {
                permit.map_err(|_| PoolError::Closed)?
            }
        };

        let handle = tokio::task::spawn_blocking(move || {
            let _permit = permit;
            unit()
        });

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(PoolError::Canceled),
            joined = handle => joined.map_err(|e| PoolError::Failed(e.to_string())),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(4)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn runs_unit_and_returns_result() {
        let pool = WorkerPool::new(2);
        let cancel = CancellationToken::new();
        let result = pool.run(&cancel, || 6 * 7).await;
        assert_eq!(result, Ok(42));
    }

    #[tokio::test]
    async fn canceled_token_short_circuits() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_in_unit = Arc::clone(&ran);
        let result = pool
            .run(&cancel, move || {
                ran_in_unit.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        assert_eq!(result, Err(PoolError::Canceled));
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancellation_unblocks_a_running_unit() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            trigger.cancel();
        });
        let result = pool
            .run(&cancel, || std::thread::sleep(Duration::from_millis(300)))
            .await;
        assert_eq!(result, Err(PoolError::Canceled));
    }

    #[tokio::test]
    async fn panicking_unit_reports_failure() {
        let pool = WorkerPool::new(1);
        let cancel = CancellationToken::new();
        let result: Result<(), PoolError> = pool.run(&cancel, || panic!("unit blew up")).await;
        assert!(matches!(result, Err(PoolError::Failed(_))));
    }

    #[test]
    fn zero_workers_is_clamped_to_one() {
        assert_eq!(WorkerPool::new(0).workers(), 1);
    }
}
