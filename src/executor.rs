//! Bounded-concurrency execution of asynchronous work.
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Runs units of work with at most `limit` executing concurrently.
///
/// Admission is FIFO among waiters (the underlying [`Semaphore`] is fair). The permit is held for
/// the duration of the work and released when the work completes, errors, or is cancelled.
#[derive(Clone)]
pub struct BoundedExecutor {
    semaphore: Arc<Semaphore>,
}

impl BoundedExecutor {
    /// Create an executor admitting at most `limit` concurrent units of work.
    pub fn new(limit: usize) -> BoundedExecutor {
        BoundedExecutor {
            semaphore: Arc::new(Semaphore::new(limit.max(1))),
        }
    }

    /// Run `work`, waiting for admission if the executor is at capacity.
    pub async fn run<F>(&self, work: F) -> F::Output
    where
        F: Future,
    {
        // The semaphore is never closed, so acquisition can only fail on a programming error.
        let _permit = self
            .semaphore
            .acquire()
            .await
            .expect("executor semaphore should not be closed");
        work.await
    }
}
