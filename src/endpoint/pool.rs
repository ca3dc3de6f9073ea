//! Bounded execution pool for State runs.
//!
//! The pool is a semaphore in front of a [`TaskTracker`]. Every submitted run
//! is spawned immediately but waits for a permit before it starts, so at most
//! `size` runs of one endpoint make progress at a time. All runs share the
//! pool's cancellation token: retiring the pool cancels everything it still
//! holds and a replacement pool is usable at once.
//!
//! # Example
//!
//! ```
//! use daq_routine::endpoint::ExecutionPool;
//!
//! # tokio_test::block_on(async {
//! let pool = ExecutionPool::new(2);
//! pool.submit(async {});
//! pool.retire().wait().await;
//! # });
//! ```

use std::future::Future;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Bounded set of concurrently running States, retired as a whole on stop.
#[derive(Debug)]
pub struct ExecutionPool {
    size: usize,
    permits: Arc<Semaphore>,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl ExecutionPool {
    /// Pool admitting `size` runs at a time, at least one.
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            size,
            permits: Arc::new(Semaphore::new(size)),
            tracker: TaskTracker::new(),
            token: CancellationToken::new(),
        }
    }

    /// Concurrent runs admitted.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Token for one run. Cancelled when the run is terminated or the pool retires.
    pub fn child_token(&self) -> CancellationToken {
        self.token.child_token()
    }

    /// Runs submitted and not yet finished, including those waiting for a permit.
    pub fn in_flight(&self) -> usize {
        self.tracker.len()
    }

    /// Whether [`Self::retire`] was called.
    pub fn is_retired(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Submits a run. A run still waiting for its permit when the pool
    /// retires is dropped without being started.
    pub fn submit<F>(&self, run: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let permits = Arc::clone(&self.permits);
        let token = self.token.clone();
        self.tracker.spawn(async move {
            let _permit = tokio::select! {
                biased;
                _ = token.cancelled() => return,
                permit = permits.acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => return,
                },
            };
            run.await;
        });
    }

    /// Cancels every run and stops accepting new ones. The returned tracker
    /// lets the owner wait for the runs to drain.
    pub fn retire(self) -> TaskTracker {
        self.token.cancel();
        self.tracker.close();
        self.tracker
    }

    /// Tracker of the live pool, closed so that `wait` resolves once it drains.
    pub(crate) fn close(&self) -> TaskTracker {
        self.tracker.close();
        self.tracker.clone()
    }

    pub(crate) fn cancel_all(&self) {
        self.token.cancel();
    }
}
