//! The State abstraction: a single run-once unit of work on one endpoint.
//!
//! A State is built by the worker from a dequeued [`Task`](super::Task) and
//! executed once on the endpoint's pool. It receives a [`StateScope`] carrying
//! its deadline and its cancellation token. Cancellation is cooperative: any
//! State that loops must poll [`StateScope::running`] or suspend through
//! [`StateScope::pause`], which wakes on cancellation.

use super::gate::StartGate;
use super::queue::PendingWork;
use super::EndpointId;
use crate::error::AppResult;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// One run of endpoint work, built from a task by [`Endpoint::build_state`](super::Endpoint::build_state).
#[async_trait]
pub trait State: Send {
    /// The work itself. Errors are logged by the framework; they never reach
    /// the worker loop.
    async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()>;

    /// Runs after `run_logic` on success, failure and cancellation alike.
    async fn on_exit(&mut self, _scope: &StateScope) {}
}

/// Execution context of one State run.
pub struct StateScope {
    endpoint: EndpointId,
    kind: &'static str,
    created_at: Instant,
    deadline: Instant,
    cancel: CancellationToken,
    pending: Arc<dyn PendingWork>,
}

impl std::fmt::Debug for StateScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateScope")
            .field("endpoint", &self.endpoint)
            .field("kind", &self.kind)
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

impl StateScope {
    pub(crate) fn new(
        endpoint: EndpointId,
        kind: &'static str,
        duration: Duration,
        cancel: CancellationToken,
        pending: Arc<dyn PendingWork>,
    ) -> Self {
        let created_at = Instant::now();
        Self {
            endpoint,
            kind,
            created_at,
            deadline: created_at + duration,
            cancel,
            pending,
        }
    }

    /// A scope not attached to any controller. Used to run a State inline.
    pub fn detached(endpoint: EndpointId, kind: &'static str, duration: Duration) -> Self {
        struct Nothing;
        impl PendingWork for Nothing {
            fn pending(&self) -> usize {
                0
            }
        }
        Self::new(endpoint, kind, duration, CancellationToken::new(), Arc::new(Nothing))
    }

    /// Endpoint the run belongs to.
    pub fn endpoint(&self) -> EndpointId {
        self.endpoint
    }

    /// Label of the State kind.
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// When the run was dispatched.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// Dispatch time plus the task duration.
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Time left until the deadline, zero once past it.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Whether the run was stopped or terminated.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Flags this run as cancelled.
    pub fn terminate(&self) {
        self.cancel.cancel();
    }

    /// Not cancelled and before the deadline.
    pub fn running(&self) -> bool {
        !self.is_cancelled() && Instant::now() < self.deadline
    }

    /// Resolves when the run is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    /// Child token for sub-schedulers owned by this run.
    pub fn child_token(&self) -> CancellationToken {
        self.cancel.child_token()
    }

    /// Sleeps for `duration`. Returns `false` if cancelled first.
    pub async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    /// Sleeps until the deadline. Returns `false` if cancelled first.
    pub async fn pause_until_deadline(&self) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = tokio::time::sleep_until(self.deadline) => true,
        }
    }

    /// Waits for `gate` to open. Returns `false` if cancelled first.
    pub async fn wait_gate(&self, gate: &StartGate) -> bool {
        tokio::select! {
            _ = self.cancel.cancelled() => false,
            _ = gate.wait() => true,
        }
    }

    /// Tasks queued on this endpoint behind the current one.
    pub fn has_pending_work(&self) -> bool {
        self.pending.pending() > 0
    }
}

/// Template method around one State run.
pub(crate) async fn execute(mut state: Box<dyn State>, scope: StateScope) {
    debug!(endpoint = scope.endpoint.name(), kind = scope.kind, "State started");
    if let Err(e) = state.run_logic(&scope).await {
        error!(endpoint = scope.endpoint.name(), kind = scope.kind, error = %e, "State failed");
    }
    state.on_exit(&scope).await;
    debug!(
        endpoint = scope.endpoint.name(),
        kind = scope.kind,
        cancelled = scope.is_cancelled(),
        "State finished"
    );
}
