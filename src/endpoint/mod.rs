//! Endpoint controllers.
//!
//! Every controllable unit (a device or the analysis engine) is driven by an
//! [`EndpointController`]: a FIFO of [`Task`]s, one worker loop that turns
//! tasks into [`State`]s, and a bounded [`ExecutionPool`] that runs them.
//!
//! The per-endpoint state machine is `Idle -> Running(kind) -> Idle`.
//! [`EndpointController::stop`] cancels whatever runs, discards the queue and
//! swaps in a fresh pool; States notice the cancellation cooperatively.
//!
//! # Example
//!
//! ```no_run
//! # async fn demo(camera: std::sync::Arc<daq_routine::devices::camera::CameraController>) {
//! use daq_routine::devices::camera::CameraKind;
//! use std::time::Duration;
//!
//! camera.enqueue(CameraKind::HealthCheck, Duration::ZERO);
//! // ...
//! camera.stop();
//! camera.shutdown().await;
//! # }
//! ```

pub mod gate;
pub mod periodic;
pub mod pool;
pub mod queue;
pub mod state;

pub use gate::StartGate;
pub use periodic::{PeriodicJob, Schedule};
pub use pool::ExecutionPool;
pub use queue::{PendingWork, Task, TaskQueue};
pub use state::{State, StateScope};

use crate::config::EndpointSettings;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, instrument, warn};

/// Identity of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EndpointId {
    /// Periodic health checks over the devices.
    DeviceSupervisor,
    /// Industrial camera.
    Camera,
    /// Thermostat board with sensors and light.
    Thermostat,
    /// Mass flow controller.
    Mfc,
    /// Syringe pump.
    Pump,
    /// Image analysis.
    Analysis,
}

impl EndpointId {
    /// Device endpoints watched by the supervisor.
    pub const DEVICES: [EndpointId; 4] = [
        EndpointId::Camera,
        EndpointId::Thermostat,
        EndpointId::Mfc,
        EndpointId::Pump,
    ];

    /// Snake-case name used in logs and events.
    pub fn name(&self) -> &'static str {
        match self {
            EndpointId::DeviceSupervisor => "device_supervisor",
            EndpointId::Camera => "camera",
            EndpointId::Thermostat => "thermostat",
            EndpointId::Mfc => "mfc",
            EndpointId::Pump => "pump",
            EndpointId::Analysis => "analysis",
        }
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Tag selecting a State in an endpoint's state table.
pub trait StateKind: Copy + Eq + Debug + Send + Sync + 'static {
    /// Snake-case name of the State, for logs.
    fn label(&self) -> &'static str;
}

/// An endpoint with a closed table of States.
pub trait Endpoint: Send + Sync + 'static {
    /// State kinds this endpoint accepts.
    type Kind: StateKind;

    /// Identity reported in logs and the context.
    const ID: EndpointId;

    /// Kind the device supervisor enqueues to probe this endpoint.
    const HEALTH_CHECK: Option<Self::Kind> = None;

    /// Builds the State for `kind`. `None` marks a kind this endpoint does
    /// not support; the task is logged and dropped.
    fn build_state(endpoint: &Arc<Self>, kind: Self::Kind) -> Option<Box<dyn State>>;
}

/// Type-erased control surface, used where endpoints of different kinds are
/// reset together.
#[async_trait]
pub trait ControlHandle: Send + Sync {
    /// Identity of the endpoint behind the handle.
    fn id(&self) -> EndpointId;

    /// See [`EndpointController::stop`].
    fn stop(&self);

    /// See [`EndpointController::shutdown`].
    async fn shutdown(&self);

    /// No State registered as current.
    fn is_idle(&self) -> bool;

    /// Tasks queued and not yet dispatched.
    fn pending(&self) -> usize;

    /// No State running and nothing queued.
    fn is_quiet(&self) -> bool {
        // Queue first: a popped task is registered as current under the
        // dispatch lock, which `is_idle` takes.
        self.pending() == 0 && self.is_idle()
    }

    /// Enqueues the endpoint's health check. Returns `false` if it has none.
    fn request_health_check(&self) -> bool;
}

/// The run registered as "current".
#[derive(Debug)]
struct Running<K> {
    id: u64,
    kind: K,
    cancel: CancellationToken,
}

#[derive(Debug)]
struct Dispatch<K> {
    current: Option<Running<K>>,
    pool: ExecutionPool,
    /// Pools replaced by `stop` whose runs may still be draining.
    retired: Vec<TaskTracker>,
}

struct Shared<K> {
    id: EndpointId,
    queue: Arc<TaskQueue<K>>,
    dispatch: Mutex<Dispatch<K>>,
    shutdown: CancellationToken,
    pool_size: usize,
    poll_interval: Duration,
    shutdown_timeout: Duration,
    next_run: AtomicU64,
    last_dispatched: Mutex<Option<K>>,
}

/// Clears the current slot when a run ends, unless a newer run replaced it.
/// Runs on panic too.
struct CurrentGuard<K: StateKind> {
    shared: Arc<Shared<K>>,
    run: u64,
}

impl<K: StateKind> Drop for CurrentGuard<K> {
    fn drop(&mut self) {
        let mut dispatch = self.shared.dispatch.lock();
        if dispatch.current.as_ref().is_some_and(|r| r.id == self.run) {
            dispatch.current = None;
        }
    }
}

/// Queue, worker loop and execution pool of one endpoint.
pub struct EndpointController<E: Endpoint> {
    endpoint: Arc<E>,
    shared: Arc<Shared<E::Kind>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl<E: Endpoint> EndpointController<E> {
    /// Starts the worker loop. Must be called inside a tokio runtime.
    pub fn spawn(endpoint: Arc<E>, pool_size: usize, settings: &EndpointSettings) -> Arc<Self> {
        let shared = Arc::new(Shared {
            id: E::ID,
            queue: Arc::new(TaskQueue::new()),
            dispatch: Mutex::new(Dispatch {
                current: None,
                pool: ExecutionPool::new(pool_size),
                retired: Vec::new(),
            }),
            shutdown: CancellationToken::new(),
            pool_size,
            poll_interval: settings.poll_interval(),
            shutdown_timeout: settings.shutdown_timeout(),
            next_run: AtomicU64::new(1),
            last_dispatched: Mutex::new(None),
        });

        let worker = tokio::spawn(worker_loop(Arc::clone(&endpoint), Arc::clone(&shared)));
        info!(endpoint = E::ID.name(), pool_size, "Endpoint controller started");

        Arc::new(Self {
            endpoint,
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// The endpoint whose States this controller runs.
    pub fn endpoint(&self) -> &Arc<E> {
        &self.endpoint
    }

    /// Identity of the controlled endpoint.
    pub fn id(&self) -> EndpointId {
        E::ID
    }

    /// Schedules `kind` with a deadline `duration` after dispatch. Never blocks.
    pub fn enqueue(&self, kind: E::Kind, duration: Duration) {
        if self.shared.shutdown.is_cancelled() {
            warn!(endpoint = E::ID.name(), kind = kind.label(), "Endpoint is shut down, dropping task");
            return;
        }
        debug!(endpoint = E::ID.name(), kind = kind.label(), ?duration, "Task enqueued");
        self.shared.queue.push(Task::new(kind, duration));
    }

    /// Cancels the running States, discards pending tasks and replaces the
    /// pool so the next task can start immediately.
    pub fn stop(&self) {
        let mut dispatch = self.shared.dispatch.lock();
        let dropped = self.shared.queue.clear();
        if let Some(running) = &dispatch.current {
            running.cancel.cancel();
        }

        let fresh = ExecutionPool::new(self.shared.pool_size);
        let old = std::mem::replace(&mut dispatch.pool, fresh);
        let draining = old.retire();
        dispatch.retired.retain(|tracker| !tracker.is_empty());
        if !draining.is_empty() {
            dispatch.retired.push(draining);
        }
        drop(dispatch);

        debug!(endpoint = E::ID.name(), dropped, "Endpoint stopped");
    }

    /// Stops, ends the worker loop and waits for in-flight States to drain,
    /// bounded by the configured shutdown timeout. Safe to call repeatedly.
    pub async fn shutdown(&self) {
        self.stop();
        self.shared.shutdown.cancel();

        let worker = self.worker.lock().take();
        let Some(worker) = worker else {
            return;
        };
        if let Err(e) = worker.await {
            error!(endpoint = E::ID.name(), error = %e, "Worker loop ended abnormally");
        }

        let trackers = {
            let mut dispatch = self.shared.dispatch.lock();
            let mut trackers = std::mem::take(&mut dispatch.retired);
            trackers.push(dispatch.pool.close());
            trackers
        };
        let drain = async {
            for tracker in trackers {
                tracker.wait().await;
            }
        };
        match tokio::time::timeout(self.shared.shutdown_timeout, drain).await {
            Ok(()) => info!(endpoint = E::ID.name(), "Endpoint shut down"),
            Err(_) => warn!(
                endpoint = E::ID.name(),
                timeout = ?self.shared.shutdown_timeout,
                "States still running after shutdown timeout"
            ),
        }
    }

    /// Kind of the State registered as current, if any.
    pub fn current_state_kind(&self) -> Option<E::Kind> {
        self.shared.dispatch.lock().current.as_ref().map(|r| r.kind)
    }

    /// No State registered as current.
    pub fn is_idle(&self) -> bool {
        self.current_state_kind().is_none()
    }

    /// Flags the current State cancelled without touching the queue or pool.
    pub fn terminate_current(&self) {
        if let Some(running) = &self.shared.dispatch.lock().current {
            running.cancel.cancel();
        }
    }

    /// Tasks queued and not yet dispatched.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Runs submitted to the live pool and not yet finished.
    pub fn in_flight(&self) -> usize {
        self.shared.dispatch.lock().pool.in_flight()
    }

    /// Kind of the most recently dispatched task.
    pub fn last_dispatched(&self) -> Option<E::Kind> {
        *self.shared.last_dispatched.lock()
    }

    /// Number of tasks turned into State runs since start.
    pub fn dispatched(&self) -> u64 {
        self.shared.next_run.load(Ordering::SeqCst) - 1
    }

    /// Whether [`Self::shutdown`] has begun.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

impl<E: Endpoint> Drop for EndpointController<E> {
    fn drop(&mut self) {
        self.shared.shutdown.cancel();
        self.shared.dispatch.lock().pool.cancel_all();
    }
}

#[async_trait]
impl<E: Endpoint> ControlHandle for EndpointController<E> {
    fn id(&self) -> EndpointId {
        E::ID
    }

    fn stop(&self) {
        EndpointController::stop(self);
    }

    async fn shutdown(&self) {
        EndpointController::shutdown(self).await;
    }

    fn is_idle(&self) -> bool {
        EndpointController::is_idle(self)
    }

    fn pending(&self) -> usize {
        EndpointController::pending(self)
    }

    fn request_health_check(&self) -> bool {
        match E::HEALTH_CHECK {
            Some(kind) => {
                self.enqueue(kind, Duration::ZERO);
                true
            }
            None => false,
        }
    }
}

impl<K: StateKind> Shared<K> {
    /// Pops one task and submits its State. Returns whether a task was taken.
    fn dispatch_next<E>(self: &Arc<Self>, endpoint: &Arc<E>) -> bool
    where
        E: Endpoint<Kind = K>,
    {
        let mut dispatch = self.dispatch.lock();
        let Some(task) = self.queue.pop() else {
            return false;
        };
        let kind = task.kind();
        let Some(state) = E::build_state(endpoint, kind) else {
            warn!(endpoint = self.id.name(), kind = kind.label(), "Unsupported task kind, dropping");
            return true;
        };

        let run = self.next_run.fetch_add(1, Ordering::SeqCst);
        let cancel = dispatch.pool.child_token();
        let pending: Arc<dyn PendingWork> = self.queue.clone();
        let scope = StateScope::new(self.id, kind.label(), task.duration(), cancel.clone(), pending);
        dispatch.current = Some(Running { id: run, kind, cancel });
        *self.last_dispatched.lock() = Some(kind);

        let guard = CurrentGuard {
            shared: Arc::clone(self),
            run,
        };
        dispatch.pool.submit(async move {
            let _guard = guard;
            state::execute(state, scope).await;
        });
        true
    }
}

#[instrument(skip_all, fields(endpoint = E::ID.name()))]
async fn worker_loop<E: Endpoint>(endpoint: Arc<E>, shared: Arc<Shared<E::Kind>>) {
    debug!("Worker loop started");
    loop {
        if shared.shutdown.is_cancelled() {
            break;
        }
        if shared.dispatch_next(&endpoint) && !shared.queue.is_empty() {
            tokio::task::yield_now().await;
            continue;
        }
        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.queue.notified() => {}
            _ = tokio::time::sleep(shared.poll_interval) => {}
        }
    }
    debug!("Worker loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppResult;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum ProbeKind {
        Hold,
        Quick,
        Unsupported,
    }

    impl StateKind for ProbeKind {
        fn label(&self) -> &'static str {
            match self {
                ProbeKind::Hold => "hold",
                ProbeKind::Quick => "quick",
                ProbeKind::Unsupported => "unsupported",
            }
        }
    }

    #[derive(Default)]
    struct Probe {
        finished: AtomicUsize,
    }

    struct Hold(Arc<Probe>);

    #[async_trait]
    impl State for Hold {
        async fn run_logic(&mut self, scope: &StateScope) -> AppResult<()> {
            scope.pause_until_deadline().await;
            Ok(())
        }

        async fn on_exit(&mut self, _scope: &StateScope) {
            self.0.finished.fetch_add(1, Ordering::SeqCst);
        }
    }

    impl Endpoint for Probe {
        type Kind = ProbeKind;
        const ID: EndpointId = EndpointId::Analysis;

        fn build_state(endpoint: &Arc<Self>, kind: ProbeKind) -> Option<Box<dyn State>> {
            match kind {
                ProbeKind::Hold | ProbeKind::Quick => Some(Box::new(Hold(Arc::clone(endpoint)))),
                ProbeKind::Unsupported => None,
            }
        }
    }

    fn controller() -> Arc<EndpointController<Probe>> {
        EndpointController::spawn(Arc::new(Probe::default()), 2, &EndpointSettings::default())
    }

    #[tokio::test(start_paused = true)]
    async fn test_current_kind_set_then_cleared() {
        let ctl = controller();
        ctl.enqueue(ProbeKind::Hold, Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctl.current_state_kind(), Some(ProbeKind::Hold));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(ctl.current_state_kind(), None);
        assert_eq!(ctl.endpoint().finished.load(Ordering::SeqCst), 1);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsupported_kind_is_dropped() {
        let ctl = controller();
        ctl.enqueue(ProbeKind::Unsupported, Duration::ZERO);
        ctl.enqueue(ProbeKind::Quick, Duration::ZERO);

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(ctl.dispatched(), 1);
        assert_eq!(ctl.last_dispatched(), Some(ProbeKind::Quick));
        assert_eq!(ctl.pending(), 0);
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_cancels_and_empties_queue() {
        let ctl = controller();
        for _ in 0..5 {
            ctl.enqueue(ProbeKind::Hold, Duration::from_secs(60));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!ctl.is_idle());

        ctl.stop();
        assert_eq!(ctl.pending(), 0);
        assert_eq!(ctl.in_flight(), 0);

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(ctl.is_idle());

        ctl.enqueue(ProbeKind::Quick, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctl.current_state_kind(), Some(ProbeKind::Quick));
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_terminate_current_keeps_queue() {
        let ctl = controller();
        ctl.enqueue(ProbeKind::Hold, Duration::from_secs(60));
        tokio::time::sleep(Duration::from_millis(100)).await;
        ctl.enqueue(ProbeKind::Quick, Duration::from_secs(60));
        ctl.terminate_current();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(ctl.endpoint().finished.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.current_state_kind(), Some(ProbeKind::Quick));
        ctl.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_is_idempotent_and_rejects_work() {
        let ctl = controller();
        ctl.enqueue(ProbeKind::Hold, Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(100)).await;

        ctl.shutdown().await;
        ctl.shutdown().await;
        assert!(ctl.is_shut_down());
        assert!(ctl.is_idle());

        ctl.enqueue(ProbeKind::Quick, Duration::ZERO);
        assert_eq!(ctl.pending(), 0);
    }
}
