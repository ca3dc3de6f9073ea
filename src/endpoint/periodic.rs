//! Periodic sub-scheduler for States.
//!
//! A State that needs to act on a fixed cadence while it runs (capture bursts,
//! sensor polling, subroutines) owns a [`PeriodicJob`]. The job is aborted
//! when it is dropped, so it cannot outlive the State on any exit path.
//! [`PeriodicJob::finish`] ends it gracefully instead, letting a tick that is
//! already running complete first.

use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{trace, warn};

/// When a job ticks.
#[derive(Debug, Clone, Copy)]
pub struct Schedule {
    /// First tick.
    pub start: Instant,
    /// Spacing between ticks.
    pub period: Duration,
    /// No tick fires at or after this instant.
    pub until: Option<Instant>,
}

impl Schedule {
    /// Ticks now and then every `period`.
    pub fn every(period: Duration) -> Self {
        Self {
            start: Instant::now(),
            period,
            until: None,
        }
    }

    /// First tick after one `period`.
    pub fn delayed(mut self) -> Self {
        self.start += self.period;
        self
    }

    /// Stops ticking at `until`.
    pub fn until(mut self, until: Instant) -> Self {
        self.until = Some(until);
        self
    }
}

/// A task running a closure on a [`Schedule`].
#[derive(Debug)]
pub struct PeriodicJob {
    name: &'static str,
    cancel: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicJob {
    /// Spawns `tick` on `schedule` until `cancel` fires, the schedule ends or
    /// the job is dropped. Cancellation is only observed between ticks; a
    /// tick that should end early must watch `cancel` itself. Dropping the
    /// job aborts it, even mid-tick.
    pub fn spawn<F, Fut>(
        name: &'static str,
        schedule: Schedule,
        cancel: CancellationToken,
        mut tick: F,
    ) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let period = schedule.period.max(Duration::from_millis(1));
        let token = cancel.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(schedule.start, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    at = interval.tick() => {
                        if schedule.until.is_some_and(|until| at >= until) {
                            break;
                        }
                        tick().await;
                    }
                }
            }
            trace!(job = name, "Periodic job finished");
        });
        Self {
            name,
            cancel: token,
            handle: Some(handle),
        }
    }

    /// Name given at spawn, used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop has exited.
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Stops the job immediately, aborting a running tick.
    pub fn stop(self) {
        drop(self);
    }

    /// Cancels the job's token and waits up to `grace` for a running tick to
    /// complete. Returns `false` if the tick had to be aborted.
    pub async fn finish(mut self, grace: Duration) -> bool {
        self.cancel.cancel();
        let Some(handle) = self.handle.take() else {
            return true;
        };
        let abort = handle.abort_handle();
        match tokio::time::timeout(grace, handle).await {
            Ok(_) => true,
            Err(_) => {
                warn!(job = self.name, ?grace, "Periodic job still busy, aborting it");
                abort.abort();
                false
            }
        }
    }
}

impl Drop for PeriodicJob {
    fn drop(&mut self) {
        if let Some(handle) = &self.handle {
            handle.abort();
        }
    }
}
