//! Task queue feeding an endpoint's worker loop.

use crossbeam_queue::SegQueue;
use std::time::Duration;
use tokio::sync::Notify;

/// A scheduled unit of work: which State to build and how long it may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task<K> {
    kind: K,
    duration: Duration,
}

impl<K: Copy> Task<K> {
    /// Task for `kind` with a deadline `duration` after dispatch.
    pub fn new(kind: K, duration: Duration) -> Self {
        Self { kind, duration }
    }

    /// State to build.
    pub fn kind(&self) -> K {
        self.kind
    }

    /// Offset from dispatch time to the State's deadline.
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

/// Unbounded FIFO of [`Task`]s.
///
/// Pushing never blocks. Each push stores a wake-up permit so a worker that
/// is between polls picks the task up without waiting a full interval.
#[derive(Debug)]
pub struct TaskQueue<K> {
    tasks: SegQueue<Task<K>>,
    notify: Notify,
}

impl<K> Default for TaskQueue<K> {
    fn default() -> Self {
        Self {
            tasks: SegQueue::new(),
            notify: Notify::new(),
        }
    }
}

impl<K> TaskQueue<K> {
    /// Empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a task and wakes the worker.
    pub fn push(&self, task: Task<K>) {
        self.tasks.push(task);
        self.notify.notify_one();
    }

    /// Oldest task, if any.
    pub fn pop(&self) -> Option<Task<K>> {
        self.tasks.pop()
    }

    /// Tasks waiting.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether no task is waiting.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Discards every pending task and returns how many were dropped.
    pub fn clear(&self) -> usize {
        let mut dropped = 0;
        while self.tasks.pop().is_some() {
            dropped += 1;
        }
        dropped
    }

    /// Resolves on the next push, or immediately if a push happened since
    /// the last wake-up.
    pub async fn notified(&self) {
        self.notify.notified().await;
    }
}

/// Read-only view of pending work, handed to running States.
pub trait PendingWork: Send + Sync {
    /// Tasks waiting on the endpoint.
    fn pending(&self) -> usize;
}

impl<K: Send> PendingWork for TaskQueue<K> {
    fn pending(&self) -> usize {
        self.len()
    }
}
