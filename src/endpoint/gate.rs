//! Manual-reset start gates.
//!
//! A gate stays open once opened until it is explicitly closed. The engine
//! opens the gates of all endpoints touched by a slot at the same instant so
//! their timed loops start aligned, then closes them when the slot ends.

use std::sync::Arc;
use tokio::sync::watch;

/// A latch States wait on before starting their main work. Clones share
/// the same state.
#[derive(Debug, Clone)]
pub struct StartGate {
    state: Arc<watch::Sender<bool>>,
}

impl Default for StartGate {
    fn default() -> Self {
        Self::new()
    }
}

impl StartGate {
    /// Creates a closed gate.
    pub fn new() -> Self {
        let (state, _) = watch::channel(false);
        Self {
            state: Arc::new(state),
        }
    }

    /// Releases current and future waiters.
    pub fn open(&self) {
        self.state.send_replace(true);
    }

    /// Makes later waiters block again.
    pub fn close(&self) {
        self.state.send_replace(false);
    }

    /// Whether the gate is currently open.
    pub fn is_open(&self) -> bool {
        *self.state.borrow()
    }

    /// Waits until the gate is open. Returns immediately if it already is.
    pub async fn wait(&self) {
        let mut rx = self.state.subscribe();
        // The sender lives as long as `self`, so this cannot observe a closed channel.
        let _ = rx.wait_for(|open| *open).await;
    }
}
