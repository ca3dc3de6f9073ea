//! Named progress counters.
//!
//! Each space has a target and a current value that always stays in
//! `[0, target]`. The routine engine is the single writer; the demo binary and
//! any UI read concurrently through a shared `Arc<ProgressTracker>`.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;

/// Timestamps of a progress space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SpaceMetadata {
    /// When the space was added.
    pub started_at: DateTime<Utc>,
    /// Set the first time the space reaches its target.
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
struct ProgressSpace {
    target: u64,
    current: u64,
    metadata: SpaceMetadata,
}

impl ProgressSpace {
    fn store(&mut self, value: u64) {
        self.current = value.min(self.target);
        if self.current >= self.target && self.metadata.completed_at.is_none() {
            self.metadata.completed_at = Some(Utc::now());
        }
    }
}

/// Named progress counters, one per running slot.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    spaces: RwLock<HashMap<String, ProgressSpace>>,
}

impl ProgressTracker {
    /// Tracker without spaces.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a space. Empty names, zero targets and existing names are rejected.
    pub fn add(&self, name: &str, target: u64) -> bool {
        if name.is_empty() || target == 0 {
            return false;
        }
        let mut spaces = self.spaces.write();
        if spaces.contains_key(name) {
            return false;
        }
        spaces.insert(
            name.to_string(),
            ProgressSpace {
                target,
                current: 0,
                metadata: SpaceMetadata {
                    started_at: Utc::now(),
                    completed_at: None,
                },
            },
        );
        true
    }

    /// Changes the target of a space, clamping its current value if needed.
    pub fn update_target(&self, name: &str, target: u64) -> bool {
        if target == 0 {
            return false;
        }
        let mut spaces = self.spaces.write();
        match spaces.get_mut(name) {
            Some(space) => {
                space.target = target;
                let current = space.current;
                space.store(current);
                true
            }
            None => false,
        }
    }

    /// Advances a space by `delta`, saturating at its target.
    ///
    /// Returns the new value, or `None` for an unknown space.
    pub fn progress(&self, name: &str, delta: u64) -> Option<u64> {
        let mut spaces = self.spaces.write();
        let space = spaces.get_mut(name)?;
        let value = space.current.saturating_add(delta);
        space.store(value);
        Some(space.current)
    }

    /// Sets a space directly. The value is clamped to `[0, target]` and may
    /// move down.
    pub fn set(&self, name: &str, value: i64) -> Option<u64> {
        let mut spaces = self.spaces.write();
        let space = spaces.get_mut(name)?;
        space.store(u64::try_from(value).unwrap_or(0));
        Some(space.current)
    }

    /// Forces a space to its target.
    pub fn complete(&self, name: &str) -> Option<u64> {
        let mut spaces = self.spaces.write();
        let space = spaces.get_mut(name)?;
        let target = space.target;
        space.store(target);
        Some(space.current)
    }

    /// Removes a space. `false` if it did not exist.
    pub fn delete(&self, name: &str) -> bool {
        self.spaces.write().remove(name).is_some()
    }

    /// Removes every space.
    pub fn purge(&self) {
        self.spaces.write().clear();
    }

    /// `(target, current)` of a space.
    pub fn get(&self, name: &str) -> Option<(u64, u64)> {
        self.spaces
            .read()
            .get(name)
            .map(|space| (space.target, space.current))
    }

    /// Timestamps of a space.
    pub fn metadata(&self, name: &str) -> Option<SpaceMetadata> {
        self.spaces.read().get(name).map(|space| space.metadata)
    }

    /// Names of the current spaces, unordered.
    pub fn names(&self) -> Vec<String> {
        self.spaces.read().keys().cloned().collect()
    }

    /// Sum of currents over sum of targets, as a percentage. 0 when empty.
    pub fn overall(&self) -> f64 {
        let spaces = self.spaces.read();
        let (current, target) = spaces
            .values()
            .fold((0u64, 0u64), |(c, t), space| (c + space.current, t + space.target));
        if target == 0 {
            return 0.0;
        }
        current as f64 / target as f64 * 100.0
    }
}
