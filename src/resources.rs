//! Resource registry and measurement directory layout.
//!
//! A resource space maps names to filesystem paths. Two kinds of spaces
//! exist while a routine runs:
//!
//! - one per slot, named after the slot, holding its result destinations
//!   (see [`SlotPaths`]); created by [`MeasurementLayout::create`]
//! - one per running slot, named after the slot uid, into which the camera
//!   registers every image it writes and from which the analysis endpoint
//!   collects work

use crate::error::{AppResult, DaqError};
use crate::routine::Routine;
use parking_lot::RwLock;
use regex::Regex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Resource names of the slot destinations.
pub const SLOT_ROOT: &str = "Slot";
/// Calibration frames.
pub const SLOT_CALIBRATION: &str = "Calibration";
/// Analysis output.
pub const SLOT_RESULT: &str = "Result";
/// Captured bursts.
pub const SLOT_IMAGES: &str = "Images";
/// Result database file.
pub const SLOT_RESULT_DB: &str = "DB";

/// File name of the per-slot result database.
pub const RESULT_DB_FILE: &str = "results.db";

/// A registered resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resource {
    /// Logical name within its space.
    pub name: String,
    /// Filesystem location.
    pub path: PathBuf,
}

/// The five destinations of one slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotPaths {
    /// Slot directory.
    pub root: PathBuf,
    /// Calibration frames.
    pub calibration: PathBuf,
    /// Analysis output.
    pub result: PathBuf,
    /// Captured bursts.
    pub images: PathBuf,
    /// Result database inside `result`.
    pub result_db: PathBuf,
}

/// Maps logical names to filesystem paths, grouped in spaces.
pub trait ResourceRegistry: Send + Sync {
    /// Registers `path` as `name` in `space`, creating the space if needed.
    /// Re-registering a name replaces its path.
    fn register(&self, space: &str, name: &str, path: PathBuf);

    /// Resources of a space in registration order.
    fn resources(&self, space: &str) -> Option<Vec<Resource>>;

    /// Removes one resource. `false` if it was not registered.
    fn deregister(&self, space: &str, name: &str) -> bool;

    /// Removes a space with all its resources.
    fn delete_space(&self, space: &str) -> bool;

    /// Names of all spaces, unordered.
    fn spaces(&self) -> Vec<String>;

    /// Resolves the destinations registered for a slot.
    ///
    /// # Errors
    ///
    /// [`DaqError::ResourcesUnresolved`] when the space or any destination is missing.
    fn slot_paths(&self, slot: &str) -> AppResult<SlotPaths> {
        let resources = self
            .resources(slot)
            .ok_or_else(|| DaqError::ResourcesUnresolved(slot.to_string()))?;
        let find = |name: &str| {
            resources
                .iter()
                .find(|r| r.name == name)
                .map(|r| r.path.clone())
                .ok_or_else(|| DaqError::ResourcesUnresolved(format!("{slot}/{name}")))
        };
        Ok(SlotPaths {
            root: find(SLOT_ROOT)?,
            calibration: find(SLOT_CALIBRATION)?,
            result: find(SLOT_RESULT)?,
            images: find(SLOT_IMAGES)?,
            result_db: find(SLOT_RESULT_DB)?,
        })
    }
}

/// Process-local [`ResourceRegistry`].
#[derive(Debug, Default)]
pub struct InMemoryResourceRegistry {
    spaces: RwLock<HashMap<String, Vec<Resource>>>,
}

impl InMemoryResourceRegistry {
    /// Registry without spaces.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResourceRegistry for InMemoryResourceRegistry {
    fn register(&self, space: &str, name: &str, path: PathBuf) {
        let mut spaces = self.spaces.write();
        let resources = spaces.entry(space.to_string()).or_default();
        match resources.iter_mut().find(|r| r.name == name) {
            Some(existing) => existing.path = path,
            None => resources.push(Resource {
                name: name.to_string(),
                path,
            }),
        }
    }

    fn resources(&self, space: &str) -> Option<Vec<Resource>> {
        let resources = self.spaces.read().get(space).cloned();
        if resources.is_none() {
            debug!(space, "Requested resources of unknown space");
        }
        resources
    }

    fn deregister(&self, space: &str, name: &str) -> bool {
        let mut spaces = self.spaces.write();
        let Some(resources) = spaces.get_mut(space) else {
            return false;
        };
        let before = resources.len();
        resources.retain(|r| r.name != name);
        resources.len() != before
    }

    fn delete_space(&self, space: &str) -> bool {
        let removed = self.spaces.write().remove(space).is_some();
        if !removed {
            warn!(space, "Resource space does not exist");
        }
        removed
    }

    fn spaces(&self) -> Vec<String> {
        let mut spaces: Vec<String> = self.spaces.read().keys().cloned().collect();
        spaces.sort();
        spaces
    }
}

/// On-disk layout of one measurement.
#[derive(Debug, Clone)]
pub struct MeasurementLayout {
    /// Measurement directory.
    pub root: PathBuf,
    /// Slot uid and its directory, in routine order.
    pub slots: Vec<(Uuid, PathBuf)>,
}

impl MeasurementLayout {
    /// Creates the measurement directory under `data_dir` and one directory
    /// per slot, registering each slot's destinations under the slot name.
    /// Fails before touching the filesystem if the routine does not validate.
    pub fn create(
        data_dir: &Path,
        name: &str,
        routine: &Routine,
        registry: &dyn ResourceRegistry,
    ) -> AppResult<Self> {
        routine.validate()?;
        fs::create_dir_all(data_dir)?;
        let root = next_directory_name(&data_dir.join(sanitize_name(name)))?;
        fs::create_dir_all(&root)?;

        let mut slots = Vec::with_capacity(routine.slots.len());
        for slot in &routine.slots {
            let dir = next_directory_name(&root.join(sanitize_name(&slot.name)))?;
            let result = dir.join(SLOT_RESULT);
            let calibration = dir.join(SLOT_CALIBRATION);
            let images = dir.join(SLOT_IMAGES);
            for folder in [&result, &calibration, &images] {
                fs::create_dir_all(folder)?;
            }

            registry.register(&slot.name, SLOT_ROOT, dir.clone());
            registry.register(&slot.name, SLOT_RESULT, result.clone());
            registry.register(&slot.name, SLOT_CALIBRATION, calibration);
            registry.register(&slot.name, SLOT_IMAGES, images);
            registry.register(&slot.name, SLOT_RESULT_DB, result.join(RESULT_DB_FILE));

            debug!(slot = %slot.name, dir = %dir.display(), "Created slot directory");
            slots.push((slot.uid, dir));
        }

        info!(root = %root.display(), slots = slots.len(), "Created measurement layout");
        Ok(Self { root, slots })
    }
}

/// Replaces control characters, ASCII punctuation and spaces with `_`.
pub fn sanitize_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if (c as u32) < 0x20 || c.is_ascii_punctuation() || c == ' ' {
                '_'
            } else {
                c
            }
        })
        .collect()
}

/// Returns `base` if no sibling uses its name, otherwise `base (n)` with
/// `n` one above the highest existing suffix.
pub fn next_directory_name(base: &Path) -> AppResult<PathBuf> {
    let (Some(parent), Some(dir_name)) = (base.parent(), base.file_name()) else {
        return Ok(base.to_path_buf());
    };
    let dir_name = dir_name.to_string_lossy();
    let pattern = Regex::new(&format!(r"^{}(?: \((\d+)\))?$", regex::escape(&dir_name)))
        .map_err(|e| DaqError::Configuration(format!("Invalid directory name '{dir_name}': {e}")))?;

    let mut max_suffix = 0u64;
    if parent.exists() {
        for entry in fs::read_dir(parent)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(captures) = pattern.captures(&name) {
                let suffix = captures
                    .get(1)
                    .and_then(|m| m.as_str().parse().ok())
                    .unwrap_or(1);
                max_suffix = max_suffix.max(suffix);
            }
        }
    }

    if max_suffix == 0 {
        Ok(base.to_path_buf())
    } else {
        Ok(parent.join(format!("{dir_name} ({})", max_suffix + 1)))
    }
}
