//! JSON state files kept in the cache directory.
//!
//! | File                    | Contents                                        |
//! |-------------------------|-------------------------------------------------|
//! | `last_device.json`      | `{"last_device": "<serial>"}`                   |
//! | `task_queue.json`       | the whole [`TaskQueue`], cursor included        |
//! | `user_preferences.json` | `{task_id: {variable: value}}`                  |
//!
//! Writes go to a temporary sibling first and are renamed into place, so a
//! crash never leaves a half-written file behind.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use ark_core::{TaskInstance, TaskQueue};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

const LAST_DEVICE_FILE: &str = "last_device.json";
const TASK_QUEUE_FILE: &str = "task_queue.json";
const PREFERENCES_FILE: &str = "user_preferences.json";

/// Errors produced by state file operations.
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error accessing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Saved variable values, keyed by task id.
pub type Preferences = BTreeMap<String, Map<String, Value>>;

#[derive(Serialize, Deserialize)]
struct LastDevice {
    last_device: String,
}

/// Reads and writes the JSON state files in one directory.
#[derive(Debug, Clone)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    // ── Last device ───────────────────────────────────────────────────────────

    pub fn last_device(&self) -> Result<Option<String>, StorageError> {
        Ok(self
            .read_json::<LastDevice>(LAST_DEVICE_FILE)?
            .map(|d| d.last_device)
            .filter(|s| !s.is_empty()))
    }

    pub fn save_last_device(&self, serial: &str) -> Result<(), StorageError> {
        self.write_json(
            LAST_DEVICE_FILE,
            &LastDevice {
                last_device: serial.to_string(),
            },
        )
    }

    // ── Task queue ────────────────────────────────────────────────────────────

    pub fn load_queue(&self) -> Result<Option<TaskQueue>, StorageError> {
        self.read_json(TASK_QUEUE_FILE)
    }

    pub fn save_queue(&self, queue: &TaskQueue) -> Result<(), StorageError> {
        self.write_json(TASK_QUEUE_FILE, queue)
    }

    // ── Variable preferences ──────────────────────────────────────────────────

    pub fn load_preferences(&self) -> Result<Preferences, StorageError> {
        Ok(self.read_json(PREFERENCES_FILE)?.unwrap_or_default())
    }

    /// Records `task`'s current overrides as the preferred values for its id.
    pub fn remember_variables(&self, task: &TaskInstance) -> Result<(), StorageError> {
        let mut prefs = self.load_preferences()?;
        prefs.insert(task.id().to_string(), task.overrides.clone());
        self.write_json(PREFERENCES_FILE, &prefs)
    }

    /// Applies the stored preferences for `task`, logging entries that no
    /// longer match its definition.
    pub fn apply_preferences(&self, task: &mut TaskInstance) -> Result<(), StorageError> {
        let prefs = self.load_preferences()?;
        if let Some(values) = prefs.get(task.id()) {
            let skipped = task.apply_preferences(values);
            if !skipped.is_empty() {
                warn!(task = task.id(), ?skipped, "ignoring stale variable preferences");
            }
        }
        Ok(())
    }

    // ── Helpers ───────────────────────────────────────────────────────────────

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>, StorageError> {
        let path = self.dir.join(name);
        let text = match std::fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(StorageError::Io { path, source }),
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| StorageError::Json { path, source })
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.dir).map_err(|source| StorageError::Io {
            path: self.dir.clone(),
            source,
        })?;
        let path = self.dir.join(name);
        let tmp = self.dir.join(format!("{name}.tmp"));
        let text = serde_json::to_string_pretty(value).map_err(|source| StorageError::Json {
            path: path.clone(),
            source,
        })?;
        std::fs::write(&tmp, text).map_err(|source| StorageError::Io {
            path: tmp.clone(),
            source,
        })?;
        std::fs::rename(&tmp, &path).map_err(|source| StorageError::Io {
            path: path.clone(),
            source,
        })?;
        debug!(path = %path.display(), "state saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_core::TaskDefinition;
    use serde_json::json;

    fn definition() -> TaskDefinition {
        serde_json::from_value(json!({
            "id": "daily",
            "name": "Daily",
            "variables": [{"name": "stage", "type": "string", "default": "1-7"}]
        }))
        .unwrap()
    }

    #[test]
    fn test_last_device_round_trip_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());

        assert_eq!(store.last_device().unwrap(), None);
        store.save_last_device("192.168.1.5:5555").unwrap();

        assert_eq!(store.last_device().unwrap().as_deref(), Some("192.168.1.5:5555"));
        let raw = std::fs::read_to_string(dir.path().join("last_device.json")).unwrap();
        assert!(raw.contains("\"last_device\""));
    }

    #[test]
    fn test_queue_persists_with_cursor() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path().join("cache"));
        let mut queue = TaskQueue::new();
        queue.push(TaskInstance::new(definition()));
        queue.push(TaskInstance::new(TaskDefinition::new("base", "Base")));
        queue.advance();

        // Act
        store.save_queue(&queue).unwrap();
        let loaded = store.load_queue().unwrap().unwrap();

        // Assert
        assert_eq!(loaded, queue);
        assert_eq!(loaded.cursor(), 1);
    }

    #[test]
    fn test_preferences_are_applied_to_new_instances() {
        // Arrange
        let dir = tempfile::tempdir().unwrap();
        let store = StateStore::new(dir.path());
        let mut task = TaskInstance::new(definition());
        task.set_override("stage", json!("CE-5")).unwrap();
        store.remember_variables(&task).unwrap();

        // Act
        let mut fresh = TaskInstance::new(definition());
        store.apply_preferences(&mut fresh).unwrap();

        // Assert
        assert_eq!(fresh.variables()["stage"], json!("CE-5"));
    }

    #[test]
    fn test_corrupt_file_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("task_queue.json"), "{not json").unwrap();
        let store = StateStore::new(dir.path());

        assert!(matches!(store.load_queue(), Err(StorageError::Json { .. })));
    }
}
