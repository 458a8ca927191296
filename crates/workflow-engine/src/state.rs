//! Run state persistence
//!
//! The engine writes partial run state after every step so an interrupted
//! run can be inspected later. State is a JSON object per run; each write is
//! shallow-merged into what is already stored.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::sync::RwLock;

use crate::error::{Result, WorkflowError};

/// Persistence contract for per-run state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Stored state of a run, if any
    async fn get_state(&self, run_id: &str) -> Result<Option<Map<String, Value>>>;

    /// Shallow-merge `partial` into the run's stored state
    async fn set_state(&self, run_id: &str, partial: Map<String, Value>) -> Result<()>;

    /// Drop the run's stored state
    async fn clear_state(&self, run_id: &str) -> Result<()>;
}

/// In-memory state store with optional file persistence
///
/// With persistence enabled every write is mirrored to
/// `<dir>/<run_id>.json`.
#[derive(Debug, Default)]
pub struct InMemoryStateStore {
    states: RwLock<HashMap<String, Map<String, Value>>>,
    persist_path: Option<PathBuf>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that mirrors state into the given directory
    ///
    /// The directory is created on first write.
    pub fn with_persistence(path: impl AsRef<Path>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            persist_path: Some(path.as_ref().to_path_buf()),
        }
    }

    /// IDs of runs with stored state, sorted
    pub async fn run_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.states.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Load every persisted run state from the persistence directory
    ///
    /// Returns the number of runs loaded. Unparseable files are skipped.
    pub async fn load_from_disk(&self) -> Result<usize> {
        let Some(ref path) = self.persist_path else {
            return Ok(0);
        };

        if !tokio::fs::try_exists(path).await? {
            return Ok(0);
        }

        let mut count = 0;
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut states = self.states.write().await;
        while let Some(entry) = entries.next_entry().await? {
            let file_path = entry.path();
            if file_path.extension().map_or(true, |e| e != "json") {
                continue;
            }
            let Some(run_id) = file_path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };

            let content = tokio::fs::read_to_string(&file_path).await?;
            match serde_json::from_str::<Map<String, Value>>(&content) {
                Ok(state) => {
                    log::debug!("Loaded state of run '{}' from {:?}", run_id, file_path);
                    states.insert(run_id.to_string(), state);
                    count += 1;
                }
                Err(e) => {
                    log::warn!("Failed to parse run state from {:?}: {}", file_path, e);
                }
            }
        }
        Ok(count)
    }

    fn state_file(&self, run_id: &str) -> Result<Option<PathBuf>> {
        let Some(ref path) = self.persist_path else {
            return Ok(None);
        };
        if run_id.is_empty()
            || run_id.contains(['/', '\\'])
            || run_id.starts_with('.')
        {
            return Err(WorkflowError::Io(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                format!("Run ID '{}' cannot be used as a file name", run_id),
            )));
        }
        Ok(Some(path.join(format!("{}.json", run_id))))
    }

    async fn save_to_disk(&self, run_id: &str, state: &Map<String, Value>) -> Result<()> {
        let Some(file_path) = self.state_file(run_id)? else {
            return Ok(());
        };
        if let Some(dir) = file_path.parent() {
            tokio::fs::create_dir_all(dir).await?;
        }
        let content = serde_json::to_string_pretty(state)?;
        tokio::fs::write(&file_path, content).await?;
        log::trace!("Saved state of run '{}' to {:?}", run_id, file_path);
        Ok(())
    }

    async fn delete_from_disk(&self, run_id: &str) -> Result<()> {
        let Some(file_path) = self.state_file(run_id)? else {
            return Ok(());
        };
        if tokio::fs::try_exists(&file_path).await? {
            tokio::fs::remove_file(&file_path).await?;
            log::debug!("Deleted state of run '{}' from {:?}", run_id, file_path);
        }
        Ok(())
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn get_state(&self, run_id: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.states.read().await.get(run_id).cloned())
    }

    async fn set_state(&self, run_id: &str, partial: Map<String, Value>) -> Result<()> {
        let merged = {
            let mut states = self.states.write().await;
            let state = states.entry(run_id.to_string()).or_default();
            state.extend(partial);
            state.clone()
        };
        self.save_to_disk(run_id, &merged).await
    }

    async fn clear_state(&self, run_id: &str) -> Result<()> {
        self.states.write().await.remove(run_id);
        self.delete_from_disk(run_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }

    #[tokio::test]
    async fn test_set_state_merges_shallowly() {
        let store = InMemoryStateStore::new();
        assert_eq!(store.get_state("run-1").await.unwrap(), None);

        store
            .set_state("run-1", object(json!({ "a": 1, "nested": { "x": 1 } })))
            .await
            .unwrap();
        store
            .set_state("run-1", object(json!({ "b": 2, "nested": { "y": 2 } })))
            .await
            .unwrap();

        let state = store.get_state("run-1").await.unwrap().unwrap();
        assert_eq!(
            Value::Object(state),
            json!({ "a": 1, "b": 2, "nested": { "y": 2 } })
        );
        assert_eq!(store.run_ids().await, vec!["run-1".to_string()]);
    }

    #[tokio::test]
    async fn test_clear_state() {
        let store = InMemoryStateStore::new();
        store.set_state("run-1", object(json!({ "a": 1 }))).await.unwrap();
        store.set_state("run-2", object(json!({ "b": 1 }))).await.unwrap();

        store.clear_state("run-1").await.unwrap();
        assert_eq!(store.get_state("run-1").await.unwrap(), None);
        assert!(store.get_state("run-2").await.unwrap().is_some());

        // Clearing an unknown run is a no-op
        store.clear_state("missing").await.unwrap();
    }

    #[tokio::test]
    async fn test_persistent_store() {
        let dir = tempfile::tempdir().unwrap();
        let state_dir = dir.path().join("runs");

        let store = InMemoryStateStore::with_persistence(&state_dir);
        store.set_state("run-1", object(json!({ "step": "a" }))).await.unwrap();
        store.set_state("run-2", object(json!({ "step": "b" }))).await.unwrap();
        assert!(state_dir.join("run-1.json").exists());

        std::fs::write(state_dir.join("broken.json"), "not json").unwrap();
        std::fs::write(state_dir.join("notes.txt"), "ignored").unwrap();

        let reloaded = InMemoryStateStore::with_persistence(&state_dir);
        assert_eq!(reloaded.load_from_disk().await.unwrap(), 2);
        assert_eq!(
            reloaded.get_state("run-2").await.unwrap().unwrap()["step"],
            json!("b")
        );

        reloaded.clear_state("run-1").await.unwrap();
        assert!(!state_dir.join("run-1.json").exists());
    }

    #[tokio::test]
    async fn test_load_without_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStateStore::with_persistence(dir.path().join("absent"));
        assert_eq!(store.load_from_disk().await.unwrap(), 0);
        assert_eq!(InMemoryStateStore::new().load_from_disk().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_unsafe_run_id_rejected_when_persisting() {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryStateStore::with_persistence(dir.path());
        let err = store
            .set_state("../escape", object(json!({ "a": 1 })))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("cannot be used as a file name"));
    }
}
