//! Durable storage for [`RunState`].

use async_trait::async_trait;
use chaos_common::RunState;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum StateStoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid persisted state: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Persists scheduler run state across process restarts.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Last saved state, or `None` if nothing was ever saved.
    async fn load(&self) -> Result<Option<RunState>, StateStoreError>;

    async fn save(&self, state: &RunState) -> Result<(), StateStoreError>;
}

/// In-process store. State survives scheduler re-creation, not process exit.
#[derive(Default)]
pub struct MemoryStateStore {
    state: Mutex<Option<RunState>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with `state`.
    pub fn with_state(state: RunState) -> Self {
        Self {
            state: Mutex::new(Some(state)),
        }
    }

    pub fn current(&self) -> Option<RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn load(&self) -> Result<Option<RunState>, StateStoreError> {
        Ok(self.current())
    }

    async fn save(&self, state: &RunState) -> Result<(), StateStoreError> {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = Some(state.clone());
        Ok(())
    }
}

/// JSON file store. Writes go to a temp file first and are renamed in place.
pub struct FileStateStore {
    path: PathBuf,
}

impl FileStateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl StateStore for FileStateStore {
    async fn load(&self) -> Result<Option<RunState>, StateStoreError> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(text) => Ok(Some(serde_json::from_str(&text)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, state: &RunState) -> Result<(), StateStoreError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let json = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("tmp");
        tokio::fs::write(&temp_path, json).await?;
        tokio::fs::rename(&temp_path, &self.path).await?;
        debug!(path = %self.path.display(), status = %state.status, "Persisted run state");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chaos_common::ChaosStatus;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStateStore::new();
        assert!(store.load().await.unwrap().is_none());
        let state = RunState {
            iteration: 3,
            ..RunState::default()
        };
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_file_store_round_trip() {
        let dir = TempDir::new().unwrap();
        let store = FileStateStore::new(dir.path().join("nested").join("state.json"));
        assert!(store.load().await.unwrap().is_none());

        let mut state = RunState::default();
        state.transition(ChaosStatus::Running);
        store.save(&state).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.status, ChaosStatus::Running);
        assert!(!dir.path().join("nested").join("state.tmp").exists());
    }

    #[tokio::test]
    async fn test_file_store_rejects_corrupt_state() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, "{ not json").unwrap();
        let store = FileStateStore::new(path);
        assert!(matches!(
            store.load().await,
            Err(StateStoreError::Serialization(_))
        ));
    }
}
