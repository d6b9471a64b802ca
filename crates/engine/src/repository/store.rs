//! Backing stores for tower state
//!
//! A store only has to offer keyed loads and an all-or-nothing batch commit.
//! Per-tower locking is the repository's job.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::error::EngineResult;
use crate::models::TowerState;
use crate::snapshot;

/// Keyed storage for tower state
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the state of one tower, if any has been recorded
    async fn load(&self, tower_id: &str) -> EngineResult<Option<TowerState>>;

    /// Persist every state in `states` or none of them
    ///
    /// A store may give up with `PersistenceTimeout` after `timeout` only
    /// while waiting to start; once the write has begun it runs to the end,
    /// even if the caller stops waiting.
    async fn commit(&self, states: Vec<TowerState>, timeout: Duration) -> EngineResult<()>;
}

/// Process-local store
#[derive(Debug, Default)]
pub struct InMemoryStore {
    states: DashMap<String, TowerState>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl StateStore for InMemoryStore {
    async fn load(&self, tower_id: &str) -> EngineResult<Option<TowerState>> {
        Ok(self.states.get(tower_id).map(|s| s.value().clone()))
    }

    async fn commit(&self, states: Vec<TowerState>, _timeout: Duration) -> EngineResult<()> {
        for state in states {
            self.states.insert(state.tower_id.clone(), state);
        }
        Ok(())
    }
}

/// Store that keeps a JSON snapshot of every tower on disk
///
/// Reads are served from memory. A commit writes the full snapshot first and
/// only then publishes the new states, so a failed write leaves both the file
/// and the in-memory view untouched.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    states: Arc<RwLock<HashMap<String, TowerState>>>,
}

impl JsonFileStore {
    /// Open a store, loading an existing snapshot if present
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let states: HashMap<String, TowerState> = match snapshot::load_json::<Vec<TowerState>>(&path)? {
            Some(list) => list.into_iter().map(|s| (s.tower_id.clone(), s)).collect(),
            None => HashMap::new(),
        };

        info!(path = %path.display(), towers = states.len(), "Opened tower state snapshot");

        Ok(Self {
            path,
            states: Arc::new(RwLock::new(states)),
        })
    }
}

#[async_trait]
impl StateStore for JsonFileStore {
    async fn load(&self, tower_id: &str) -> EngineResult<Option<TowerState>> {
        Ok(self.states.read().await.get(tower_id).cloned())
    }

    async fn commit(&self, states: Vec<TowerState>, timeout: Duration) -> EngineResult<()> {
        let current = snapshot::lock_for_commit(&self.states, timeout).await?;

        let mut next = current.clone();
        for state in states {
            next.insert(state.tower_id.clone(), state);
        }

        let mut list: Vec<TowerState> = next.values().cloned().collect();
        list.sort_by(|a, b| a.tower_id.cmp(&b.tower_id));
        let entries = list.len();

        snapshot::save_and_publish(Some(self.path.clone()), list, current, next).await?;
        debug!(path = %self.path.display(), towers = entries, "Tower state snapshot written");
        Ok(())
    }
}

/// Shared handle to a store
pub type SharedStore = Arc<dyn StateStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Tower;

    const TIMEOUT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_in_memory_roundtrip() {
        let store = InMemoryStore::new();
        assert!(store.load("tower-001").await.unwrap().is_none());

        let state = Tower::new("tower-001", 500, 8).default_state();
        store.commit(vec![state.clone()], TIMEOUT).await.unwrap();

        assert_eq!(store.load("tower-001").await.unwrap(), Some(state));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("towers.json");

        let mut state = Tower::new("tower-003", 450, 8).default_state();
        state.active_connections = 420;

        {
            let store = JsonFileStore::open(&path).unwrap();
            store.commit(vec![state.clone()], TIMEOUT).await.unwrap();
        }

        let reopened = JsonFileStore::open(&path).unwrap();
        let loaded = reopened.load("tower-003").await.unwrap().unwrap();
        assert_eq!(loaded.active_connections, 420);
    }

    #[tokio::test]
    async fn test_file_store_failed_write_keeps_memory() {
        let dir = tempfile::tempdir().unwrap();
        // A directory where the snapshot file should be makes the rename fail
        let path = dir.path().join("blocked");
        std::fs::create_dir_all(path.join("inner")).unwrap();

        let store = JsonFileStore {
            path: path.clone(),
            states: Arc::new(RwLock::new(HashMap::new())),
        };

        let state = Tower::new("tower-001", 500, 8).default_state();
        assert!(store.commit(vec![state], TIMEOUT).await.is_err());
        assert!(store.load("tower-001").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_file_store_busy_commit_times_out_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("towers.json");
        let store = JsonFileStore::open(&path).unwrap();

        let reader = store.states.read().await;
        let state = Tower::new("tower-001", 500, 8).default_state();
        let err = store
            .commit(vec![state], Duration::from_millis(20))
            .await
            .unwrap_err();
        assert!(err.is_retryable());
        drop(reader);

        assert!(store.load("tower-001").await.unwrap().is_none());
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_file_store_abandoned_commit_matches_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("towers.json");
        let store = JsonFileStore::open(&path).unwrap();

        let mut state = Tower::new("tower-002", 500, 8).default_state();
        state.active_connections = 333;
        let _ = tokio::time::timeout(
            Duration::from_micros(1),
            store.commit(vec![state], TIMEOUT),
        )
        .await;

        // Any started write finishes before the next commit gets the lock
        store.commit(Vec::new(), TIMEOUT).await.unwrap();
        let in_memory = store.load("tower-002").await.unwrap();
        let reopened = JsonFileStore::open(&path).unwrap();
        assert_eq!(reopened.load("tower-002").await.unwrap(), in_memory);
    }
}
