//! Tower state repository
//!
//! Owns every mutable tower record. All writes go through a per-tower lock
//! so that concurrent redistribution and remediation calls touching the same
//! tower never lose updates, while unrelated towers proceed in parallel.
//! Operations spanning several towers take their locks in sorted key order.

mod store;

pub use store::{InMemoryStore, JsonFileStore, SharedStore, StateStore};

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use crate::error::{EngineError, EngineResult};
use crate::models::{StatePatch, TowerState};
use crate::policy::DEFAULT_PERSISTENCE_TIMEOUT;
use crate::topology::Topology;

/// Before and after view of a single tower mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateChange {
    pub tower_id: String,
    pub before: TowerState,
    pub after: TowerState,
}

/// Outcome of moving connections between two towers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transfer {
    pub connections_moved: u32,
    pub source: StateChange,
    pub target: StateChange,
}

/// Repository of live tower state
pub struct TowerRepository {
    topology: Arc<Topology>,
    store: SharedStore,
    locks: DashMap<String, Arc<Mutex<()>>>,
    timeout: Duration,
}

impl TowerRepository {
    pub fn new(topology: Arc<Topology>, store: SharedStore) -> Self {
        Self {
            topology,
            store,
            locks: DashMap::new(),
            timeout: DEFAULT_PERSISTENCE_TIMEOUT,
        }
    }

    /// Deadline applied to every store call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Repository over a fresh in-memory store
    pub fn in_memory(topology: Arc<Topology>) -> Self {
        Self::new(topology, Arc::new(InMemoryStore::new()))
    }

    pub fn topology(&self) -> &Arc<Topology> {
        &self.topology
    }

    /// Current state of a tower, created from topology defaults on first read
    pub async fn get(&self, tower_id: &str) -> EngineResult<TowerState> {
        let tower = self.topology.get(tower_id)?;

        if let Some(state) = self.load(tower_id).await? {
            return Ok(state);
        }

        let _guard = self.lock(tower_id).await;
        // Another caller may have created it while we waited
        if let Some(state) = self.load(tower_id).await? {
            return Ok(state);
        }

        let state = tower.default_state();
        self.commit(vec![state.clone()]).await?;
        debug!(tower_id = %tower_id, "Initialized tower state from topology defaults");
        Ok(state)
    }

    /// States of every tower in topology order
    pub async fn get_all(&self) -> EngineResult<Vec<TowerState>> {
        let mut states = Vec::with_capacity(self.topology.len());
        for tower_id in self.topology.tower_ids() {
            states.push(self.get(tower_id).await?);
        }
        Ok(states)
    }

    /// Merge `patch` into the tower's state and persist it
    pub async fn update(&self, tower_id: &str, patch: &StatePatch) -> EngineResult<TowerState> {
        let change = self
            .modify(tower_id, |state| {
                state.apply(patch);
                Ok(())
            })
            .await?;
        Ok(change.after)
    }

    /// Atomic read-modify-write of one tower
    ///
    /// `f` runs under the tower's lock. If it returns an error nothing is
    /// written.
    pub async fn modify<F>(&self, tower_id: &str, f: F) -> EngineResult<StateChange>
    where
        F: FnOnce(&mut TowerState) -> EngineResult<()>,
    {
        let tower = self.topology.get(tower_id)?;
        let _guard = self.lock(tower_id).await;

        let before = match self.load(tower_id).await? {
            Some(state) => state,
            None => tower.default_state(),
        };

        let mut after = before.clone();
        f(&mut after)?;
        after.active_capacity_units = after
            .active_capacity_units
            .clamp(1, tower.max_capacity_units);
        after.last_updated = Utc::now();

        self.commit(vec![after.clone()]).await?;

        Ok(StateChange {
            tower_id: tower_id.to_string(),
            before,
            after,
        })
    }

    /// Move up to `connections` from `source` to `target`
    ///
    /// The amount is clamped to the source's current load. Both towers are
    /// committed in one batch.
    pub async fn transfer(
        &self,
        source_id: &str,
        target_id: &str,
        connections: u32,
    ) -> EngineResult<Transfer> {
        if source_id == target_id {
            return Err(EngineError::InvalidRequest(format!(
                "cannot redirect tower {source_id} to itself"
            )));
        }
        let source_tower = self.topology.get(source_id)?;
        let target_tower = self.topology.get(target_id)?;

        let _guards = self.lock_many(&[source_id, target_id]).await;

        let source_before = match self.load(source_id).await? {
            Some(state) => state,
            None => source_tower.default_state(),
        };
        let target_before = match self.load(target_id).await? {
            Some(state) => state,
            None => target_tower.default_state(),
        };

        let moved = connections.min(source_before.active_connections);
        let now = Utc::now();

        let mut source_after = source_before.clone();
        source_after.active_connections -= moved;
        source_after.last_updated = now;

        let mut target_after = target_before.clone();
        target_after.active_connections = target_after.active_connections.saturating_add(moved);
        target_after.last_updated = now;

        self.commit(vec![source_after.clone(), target_after.clone()])
            .await?;

        Ok(Transfer {
            connections_moved: moved,
            source: StateChange {
                tower_id: source_id.to_string(),
                before: source_before,
                after: source_after,
            },
            target: StateChange {
                tower_id: target_id.to_string(),
                before: target_before,
                after: target_after,
            },
        })
    }

    /// Atomic read-modify-write across several towers
    ///
    /// `f` receives the current states in the order of `tower_ids`.
    pub async fn modify_many<F>(&self, tower_ids: &[&str], f: F) -> EngineResult<Vec<StateChange>>
    where
        F: FnOnce(&mut [TowerState]) -> EngineResult<()>,
    {
        let mut before = Vec::with_capacity(tower_ids.len());
        let towers = tower_ids
            .iter()
            .map(|id| self.topology.get(id))
            .collect::<EngineResult<Vec<_>>>()?;

        let _guards = self.lock_many(tower_ids).await;

        for tower in &towers {
            let state = match self.load(&tower.tower_id).await? {
                Some(state) => state,
                None => tower.default_state(),
            };
            before.push(state);
        }

        let mut after = before.clone();
        f(&mut after)?;
        let now = Utc::now();
        for (state, tower) in after.iter_mut().zip(&towers) {
            state.active_capacity_units =
                state.active_capacity_units.clamp(1, tower.max_capacity_units);
            state.last_updated = now;
        }

        self.commit(after.clone()).await?;

        Ok(before
            .into_iter()
            .zip(after)
            .map(|(before, after)| StateChange {
                tower_id: before.tower_id.clone(),
                before,
                after,
            })
            .collect())
    }

    /// Overwrite every tower with its topology default in a single batch
    pub async fn restore_defaults(&self) -> EngineResult<Vec<TowerState>> {
        let ids: Vec<&str> = self.topology.tower_ids().collect();
        let _guards = self.lock_many(&ids).await;

        let defaults: Vec<TowerState> = self
            .topology
            .towers()
            .iter()
            .map(|t| t.default_state())
            .collect();
        self.commit(defaults.clone()).await?;
        Ok(defaults)
    }

    fn lock_for(&self, tower_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(tower_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn lock(&self, tower_id: &str) -> OwnedMutexGuard<()> {
        self.lock_for(tower_id).lock_owned().await
    }

    async fn lock_many(&self, tower_ids: &[&str]) -> Vec<OwnedMutexGuard<()>> {
        let mut ids: Vec<&str> = tower_ids.to_vec();
        ids.sort_unstable();
        ids.dedup();

        let mut guards = Vec::with_capacity(ids.len());
        for id in ids {
            guards.push(self.lock(id).await);
        }
        guards
    }

    async fn load(&self, tower_id: &str) -> EngineResult<Option<TowerState>> {
        self.with_deadline(self.store.load(tower_id)).await
    }

    /// The store owns the commit deadline, so a timeout never cuts a write short
    async fn commit(&self, states: Vec<TowerState>) -> EngineResult<()> {
        self.store.commit(states, self.timeout).await
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = EngineResult<T>>,
    ) -> EngineResult<T> {
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::PersistenceTimeout(self.timeout)),
        }
    }
}
