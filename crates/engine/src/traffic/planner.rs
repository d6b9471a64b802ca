//! Traffic redistribution planning
//!
//! The planner walks a congested tower's neighbors in topology order and
//! fills each one up to its ceiling before moving on, then hands whatever is
//! left to the first available warm spare. Greedy topology order keeps every
//! plan reproducible and easy to explain to an operator; it does not try to
//! find the globally best split.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{round1, Tower, TowerStatus};
use crate::policy::RedistributionPolicy;
use crate::repository::{StateChange, TowerRepository, Transfer};

/// Fixed score given to a warm spare; always below a capacity-sufficient neighbor
pub const WARM_SPARE_SCORE: f64 = 80.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    Neighbor,
    WarmSpare,
}

/// Candidate tower for a single redirect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetCandidate {
    pub tower_id: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub current_load: u32,
    pub available_capacity: u32,
    /// Projected load after the move, in percent
    pub load_after_redirect: f64,
    pub score: f64,
}

/// One planned transfer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlannedTransfer {
    pub tower_id: String,
    #[serde(rename = "type")]
    pub kind: TargetKind,
    pub connections_received: u32,
    pub load_before: u32,
    pub load_after: u32,
}

/// Plan for relieving a congested tower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedistributionPlan {
    pub source_tower: String,
    pub source_current_load: u32,
    /// Desired load after the plan is applied
    pub target_load: u32,
    pub connections_to_move: u32,
    pub targets: Vec<PlannedTransfer>,
    pub total_redistributed: u32,
    /// Whether enough of the deficit was placed
    pub fully_satisfied: bool,
    pub action_required: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl RedistributionPlan {
    /// Connections planned for neighbors only
    pub fn neighbor_targets(&self) -> impl Iterator<Item = &PlannedTransfer> {
        self.targets.iter().filter(|t| t.kind == TargetKind::Neighbor)
    }

    pub fn spare_target(&self) -> Option<&PlannedTransfer> {
        self.targets.iter().find(|t| t.kind == TargetKind::WarmSpare)
    }
}

/// Before/after view of one tower in a redirect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerLoadChange {
    pub tower_id: String,
    pub connections_before: u32,
    pub connections_after: u32,
}

impl From<&StateChange> for TowerLoadChange {
    fn from(change: &StateChange) -> Self {
        Self {
            tower_id: change.tower_id.clone(),
            connections_before: change.before.active_connections,
            connections_after: change.after.active_connections,
        }
    }
}

/// Outcome of an executed redirect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedirectOutcome {
    pub success: bool,
    pub connections_requested: u32,
    pub connections_moved: u32,
    pub source_tower: TowerLoadChange,
    pub target_tower: TowerLoadChange,
    pub timestamp: DateTime<Utc>,
}

impl RedirectOutcome {
    pub fn from_transfer(transfer: &Transfer, connections_requested: u32) -> Self {
        Self {
            success: true,
            connections_requested,
            connections_moved: transfer.connections_moved,
            source_tower: TowerLoadChange::from(&transfer.source),
            target_tower: TowerLoadChange::from(&transfer.target),
            timestamp: transfer.source.after.last_updated,
        }
    }
}

/// Topology-aware redistribution planner
#[derive(Clone)]
pub struct RedistributionPlanner {
    repository: Arc<TowerRepository>,
    policy: RedistributionPolicy,
}

impl RedistributionPlanner {
    pub fn new(repository: Arc<TowerRepository>, policy: RedistributionPolicy) -> Self {
        Self { repository, policy }
    }

    pub fn policy(&self) -> &RedistributionPolicy {
        &self.policy
    }

    /// Best single tower to absorb `connections_to_move`
    ///
    /// Neighbors must be able to take the whole amount within their raw
    /// capacity; the least loaded one after the move wins and ties keep
    /// topology order. Only when no neighbor qualifies is a warm spare
    /// offered.
    pub async fn find_target(
        &self,
        tower_id: &str,
        connections_to_move: u32,
    ) -> EngineResult<Option<TargetCandidate>> {
        let tower = self.repository.topology().get(tower_id)?.clone();

        let mut best: Option<TargetCandidate> = None;
        for neighbor_id in &tower.neighbors {
            let neighbor = self.repository.topology().get(neighbor_id)?;
            let state = self.repository.get(neighbor_id).await?;
            if state.status == TowerStatus::Down {
                continue;
            }

            let available = neighbor.max_capacity.saturating_sub(state.active_connections);
            if available < connections_to_move {
                continue;
            }

            let load_after = (state.active_connections + connections_to_move) as f64
                / neighbor.max_capacity as f64;
            let candidate = TargetCandidate {
                tower_id: neighbor_id.clone(),
                kind: TargetKind::Neighbor,
                current_load: state.active_connections,
                available_capacity: available,
                load_after_redirect: round1(load_after * 100.0),
                score: round1((1.0 - load_after) * 100.0),
            };

            if best.as_ref().map_or(true, |b| candidate.score > b.score) {
                best = Some(candidate);
            }
        }

        if best.is_some() {
            return Ok(best);
        }

        let Some(spare) = self.first_available_spare(&tower).await? else {
            return Ok(None);
        };
        let state = self.repository.get(&spare.tower_id).await?;
        let available = spare.max_capacity.saturating_sub(state.active_connections);
        Ok(Some(TargetCandidate {
            tower_id: spare.tower_id.clone(),
            kind: TargetKind::WarmSpare,
            current_load: state.active_connections,
            available_capacity: available,
            load_after_redirect: round1(
                state.active_connections.saturating_add(connections_to_move) as f64
                    / spare.max_capacity as f64
                    * 100.0,
            ),
            score: WARM_SPARE_SCORE,
        }))
    }

    /// Plan how to bring `tower_id` down to the target load
    pub async fn plan(&self, tower_id: &str) -> EngineResult<RedistributionPlan> {
        let tower = self.repository.topology().get(tower_id)?.clone();
        let state = self.repository.get(tower_id).await?;

        let current_load = state.active_connections;
        let target_load = self.policy.target_load.of_floor(tower.max_capacity);

        if current_load <= target_load {
            return Ok(RedistributionPlan {
                source_tower: tower_id.to_string(),
                source_current_load: current_load,
                target_load,
                connections_to_move: 0,
                targets: Vec::new(),
                total_redistributed: 0,
                fully_satisfied: true,
                action_required: false,
                reason: Some("Tower load is within acceptable range".to_string()),
            });
        }

        let connections_to_move = current_load - target_load;
        let mut remaining = connections_to_move;
        let mut targets = Vec::new();

        for neighbor_id in &tower.neighbors {
            if remaining == 0 {
                break;
            }

            let neighbor = self.repository.topology().get(neighbor_id)?;
            let neighbor_state = self.repository.get(neighbor_id).await?;
            if neighbor_state.status == TowerStatus::Down {
                continue;
            }

            let ceiling = self.policy.neighbor_ceiling.of_floor(neighbor.max_capacity);
            let headroom = ceiling.saturating_sub(neighbor_state.active_connections);
            if headroom == 0 {
                continue;
            }

            let received = remaining.min(headroom);
            targets.push(PlannedTransfer {
                tower_id: neighbor_id.clone(),
                kind: TargetKind::Neighbor,
                connections_received: received,
                load_before: neighbor_state.active_connections,
                load_after: neighbor_state.active_connections + received,
            });
            remaining -= received;
        }

        let mut reason = None;
        if remaining > 0 {
            match self.first_available_spare(&tower).await? {
                Some(spare) => {
                    let spare_state = self.repository.get(&spare.tower_id).await?;
                    targets.push(PlannedTransfer {
                        tower_id: spare.tower_id.clone(),
                        kind: TargetKind::WarmSpare,
                        connections_received: remaining,
                        load_before: spare_state.active_connections,
                        load_after: spare_state.active_connections + remaining,
                    });
                    remaining = 0;
                }
                None => {
                    reason = Some(EngineError::NoEligibleTarget(tower_id.to_string()).to_string());
                }
            }
        }

        let total_redistributed = connections_to_move - remaining;
        Ok(RedistributionPlan {
            source_tower: tower_id.to_string(),
            source_current_load: current_load,
            target_load,
            connections_to_move,
            targets,
            total_redistributed,
            fully_satisfied: self
                .policy
                .satisfied
                .is_met_by(total_redistributed, connections_to_move),
            action_required: true,
            reason,
        })
    }

    /// Move up to `connections` from `source` to `target`
    ///
    /// Requests larger than the source's load are clamped rather than
    /// rejected.
    pub async fn execute_redirect(
        &self,
        source: &str,
        target: &str,
        connections: u32,
    ) -> EngineResult<RedirectOutcome> {
        let transfer = self.repository.transfer(source, target, connections).await?;
        Ok(RedirectOutcome::from_transfer(&transfer, connections))
    }

    /// First warm spare of `tower` that is not down
    pub async fn first_available_spare(&self, tower: &Tower) -> EngineResult<Option<Tower>> {
        for spare_id in &tower.warm_spares {
            let state = self.repository.get(spare_id).await?;
            if state.status != TowerStatus::Down {
                return Ok(Some(self.repository.topology().get(spare_id)?.clone()));
            }
        }
        Ok(None)
    }
}
