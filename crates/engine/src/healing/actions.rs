//! Playbook action execution
//!
//! Every action is deterministic. An action that cannot do its job returns a
//! `Failed` outcome; only infrastructure errors escape as `Err`.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use super::faults::{FaultInjector, NoFaults};
use super::ledger::StepStatus;
use super::playbook::HealingAction;
use crate::error::{EngineError, EngineResult};
use crate::models::{round1, round2, OperatingMode, TowerState, TowerStatus, BASE_POWER_KW};
use crate::policy::{HealingPolicy, RedistributionPolicy};
use crate::repository::{StateChange, TowerRepository};
use crate::traffic::{
    CongestionAnalyzer, RedirectOutcome, RedistributionPlan, RedistributionPlanner,
    TowerLoadChange, TrafficAnalysis,
};

/// Units an activated warm spare brings up
const ACTIVE_SPARE_UNITS: u32 = 4;

const MIN_CPU_AFTER_RESTART: f64 = 20.0;
const CPU_FREED_BY_RESTART: f64 = 25.0;
const MIN_LATENCY_MS: f64 = 10.0;
const ROUTING_GAIN_MS: f64 = 30.0;
const ALTERNATE_PATH_GAIN_MS: f64 = 50.0;
const BANDWIDTH_LATENCY_FACTOR: f64 = 0.8;
const MAX_IDLE_UNITS_SHED: u32 = 2;

/// Readings captured by observational steps
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySnapshot {
    pub active_connections: u32,
    pub active_capacity_units: u32,
    pub operating_mode: OperatingMode,
    pub cpu_usage: f64,
    pub latency_ms: f64,
    pub power_consumption: f64,
}

impl From<&TowerState> for TelemetrySnapshot {
    fn from(state: &TowerState) -> Self {
        Self {
            active_connections: state.active_connections,
            active_capacity_units: state.active_capacity_units,
            operating_mode: state.operating_mode,
            cpu_usage: state.cpu_usage,
            latency_ms: state.latency_ms,
            power_consumption: state.power_consumption,
        }
    }
}

/// Typed result of one step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionReport {
    Observation {
        readings: TelemetrySnapshot,
        finding: String,
    },
    TrafficAnalysis(TrafficAnalysis),
    Plan(RedistributionPlan),
    Redirected {
        connections_moved: u32,
        redirects: Vec<RedirectOutcome>,
    },
    SpareActivated {
        spare_tower: String,
        connections_moved: u32,
        active_capacity_units: u32,
    },
    UnitsAdjusted {
        from: u32,
        to: u32,
        units_needed: u32,
        power_before: f64,
        power_after: f64,
    },
    ModeChanged {
        from: OperatingMode,
        to: OperatingMode,
        power_before: f64,
        power_after: f64,
    },
    TelemetryAdjusted {
        metric: String,
        before: f64,
        after: f64,
    },
    Notification {
        channel: String,
        message: String,
    },
    Escalated {
        approved_by: String,
    },
    ServiceRestored {
        status: TowerStatus,
        operating_mode: OperatingMode,
    },
    AwaitingApproval {
        message: String,
    },
    Failed {
        reason: String,
    },
    RolledBack {
        reason: String,
        towers_restored: Vec<String>,
    },
}

/// What one executed action produced
#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub status: StepStatus,
    pub report: ActionReport,
    pub changes: Vec<StateChange>,
}

impl ActionOutcome {
    fn completed(report: ActionReport, changes: Vec<StateChange>) -> Self {
        Self {
            status: StepStatus::Completed,
            report,
            changes,
        }
    }

    fn failed(reason: impl Into<String>) -> Self {
        Self {
            status: StepStatus::Failed,
            report: ActionReport::Failed {
                reason: reason.into(),
            },
            changes: Vec::new(),
        }
    }
}

/// Result of bringing a warm spare online
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpareActivation {
    pub tower_id: String,
    pub spare_tower: String,
    pub connections_moved: u32,
    pub spare_state: TowerState,
    #[serde(skip)]
    pub changes: Vec<StateChange>,
}

/// Change active units and scale power draw with them
pub(crate) fn rescale_units(state: &mut TowerState, units: u32) {
    let old = state.active_capacity_units.max(1);
    state.power_consumption = round2(state.power_consumption * units as f64 / old as f64);
    state.active_capacity_units = units;
}

pub struct ActionExecutor {
    repository: Arc<TowerRepository>,
    analyzer: CongestionAnalyzer,
    planner: RedistributionPlanner,
    healing: HealingPolicy,
    faults: Arc<dyn FaultInjector>,
}

impl ActionExecutor {
    pub fn new(
        repository: Arc<TowerRepository>,
        redistribution: RedistributionPolicy,
        healing: HealingPolicy,
    ) -> Self {
        Self {
            analyzer: CongestionAnalyzer::new(repository.clone()),
            planner: RedistributionPlanner::new(repository.clone(), redistribution),
            repository,
            healing,
            faults: Arc::new(NoFaults),
        }
    }

    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.faults = faults;
        self
    }

    pub fn healing_policy(&self) -> &HealingPolicy {
        &self.healing
    }

    /// Run one action against `tower_id`
    ///
    /// `approver` is set when an operator approved a manual step.
    pub async fn execute(
        &self,
        tower_id: &str,
        action: HealingAction,
        approver: Option<&str>,
    ) -> EngineResult<ActionOutcome> {
        if let Some(reason) = self.faults.inject(tower_id, action) {
            return Ok(ActionOutcome::failed(reason));
        }

        match self.perform(tower_id, action, approver).await {
            Ok(outcome) => Ok(outcome),
            Err(e) if e.is_infrastructure() => Err(e),
            Err(e) => Ok(ActionOutcome::failed(e.to_string())),
        }
    }

    async fn perform(
        &self,
        tower_id: &str,
        action: HealingAction,
        approver: Option<&str>,
    ) -> EngineResult<ActionOutcome> {
        match action {
            HealingAction::IdentifyHeavyProcesses => {
                self.observe(tower_id, |s| {
                    format!(
                        "CPU at {:.1}% across {} active units",
                        s.cpu_usage, s.active_capacity_units
                    )
                })
                .await
            }
            HealingAction::CheckNetworkPath => {
                self.observe(tower_id, |s| {
                    format!("Primary path latency {:.1} ms", s.latency_ms)
                })
                .await
            }
            HealingAction::AnalyzePowerUsage => {
                let max_units = self.repository.topology().get(tower_id)?.max_capacity_units;
                self.observe(tower_id, |s| {
                    format!(
                        "{:.2} kW with {} of {} units active in {} mode",
                        s.power_consumption, s.active_capacity_units, max_units, s.operating_mode
                    )
                })
                .await
            }
            HealingAction::RestartNonCriticalServices => {
                self.adjust(tower_id, "cpu_usage", |s| &mut s.cpu_usage, |cpu| {
                    (cpu - CPU_FREED_BY_RESTART).max(MIN_CPU_AFTER_RESTART)
                })
                .await
            }
            HealingAction::OptimizeRouting => {
                self.adjust(tower_id, "latency_ms", |s| &mut s.latency_ms, |latency| {
                    (latency - ROUTING_GAIN_MS).max(MIN_LATENCY_MS)
                })
                .await
            }
            HealingAction::IncreaseBandwidth => {
                self.adjust(tower_id, "latency_ms", |s| &mut s.latency_ms, |latency| {
                    round1(latency * BANDWIDTH_LATENCY_FACTOR).max(MIN_LATENCY_MS)
                })
                .await
            }
            HealingAction::ActivateAlternatePath => {
                self.adjust(tower_id, "latency_ms", |s| &mut s.latency_ms, |latency| {
                    (latency - ALTERNATE_PATH_GAIN_MS).max(MIN_LATENCY_MS)
                })
                .await
            }
            HealingAction::ScaleResources => self.scale_resources(tower_id).await,
            HealingAction::ReduceIdleTrx => self.reduce_idle_trx(tower_id).await,
            HealingAction::EnableEcoMode => self.enable_eco_mode(tower_id).await,
            HealingAction::AnalyzeTrafficPattern => {
                let analysis = self.analyzer.analyze(tower_id).await?;
                Ok(ActionOutcome::completed(
                    ActionReport::TrafficAnalysis(analysis),
                    Vec::new(),
                ))
            }
            HealingAction::CalculateRedistribution => {
                let plan = self.planner.plan(tower_id).await?;
                Ok(ActionOutcome::completed(ActionReport::Plan(plan), Vec::new()))
            }
            HealingAction::RedirectToNeighbors => self.redirect_to_neighbors(tower_id).await,
            HealingAction::ActivateWarmSpare => {
                let activation = self.activate_spare(tower_id, true).await?;
                Ok(ActionOutcome::completed(
                    ActionReport::SpareActivated {
                        spare_tower: activation.spare_tower,
                        connections_moved: activation.connections_moved,
                        active_capacity_units: activation.spare_state.active_capacity_units,
                    },
                    activation.changes,
                ))
            }
            HealingAction::NotifyOperator => {
                let state = self.repository.get(tower_id).await?;
                Ok(ActionOutcome::completed(
                    ActionReport::Notification {
                        channel: "dashboard".to_string(),
                        message: format!(
                            "Remediation update for {tower_id}: {} connections, status {}",
                            state.active_connections, state.status
                        ),
                    },
                    Vec::new(),
                ))
            }
            HealingAction::EscalateToHuman => Ok(ActionOutcome::completed(
                ActionReport::Escalated {
                    approved_by: approver.unwrap_or("unknown").to_string(),
                },
                Vec::new(),
            )),
            HealingAction::RestoreTowerService => {
                let change = self
                    .repository
                    .modify(tower_id, |state| {
                        state.status = TowerStatus::Healthy;
                        state.operating_mode = OperatingMode::Normal;
                        Ok(())
                    })
                    .await?;
                Ok(ActionOutcome::completed(
                    ActionReport::ServiceRestored {
                        status: change.after.status,
                        operating_mode: change.after.operating_mode,
                    },
                    vec![change],
                ))
            }
            HealingAction::Rollback => Err(EngineError::InvalidRequest(
                "rollback is not a playbook action".to_string(),
            )),
        }
    }

    async fn observe<F>(&self, tower_id: &str, finding: F) -> EngineResult<ActionOutcome>
    where
        F: FnOnce(&TowerState) -> String,
    {
        let state = self.repository.get(tower_id).await?;
        Ok(ActionOutcome::completed(
            ActionReport::Observation {
                finding: finding(&state),
                readings: TelemetrySnapshot::from(&state),
            },
            Vec::new(),
        ))
    }

    async fn adjust<S, F>(
        &self,
        tower_id: &str,
        metric: &str,
        select: S,
        f: F,
    ) -> EngineResult<ActionOutcome>
    where
        S: Fn(&mut TowerState) -> &mut f64,
        F: FnOnce(f64) -> f64,
    {
        let change = self
            .repository
            .modify(tower_id, |state| {
                let value = select(state);
                *value = f(*value);
                Ok(())
            })
            .await?;

        let mut before = change.before.clone();
        let mut after = change.after.clone();
        Ok(ActionOutcome::completed(
            ActionReport::TelemetryAdjusted {
                metric: metric.to_string(),
                before: *select(&mut before),
                after: *select(&mut after),
            },
            vec![change],
        ))
    }

    async fn scale_resources(&self, tower_id: &str) -> EngineResult<ActionOutcome> {
        let max_units = self.repository.topology().get(tower_id)?.max_capacity_units;
        let connections = self.repository.get(tower_id).await?.active_connections;
        let units_needed = self.healing.units_needed(connections);

        let change = self
            .repository
            .modify(tower_id, |state| {
                let units = state.active_capacity_units;
                if units >= max_units {
                    return Err(EngineError::InvalidRequest(format!(
                        "tower {tower_id} already runs all {max_units} units"
                    )));
                }
                // Load spreads over one more unit
                state.cpu_usage = round1(state.cpu_usage * units as f64 / (units + 1) as f64);
                rescale_units(state, units + 1);
                Ok(())
            })
            .await?;

        Ok(ActionOutcome::completed(
            ActionReport::UnitsAdjusted {
                from: change.before.active_capacity_units,
                to: change.after.active_capacity_units,
                units_needed,
                power_before: change.before.power_consumption,
                power_after: change.after.power_consumption,
            },
            vec![change],
        ))
    }

    async fn reduce_idle_trx(&self, tower_id: &str) -> EngineResult<ActionOutcome> {
        let max_units = self.repository.topology().get(tower_id)?.max_capacity_units;
        let healing = self.healing;
        let mut units_needed = 0;

        let change = self
            .repository
            .modify(tower_id, |state| {
                units_needed = healing.units_needed(state.active_connections);
                let units = units_needed
                    .max(state.active_capacity_units.saturating_sub(MAX_IDLE_UNITS_SHED))
                    .min(max_units);
                rescale_units(state, units);
                Ok(())
            })
            .await?;

        Ok(ActionOutcome::completed(
            ActionReport::UnitsAdjusted {
                from: change.before.active_capacity_units,
                to: change.after.active_capacity_units,
                units_needed,
                power_before: change.before.power_consumption,
                power_after: change.after.power_consumption,
            },
            vec![change],
        ))
    }

    async fn enable_eco_mode(&self, tower_id: &str) -> EngineResult<ActionOutcome> {
        let change = self
            .repository
            .modify(tower_id, |state| {
                state.operating_mode = OperatingMode::Eco;
                state.power_consumption =
                    round2(state.power_consumption * OperatingMode::Eco.power_multiplier());
                Ok(())
            })
            .await?;

        Ok(ActionOutcome::completed(
            ActionReport::ModeChanged {
                from: change.before.operating_mode,
                to: change.after.operating_mode,
                power_before: change.before.power_consumption,
                power_after: change.after.power_consumption,
            },
            vec![change],
        ))
    }

    async fn redirect_to_neighbors(&self, tower_id: &str) -> EngineResult<ActionOutcome> {
        let plan = self.planner.plan(tower_id).await?;
        let targets: Vec<_> = plan.neighbor_targets().cloned().collect();
        if targets.is_empty() {
            return Err(EngineError::NoEligibleTarget(tower_id.to_string()));
        }

        // One commit for the source and every neighbor, so a failure moves nothing
        let mut ids = vec![tower_id];
        ids.extend(targets.iter().map(|t| t.tower_id.as_str()));
        let mut moves = Vec::with_capacity(targets.len());
        let changes = self
            .repository
            .modify_many(&ids, |states| {
                let (source, neighbors) = states.split_at_mut(1);
                let source = &mut source[0];
                for (target, state) in targets.iter().zip(neighbors.iter_mut()) {
                    let source_before = source.active_connections;
                    let moved = target.connections_received.min(source_before);
                    source.active_connections -= moved;
                    let target_before = state.active_connections;
                    state.active_connections = target_before.saturating_add(moved);
                    moves.push((moved, source_before, target_before));
                }
                Ok(())
            })
            .await?;

        let timestamp = changes[0].after.last_updated;
        let redirects: Vec<RedirectOutcome> = targets
            .iter()
            .zip(&moves)
            .zip(&changes[1..])
            .map(|((target, &(moved, source_before, target_before)), change)| RedirectOutcome {
                success: true,
                connections_requested: target.connections_received,
                connections_moved: moved,
                source_tower: TowerLoadChange {
                    tower_id: tower_id.to_string(),
                    connections_before: source_before,
                    connections_after: source_before - moved,
                },
                target_tower: TowerLoadChange {
                    tower_id: change.tower_id.clone(),
                    connections_before: target_before,
                    connections_after: target_before.saturating_add(moved),
                },
                timestamp,
            })
            .collect();

        Ok(ActionOutcome::completed(
            ActionReport::Redirected {
                connections_moved: redirects.iter().map(|r| r.connections_moved).sum(),
                redirects,
            },
            changes,
        ))
    }

    /// Bring the first available warm spare of `tower_id` online
    ///
    /// With `move_excess`, the load still above the tower's target moves to
    /// the spare in the same commit.
    pub async fn activate_spare(
        &self,
        tower_id: &str,
        move_excess: bool,
    ) -> EngineResult<SpareActivation> {
        let tower = self.repository.topology().get(tower_id)?.clone();
        let spare = self
            .planner
            .first_available_spare(&tower)
            .await?
            .ok_or_else(|| EngineError::NoEligibleTarget(tower_id.to_string()))?;
        let target_load = self.planner.policy().target_load.of_floor(tower.max_capacity);

        let changes = self
            .repository
            .modify_many(&[tower_id, &spare.tower_id], |states| {
                let (source, rest) = states.split_at_mut(1);
                let (source, spare_state) = (&mut source[0], &mut rest[0]);

                let moved = if move_excess {
                    source
                        .active_connections
                        .saturating_sub(target_load)
                        .min(spare.max_capacity.saturating_sub(spare_state.active_connections))
                } else {
                    0
                };
                source.active_connections -= moved;
                spare_state.active_connections += moved;

                spare_state.operating_mode = OperatingMode::Boost;
                spare_state.status = TowerStatus::Healthy;
                spare_state.active_capacity_units = ACTIVE_SPARE_UNITS.min(spare.max_capacity_units);
                spare_state.power_consumption =
                    round2(BASE_POWER_KW * OperatingMode::Boost.power_multiplier());
                Ok(())
            })
            .await?;

        let moved = changes[0].before.active_connections - changes[0].after.active_connections;
        Ok(SpareActivation {
            tower_id: tower_id.to_string(),
            spare_tower: spare.tower_id,
            connections_moved: moved,
            spare_state: changes[1].after.clone(),
            changes,
        })
    }
}
