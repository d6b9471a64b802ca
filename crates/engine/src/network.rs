//! Tower network facade
//!
//! `TowerNetwork` wires the repository, analyzer, planner, detector and
//! healing engine together and exposes every operation callers need as plain
//! serde data, so any transport can sit in front of it.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::healing::{
    rescale_units, ActionExecutor, FaultInjector, HealingReport, Issue, IssueDetector, IssueType,
    RemediationFilter, RemediationLedger, RemediationRecord, SelfHealingEngine, Severity,
    SpareActivation,
};
use crate::models::{
    round1, round2, OperatingMode, StatePatch, TowerState, TowerStatus, BASE_POWER_KW,
};
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::policy::EngineConfig;
use crate::repository::{SharedStore, TowerRepository};
use crate::topology::Topology;
use crate::traffic::{
    CongestionAnalyzer, RedirectOutcome, RedistributionPlan, RedistributionPlanner,
    TrafficAnalysis,
};

/// Highest load a congestion simulation may request, in percent
pub const MAX_SIMULATED_LOAD_PERCENT: f64 = 150.0;

const SIMULATED_CPU_CEILING: f64 = 95.0;

/// Result of `simulate_congestion`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CongestionSimulation {
    pub tower_id: String,
    pub load_percent: f64,
    pub state: TowerState,
    pub analysis: TrafficAnalysis,
}

/// Network-wide health roll-up
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkHealthSummary {
    pub timestamp: DateTime<Utc>,
    pub total_towers: usize,
    pub healthy: usize,
    pub warning: usize,
    pub critical: usize,
    pub down: usize,
    pub total_connections: u64,
    pub avg_cpu_usage: f64,
    pub avg_latency_ms: f64,
    pub total_power_kw: f64,
    pub warning_issues: usize,
    pub critical_issues: usize,
    pub auto_remediation_available: bool,
    pub active_issues: Vec<Issue>,
}

/// Idle serving units on one tower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyRecommendation {
    pub tower_id: String,
    pub active_units: u32,
    pub units_needed: u32,
    pub idle_units: u32,
    pub estimated_savings_kw: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyReport {
    pub timestamp: DateTime<Utc>,
    pub recommendations: Vec<EnergyRecommendation>,
    pub total_potential_savings_kw: f64,
}

/// Result of matching a tower's units to its load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnergyOptimization {
    pub success: bool,
    pub tower_id: String,
    pub units_before: u32,
    pub units_after: u32,
    pub power_before: f64,
    pub power_after: f64,
    pub power_savings_kw: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerModeChange {
    pub success: bool,
    pub tower_id: String,
    pub previous_mode: OperatingMode,
    pub new_mode: OperatingMode,
    pub power_before: f64,
    pub power_after: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitsChange {
    pub success: bool,
    pub tower_id: String,
    pub previous_units: u32,
    pub new_units: u32,
    pub max_units: u32,
    pub power_before: f64,
    pub power_after: f64,
    pub timestamp: DateTime<Utc>,
}

/// The tower network and everything that acts on it
pub struct TowerNetwork {
    config: EngineConfig,
    repository: Arc<TowerRepository>,
    analyzer: CongestionAnalyzer,
    planner: RedistributionPlanner,
    detector: IssueDetector,
    healing: SelfHealingEngine,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl TowerNetwork {
    pub fn new(
        topology: Arc<Topology>,
        store: SharedStore,
        ledger: Arc<RemediationLedger>,
        config: EngineConfig,
    ) -> Self {
        let repository = Arc::new(
            TowerRepository::new(topology, store).with_timeout(config.persistence_timeout),
        );
        let metrics = EngineMetrics::new();
        metrics.set_towers_monitored(repository.topology().len() as i64);

        let executor =
            ActionExecutor::new(repository.clone(), config.redistribution, config.healing);
        Self {
            analyzer: CongestionAnalyzer::new(repository.clone()),
            planner: RedistributionPlanner::new(repository.clone(), config.redistribution),
            detector: IssueDetector::new(repository.clone()),
            healing: SelfHealingEngine::new(repository.clone(), executor, ledger),
            logger: StructuredLogger::new("trace-engine"),
            metrics,
            config,
            repository,
        }
    }

    /// Network over in-memory state and ledger with default policy
    pub fn in_memory(topology: Arc<Topology>) -> Self {
        Self::new(
            topology,
            Arc::new(crate::repository::InMemoryStore::new()),
            Arc::new(RemediationLedger::in_memory()),
            EngineConfig::default(),
        )
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.healing = self.rebuild_healing(None).with_logger(logger.clone());
        self.logger = logger;
        self
    }

    /// Route playbook actions through `faults`
    pub fn with_faults(mut self, faults: Arc<dyn FaultInjector>) -> Self {
        self.healing = self
            .rebuild_healing(Some(faults))
            .with_logger(self.logger.clone());
        self
    }

    fn rebuild_healing(&self, faults: Option<Arc<dyn FaultInjector>>) -> SelfHealingEngine {
        let mut executor = ActionExecutor::new(
            self.repository.clone(),
            self.config.redistribution,
            self.config.healing,
        );
        if let Some(faults) = faults {
            executor = executor.with_faults(faults);
        }
        SelfHealingEngine::new(
            self.repository.clone(),
            executor,
            self.healing.ledger().clone(),
        )
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn topology(&self) -> &Arc<Topology> {
        self.repository.topology()
    }

    pub fn repository(&self) -> &Arc<TowerRepository> {
        &self.repository
    }

    pub fn healing(&self) -> &SelfHealingEngine {
        &self.healing
    }

    /// Reopen remediations left open by a previous process
    pub async fn recover(&self) -> usize {
        self.healing.recover().await
    }

    pub async fn get_tower_state(&self, tower_id: &str) -> EngineResult<TowerState> {
        self.repository.get(tower_id).await
    }

    pub async fn get_all_tower_states(&self) -> EngineResult<Vec<TowerState>> {
        self.repository.get_all().await
    }

    pub async fn analyze_traffic(&self, tower_id: &str) -> EngineResult<TrafficAnalysis> {
        self.analyzer.analyze(tower_id).await
    }

    pub async fn calculate_redistribution(&self, tower_id: &str) -> EngineResult<RedistributionPlan> {
        self.planner.plan(tower_id).await
    }

    pub async fn execute_traffic_redirect(
        &self,
        tower_id: &str,
        target_tower_id: &str,
        connections: u32,
    ) -> EngineResult<RedirectOutcome> {
        if tower_id == target_tower_id {
            return Err(EngineError::InvalidRequest(format!(
                "cannot redirect tower {tower_id} onto itself"
            )));
        }

        let outcome = self
            .planner
            .execute_redirect(tower_id, target_tower_id, connections)
            .await?;
        self.metrics
            .add_connections_redirected(outcome.connections_moved);
        self.logger.log_traffic_redirected(&outcome);
        Ok(outcome)
    }

    /// Scan one tower, or all of them, and record what was found
    pub async fn detect_issues(&self, tower_id: Option<&str>) -> EngineResult<Vec<Issue>> {
        let issues = self.detector.detect(tower_id).await?;
        for issue in &issues {
            self.metrics.record_issue(issue);
            self.logger.log_issue(issue);
        }
        Ok(issues)
    }

    pub async fn execute_self_healing(
        &self,
        tower_id: &str,
        issue_type: IssueType,
    ) -> EngineResult<HealingReport> {
        self.healing.execute(tower_id, issue_type).await
    }

    pub async fn get_healing_status(&self, remediation_id: &str) -> EngineResult<RemediationRecord> {
        self.healing.ledger().get(remediation_id).await
    }

    pub async fn list_remediations(&self, filter: &RemediationFilter) -> Vec<RemediationRecord> {
        self.healing.ledger().list(filter).await
    }

    pub async fn approve_remediation(
        &self,
        remediation_id: &str,
        approver: &str,
    ) -> EngineResult<RemediationRecord> {
        if approver.trim().is_empty() {
            return Err(EngineError::InvalidRequest(
                "approver must not be empty".to_string(),
            ));
        }
        self.healing.approve(remediation_id, approver).await
    }

    pub async fn rollback_remediation(
        &self,
        remediation_id: &str,
        reason: &str,
    ) -> EngineResult<RemediationRecord> {
        self.healing.rollback(remediation_id, reason).await
    }

    /// Drive a tower to `load_percent` of its capacity with matching telemetry
    pub async fn simulate_congestion(
        &self,
        tower_id: &str,
        load_percent: f64,
    ) -> EngineResult<CongestionSimulation> {
        if !load_percent.is_finite() || !(0.0..=MAX_SIMULATED_LOAD_PERCENT).contains(&load_percent)
        {
            return Err(EngineError::InvalidRequest(format!(
                "load_percent must be between 0 and {MAX_SIMULATED_LOAD_PERCENT}, got {load_percent}"
            )));
        }

        let max_capacity = self.repository.topology().get(tower_id)?.max_capacity;
        let patch = StatePatch {
            active_connections: Some((max_capacity as f64 * load_percent / 100.0).floor() as u32),
            cpu_usage: Some(round1((50.0 + load_percent * 0.4).min(SIMULATED_CPU_CEILING))),
            latency_ms: Some(round1(20.0 + load_percent * 1.5)),
            status: Some(if load_percent > 75.0 {
                TowerStatus::Warning
            } else {
                TowerStatus::Healthy
            }),
            ..Default::default()
        };
        let state = self.repository.update(tower_id, &patch).await?;
        let analysis = self.analyzer.analyze(tower_id).await?;

        info!(
            tower_id = %tower_id,
            load_percent = load_percent,
            connections = state.active_connections,
            "Simulated congestion"
        );
        Ok(CongestionSimulation {
            tower_id: tower_id.to_string(),
            load_percent,
            state,
            analysis,
        })
    }

    /// Put every tower back to its topology default
    pub async fn reset_network(&self) -> EngineResult<Vec<TowerState>> {
        let states = self.repository.restore_defaults().await?;
        info!(towers = states.len(), "Network reset to defaults");
        Ok(states)
    }

    pub async fn network_health_summary(&self) -> EngineResult<NetworkHealthSummary> {
        let states = self.repository.get_all().await?;
        let topology = self.repository.topology();

        let mut issues = Vec::new();
        for state in &states {
            let tower = topology.get(&state.tower_id)?;
            issues.extend(crate::healing::evaluate(tower, state));
        }

        let count = |status: TowerStatus| states.iter().filter(|s| s.status == status).count();
        let towers = states.len().max(1) as f64;
        Ok(NetworkHealthSummary {
            timestamp: Utc::now(),
            total_towers: states.len(),
            healthy: count(TowerStatus::Healthy),
            warning: count(TowerStatus::Warning),
            critical: count(TowerStatus::Critical),
            down: count(TowerStatus::Down),
            total_connections: states.iter().map(|s| s.active_connections as u64).sum(),
            avg_cpu_usage: round2(states.iter().map(|s| s.cpu_usage).sum::<f64>() / towers),
            avg_latency_ms: round2(states.iter().map(|s| s.latency_ms).sum::<f64>() / towers),
            total_power_kw: round2(states.iter().map(|s| s.power_consumption).sum()),
            warning_issues: issues
                .iter()
                .filter(|i| i.severity == Severity::Warning)
                .count(),
            critical_issues: issues
                .iter()
                .filter(|i| i.severity == Severity::Critical)
                .count(),
            auto_remediation_available: issues.iter().any(|i| i.auto_remediation_available),
            active_issues: issues,
        })
    }

    /// Primary towers running more units than their load needs
    pub async fn energy_recommendations(&self) -> EngineResult<EnergyReport> {
        let healing = self.config.healing;
        let mut recommendations = Vec::new();

        for tower in self.repository.topology().towers() {
            if tower.is_warm_spare() {
                continue;
            }
            let state = self.repository.get(&tower.tower_id).await?;
            let units_needed = healing
                .units_needed(state.active_connections)
                .min(tower.max_capacity_units);
            let idle_units = state.active_capacity_units.saturating_sub(units_needed);
            if idle_units == 0 {
                continue;
            }
            recommendations.push(EnergyRecommendation {
                tower_id: tower.tower_id.clone(),
                active_units: state.active_capacity_units,
                units_needed,
                idle_units,
                estimated_savings_kw: round2(idle_units as f64 * healing.power_per_unit_kw),
            });
        }

        Ok(EnergyReport {
            timestamp: Utc::now(),
            total_potential_savings_kw: round2(
                recommendations.iter().map(|r| r.estimated_savings_kw).sum(),
            ),
            recommendations,
        })
    }

    /// Match a tower's active units to what its load needs
    pub async fn execute_energy_optimization(&self, tower_id: &str) -> EngineResult<EnergyOptimization> {
        let max_units = self.repository.topology().get(tower_id)?.max_capacity_units;
        let healing = self.config.healing;

        let change = self
            .repository
            .modify(tower_id, |state| {
                let units = healing
                    .units_needed(state.active_connections)
                    .min(max_units);
                rescale_units(state, units);
                Ok(())
            })
            .await?;

        info!(
            tower_id = %tower_id,
            units_before = change.before.active_capacity_units,
            units_after = change.after.active_capacity_units,
            "Energy optimization applied"
        );
        Ok(EnergyOptimization {
            success: true,
            tower_id: tower_id.to_string(),
            units_before: change.before.active_capacity_units,
            units_after: change.after.active_capacity_units,
            power_before: change.before.power_consumption,
            power_after: change.after.power_consumption,
            power_savings_kw: round2(
                change.before.power_consumption - change.after.power_consumption,
            ),
            timestamp: Utc::now(),
        })
    }

    pub async fn set_power_mode(&self, tower_id: &str, mode: OperatingMode) -> EngineResult<PowerModeChange> {
        let change = self
            .repository
            .modify(tower_id, |state| {
                state.operating_mode = mode;
                state.power_consumption = round2(BASE_POWER_KW * mode.power_multiplier());
                Ok(())
            })
            .await?;

        info!(
            tower_id = %tower_id,
            from = %change.before.operating_mode,
            to = %mode,
            "Power mode changed"
        );
        Ok(PowerModeChange {
            success: true,
            tower_id: tower_id.to_string(),
            previous_mode: change.before.operating_mode,
            new_mode: mode,
            power_before: change.before.power_consumption,
            power_after: change.after.power_consumption,
            timestamp: Utc::now(),
        })
    }

    pub async fn set_active_units(&self, tower_id: &str, units: u32) -> EngineResult<UnitsChange> {
        let max_units = self.repository.topology().get(tower_id)?.max_capacity_units;
        if units == 0 || units > max_units {
            return Err(EngineError::InvalidRequest(format!(
                "active units for {tower_id} must be between 1 and {max_units}, got {units}"
            )));
        }

        let change = self
            .repository
            .modify(tower_id, |state| {
                rescale_units(state, units);
                Ok(())
            })
            .await?;

        Ok(UnitsChange {
            success: true,
            tower_id: tower_id.to_string(),
            previous_units: change.before.active_capacity_units,
            new_units: change.after.active_capacity_units,
            max_units,
            power_before: change.before.power_consumption,
            power_after: change.after.power_consumption,
            timestamp: Utc::now(),
        })
    }

    /// Bring the first available warm spare of `tower_id` online without
    /// moving any load onto it
    pub async fn activate_warm_spare(&self, tower_id: &str) -> EngineResult<SpareActivation> {
        let activation = self
            .healing
            .executor()
            .activate_spare(tower_id, false)
            .await?;
        info!(
            tower_id = %tower_id,
            spare_tower = %activation.spare_tower,
            "Warm spare activated"
        );
        Ok(activation)
    }
}
