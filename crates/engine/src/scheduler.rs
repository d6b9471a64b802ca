//! Periodic issue detection
//!
//! Runs `detect_issues` over the whole network on a fixed interval and, when
//! auto-heal is on, starts remediation for every issue that has an
//! automatic playbook. A failing cycle marks the scheduler degraded in the
//! health registry; the loop itself keeps going.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::error::EngineResult;
use crate::health::{components, ComponentHealth, HealthRegistry};
use crate::network::TowerNetwork;
use crate::observability::EngineMetrics;

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Start remediation for detected issues without waiting for a caller
    pub auto_heal: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            auto_heal: false,
        }
    }
}

/// What one detection cycle did
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CycleReport {
    pub issues: usize,
    pub remediations_started: usize,
    pub remediations_deduplicated: usize,
    pub remediation_errors: usize,
}

pub struct DetectionScheduler {
    network: Arc<TowerNetwork>,
    health: HealthRegistry,
    config: SchedulerConfig,
    metrics: EngineMetrics,
}

impl DetectionScheduler {
    pub fn new(network: Arc<TowerNetwork>, health: HealthRegistry, config: SchedulerConfig) -> Self {
        Self {
            network,
            health,
            config,
            metrics: EngineMetrics::new(),
        }
    }

    /// Run until `shutdown` fires
    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        info!(
            interval_secs = self.config.interval.as_secs(),
            auto_heal = self.config.auto_heal,
            "Starting detection scheduler"
        );

        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_cycle().await {
                        Ok(report) => {
                            self.health.set_healthy(components::SCHEDULER).await;
                            debug!(
                                issues = report.issues,
                                started = report.remediations_started,
                                deduplicated = report.remediations_deduplicated,
                                errors = report.remediation_errors,
                                "Detection cycle complete"
                            );
                        }
                        Err(e) => {
                            self.metrics.inc_detection_errors();
                            warn!(error = %e, "Detection cycle failed");
                            self.health
                                .set_degraded(components::SCHEDULER, e.to_string())
                                .await;
                        }
                    }
                }
                _ = shutdown.recv() => {
                    info!("Shutting down detection scheduler");
                    break;
                }
            }
        }
    }

    /// Scan every tower once
    pub async fn run_cycle(&self) -> EngineResult<CycleReport> {
        let start = Instant::now();
        let detected = self.network.detect_issues(None).await;
        self.health.observe(components::DETECTOR, &detected).await;
        let issues = detected?;
        self.metrics
            .observe_detection_cycle(start.elapsed().as_secs_f64());

        let mut report = CycleReport {
            issues: issues.len(),
            ..Default::default()
        };
        if !self.config.auto_heal {
            return Ok(report);
        }

        // Worst infrastructure fault of the cycle; one success must not hide it
        let mut ledger_health: Option<ComponentHealth> = None;
        for issue in issues.iter().filter(|i| i.auto_remediation_available) {
            let result = self
                .network
                .execute_self_healing(&issue.tower_id, issue.issue_type)
                .await;
            let observed = match &result {
                Err(e) if e.is_infrastructure() => Some(ComponentHealth::from_error(e)),
                Err(_) => None,
                Ok(_) => Some(ComponentHealth::healthy()),
            };
            if let Some(observed) = observed {
                if ledger_health
                    .as_ref()
                    .map_or(true, |worst| observed.status > worst.status)
                {
                    ledger_health = Some(observed);
                }
            }
            match result {
                Ok(healing) if healing.deduplicated => report.remediations_deduplicated += 1,
                Ok(_) => report.remediations_started += 1,
                Err(e) => {
                    report.remediation_errors += 1;
                    warn!(
                        tower_id = %issue.tower_id,
                        issue_type = %issue.issue_type,
                        error = %e,
                        "Automatic remediation failed"
                    );
                }
            }
        }
        if let Some(health) = ledger_health {
            self.health.update(components::LEDGER, health).await;
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use crate::health::ComponentStatus;
    use crate::healing::{IssueType, RemediationFilter, RemediationLedger, RemediationStatus};
    use crate::models::{StatePatch, TowerState, TowerStatus};
    use crate::policy::EngineConfig;
    use crate::repository::{InMemoryStore, StateStore};
    use crate::topology::Topology;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Store that refuses writes touching one tower while `down` is set
    struct OutageStore {
        inner: InMemoryStore,
        tower_id: &'static str,
        down: AtomicBool,
    }

    #[async_trait]
    impl StateStore for OutageStore {
        async fn load(&self, tower_id: &str) -> EngineResult<Option<TowerState>> {
            self.inner.load(tower_id).await
        }

        async fn commit(&self, states: Vec<TowerState>, timeout: Duration) -> EngineResult<()> {
            if self.down.load(Ordering::SeqCst) && states.iter().any(|s| s.tower_id == self.tower_id)
            {
                return Err(EngineError::Persistence("shard offline".into()));
            }
            self.inner.commit(states, timeout).await
        }
    }

    fn scheduler(auto_heal: bool) -> (DetectionScheduler, Arc<TowerNetwork>) {
        let network = Arc::new(TowerNetwork::in_memory(Arc::new(Topology::builtin())));
        let scheduler = DetectionScheduler::new(
            network.clone(),
            HealthRegistry::new(),
            SchedulerConfig {
                interval: Duration::from_millis(10),
                auto_heal,
            },
        );
        (scheduler, network)
    }

    #[tokio::test]
    async fn test_cycle_without_auto_heal_only_detects() {
        let (scheduler, network) = scheduler(false);
        network.simulate_congestion("tower-001", 96.0).await.unwrap();

        let report = scheduler.run_cycle().await.unwrap();
        assert!(report.issues > 0);
        assert_eq!(report.remediations_started, 0);
        assert!(network
            .list_remediations(&RemediationFilter::default())
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn test_auto_heal_skips_manual_issues() {
        let (scheduler, network) = scheduler(true);
        network
            .repository()
            .update(
                "tower-004",
                &StatePatch {
                    status: Some(TowerStatus::Down),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        network
            .repository()
            .update(
                "tower-003",
                &StatePatch {
                    latency_ms: Some(150.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.remediations_started, 1);

        let records = network
            .list_remediations(&RemediationFilter::default())
            .await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].issue_type, IssueType::HighLatency);
        assert_eq!(records[0].status, RemediationStatus::Resolved);
    }

    #[tokio::test]
    async fn test_one_success_does_not_hide_a_ledger_fault() {
        let store = Arc::new(OutageStore {
            inner: InMemoryStore::new(),
            tower_id: "tower-003",
            down: AtomicBool::new(false),
        });
        let network = Arc::new(TowerNetwork::new(
            Arc::new(Topology::builtin()),
            store.clone(),
            Arc::new(RemediationLedger::in_memory()),
            EngineConfig::default(),
        ));
        let health = HealthRegistry::new();
        health.register_all().await;
        let scheduler = DetectionScheduler::new(
            network.clone(),
            health.clone(),
            SchedulerConfig {
                interval: Duration::from_millis(10),
                auto_heal: true,
            },
        );

        for tower_id in ["tower-002", "tower-003"] {
            network
                .repository()
                .update(
                    tower_id,
                    &StatePatch {
                        latency_ms: Some(150.0),
                        ..Default::default()
                    },
                )
                .await
                .unwrap();
        }
        // Every other tower needs a stored state before the outage starts
        network.get_all_tower_states().await.unwrap();
        store.down.store(true, Ordering::SeqCst);

        let report = scheduler.run_cycle().await.unwrap();
        assert_eq!(report.remediations_started, 1);
        assert_eq!(report.remediation_errors, 1);

        let ledger = &health.health().await.components[components::LEDGER];
        assert_eq!(ledger.status, ComponentStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (scheduler, _network) = scheduler(false);
        let (tx, rx) = broadcast::channel(1);

        let handle = tokio::spawn(scheduler.run(rx));
        tokio::time::sleep(Duration::from_millis(30)).await;
        tx.send(()).unwrap();

        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
