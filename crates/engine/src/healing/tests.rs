//! End-to-end remediation scenarios

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::*;
use crate::error::{EngineError, EngineResult};
use crate::models::{OperatingMode, StatePatch, Tower, TowerState, TowerStatus};
use crate::policy::{HealingPolicy, RedistributionPolicy};
use crate::repository::{InMemoryStore, StateStore, TowerRepository};
use crate::topology::Topology;

fn congestion_topology() -> Arc<Topology> {
    Arc::new(
        Topology::new(vec![
            Tower::new("T1", 500, 8)
                .with_neighbors(["T2"])
                .with_warm_spares(["S1"]),
            Tower::new("T2", 500, 8),
            Tower::new("T3", 300, 4),
            Tower::spare("S1", 400, 4),
        ])
        .unwrap(),
    )
}

fn engine_with(repo: Arc<TowerRepository>, faults: Arc<dyn FaultInjector>) -> SelfHealingEngine {
    let executor = ActionExecutor::new(
        repo.clone(),
        RedistributionPolicy::default(),
        HealingPolicy::default(),
    )
    .with_faults(faults);
    SelfHealingEngine::new(repo, executor, Arc::new(RemediationLedger::in_memory()))
}

fn setup() -> (SelfHealingEngine, Arc<TowerRepository>) {
    let repo = Arc::new(TowerRepository::in_memory(congestion_topology()));
    (engine_with(repo.clone(), Arc::new(NoFaults)), repo)
}

async fn set(repo: &TowerRepository, tower_id: &str, patch: StatePatch) -> TowerState {
    repo.update(tower_id, &patch).await.unwrap()
}

fn actions(record: &RemediationRecord) -> Vec<HealingAction> {
    record.steps_executed.iter().map(|s| s.action).collect()
}

#[tokio::test]
async fn test_congestion_resolved_by_neighbor_redirect() {
    let (engine, repo) = setup();
    set(&repo, "T1", StatePatch { active_connections: Some(480), ..Default::default() }).await;
    set(&repo, "T2", StatePatch { active_connections: Some(0), ..Default::default() }).await;

    let report = engine.execute("T1", IssueType::Congestion).await.unwrap();
    assert!(!report.deduplicated);
    assert_eq!(report.record.status, RemediationStatus::Resolved);
    assert_eq!(
        actions(&report.record),
        vec![
            HealingAction::AnalyzeTrafficPattern,
            HealingAction::CalculateRedistribution,
            HealingAction::RedirectToNeighbors,
        ]
    );
    assert!(report.record.completed_at.is_some());

    assert_eq!(repo.get("T1").await.unwrap().active_connections, 350);
    assert_eq!(repo.get("T2").await.unwrap().active_connections, 130);
    // The spare was never touched
    assert_eq!(
        repo.get("S1").await.unwrap().operating_mode,
        OperatingMode::Standby
    );
}

#[tokio::test]
async fn test_congestion_falls_back_to_warm_spare() {
    let (engine, repo) = setup();
    set(&repo, "T1", StatePatch { active_connections: Some(480), ..Default::default() }).await;
    // 75% of 500 is 375, leaving room for only 5
    set(&repo, "T2", StatePatch { active_connections: Some(370), ..Default::default() }).await;

    let report = engine.execute("T1", IssueType::Congestion).await.unwrap();
    assert_eq!(report.record.status, RemediationStatus::Resolved);
    assert_eq!(report.record.steps_executed.len(), 4);
    assert_eq!(
        report.record.steps_executed[3].action,
        HealingAction::ActivateWarmSpare
    );

    assert_eq!(repo.get("T1").await.unwrap().active_connections, 350);
    assert_eq!(repo.get("T2").await.unwrap().active_connections, 375);
    let spare = repo.get("S1").await.unwrap();
    assert_eq!(spare.active_connections, 125);
    assert_eq!(spare.operating_mode, OperatingMode::Boost);
}

#[tokio::test]
async fn test_manual_step_waits_for_approval() {
    let repo = Arc::new(TowerRepository::in_memory(congestion_topology()));
    let engine = engine_with(
        repo.clone(),
        Arc::new(ScriptedFaults::failing([HealingAction::RestartNonCriticalServices])),
    );
    // T3 already runs all four units, so scaling cannot help either
    set(&repo, "T3", StatePatch { cpu_usage: Some(96.0), ..Default::default() }).await;
    let before = repo.get("T3").await.unwrap();

    let report = engine.execute("T3", IssueType::HighCpu).await.unwrap();
    let record = report.record;
    assert_eq!(record.status, RemediationStatus::AwaitingApproval);

    let statuses: Vec<StepStatus> = record.steps_executed.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Failed,
            StepStatus::RequiresHumanApproval,
        ]
    );
    assert!(repo.get("T3").await.unwrap().same_readings(&before));

    // A second trigger does not start a parallel run
    let again = engine.execute("T3", IssueType::HighCpu).await.unwrap();
    assert!(again.deduplicated);
    assert_eq!(again.record.remediation_id, record.remediation_id);
    assert_eq!(again.record.steps_executed.len(), 4);

    let approved = engine
        .approve(&record.remediation_id, "noc-lead")
        .await
        .unwrap();
    assert_eq!(approved.status, RemediationStatus::Completed);
    let last = approved.steps_executed.last().unwrap();
    assert_eq!(last.action, HealingAction::EscalateToHuman);
    assert_eq!(last.status, StepStatus::Completed);
    assert_eq!(last.approved_by.as_deref(), Some("noc-lead"));
    // History before the approval is unchanged
    assert_eq!(approved.steps_executed[..4], record.steps_executed[..]);
}

#[tokio::test]
async fn test_tower_down_starts_pending_approval() {
    let (engine, repo) = setup();
    set(&repo, "T2", StatePatch { status: Some(TowerStatus::Down), ..Default::default() }).await;

    let report = engine.execute("T2", IssueType::TowerDown).await.unwrap();
    assert_eq!(report.record.status, RemediationStatus::PendingApproval);
    assert!(report.record.steps_executed.is_empty());
    assert_eq!(repo.get("T2").await.unwrap().status, TowerStatus::Down);

    assert!(engine.execute("T2", IssueType::TowerDown).await.unwrap().deduplicated);

    let record = engine
        .approve(&report.record.remediation_id, "field-ops")
        .await
        .unwrap();
    assert_eq!(record.status, RemediationStatus::Resolved);
    assert_eq!(
        actions(&record),
        vec![HealingAction::NotifyOperator, HealingAction::RestoreTowerService]
    );
    assert_eq!(record.steps_executed[1].approved_by.as_deref(), Some("field-ops"));
    assert_eq!(repo.get("T2").await.unwrap().status, TowerStatus::Healthy);

    // Once resolved the pair is free again
    set(&repo, "T2", StatePatch { status: Some(TowerStatus::Down), ..Default::default() }).await;
    let next = engine.execute("T2", IssueType::TowerDown).await.unwrap();
    assert!(!next.deduplicated);
    assert_ne!(next.record.remediation_id, record.remediation_id);
}

#[tokio::test]
async fn test_approve_rejects_finished_remediation() {
    let (engine, repo) = setup();
    set(&repo, "T1", StatePatch { cpu_usage: Some(96.0), ..Default::default() }).await;

    let report = engine.execute("T1", IssueType::HighCpu).await.unwrap();
    assert_eq!(report.record.status, RemediationStatus::Resolved);
    assert_eq!(report.record.steps_executed.len(), 2);

    let err = engine
        .approve(&report.record.remediation_id, "noc-lead")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::InvalidTransition { .. }));
    assert!(matches!(
        engine.approve("HEAL-unknown", "noc-lead").await,
        Err(EngineError::RemediationNotFound(_))
    ));
}

#[tokio::test]
async fn test_failed_step_does_not_stop_playbook() {
    let repo = Arc::new(TowerRepository::in_memory(congestion_topology()));
    let engine = engine_with(
        repo.clone(),
        Arc::new(ScriptedFaults::failing([HealingAction::OptimizeRouting])),
    );
    set(&repo, "T2", StatePatch { latency_ms: Some(150.0), ..Default::default() }).await;

    let record = engine
        .execute("T2", IssueType::HighLatency)
        .await
        .unwrap()
        .record;
    let statuses: Vec<StepStatus> = record.steps_executed.iter().map(|s| s.status).collect();
    assert_eq!(
        statuses,
        vec![
            StepStatus::Completed,
            StepStatus::Failed,
            StepStatus::Completed,
            StepStatus::Completed,
        ]
    );
    assert_eq!(record.status, RemediationStatus::Resolved);
    assert_eq!(repo.get("T2").await.unwrap().latency_ms, 70.0);
}

#[tokio::test]
async fn test_playbook_exhausted_is_completed_not_resolved() {
    let (engine, repo) = setup();
    set(&repo, "T2", StatePatch { latency_ms: Some(400.0), ..Default::default() }).await;

    let record = engine
        .execute("T2", IssueType::HighLatency)
        .await
        .unwrap()
        .record;
    assert_eq!(record.steps_executed.len(), 4);
    assert_eq!(record.status, RemediationStatus::Completed);
    // 400 - 30 = 370, * 0.8 = 296, - 50 = 246
    assert_eq!(repo.get("T2").await.unwrap().latency_ms, 246.0);
}

#[tokio::test]
async fn test_high_power_keeps_units_for_load() {
    let (engine, repo) = setup();
    set(
        &repo,
        "T1",
        StatePatch {
            active_connections: Some(150),
            active_capacity_units: Some(8),
            power_consumption: Some(9.6),
            ..Default::default()
        },
    )
    .await;

    let record = engine
        .execute("T1", IssueType::HighPower)
        .await
        .unwrap()
        .record;
    assert_eq!(record.status, RemediationStatus::Resolved);
    assert_eq!(
        actions(&record),
        vec![HealingAction::AnalyzePowerUsage, HealingAction::ReduceIdleTrx]
    );

    let state = repo.get("T1").await.unwrap();
    assert_eq!(state.active_capacity_units, 6);
    assert!(state.active_capacity_units >= 2);
}

#[tokio::test]
async fn test_rollback_restores_towers() {
    let (engine, repo) = setup();
    set(&repo, "T1", StatePatch { active_connections: Some(480), ..Default::default() }).await;
    set(&repo, "T2", StatePatch { active_connections: Some(0), ..Default::default() }).await;

    let record = engine
        .execute("T1", IssueType::Congestion)
        .await
        .unwrap()
        .record;
    let rolled = engine
        .rollback(&record.remediation_id, "customer complaints on T2")
        .await
        .unwrap();

    assert_eq!(rolled.status, RemediationStatus::RolledBack);
    assert_eq!(rolled.rollback_reason.as_deref(), Some("customer complaints on T2"));
    let marker = rolled.steps_executed.last().unwrap();
    assert_eq!(marker.action, HealingAction::Rollback);
    assert_eq!(marker.status, StepStatus::RolledBack);
    assert_eq!(rolled.steps_executed.len(), record.steps_executed.len() + 1);

    assert_eq!(repo.get("T1").await.unwrap().active_connections, 480);
    assert_eq!(repo.get("T2").await.unwrap().active_connections, 0);

    assert!(matches!(
        engine.rollback(&record.remediation_id, "again").await,
        Err(EngineError::InvalidTransition { .. })
    ));
}

#[tokio::test]
async fn test_rollback_reverses_deltas_only() {
    let (engine, repo) = setup();
    set(&repo, "T1", StatePatch { active_connections: Some(480), ..Default::default() }).await;
    set(&repo, "T2", StatePatch { active_connections: Some(0), ..Default::default() }).await;

    let record = engine
        .execute("T1", IssueType::Congestion)
        .await
        .unwrap()
        .record;
    // T2 sheds load on its own after the redirect
    set(&repo, "T2", StatePatch { active_connections: Some(40), ..Default::default() }).await;

    engine.rollback(&record.remediation_id, "revert").await.unwrap();
    assert_eq!(repo.get("T1").await.unwrap().active_connections, 480);
    assert_eq!(repo.get("T2").await.unwrap().active_connections, 0);
}

#[tokio::test]
async fn test_rollback_disabled_by_policy() {
    let (engine, repo) = setup();
    set(&repo, "T1", StatePatch { cpu_usage: Some(96.0), ..Default::default() }).await;

    let record = engine
        .execute("T1", IssueType::HighCpu)
        .await
        .unwrap()
        .record;
    let err = engine
        .rollback(&record.remediation_id, "operator request")
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::PolicyViolation(IssueType::HighCpu)));
    assert_eq!(
        engine.ledger().get(&record.remediation_id).await.unwrap().status,
        RemediationStatus::Resolved
    );
}

/// Store whose commits can be switched to fail
#[derive(Default)]
struct FlakyStore {
    inner: InMemoryStore,
    failing: AtomicBool,
    /// Commits still let through once `failing` is set
    grace: AtomicU32,
}

#[async_trait]
impl StateStore for FlakyStore {
    async fn load(&self, tower_id: &str) -> EngineResult<Option<TowerState>> {
        self.inner.load(tower_id).await
    }

    async fn commit(&self, states: Vec<TowerState>, timeout: Duration) -> EngineResult<()> {
        if self.failing.load(Ordering::SeqCst)
            && self
                .grace
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |g| g.checked_sub(1))
                .is_err()
        {
            return Err(EngineError::Persistence("state store unreachable".into()));
        }
        self.inner.commit(states, timeout).await
    }
}

/// Takes the store down the first time `action` is about to run
struct TripWire {
    store: Arc<FlakyStore>,
    action: HealingAction,
    tripped: AtomicBool,
}

impl FaultInjector for TripWire {
    fn inject(&self, _tower_id: &str, action: HealingAction) -> Option<String> {
        if action == self.action && !self.tripped.swap(true, Ordering::SeqCst) {
            self.store.failing.store(true, Ordering::SeqCst);
        }
        None
    }
}

#[tokio::test]
async fn test_infrastructure_failure_aborts_and_resumes() {
    let store = Arc::new(FlakyStore::default());
    let repo = Arc::new(TowerRepository::new(congestion_topology(), store.clone()));
    let engine = engine_with(
        repo.clone(),
        Arc::new(TripWire {
            store: store.clone(),
            action: HealingAction::OptimizeRouting,
            tripped: AtomicBool::new(false),
        }),
    );
    set(&repo, "T2", StatePatch { latency_ms: Some(150.0), ..Default::default() }).await;

    let err = engine
        .execute("T2", IssueType::HighLatency)
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());

    let open = engine.ledger().list(&RemediationFilter::default()).await;
    assert_eq!(open.len(), 1);
    assert_eq!(open[0].status, RemediationStatus::InProgress);
    assert_eq!(open[0].next_step, 1);
    assert_eq!(repo.get("T2").await.unwrap().latency_ms, 150.0);

    store.failing.store(false, Ordering::SeqCst);
    let resumed = engine
        .execute("T2", IssueType::HighLatency)
        .await
        .unwrap();
    assert!(!resumed.deduplicated);
    assert_eq!(resumed.record.remediation_id, open[0].remediation_id);
    assert_eq!(resumed.record.status, RemediationStatus::Resolved);
    assert_eq!(
        actions(&resumed.record),
        vec![
            HealingAction::CheckNetworkPath,
            HealingAction::OptimizeRouting,
            HealingAction::IncreaseBandwidth,
        ]
    );
}

fn two_neighbor_topology() -> Arc<Topology> {
    Arc::new(
        Topology::new(vec![
            Tower::new("T1", 500, 8).with_neighbors(["T2", "T3"]),
            Tower::new("T2", 500, 8),
            Tower::new("T3", 500, 8),
        ])
        .unwrap(),
    )
}

/// T1 at 480 needs 130 moved; T2 and T3 have 55 and 75 of headroom
async fn split_redirect_setup() -> (SelfHealingEngine, Arc<TowerRepository>, Arc<FlakyStore>) {
    let store = Arc::new(FlakyStore::default());
    let repo = Arc::new(TowerRepository::new(two_neighbor_topology(), store.clone()));
    let engine = engine_with(
        repo.clone(),
        Arc::new(TripWire {
            store: store.clone(),
            action: HealingAction::RedirectToNeighbors,
            tripped: AtomicBool::new(false),
        }),
    );
    set(&repo, "T1", StatePatch { active_connections: Some(480), ..Default::default() }).await;
    set(&repo, "T2", StatePatch { active_connections: Some(320), ..Default::default() }).await;
    set(&repo, "T3", StatePatch { active_connections: Some(300), ..Default::default() }).await;
    (engine, repo, store)
}

async fn loads(repo: &TowerRepository) -> [u32; 3] {
    [
        repo.get("T1").await.unwrap().active_connections,
        repo.get("T2").await.unwrap().active_connections,
        repo.get("T3").await.unwrap().active_connections,
    ]
}

#[tokio::test]
async fn test_split_redirect_commits_once() {
    let (engine, repo, store) = split_redirect_setup().await;
    // Only one more commit gets through once the redirect starts
    store.grace.store(1, Ordering::SeqCst);

    let record = engine
        .execute("T1", IssueType::Congestion)
        .await
        .unwrap()
        .record;
    assert_eq!(record.status, RemediationStatus::Resolved);
    assert_eq!(loads(&repo).await, [350, 375, 375]);

    let redirect = record.steps_executed.last().unwrap();
    assert_eq!(redirect.action, HealingAction::RedirectToNeighbors);
    assert_eq!(redirect.changes.len(), 3);
    match &redirect.result {
        Some(ActionReport::Redirected {
            connections_moved,
            redirects,
        }) => {
            assert_eq!(*connections_moved, 130);
            assert_eq!(redirects.len(), 2);
            assert_eq!(redirects[0].source_tower.connections_before, 480);
            assert_eq!(
                redirects[1].source_tower.connections_before,
                redirects[0].source_tower.connections_after
            );
            assert_eq!(redirects[1].source_tower.connections_after, 350);
        }
        other => panic!("unexpected report: {other:?}"),
    }

    store.failing.store(false, Ordering::SeqCst);
    engine
        .rollback(&record.remediation_id, "operator request")
        .await
        .unwrap();
    assert_eq!(loads(&repo).await, [480, 320, 300]);
}

#[tokio::test]
async fn test_failed_redirect_moves_nothing() {
    let (engine, repo, store) = split_redirect_setup().await;

    let err = engine
        .execute("T1", IssueType::Congestion)
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(loads(&repo).await, [480, 320, 300]);

    store.failing.store(false, Ordering::SeqCst);
    let resumed = engine
        .execute("T1", IssueType::Congestion)
        .await
        .unwrap()
        .record;
    assert_eq!(resumed.status, RemediationStatus::Resolved);
    assert_eq!(loads(&repo).await, [350, 375, 375]);

    engine
        .rollback(&resumed.remediation_id, "operator request")
        .await
        .unwrap();
    assert_eq!(loads(&repo).await, [480, 320, 300]);
}

/// Swaps the ledger file for a directory just before `action` runs
struct LedgerBlocker {
    path: PathBuf,
    action: HealingAction,
}

impl LedgerBlocker {
    fn unblock(path: &Path) {
        std::fs::remove_dir_all(path).unwrap();
    }
}

impl FaultInjector for LedgerBlocker {
    fn inject(&self, _tower_id: &str, action: HealingAction) -> Option<String> {
        if action == self.action {
            let _ = std::fs::remove_file(&self.path);
            std::fs::create_dir_all(self.path.join("blocked")).unwrap();
        }
        None
    }
}

#[tokio::test]
async fn test_unrecorded_step_is_not_repeated_on_resume() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ledger.json");
    let repo = Arc::new(TowerRepository::in_memory(congestion_topology()));
    let executor = ActionExecutor::new(
        repo.clone(),
        RedistributionPolicy::default(),
        HealingPolicy::default(),
    )
    .with_faults(Arc::new(LedgerBlocker {
        path: path.clone(),
        action: HealingAction::ReduceIdleTrx,
    }));
    let engine = SelfHealingEngine::new(
        repo.clone(),
        executor,
        Arc::new(RemediationLedger::open(&path).unwrap()),
    );
    set(
        &repo,
        "T1",
        StatePatch {
            active_connections: Some(150),
            active_capacity_units: Some(8),
            power_consumption: Some(9.6),
            ..Default::default()
        },
    )
    .await;

    let err = engine
        .execute("T1", IssueType::HighPower)
        .await
        .unwrap_err();
    assert!(err.is_infrastructure());
    assert_eq!(repo.get("T1").await.unwrap().active_capacity_units, 6);

    LedgerBlocker::unblock(&path);
    let record = engine
        .execute("T1", IssueType::HighPower)
        .await
        .unwrap()
        .record;
    assert_eq!(record.status, RemediationStatus::Resolved);
    assert_eq!(
        actions(&record),
        vec![HealingAction::AnalyzePowerUsage, HealingAction::ReduceIdleTrx]
    );
    assert_eq!(repo.get("T1").await.unwrap().active_capacity_units, 6);

    let reopened = RemediationLedger::open(&path).unwrap();
    let stored = reopened.get(&record.remediation_id).await.unwrap();
    assert_eq!(stored.status, RemediationStatus::Resolved);
    assert_eq!(stored.steps_executed.len(), 2);
}

#[tokio::test]
async fn test_recover_restores_dedup_after_restart() {
    let repo = Arc::new(TowerRepository::in_memory(congestion_topology()));
    let ledger = Arc::new(RemediationLedger::in_memory());
    let executor = ActionExecutor::new(
        repo.clone(),
        RedistributionPolicy::default(),
        HealingPolicy::default(),
    );
    let engine = SelfHealingEngine::new(repo.clone(), executor, ledger.clone());
    set(&repo, "T2", StatePatch { status: Some(TowerStatus::Down), ..Default::default() }).await;
    let first = engine.execute("T2", IssueType::TowerDown).await.unwrap();

    let executor = ActionExecutor::new(
        repo.clone(),
        RedistributionPolicy::default(),
        HealingPolicy::default(),
    );
    let restarted = SelfHealingEngine::new(repo, executor, ledger);
    assert_eq!(restarted.recover().await, 1);

    let again = restarted.execute("T2", IssueType::TowerDown).await.unwrap();
    assert!(again.deduplicated);
    assert_eq!(again.record.remediation_id, first.record.remediation_id);
}

#[tokio::test]
async fn test_concurrent_triggers_share_one_remediation() {
    let (engine, repo) = setup();
    set(&repo, "T2", StatePatch { status: Some(TowerStatus::Down), ..Default::default() }).await;
    let engine = Arc::new(engine);

    let mut handles = Vec::new();
    for _ in 0..8 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine.execute("T2", IssueType::TowerDown).await
        }));
    }

    let mut ids = Vec::new();
    let mut fresh = 0;
    for handle in handles {
        let report = handle.await.unwrap().unwrap();
        if !report.deduplicated {
            fresh += 1;
        }
        ids.push(report.record.remediation_id);
    }
    ids.dedup();
    assert_eq!(fresh, 1);
    assert_eq!(ids.len(), 1);
    assert_eq!(engine.ledger().len().await, 1);
}

#[tokio::test]
async fn test_unknown_tower_is_rejected() {
    let (engine, _repo) = setup();
    assert!(matches!(
        engine.execute("T9", IssueType::Congestion).await,
        Err(EngineError::UnknownTower(_))
    ));
}
