//! Remediation ledger
//!
//! Records are append-only. While a remediation is open its record may be
//! replaced by a version with more steps; once it is resolved, completed or
//! rolled back the record is sealed and only a rollback marker may still be
//! appended.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, info};

use super::actions::ActionReport;
use super::detector::IssueType;
use super::playbook::HealingAction;
use crate::error::{EngineError, EngineResult};
use crate::policy::DEFAULT_PERSISTENCE_TIMEOUT;
use crate::repository::StateChange;
use crate::snapshot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationStatus {
    PendingApproval,
    InProgress,
    AwaitingApproval,
    Resolved,
    Completed,
    RolledBack,
}

impl RemediationStatus {
    /// Sealed states accept no further steps
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RemediationStatus::Resolved | RemediationStatus::Completed | RemediationStatus::RolledBack
        )
    }

    pub fn needs_approval(&self) -> bool {
        matches!(
            self,
            RemediationStatus::PendingApproval | RemediationStatus::AwaitingApproval
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RemediationStatus::PendingApproval => "pending_approval",
            RemediationStatus::InProgress => "in_progress",
            RemediationStatus::AwaitingApproval => "awaiting_approval",
            RemediationStatus::Resolved => "resolved",
            RemediationStatus::Completed => "completed",
            RemediationStatus::RolledBack => "rolled_back",
        }
    }
}

impl std::fmt::Display for RemediationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for RemediationStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            RemediationStatus::PendingApproval,
            RemediationStatus::InProgress,
            RemediationStatus::AwaitingApproval,
            RemediationStatus::Resolved,
            RemediationStatus::Completed,
            RemediationStatus::RolledBack,
        ]
        .into_iter()
        .find(|status| status.as_str() == s)
        .ok_or_else(|| EngineError::InvalidRequest(format!("unknown remediation status: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Failed,
    RequiresHumanApproval,
    RolledBack,
}

impl std::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepStatus::Completed => write!(f, "completed"),
            StepStatus::Failed => write!(f, "failed"),
            StepStatus::RequiresHumanApproval => write!(f, "requires_human_approval"),
            StepStatus::RolledBack => write!(f, "rolled_back"),
        }
    }
}

/// One entry in a remediation's step log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    /// 1-based playbook position; 0 for the rollback marker
    pub step_index: u32,
    pub action: HealingAction,
    pub auto: bool,
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<ActionReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub changes: Vec<StateChange>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved_by: Option<String>,
    pub executed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationRecord {
    pub remediation_id: String,
    pub tower_id: String,
    pub issue_type: IssueType,
    pub status: RemediationStatus,
    pub steps_executed: Vec<StepResult>,
    /// Index of the next playbook step to run
    pub next_step: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_reason: Option<String>,
}

impl RemediationRecord {
    pub fn new(
        remediation_id: impl Into<String>,
        tower_id: impl Into<String>,
        issue_type: IssueType,
        status: RemediationStatus,
    ) -> Self {
        Self {
            remediation_id: remediation_id.into(),
            tower_id: tower_id.into(),
            issue_type,
            status,
            steps_executed: Vec::new(),
            next_step: 0,
            started_at: Utc::now(),
            completed_at: None,
            rollback_reason: None,
        }
    }

    /// Every state change recorded by this remediation, in execution order
    pub fn changes(&self) -> impl Iterator<Item = &StateChange> {
        self.steps_executed.iter().flat_map(|s| s.changes.iter())
    }
}

/// Filter for `RemediationLedger::list`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemediationFilter {
    #[serde(default)]
    pub tower_id: Option<String>,
    #[serde(default)]
    pub issue_type: Option<IssueType>,
    #[serde(default)]
    pub status: Option<RemediationStatus>,
}

impl RemediationFilter {
    fn matches(&self, record: &RemediationRecord) -> bool {
        self.tower_id.as_ref().map_or(true, |t| &record.tower_id == t)
            && self.issue_type.map_or(true, |t| record.issue_type == t)
            && self.status.map_or(true, |s| record.status == s)
    }
}

/// Audit log of remediations, optionally persisted as a JSON snapshot
///
/// A write may time out only while waiting for the log; once started it
/// completes even if the caller goes away.
pub struct RemediationLedger {
    records: Arc<RwLock<Vec<RemediationRecord>>>,
    path: Option<PathBuf>,
    timeout: Duration,
}

impl Default for RemediationLedger {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl RemediationLedger {
    pub fn in_memory() -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            path: None,
            timeout: DEFAULT_PERSISTENCE_TIMEOUT,
        }
    }

    /// Open a persisted ledger, loading an existing snapshot if present
    pub fn open(path: impl Into<PathBuf>) -> EngineResult<Self> {
        let path = path.into();
        let records: Vec<RemediationRecord> = snapshot::load_json(&path)?.unwrap_or_default();
        info!(path = %path.display(), records = records.len(), "Opened remediation ledger");
        Ok(Self {
            records: Arc::new(RwLock::new(records)),
            path: Some(path),
            timeout: DEFAULT_PERSISTENCE_TIMEOUT,
        })
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn append(&self, record: RemediationRecord) -> EngineResult<()> {
        let records = self.lock().await?;
        if records
            .iter()
            .any(|r| r.remediation_id == record.remediation_id)
        {
            return Err(EngineError::InvalidRequest(format!(
                "remediation {} already recorded",
                record.remediation_id
            )));
        }

        let mut next = records.clone();
        next.push(record);
        self.persist(records, next).await
    }

    pub async fn get(&self, remediation_id: &str) -> EngineResult<RemediationRecord> {
        self.records
            .read()
            .await
            .iter()
            .find(|r| r.remediation_id == remediation_id)
            .cloned()
            .ok_or_else(|| EngineError::RemediationNotFound(remediation_id.to_string()))
    }

    /// Replace an open record with a newer version of itself
    pub async fn update(&self, record: &RemediationRecord) -> EngineResult<()> {
        let records = self.lock().await?;
        let index = Self::position(&records, &record.remediation_id)?;

        let current = &records[index];
        if current.status.is_terminal() {
            return Err(EngineError::InvalidTransition {
                id: record.remediation_id.clone(),
                action: "updated",
                status: current.status,
            });
        }
        if record.steps_executed.len() < current.steps_executed.len()
            || record.steps_executed[..current.steps_executed.len()] != current.steps_executed[..]
        {
            return Err(EngineError::InvalidRequest(format!(
                "steps of remediation {} can only be appended",
                record.remediation_id
            )));
        }

        let mut next = records.clone();
        next[index] = record.clone();
        self.persist(records, next).await?;
        debug!(
            remediation_id = %record.remediation_id,
            status = %record.status,
            steps = record.steps_executed.len(),
            "Remediation record updated"
        );
        Ok(())
    }

    /// Append a rollback marker and mark the record rolled back
    pub async fn append_rollback(
        &self,
        remediation_id: &str,
        marker: StepResult,
        reason: &str,
    ) -> EngineResult<RemediationRecord> {
        let records = self.lock().await?;
        let index = Self::position(&records, remediation_id)?;

        if records[index].status == RemediationStatus::RolledBack {
            return Err(EngineError::InvalidTransition {
                id: remediation_id.to_string(),
                action: "rolled back",
                status: RemediationStatus::RolledBack,
            });
        }

        let mut next = records.clone();
        let record = &mut next[index];
        record.steps_executed.push(marker);
        record.status = RemediationStatus::RolledBack;
        record.rollback_reason = Some(reason.to_string());
        record.completed_at = Some(Utc::now());
        let updated = record.clone();

        self.persist(records, next).await?;
        Ok(updated)
    }

    /// Records matching `filter`, oldest first
    pub async fn list(&self, filter: &RemediationFilter) -> Vec<RemediationRecord> {
        let mut matching: Vec<RemediationRecord> = self
            .records
            .read()
            .await
            .iter()
            .filter(|r| filter.matches(r))
            .cloned()
            .collect();
        matching.sort_by_key(|r| r.started_at);
        matching
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    fn position(records: &[RemediationRecord], remediation_id: &str) -> EngineResult<usize> {
        records
            .iter()
            .position(|r| r.remediation_id == remediation_id)
            .ok_or_else(|| EngineError::RemediationNotFound(remediation_id.to_string()))
    }

    async fn lock(&self) -> EngineResult<OwnedRwLockWriteGuard<Vec<RemediationRecord>>> {
        snapshot::lock_for_commit(&self.records, self.timeout).await
    }

    /// Write `next` to the snapshot file, then make it the live log
    async fn persist(
        &self,
        records: OwnedRwLockWriteGuard<Vec<RemediationRecord>>,
        next: Vec<RemediationRecord>,
    ) -> EngineResult<()> {
        let payload = self.path.as_ref().map(|_| next.clone());
        snapshot::save_and_publish(self.path.clone(), payload, records, next).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> RemediationRecord {
        RemediationRecord::new(id, "tower-001", IssueType::HighLatency, RemediationStatus::InProgress)
    }

    fn step(index: u32, status: StepStatus) -> StepResult {
        StepResult {
            step_index: index,
            action: HealingAction::CheckNetworkPath,
            auto: true,
            status,
            result: None,
            changes: Vec::new(),
            approved_by: None,
            executed_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_get_missing_record() {
        let ledger = RemediationLedger::in_memory();
        assert!(matches!(
            ledger.get("HEAL-missing").await,
            Err(EngineError::RemediationNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_ledger_times_out_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");
        let ledger = RemediationLedger::open(&path)
            .unwrap()
            .with_timeout(Duration::from_millis(20));

        let reader = ledger.records.read().await;
        let err = ledger.append(record("HEAL-1")).await.unwrap_err();
        assert!(err.is_retryable());
        drop(reader);

        assert!(ledger.is_empty().await);
        assert!(!path.exists());

        ledger.append(record("HEAL-1")).await.unwrap();
        let reopened = RemediationLedger::open(&path).unwrap();
        assert_eq!(reopened.len().await, 1);
    }

    #[tokio::test]
    async fn test_duplicate_append_rejected() {
        let ledger = RemediationLedger::in_memory();
        ledger.append(record("HEAL-1")).await.unwrap();
        assert!(ledger.append(record("HEAL-1")).await.is_err());
        assert_eq!(ledger.len().await, 1);
    }

    #[tokio::test]
    async fn test_terminal_records_are_sealed() {
        let ledger = RemediationLedger::in_memory();
        let mut rec = record("HEAL-1");
        ledger.append(rec.clone()).await.unwrap();

        rec.steps_executed.push(step(1, StepStatus::Completed));
        rec.status = RemediationStatus::Resolved;
        ledger.update(&rec).await.unwrap();

        rec.steps_executed.push(step(2, StepStatus::Completed));
        assert!(matches!(
            ledger.update(&rec).await,
            Err(EngineError::InvalidTransition { .. })
        ));

        let marker = StepResult {
            status: StepStatus::RolledBack,
            action: HealingAction::Rollback,
            ..step(0, StepStatus::RolledBack)
        };
        let rolled = ledger
            .append_rollback("HEAL-1", marker.clone(), "operator request")
            .await
            .unwrap();
        assert_eq!(rolled.status, RemediationStatus::RolledBack);
        assert_eq!(rolled.steps_executed.len(), 2);
        assert!(ledger
            .append_rollback("HEAL-1", marker, "again")
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_history_cannot_be_rewritten() {
        let ledger = RemediationLedger::in_memory();
        let mut rec = record("HEAL-1");
        rec.steps_executed.push(step(1, StepStatus::Completed));
        ledger.append(rec.clone()).await.unwrap();

        rec.steps_executed[0].status = StepStatus::Failed;
        assert!(matches!(
            ledger.update(&rec).await,
            Err(EngineError::InvalidRequest(_))
        ));
    }

    #[tokio::test]
    async fn test_list_filters() {
        let ledger = RemediationLedger::in_memory();
        ledger.append(record("HEAL-1")).await.unwrap();
        let mut other = record("HEAL-2");
        other.tower_id = "tower-002".to_string();
        other.issue_type = IssueType::Congestion;
        ledger.append(other).await.unwrap();

        let all = ledger.list(&RemediationFilter::default()).await;
        assert_eq!(all.len(), 2);

        let congestion = ledger
            .list(&RemediationFilter {
                issue_type: Some(IssueType::Congestion),
                ..Default::default()
            })
            .await;
        assert_eq!(congestion.len(), 1);
        assert_eq!(congestion[0].remediation_id, "HEAL-2");
    }

    #[tokio::test]
    async fn test_persisted_ledger_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.json");

        {
            let ledger = RemediationLedger::open(&path).unwrap();
            let mut rec = record("HEAL-7");
            rec.steps_executed.push(step(1, StepStatus::Completed));
            ledger.append(rec).await.unwrap();
        }

        let reopened = RemediationLedger::open(&path).unwrap();
        let rec = reopened.get("HEAL-7").await.unwrap();
        assert_eq!(rec.steps_executed.len(), 1);
        assert_eq!(rec.status, RemediationStatus::InProgress);
    }

    #[test]
    fn test_status_parse() {
        assert_eq!(
            "awaiting_approval".parse::<RemediationStatus>().unwrap(),
            RemediationStatus::AwaitingApproval
        );
        assert!("paused".parse::<RemediationStatus>().is_err());
        assert!(RemediationStatus::Completed.is_terminal());
        assert!(!RemediationStatus::AwaitingApproval.is_terminal());
    }
}
