//! Self-healing state machine
//!
//! A remediation walks its playbook one step at a time, persisting the
//! record after every step so that an interrupted run can resume from its
//! cursor. At most one remediation is open per `(tower, issue type)`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::Utc;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::actions::{ActionExecutor, ActionReport};
use super::detector::{IssueRule, IssueType};
use super::ledger::{
    RemediationFilter, RemediationLedger, RemediationRecord, RemediationStatus, StepResult,
    StepStatus,
};
use super::playbook::{HealingAction, Playbook};
use crate::error::{EngineError, EngineResult};
use crate::models::TowerState;
use crate::observability::{EngineMetrics, StructuredLogger};
use crate::repository::{StateChange, TowerRepository};

type RemediationKey = (String, IssueType);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// A call is executing steps right now
    Running,
    /// Stopped at a manual step or never started
    Waiting,
    /// Aborted by an infrastructure fault; the next trigger resumes it
    Interrupted,
}

#[derive(Debug, Clone)]
struct Slot {
    remediation_id: String,
    state: SlotState,
    /// Record as first opened, served to duplicates racing the ledger append
    opened: RemediationRecord,
    /// Executed steps the ledger failed to take; ahead of the ledger copy
    unsaved: Option<RemediationRecord>,
}

impl Slot {
    fn running(record: &RemediationRecord) -> Self {
        Self {
            remediation_id: record.remediation_id.clone(),
            state: SlotState::Running,
            opened: record.clone(),
            unsaved: None,
        }
    }
}

/// Releases a claimed slot. If dropped without `finish`, the slot falls back
/// to `on_drop`, which is interrupted unless set otherwise.
struct RunGuard<'a> {
    active: &'a DashMap<RemediationKey, Slot>,
    key: RemediationKey,
    armed: bool,
    on_drop: SlotState,
}

impl<'a> RunGuard<'a> {
    fn new(active: &'a DashMap<RemediationKey, Slot>, key: RemediationKey) -> Self {
        Self {
            active,
            key,
            armed: true,
            on_drop: SlotState::Interrupted,
        }
    }

    fn restoring(mut self, state: SlotState) -> Self {
        self.on_drop = state;
        self
    }

    fn finish(mut self, record: &RemediationRecord) {
        self.armed = false;
        if record.status.is_terminal() {
            self.active.remove(&self.key);
        } else if let Some(mut slot) = self.active.get_mut(&self.key) {
            slot.state = if record.status.needs_approval() {
                SlotState::Waiting
            } else {
                SlotState::Interrupted
            };
        }
    }

    /// Drop the slot entirely; used when no record was ever written
    fn abandon(mut self) {
        self.armed = false;
        self.active.remove(&self.key);
    }
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Some(mut slot) = self.active.get_mut(&self.key) {
                slot.state = self.on_drop;
            }
        }
    }
}

enum Claim {
    Existing(String, RemediationRecord),
    Resume(String),
    Fresh(RemediationRecord),
}

/// Remediation record as returned to callers of `execute`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealingReport {
    #[serde(flatten)]
    pub record: RemediationRecord,
    /// True when an open remediation for the same tower and issue was returned
    pub deduplicated: bool,
}

pub struct SelfHealingEngine {
    repository: Arc<TowerRepository>,
    executor: ActionExecutor,
    ledger: Arc<RemediationLedger>,
    active: DashMap<RemediationKey, Slot>,
    sequence: AtomicU64,
    logger: StructuredLogger,
    metrics: EngineMetrics,
}

impl SelfHealingEngine {
    pub fn new(
        repository: Arc<TowerRepository>,
        executor: ActionExecutor,
        ledger: Arc<RemediationLedger>,
    ) -> Self {
        Self {
            repository,
            executor,
            ledger,
            active: DashMap::new(),
            sequence: AtomicU64::new(0),
            logger: StructuredLogger::new("trace-engine"),
            metrics: EngineMetrics::new(),
        }
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn ledger(&self) -> &Arc<RemediationLedger> {
        &self.ledger
    }

    pub fn executor(&self) -> &ActionExecutor {
        &self.executor
    }

    /// Rebuild the open-remediation table from the ledger after a restart
    pub async fn recover(&self) -> usize {
        let open: Vec<RemediationRecord> = self
            .ledger
            .list(&RemediationFilter::default())
            .await
            .into_iter()
            .filter(|r| !r.status.is_terminal())
            .collect();

        for record in &open {
            let state = if record.status.needs_approval() {
                SlotState::Waiting
            } else {
                SlotState::Interrupted
            };
            self.active.insert(
                (record.tower_id.clone(), record.issue_type),
                Slot {
                    state,
                    ..Slot::running(record)
                },
            );
        }

        if !open.is_empty() {
            info!(open = open.len(), "Recovered open remediations from ledger");
        }
        open.len()
    }

    /// Run the playbook for `issue_type` on `tower_id`
    ///
    /// Returns the open record instead of starting a second run when one
    /// already exists for the pair.
    pub async fn execute(&self, tower_id: &str, issue_type: IssueType) -> EngineResult<HealingReport> {
        self.repository.topology().get(tower_id)?;
        let rule = IssueRule::for_issue(issue_type);
        let key: RemediationKey = (tower_id.to_string(), issue_type);

        let claim = match self.active.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.state == SlotState::Interrupted {
                    slot.state = SlotState::Running;
                    Claim::Resume(slot.remediation_id.clone())
                } else {
                    Claim::Existing(slot.remediation_id.clone(), slot.opened.clone())
                }
            }
            Entry::Vacant(entry) => {
                let status = if rule.auto_remediation_available {
                    RemediationStatus::InProgress
                } else {
                    RemediationStatus::PendingApproval
                };
                let record =
                    RemediationRecord::new(self.next_id(tower_id), tower_id, issue_type, status);
                entry.insert(Slot::running(&record));
                Claim::Fresh(record)
            }
        };

        match claim {
            Claim::Existing(id, opened) => {
                let record = match self.ledger.get(&id).await {
                    Ok(record) => record,
                    Err(EngineError::RemediationNotFound(_)) => opened,
                    Err(e) => return Err(e),
                };
                info!(
                    remediation_id = %id,
                    tower_id = %tower_id,
                    issue_type = %issue_type,
                    status = %record.status,
                    "Remediation already open, not starting another"
                );
                Ok(HealingReport {
                    record,
                    deduplicated: true,
                })
            }
            Claim::Resume(id) => {
                let guard = RunGuard::new(&self.active, key);
                let record = self.latest(self.ledger.get(&id).await?);
                info!(
                    remediation_id = %id,
                    next_step = record.next_step + 1,
                    "Resuming interrupted remediation"
                );
                let record = self.run(record, None).await?;
                guard.finish(&record);
                Ok(HealingReport {
                    record,
                    deduplicated: false,
                })
            }
            Claim::Fresh(record) => {
                let guard = RunGuard::new(&self.active, key);
                if let Err(e) = self.ledger.append(record.clone()).await {
                    guard.abandon();
                    return Err(e);
                }

                let record = if record.status == RemediationStatus::PendingApproval {
                    self.metrics.record_remediation(issue_type, record.status);
                    self.logger.log_remediation_finished(&record);
                    record
                } else {
                    self.run(record, None).await?
                };
                guard.finish(&record);
                Ok(HealingReport {
                    record,
                    deduplicated: false,
                })
            }
        }
    }

    /// Approve a remediation waiting on an operator
    ///
    /// The approval covers the next manual step the run reaches. A pending
    /// remediation starts from its first step.
    pub async fn approve(&self, remediation_id: &str, approver: &str) -> EngineResult<RemediationRecord> {
        let record = self.ledger.get(remediation_id).await?;
        if !record.status.needs_approval() {
            return Err(EngineError::InvalidTransition {
                id: remediation_id.to_string(),
                action: "approved",
                status: record.status,
            });
        }

        let key: RemediationKey = (record.tower_id.clone(), record.issue_type);
        let claimed = match self.active.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let slot = entry.get_mut();
                if slot.remediation_id == remediation_id && slot.state == SlotState::Waiting {
                    slot.state = SlotState::Running;
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(entry) => {
                entry.insert(Slot::running(&record));
                true
            }
        };
        if !claimed {
            return Err(EngineError::InvalidTransition {
                id: remediation_id.to_string(),
                action: "approved",
                status: RemediationStatus::InProgress,
            });
        }

        let guard = RunGuard::new(&self.active, key);
        // Another approval may have run between the first read and the claim
        let record = self.ledger.get(remediation_id).await?;
        if !record.status.needs_approval() {
            let status = record.status;
            guard.finish(&record);
            return Err(EngineError::InvalidTransition {
                id: remediation_id.to_string(),
                action: "approved",
                status,
            });
        }

        info!(
            remediation_id = %remediation_id,
            approver = %approver,
            status = %record.status,
            "Remediation approved"
        );
        let record = self.run(record, Some(approver.to_string())).await?;
        guard.finish(&record);
        Ok(record)
    }

    /// Undo every state change a remediation made
    pub async fn rollback(&self, remediation_id: &str, reason: &str) -> EngineResult<RemediationRecord> {
        let record = self.ledger.get(remediation_id).await?;
        if record.status == RemediationStatus::RolledBack {
            return Err(EngineError::InvalidTransition {
                id: remediation_id.to_string(),
                action: "rolled back",
                status: record.status,
            });
        }
        if !Playbook::for_issue(record.issue_type).rollback_enabled {
            return Err(EngineError::PolicyViolation(record.issue_type));
        }

        let key: RemediationKey = (record.tower_id.clone(), record.issue_type);
        let previous = match self.active.entry(key.clone()) {
            Entry::Occupied(mut entry) if entry.get().remediation_id == remediation_id => {
                let previous = entry.get().state;
                if previous == SlotState::Running {
                    return Err(EngineError::InvalidTransition {
                        id: remediation_id.to_string(),
                        action: "rolled back",
                        status: RemediationStatus::InProgress,
                    });
                }
                entry.get_mut().state = SlotState::Running;
                Some(previous)
            }
            _ => None,
        };
        let guard = previous.map(|state| RunGuard::new(&self.active, key).restoring(state));

        // Steps that ran but never reached the ledger are recorded before undoing them
        let latest = self.latest(record.clone());
        let record = if latest.steps_executed.len() > record.steps_executed.len() {
            self.ledger.update(&latest).await?;
            latest
        } else {
            record
        };

        let (towers_restored, changes) = self.restore_touched_towers(&record).await?;

        let marker = StepResult {
            step_index: 0,
            action: HealingAction::Rollback,
            auto: true,
            status: StepStatus::RolledBack,
            result: Some(ActionReport::RolledBack {
                reason: reason.to_string(),
                towers_restored,
            }),
            changes,
            approved_by: None,
            executed_at: Utc::now(),
        };
        let record = self
            .ledger
            .append_rollback(remediation_id, marker, reason)
            .await?;

        if let Some(guard) = guard {
            guard.finish(&record);
        }
        self.metrics
            .record_remediation(record.issue_type, RemediationStatus::RolledBack);
        warn!(
            remediation_id = %remediation_id,
            tower_id = %record.tower_id,
            reason = %reason,
            "Remediation rolled back"
        );
        Ok(record)
    }

    async fn restore_touched_towers(
        &self,
        record: &RemediationRecord,
    ) -> EngineResult<(Vec<String>, Vec<StateChange>)> {
        let mut touched: Vec<String> = Vec::new();
        let mut earliest: HashMap<String, TowerState> = HashMap::new();
        let mut connection_delta: HashMap<String, i64> = HashMap::new();

        for change in record.changes() {
            if !earliest.contains_key(&change.tower_id) {
                touched.push(change.tower_id.clone());
                earliest.insert(change.tower_id.clone(), change.before.clone());
            }
            *connection_delta.entry(change.tower_id.clone()).or_default() +=
                change.after.active_connections as i64 - change.before.active_connections as i64;
        }

        if touched.is_empty() {
            return Ok((touched, Vec::new()));
        }

        let ids: Vec<&str> = touched.iter().map(String::as_str).collect();
        let changes = self
            .repository
            .modify_many(&ids, |states| {
                for state in states.iter_mut() {
                    let (Some(original), Some(delta)) = (
                        earliest.get(&state.tower_id),
                        connection_delta.get(&state.tower_id),
                    ) else {
                        continue;
                    };
                    // Connections are reversed by delta so unrelated traffic survives
                    let connections = (state.active_connections as i64 - delta).max(0);
                    state.active_connections = u32::try_from(connections).unwrap_or(u32::MAX);
                    state.active_capacity_units = original.active_capacity_units;
                    state.operating_mode = original.operating_mode;
                    state.power_consumption = original.power_consumption;
                    state.cpu_usage = original.cpu_usage;
                    state.latency_ms = original.latency_ms;
                    state.status = original.status;
                }
                Ok(())
            })
            .await?;

        Ok((touched, changes))
    }

    async fn run(
        &self,
        mut record: RemediationRecord,
        mut approval: Option<String>,
    ) -> EngineResult<RemediationRecord> {
        let playbook = Playbook::for_issue(record.issue_type);
        let rule = IssueRule::for_issue(record.issue_type);
        let tower = self.repository.topology().get(&record.tower_id)?.clone();

        if record.status != RemediationStatus::InProgress {
            record.status = RemediationStatus::InProgress;
            self.ledger.update(&record).await?;
        }

        // A resumed run whose last step already cleared the issue only needs sealing
        if approval.is_none() && !record.steps_executed.is_empty() {
            let state = self.repository.get(&record.tower_id).await?;
            if !rule.holds(&tower, &state) {
                return self.finish(record, RemediationStatus::Resolved).await;
            }
        }

        while let Some(step) = playbook.step(record.next_step) {
            let approver = if step.auto {
                None
            } else {
                match approval.take() {
                    Some(approver) => Some(approver),
                    None => {
                        let gate = StepResult {
                            step_index: step.step,
                            action: step.action,
                            auto: false,
                            status: StepStatus::RequiresHumanApproval,
                            result: Some(ActionReport::AwaitingApproval {
                                message: "Awaiting operator approval".to_string(),
                            }),
                            changes: Vec::new(),
                            approved_by: None,
                            executed_at: Utc::now(),
                        };
                        self.logger.log_remediation_step(&record, &gate);
                        record.steps_executed.push(gate);
                        record.status = RemediationStatus::AwaitingApproval;
                        self.ledger.update(&record).await?;
                        self.metrics
                            .record_remediation(record.issue_type, record.status);
                        self.logger.log_remediation_finished(&record);
                        return Ok(record);
                    }
                }
            };

            let outcome = self
                .executor
                .execute(&record.tower_id, step.action, approver.as_deref())
                .await?;

            if let ActionReport::Redirected { redirects, .. } = &outcome.report {
                for redirect in redirects {
                    self.metrics
                        .add_connections_redirected(redirect.connections_moved);
                    self.logger.log_traffic_redirected(redirect);
                }
            }

            let result = StepResult {
                step_index: step.step,
                action: step.action,
                auto: step.auto,
                status: outcome.status,
                result: Some(outcome.report),
                changes: outcome.changes,
                approved_by: approver,
                executed_at: Utc::now(),
            };
            self.metrics.record_step(step.action, result.status);
            self.logger.log_remediation_step(&record, &result);
            record.steps_executed.push(result);
            record.next_step += 1;
            if let Err(e) = self.ledger.update(&record).await {
                self.stash_unsaved(&record);
                return Err(e);
            }

            let state = self.repository.get(&record.tower_id).await?;
            if !rule.holds(&tower, &state) {
                return self.finish(record, RemediationStatus::Resolved).await;
            }
        }

        self.finish(record, RemediationStatus::Completed).await
    }

    async fn finish(
        &self,
        mut record: RemediationRecord,
        status: RemediationStatus,
    ) -> EngineResult<RemediationRecord> {
        record.status = status;
        record.completed_at = Some(Utc::now());
        self.ledger.update(&record).await?;
        self.metrics.record_remediation(record.issue_type, status);
        self.logger.log_remediation_finished(&record);
        Ok(record)
    }

    /// Keep an executed step the ledger refused so a resume does not repeat it
    fn stash_unsaved(&self, record: &RemediationRecord) {
        let key: RemediationKey = (record.tower_id.clone(), record.issue_type);
        if let Some(mut slot) = self.active.get_mut(&key) {
            if slot.remediation_id == record.remediation_id {
                warn!(
                    remediation_id = %record.remediation_id,
                    steps = record.steps_executed.len(),
                    "Ledger rejected step update; keeping it for resume"
                );
                slot.unsaved = Some(record.clone());
            }
        }
    }

    /// `stored`, or the unsaved copy of it if that has more steps
    fn latest(&self, stored: RemediationRecord) -> RemediationRecord {
        let key: RemediationKey = (stored.tower_id.clone(), stored.issue_type);
        self.active
            .get(&key)
            .and_then(|slot| {
                slot.unsaved
                    .as_ref()
                    .filter(|unsaved| {
                        unsaved.remediation_id == stored.remediation_id
                            && unsaved.steps_executed.len() > stored.steps_executed.len()
                    })
                    .cloned()
            })
            .unwrap_or(stored)
    }

    fn next_id(&self, tower_id: &str) -> String {
        let seq = self.sequence.fetch_add(1, Ordering::Relaxed) % 10_000 + 1;
        format!(
            "HEAL-{}-{}-{:04}",
            Utc::now().format("%Y%m%d%H%M%S"),
            tower_id,
            seq
        )
    }
}
