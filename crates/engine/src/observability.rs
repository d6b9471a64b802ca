//! Observability infrastructure for the tower engine
//!
//! Provides:
//! - Prometheus metrics (issues, remediations, healing steps, redirects, detection latency)
//! - Structured JSON logging with tracing

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;
use tracing::{info, warn};

use crate::healing::{
    HealingAction, Issue, IssueType, RemediationRecord, RemediationStatus, Severity, StepResult,
    StepStatus,
};
use crate::traffic::RedirectOutcome;

/// Default histogram buckets for latency measurements (in seconds)
const LATENCY_BUCKETS: &[f64] = &[
    0.0001, 0.0005, 0.001, 0.0025, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0,
];

/// Global metrics instance (registered once)
static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    issues_detected: IntCounterVec,
    remediations: IntCounterVec,
    healing_steps: IntCounterVec,
    connections_redirected: IntCounter,
    detection_cycle_seconds: Histogram,
    detection_errors: IntCounter,
    towers_monitored: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            issues_detected: register_int_counter_vec!(
                "trace_issues_detected_total",
                "Issues detected by type and severity",
                &["issue_type", "severity"]
            )
            .expect("Failed to register issues_detected"),

            remediations: register_int_counter_vec!(
                "trace_remediations_total",
                "Remediation runs by issue type and resulting status",
                &["issue_type", "status"]
            )
            .expect("Failed to register remediations"),

            healing_steps: register_int_counter_vec!(
                "trace_healing_steps_total",
                "Executed playbook steps by action and outcome",
                &["action", "outcome"]
            )
            .expect("Failed to register healing_steps"),

            connections_redirected: register_int_counter!(
                "trace_connections_redirected_total",
                "Connections moved between towers"
            )
            .expect("Failed to register connections_redirected"),

            detection_cycle_seconds: register_histogram!(
                "trace_detection_cycle_seconds",
                "Time spent scanning all towers for issues",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register detection_cycle_seconds"),

            detection_errors: register_int_counter!(
                "trace_detection_errors_total",
                "Detection cycles that failed"
            )
            .expect("Failed to register detection_errors"),

            towers_monitored: register_int_gauge!(
                "trace_towers_monitored",
                "Number of towers in the active topology"
            )
            .expect("Failed to register towers_monitored"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// Lightweight handle to the global metrics instance; clones share the same
/// underlying metrics.
#[derive(Clone)]
pub struct EngineMetrics {
    _private: (),
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &EngineMetricsInner {
        GLOBAL_METRICS.get_or_init(EngineMetricsInner::new)
    }

    pub fn record_issue(&self, issue: &Issue) {
        self.inner()
            .issues_detected
            .with_label_values(&[issue.issue_type.as_str(), &issue.severity.to_string()])
            .inc();
    }

    pub fn record_remediation(&self, issue_type: IssueType, status: RemediationStatus) {
        self.inner()
            .remediations
            .with_label_values(&[issue_type.as_str(), status.as_str()])
            .inc();
    }

    pub fn record_step(&self, action: HealingAction, status: StepStatus) {
        self.inner()
            .healing_steps
            .with_label_values(&[action.as_str(), &status.to_string()])
            .inc();
    }

    pub fn add_connections_redirected(&self, connections: u32) {
        self.inner().connections_redirected.inc_by(connections as u64);
    }

    pub fn observe_detection_cycle(&self, duration_secs: f64) {
        self.inner().detection_cycle_seconds.observe(duration_secs);
    }

    pub fn inc_detection_errors(&self) {
        self.inner().detection_errors.inc();
    }

    pub fn set_towers_monitored(&self, count: i64) {
        self.inner().towers_monitored.set(count);
    }
}

/// Structured logger for engine events
///
/// Every record carries an `event` field so that log pipelines can route on it.
#[derive(Clone)]
pub struct StructuredLogger {
    node_name: String,
}

impl StructuredLogger {
    pub fn new(node_name: impl Into<String>) -> Self {
        Self {
            node_name: node_name.into(),
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn log_issue(&self, issue: &Issue) {
        match issue.severity {
            Severity::Critical => {
                warn!(
                    event = "issue_detected",
                    node = %self.node_name,
                    tower_id = %issue.tower_id,
                    issue_type = %issue.issue_type,
                    severity = %issue.severity,
                    cpu_usage = issue.evidence.cpu_usage,
                    latency_ms = issue.evidence.latency_ms,
                    load_percent = issue.evidence.load_percent,
                    power_kw = issue.evidence.power_consumption,
                    auto_remediation = issue.auto_remediation_available,
                    "Critical issue detected"
                );
            }
            Severity::Warning => {
                info!(
                    event = "issue_detected",
                    node = %self.node_name,
                    tower_id = %issue.tower_id,
                    issue_type = %issue.issue_type,
                    severity = %issue.severity,
                    cpu_usage = issue.evidence.cpu_usage,
                    latency_ms = issue.evidence.latency_ms,
                    load_percent = issue.evidence.load_percent,
                    power_kw = issue.evidence.power_consumption,
                    auto_remediation = issue.auto_remediation_available,
                    "Issue detected"
                );
            }
        }
    }

    pub fn log_remediation_step(&self, record: &RemediationRecord, step: &StepResult) {
        if step.status == StepStatus::Failed {
            warn!(
                event = "remediation_step",
                node = %self.node_name,
                remediation_id = %record.remediation_id,
                tower_id = %record.tower_id,
                step = step.step_index,
                action = %step.action,
                status = %step.status,
                "Remediation step failed, continuing with next step"
            );
        } else {
            info!(
                event = "remediation_step",
                node = %self.node_name,
                remediation_id = %record.remediation_id,
                tower_id = %record.tower_id,
                step = step.step_index,
                action = %step.action,
                status = %step.status,
                approved_by = ?step.approved_by,
                towers_changed = step.changes.len(),
                "Remediation step recorded"
            );
        }
    }

    pub fn log_remediation_finished(&self, record: &RemediationRecord) {
        info!(
            event = "remediation_finished",
            node = %self.node_name,
            remediation_id = %record.remediation_id,
            tower_id = %record.tower_id,
            issue_type = %record.issue_type,
            status = %record.status,
            steps = record.steps_executed.len(),
            "Remediation run finished"
        );
    }

    pub fn log_traffic_redirected(&self, outcome: &RedirectOutcome) {
        info!(
            event = "traffic_redirected",
            node = %self.node_name,
            source = %outcome.source_tower.tower_id,
            target = %outcome.target_tower.tower_id,
            requested = outcome.connections_requested,
            moved = outcome.connections_moved,
            source_after = outcome.source_tower.connections_after,
            target_after = outcome.target_tower.connections_after,
            "Traffic redirected"
        );
    }

    pub fn log_startup(&self, version: &str, towers: usize, auto_heal: bool) {
        info!(
            event = "agent_started",
            node = %self.node_name,
            agent_version = %version,
            towers = towers,
            auto_heal = auto_heal,
            "TRACE agent started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "agent_shutdown",
            node = %self.node_name,
            reason = %reason,
            "TRACE agent shutting down"
        );
    }
}
