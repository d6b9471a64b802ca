//! Issue detection and playbook-driven self-healing
//!
//! The detector turns tower readings into typed issues. The healing engine
//! runs the playbook registered for an issue type, re-checking the issue's
//! rule after every automatic step, and records each run in the ledger.

mod actions;
mod detector;
mod engine;
mod faults;
mod ledger;
mod playbook;

#[cfg(test)]
mod tests;

pub use actions::{ActionExecutor, ActionOutcome, ActionReport, SpareActivation, TelemetrySnapshot};
pub(crate) use actions::rescale_units;
pub use detector::{evaluate, rules, Issue, IssueDetector, IssueEvidence, IssueRule, IssueType, Severity};
pub use engine::{HealingReport, SelfHealingEngine};
pub use faults::{FaultInjector, NoFaults, ScriptedFaults};
pub use ledger::{
    RemediationFilter, RemediationLedger, RemediationRecord, RemediationStatus, StepResult,
    StepStatus,
};
pub use playbook::{HealingAction, Playbook, PlaybookStep};
