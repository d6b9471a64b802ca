//! Tower network engine for TRACE
//!
//! This crate provides:
//! - Persistent per-tower state with atomic read-modify-write
//! - Congestion analysis and topology-aware traffic redistribution
//! - Rule-based issue detection
//! - Playbook-driven self-healing with an append-only remediation ledger
//! - Periodic detection, health checks and observability

pub mod error;
pub mod healing;
pub mod health;
pub mod models;
pub mod network;
pub mod observability;
pub mod policy;
pub mod repository;
pub mod scheduler;
pub mod snapshot;
pub mod topology;
pub mod traffic;

pub use error::{EngineError, EngineResult};
pub use healing::{
    HealingAction, HealingReport, Issue, IssueType, RemediationFilter, RemediationLedger,
    RemediationRecord, RemediationStatus, Severity, SpareActivation, StepResult, StepStatus,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use network::{
    CongestionSimulation, EnergyOptimization, EnergyRecommendation, EnergyReport,
    NetworkHealthSummary, PowerModeChange, TowerNetwork, UnitsChange,
};
pub use observability::{EngineMetrics, StructuredLogger};
pub use policy::{BasisPoints, EngineConfig, HealingPolicy, RedistributionPolicy};
pub use repository::{InMemoryStore, JsonFileStore, SharedStore, StateStore, TowerRepository};
pub use scheduler::{CycleReport, DetectionScheduler, SchedulerConfig};
pub use topology::Topology;
pub use traffic::{RedirectOutcome, RedistributionPlan, TrafficAnalysis};
