//! Traffic analysis and redistribution

mod analyzer;
mod planner;

pub use analyzer::{
    classify, Classification, CongestionAnalyzer, CongestionRisk, LoadStatus, RecommendedAction,
    TrafficAnalysis, CONGESTION_CRITICAL, CONGESTION_MEDIUM, CONGESTION_WARNING,
};
pub use planner::{
    PlannedTransfer, RedirectOutcome, RedistributionPlan, RedistributionPlanner, TargetCandidate,
    TargetKind, TowerLoadChange, WARM_SPARE_SCORE,
};
