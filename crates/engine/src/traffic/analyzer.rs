//! Congestion analysis
//!
//! Classifies a tower's load ratio. The breakpoints are business rules and
//! are compared against the exact ratio, never a rounded percentage.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::EngineResult;
use crate::models::round1;
use crate::repository::TowerRepository;

/// Load ratio at or above which a tower is critical
pub const CONGESTION_CRITICAL: f64 = 0.90;
/// Load ratio at or above which a tower is in warning
pub const CONGESTION_WARNING: f64 = 0.75;
/// Load ratio at or above which congestion risk is medium
pub const CONGESTION_MEDIUM: f64 = 0.50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStatus {
    Normal,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CongestionRisk {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for CongestionRisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CongestionRisk::Low => write!(f, "low"),
            CongestionRisk::Medium => write!(f, "medium"),
            CongestionRisk::High => write!(f, "high"),
            CongestionRisk::Critical => write!(f, "critical"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecommendedAction {
    ImmediateTrafficRedirect,
    PreemptiveLoadBalance,
}

/// Classification of a single load ratio
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Classification {
    pub status: LoadStatus,
    pub risk: CongestionRisk,
    pub recommended_action: Option<RecommendedAction>,
}

/// Classify a load ratio
pub fn classify(load_ratio: f64) -> Classification {
    if load_ratio >= CONGESTION_CRITICAL {
        Classification {
            status: LoadStatus::Critical,
            risk: CongestionRisk::Critical,
            recommended_action: Some(RecommendedAction::ImmediateTrafficRedirect),
        }
    } else if load_ratio >= CONGESTION_WARNING {
        Classification {
            status: LoadStatus::Warning,
            risk: CongestionRisk::High,
            recommended_action: Some(RecommendedAction::PreemptiveLoadBalance),
        }
    } else if load_ratio >= CONGESTION_MEDIUM {
        Classification {
            status: LoadStatus::Normal,
            risk: CongestionRisk::Medium,
            recommended_action: None,
        }
    } else {
        Classification {
            status: LoadStatus::Normal,
            risk: CongestionRisk::Low,
            recommended_action: None,
        }
    }
}

/// Result of analyzing one tower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficAnalysis {
    pub tower_id: String,
    pub current_connections: u32,
    pub max_capacity: u32,
    /// Exact `active_connections / max_capacity`
    pub load_ratio: f64,
    /// Load in percent, one decimal place
    pub load_percent: f64,
    pub status: LoadStatus,
    pub congestion_risk: CongestionRisk,
    pub action_required: bool,
    pub recommended_action: Option<RecommendedAction>,
}

/// Congestion analyzer over the live repository
#[derive(Clone)]
pub struct CongestionAnalyzer {
    repository: Arc<TowerRepository>,
}

impl CongestionAnalyzer {
    pub fn new(repository: Arc<TowerRepository>) -> Self {
        Self { repository }
    }

    pub async fn analyze(&self, tower_id: &str) -> EngineResult<TrafficAnalysis> {
        let tower = self.repository.topology().get(tower_id)?;
        let state = self.repository.get(tower_id).await?;

        let load_ratio = state.load_ratio(tower.max_capacity);
        let class = classify(load_ratio);

        Ok(TrafficAnalysis {
            tower_id: tower_id.to_string(),
            current_connections: state.active_connections,
            max_capacity: tower.max_capacity,
            load_ratio,
            load_percent: round1(load_ratio * 100.0),
            status: class.status,
            congestion_risk: class.risk,
            action_required: class.recommended_action.is_some(),
            recommended_action: class.recommended_action,
        })
    }
}
