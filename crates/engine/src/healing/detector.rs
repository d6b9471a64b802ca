//! Rule-based issue detection
//!
//! Each issue type has exactly one rule. A rule's condition is also what the
//! healing engine re-checks after every step to decide whether an issue has
//! cleared.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};
use crate::models::{round1, Tower, TowerState, TowerStatus};
use crate::repository::TowerRepository;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IssueType {
    HighCpu,
    HighLatency,
    Congestion,
    HighPower,
    TowerDown,
}

impl IssueType {
    pub const ALL: [IssueType; 5] = [
        IssueType::HighCpu,
        IssueType::HighLatency,
        IssueType::Congestion,
        IssueType::HighPower,
        IssueType::TowerDown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            IssueType::HighCpu => "HIGH_CPU",
            IssueType::HighLatency => "HIGH_LATENCY",
            IssueType::Congestion => "CONGESTION",
            IssueType::HighPower => "HIGH_POWER",
            IssueType::TowerDown => "TOWER_DOWN",
        }
    }
}

impl std::fmt::Display for IssueType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IssueType {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace('-', "_");
        IssueType::ALL
            .into_iter()
            .find(|t| t.as_str() == normalized)
            .ok_or_else(|| EngineError::InvalidIssueType(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Warning,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Warning => write!(f, "warning"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// Readings that triggered an issue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IssueEvidence {
    pub cpu_usage: f64,
    pub latency_ms: f64,
    pub active_connections: u32,
    /// Load in percent of the tower's own capacity
    pub load_percent: f64,
    pub power_consumption: f64,
    pub status: TowerStatus,
}

impl IssueEvidence {
    fn capture(tower: &Tower, state: &TowerState) -> Self {
        Self {
            cpu_usage: state.cpu_usage,
            latency_ms: state.latency_ms,
            active_connections: state.active_connections,
            load_percent: round1(state.load_ratio(tower.max_capacity) * 100.0),
            power_consumption: state.power_consumption,
            status: state.status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub tower_id: String,
    pub issue_type: IssueType,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub evidence: IssueEvidence,
    pub possible_root_causes: Vec<String>,
    pub auto_remediation_available: bool,
}

type Predicate = fn(&Tower, &TowerState) -> bool;

/// Detection rule for one issue type
pub struct IssueRule {
    pub issue_type: IssueType,
    condition: Predicate,
    is_critical: Predicate,
    pub root_causes: &'static [&'static str],
    pub auto_remediation_available: bool,
}

impl IssueRule {
    /// Whether the issue is present on `state`
    pub fn holds(&self, tower: &Tower, state: &TowerState) -> bool {
        (self.condition)(tower, state)
    }

    pub fn severity(&self, tower: &Tower, state: &TowerState) -> Severity {
        if (self.is_critical)(tower, state) {
            Severity::Critical
        } else {
            Severity::Warning
        }
    }

    /// Rule for `issue_type`
    pub fn for_issue(issue_type: IssueType) -> &'static IssueRule {
        match issue_type {
            IssueType::HighCpu => &RULES[0],
            IssueType::HighLatency => &RULES[1],
            IssueType::Congestion => &RULES[2],
            IssueType::HighPower => &RULES[3],
            IssueType::TowerDown => &RULES[4],
        }
    }
}

static RULES: [IssueRule; 5] = [
    IssueRule {
        issue_type: IssueType::HighCpu,
        condition: |_, s| s.cpu_usage > 80.0,
        is_critical: |_, s| s.cpu_usage > 95.0,
        root_causes: &["process_leak", "traffic_spike", "malware", "config_error"],
        auto_remediation_available: true,
    },
    IssueRule {
        issue_type: IssueType::HighLatency,
        condition: |_, s| s.latency_ms > 100.0,
        is_critical: |_, s| s.latency_ms > 200.0,
        root_causes: &["network_congestion", "hardware_degradation", "routing_issue"],
        auto_remediation_available: true,
    },
    IssueRule {
        issue_type: IssueType::Congestion,
        condition: |t, s| s.load_ratio(t.max_capacity) > 0.85,
        is_critical: |t, s| s.load_ratio(t.max_capacity) > 0.95,
        root_causes: &["traffic_spike", "neighbor_failure", "event_surge"],
        auto_remediation_available: true,
    },
    IssueRule {
        issue_type: IssueType::HighPower,
        condition: |_, s| s.power_consumption > 8.0,
        is_critical: |_, _| false,
        root_causes: &["inefficient_config", "all_trx_active", "cooling_issue"],
        auto_remediation_available: true,
    },
    IssueRule {
        issue_type: IssueType::TowerDown,
        condition: |_, s| s.status == TowerStatus::Down,
        is_critical: |_, _| true,
        root_causes: &["hardware_failure", "power_outage", "network_disconnect"],
        auto_remediation_available: false,
    },
];

/// Every rule, in evaluation order
pub fn rules() -> &'static [IssueRule] {
    &RULES
}

/// Evaluate every rule against one tower
pub fn evaluate(tower: &Tower, state: &TowerState) -> Vec<Issue> {
    let detected_at = Utc::now();
    RULES
        .iter()
        .filter(|rule| rule.holds(tower, state))
        .map(|rule| Issue {
            tower_id: tower.tower_id.clone(),
            issue_type: rule.issue_type,
            severity: rule.severity(tower, state),
            detected_at,
            evidence: IssueEvidence::capture(tower, state),
            possible_root_causes: rule.root_causes.iter().map(|c| c.to_string()).collect(),
            auto_remediation_available: rule.auto_remediation_available,
        })
        .collect()
}

#[derive(Clone)]
pub struct IssueDetector {
    repository: Arc<TowerRepository>,
}

impl IssueDetector {
    pub fn new(repository: Arc<TowerRepository>) -> Self {
        Self { repository }
    }

    /// Detect issues on one tower, or on every topology tower when `None`
    pub async fn detect(&self, tower_id: Option<&str>) -> EngineResult<Vec<Issue>> {
        let topology = self.repository.topology();
        let towers: Vec<&Tower> = match tower_id {
            Some(id) => vec![topology.get(id)?],
            None => topology.towers().iter().collect(),
        };

        let mut issues = Vec::new();
        for tower in towers {
            let state = self.repository.get(&tower.tower_id).await?;
            issues.extend(evaluate(tower, &state));
        }
        Ok(issues)
    }

    /// Whether `issue_type` currently holds on `tower_id`
    pub async fn is_present(&self, tower_id: &str, issue_type: IssueType) -> EngineResult<bool> {
        let tower = self.repository.topology().get(tower_id)?;
        let state = self.repository.get(tower_id).await?;
        Ok(IssueRule::for_issue(issue_type).holds(tower, &state))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::StatePatch;
    use crate::topology::Topology;

    fn state_with(patch: StatePatch) -> (Tower, TowerState) {
        let tower = Tower::new("tower-001", 500, 8);
        let mut state = tower.default_state();
        state.apply(&patch);
        (tower, state)
    }

    #[test]
    fn test_only_high_cpu_fires() {
        let (tower, state) = state_with(StatePatch {
            cpu_usage: Some(96.0),
            latency_ms: Some(50.0),
            active_connections: Some(100),
            power_consumption: Some(3.0),
            ..Default::default()
        });

        let issues = evaluate(&tower, &state);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::HighCpu);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert!(issues[0].auto_remediation_available);
    }

    #[test]
    fn test_multiple_simultaneous_issues() {
        let (tower, state) = state_with(StatePatch {
            cpu_usage: Some(85.0),
            latency_ms: Some(250.0),
            active_connections: Some(440),
            ..Default::default()
        });

        let types: Vec<IssueType> = evaluate(&tower, &state).iter().map(|i| i.issue_type).collect();
        assert_eq!(
            types,
            vec![IssueType::HighCpu, IssueType::HighLatency, IssueType::Congestion]
        );
    }

    #[test]
    fn test_congestion_uses_tower_capacity() {
        // 280 of 300 is 93%, which would be only 56% of a 500-connection tower
        let tower = Tower::new("tower-005", 300, 4);
        let mut state = tower.default_state();
        state.active_connections = 280;

        let issues = evaluate(&tower, &state);
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].issue_type, IssueType::Congestion);
        assert_eq!(issues[0].severity, Severity::Warning);
        assert_eq!(issues[0].evidence.load_percent, 93.3);
    }

    #[test]
    fn test_high_power_is_never_critical() {
        let (tower, state) = state_with(StatePatch {
            power_consumption: Some(14.0),
            ..Default::default()
        });
        let issues = evaluate(&tower, &state);
        assert_eq!(issues[0].issue_type, IssueType::HighPower);
        assert_eq!(issues[0].severity, Severity::Warning);
    }

    #[test]
    fn test_tower_down_requires_operator() {
        let (tower, state) = state_with(StatePatch {
            status: Some(TowerStatus::Down),
            ..Default::default()
        });
        let issues = evaluate(&tower, &state);
        assert_eq!(issues[0].issue_type, IssueType::TowerDown);
        assert_eq!(issues[0].severity, Severity::Critical);
        assert!(!issues[0].auto_remediation_available);
    }

    #[test]
    fn test_thresholds_are_strict() {
        let (tower, state) = state_with(StatePatch {
            cpu_usage: Some(80.0),
            latency_ms: Some(100.0),
            power_consumption: Some(8.0),
            ..Default::default()
        });
        assert!(evaluate(&tower, &state).is_empty());
    }

    #[test]
    fn test_issue_type_parse() {
        assert_eq!("congestion".parse::<IssueType>().unwrap(), IssueType::Congestion);
        assert_eq!("high-cpu".parse::<IssueType>().unwrap(), IssueType::HighCpu);
        assert!(matches!(
            "SOLAR_FLARE".parse::<IssueType>(),
            Err(EngineError::InvalidIssueType(_))
        ));
        assert_eq!(
            serde_json::to_string(&IssueType::TowerDown).unwrap(),
            "\"TOWER_DOWN\""
        );
    }

    #[tokio::test]
    async fn test_detect_all_towers_on_builtin_network() {
        let repo = Arc::new(TowerRepository::in_memory(Arc::new(Topology::builtin())));
        repo.update(
            "tower-003",
            &StatePatch {
                active_connections: Some(440),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let detector = IssueDetector::new(repo);
        let issues = detector.detect(None).await.unwrap();
        assert_eq!(issues.len(), 1);
        assert_eq!(issues[0].tower_id, "tower-003");
        assert_eq!(issues[0].severity, Severity::Critical);

        assert!(detector.detect(Some("tower-001")).await.unwrap().is_empty());
        assert!(detector.detect(Some("tower-404")).await.is_err());
    }
}
