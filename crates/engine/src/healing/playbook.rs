//! Remediation playbooks

use serde::{Deserialize, Serialize};

use super::detector::IssueType;

/// Every action a playbook step can take
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealingAction {
    IdentifyHeavyProcesses,
    RestartNonCriticalServices,
    ScaleResources,
    EscalateToHuman,
    CheckNetworkPath,
    OptimizeRouting,
    IncreaseBandwidth,
    ActivateAlternatePath,
    AnalyzeTrafficPattern,
    CalculateRedistribution,
    RedirectToNeighbors,
    ActivateWarmSpare,
    NotifyOperator,
    AnalyzePowerUsage,
    ReduceIdleTrx,
    EnableEcoMode,
    RestoreTowerService,
    /// Marker appended to the ledger when a remediation is undone
    Rollback,
}

impl HealingAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealingAction::IdentifyHeavyProcesses => "identify_heavy_processes",
            HealingAction::RestartNonCriticalServices => "restart_non_critical_services",
            HealingAction::ScaleResources => "scale_resources",
            HealingAction::EscalateToHuman => "escalate_to_human",
            HealingAction::CheckNetworkPath => "check_network_path",
            HealingAction::OptimizeRouting => "optimize_routing",
            HealingAction::IncreaseBandwidth => "increase_bandwidth",
            HealingAction::ActivateAlternatePath => "activate_alternate_path",
            HealingAction::AnalyzeTrafficPattern => "analyze_traffic_pattern",
            HealingAction::CalculateRedistribution => "calculate_redistribution",
            HealingAction::RedirectToNeighbors => "redirect_to_neighbors",
            HealingAction::ActivateWarmSpare => "activate_warm_spare",
            HealingAction::NotifyOperator => "notify_operator",
            HealingAction::AnalyzePowerUsage => "analyze_power_usage",
            HealingAction::ReduceIdleTrx => "reduce_idle_trx",
            HealingAction::EnableEcoMode => "enable_eco_mode",
            HealingAction::RestoreTowerService => "restore_tower_service",
            HealingAction::Rollback => "rollback",
        }
    }
}

impl std::fmt::Display for HealingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PlaybookStep {
    /// 1-based position in the playbook
    pub step: u32,
    pub action: HealingAction,
    /// False when the step needs operator approval
    pub auto: bool,
}

const fn auto(step: u32, action: HealingAction) -> PlaybookStep {
    PlaybookStep {
        step,
        action,
        auto: true,
    }
}

const fn manual(step: u32, action: HealingAction) -> PlaybookStep {
    PlaybookStep {
        step,
        action,
        auto: false,
    }
}

/// Ordered remediation steps for one issue type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Playbook {
    pub issue_type: IssueType,
    pub steps: &'static [PlaybookStep],
    pub rollback_enabled: bool,
}

static HIGH_CPU: Playbook = Playbook {
    issue_type: IssueType::HighCpu,
    steps: &[
        auto(1, HealingAction::IdentifyHeavyProcesses),
        auto(2, HealingAction::RestartNonCriticalServices),
        auto(3, HealingAction::ScaleResources),
        manual(4, HealingAction::EscalateToHuman),
    ],
    rollback_enabled: false,
};

static HIGH_LATENCY: Playbook = Playbook {
    issue_type: IssueType::HighLatency,
    steps: &[
        auto(1, HealingAction::CheckNetworkPath),
        auto(2, HealingAction::OptimizeRouting),
        auto(3, HealingAction::IncreaseBandwidth),
        auto(4, HealingAction::ActivateAlternatePath),
    ],
    rollback_enabled: true,
};

static CONGESTION: Playbook = Playbook {
    issue_type: IssueType::Congestion,
    steps: &[
        auto(1, HealingAction::AnalyzeTrafficPattern),
        auto(2, HealingAction::CalculateRedistribution),
        auto(3, HealingAction::RedirectToNeighbors),
        auto(4, HealingAction::ActivateWarmSpare),
        auto(5, HealingAction::NotifyOperator),
    ],
    rollback_enabled: true,
};

static HIGH_POWER: Playbook = Playbook {
    issue_type: IssueType::HighPower,
    steps: &[
        auto(1, HealingAction::AnalyzePowerUsage),
        auto(2, HealingAction::ReduceIdleTrx),
        auto(3, HealingAction::EnableEcoMode),
    ],
    rollback_enabled: true,
};

static TOWER_DOWN: Playbook = Playbook {
    issue_type: IssueType::TowerDown,
    steps: &[
        auto(1, HealingAction::NotifyOperator),
        manual(2, HealingAction::RestoreTowerService),
    ],
    rollback_enabled: false,
};

impl Playbook {
    pub fn for_issue(issue_type: IssueType) -> &'static Playbook {
        match issue_type {
            IssueType::HighCpu => &HIGH_CPU,
            IssueType::HighLatency => &HIGH_LATENCY,
            IssueType::Congestion => &CONGESTION,
            IssueType::HighPower => &HIGH_POWER,
            IssueType::TowerDown => &TOWER_DOWN,
        }
    }

    pub fn step(&self, index: usize) -> Option<&'static PlaybookStep> {
        self.steps.get(index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_issue_has_a_playbook() {
        for issue_type in IssueType::ALL {
            let playbook = Playbook::for_issue(issue_type);
            assert_eq!(playbook.issue_type, issue_type);
            assert!(!playbook.steps.is_empty());
            for (i, step) in playbook.steps.iter().enumerate() {
                assert_eq!(step.step as usize, i + 1);
                assert_ne!(step.action, HealingAction::Rollback);
            }
        }
    }

    #[test]
    fn test_manual_steps() {
        let manual: Vec<HealingAction> = IssueType::ALL
            .into_iter()
            .flat_map(|t| Playbook::for_issue(t).steps.iter())
            .filter(|s| !s.auto)
            .map(|s| s.action)
            .collect();
        assert_eq!(
            manual,
            vec![HealingAction::EscalateToHuman, HealingAction::RestoreTowerService]
        );
    }

    #[test]
    fn test_rollback_policy() {
        assert!(!Playbook::for_issue(IssueType::HighCpu).rollback_enabled);
        assert!(Playbook::for_issue(IssueType::Congestion).rollback_enabled);
        assert!(!Playbook::for_issue(IssueType::TowerDown).rollback_enabled);
    }

    #[test]
    fn test_action_names_match_serde() {
        let json = serde_json::to_string(&HealingAction::ReduceIdleTrx).unwrap();
        assert_eq!(json, format!("\"{}\"", HealingAction::ReduceIdleTrx));
    }
}
