//! Injectable step failures
//!
//! Actions are deterministic, so failure paths are exercised by telling the
//! executor to fail a step before it touches any state.

use std::collections::HashSet;
use std::sync::Mutex;

use super::playbook::HealingAction;

pub trait FaultInjector: Send + Sync {
    /// Return a failure reason to make `action` fail on `tower_id`
    fn inject(&self, tower_id: &str, action: HealingAction) -> Option<String>;
}

/// Never injects a failure
#[derive(Debug, Default, Clone, Copy)]
pub struct NoFaults;

impl FaultInjector for NoFaults {
    fn inject(&self, _tower_id: &str, _action: HealingAction) -> Option<String> {
        None
    }
}

/// Fails a fixed set of actions on every tower
#[derive(Debug, Default)]
pub struct ScriptedFaults {
    failing: Mutex<HashSet<HealingAction>>,
}

impl ScriptedFaults {
    pub fn failing<I>(actions: I) -> Self
    where
        I: IntoIterator<Item = HealingAction>,
    {
        Self {
            failing: Mutex::new(actions.into_iter().collect()),
        }
    }

    /// Stop failing `action`
    pub fn clear(&self, action: HealingAction) {
        if let Ok(mut failing) = self.failing.lock() {
            failing.remove(&action);
        }
    }
}

impl FaultInjector for ScriptedFaults {
    fn inject(&self, _tower_id: &str, action: HealingAction) -> Option<String> {
        let failing = self.failing.lock().ok()?;
        failing
            .contains(&action)
            .then(|| format!("injected fault in {action}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_faults() {
        let faults = ScriptedFaults::failing([HealingAction::OptimizeRouting]);
        assert!(faults
            .inject("tower-001", HealingAction::OptimizeRouting)
            .is_some());
        assert!(faults
            .inject("tower-001", HealingAction::IncreaseBandwidth)
            .is_none());

        faults.clear(HealingAction::OptimizeRouting);
        assert!(faults
            .inject("tower-001", HealingAction::OptimizeRouting)
            .is_none());
        assert!(NoFaults.inject("tower-001", HealingAction::Rollback).is_none());
    }
}
