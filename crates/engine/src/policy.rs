//! Tunable policy constants
//!
//! Ratios are held as integer basis points so that capacity arithmetic is
//! exact: `floor(500 * 70%)` is always 350, never 349.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// A ratio expressed in hundredths of a percent (10_000 = 100%)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BasisPoints(pub u32);

impl BasisPoints {
    pub const ONE: BasisPoints = BasisPoints(10_000);

    pub const fn from_percent(percent: u32) -> Self {
        BasisPoints(percent * 100)
    }

    /// `floor(value * ratio)`
    pub fn of_floor(self, value: u32) -> u32 {
        ((value as u64 * self.0 as u64) / Self::ONE.0 as u64) as u32
    }

    /// True if `part >= whole * ratio`
    pub fn is_met_by(self, part: u32, whole: u32) -> bool {
        part as u64 * Self::ONE.0 as u64 >= whole as u64 * self.0 as u64
    }

    pub fn as_f64(self) -> f64 {
        self.0 as f64 / Self::ONE.0 as f64
    }
}

impl std::fmt::Display for BasisPoints {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}%", self.0 as f64 / 100.0)
    }
}

fn default_target_load() -> BasisPoints {
    BasisPoints::from_percent(70)
}

fn default_neighbor_ceiling() -> BasisPoints {
    BasisPoints::from_percent(75)
}

fn default_satisfied() -> BasisPoints {
    BasisPoints::from_percent(90)
}

/// Redistribution planner policy
///
/// The defaults are product decisions carried over from field operation,
/// not derived values.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RedistributionPolicy {
    /// Load a congested tower is brought down to
    #[serde(default = "default_target_load", rename = "target_load_bps")]
    pub target_load: BasisPoints,
    /// Neighbors never receive load beyond this share of their capacity
    #[serde(default = "default_neighbor_ceiling", rename = "neighbor_ceiling_bps")]
    pub neighbor_ceiling: BasisPoints,
    /// Share of the deficit that must be placed for a plan to count as satisfied
    #[serde(default = "default_satisfied", rename = "satisfied_bps")]
    pub satisfied: BasisPoints,
}

impl Default for RedistributionPolicy {
    fn default() -> Self {
        Self {
            target_load: default_target_load(),
            neighbor_ceiling: default_neighbor_ceiling(),
            satisfied: default_satisfied(),
        }
    }
}

fn default_connections_per_unit() -> u32 {
    100
}

fn default_power_per_unit_kw() -> f64 {
    0.8
}

/// Healing action policy
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealingPolicy {
    /// Connections one serving unit carries
    #[serde(default = "default_connections_per_unit")]
    pub connections_per_unit: u32,
    /// Estimated draw of a single unit, used for savings estimates
    #[serde(default = "default_power_per_unit_kw")]
    pub power_per_unit_kw: f64,
}

impl HealingPolicy {
    /// Units required to serve `connections`, never less than one
    pub fn units_needed(&self, connections: u32) -> u32 {
        let per_unit = self.connections_per_unit.max(1);
        connections.div_ceil(per_unit).max(1)
    }
}

impl Default for HealingPolicy {
    fn default() -> Self {
        Self {
            connections_per_unit: default_connections_per_unit(),
            power_per_unit_kw: default_power_per_unit_kw(),
        }
    }
}

/// Default deadline for a single persistence call
pub const DEFAULT_PERSISTENCE_TIMEOUT: Duration = Duration::from_secs(2);

/// Engine-wide configuration
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    pub redistribution: RedistributionPolicy,
    pub healing: HealingPolicy,
    pub persistence_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            redistribution: RedistributionPolicy::default(),
            healing: HealingPolicy::default(),
            persistence_timeout: DEFAULT_PERSISTENCE_TIMEOUT,
        }
    }
}
