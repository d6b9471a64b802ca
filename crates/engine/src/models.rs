//! Core data models for the tower network

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Connections a primary tower carries when first seen
pub const DEFAULT_CONNECTIONS: u32 = 150;

/// Baseline power draw in kW at normal operating mode
pub const BASE_POWER_KW: f64 = 5.5;

const DEFAULT_CPU_USAGE: f64 = 45.0;
const DEFAULT_LATENCY_MS: f64 = 25.0;
const DEFAULT_ACTIVE_UNITS: u32 = 4;

const SPARE_CPU_USAGE: f64 = 5.0;
const SPARE_LATENCY_MS: f64 = 10.0;

/// Role of a tower in the topology
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TowerRole {
    #[default]
    Primary,
    /// Standby cell with zero baseline load, activated to absorb overflow
    WarmSpare,
}

/// Static description of a tower (immutable at runtime)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tower {
    pub tower_id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub region: String,
    /// Connection ceiling
    pub max_capacity: u32,
    /// Ceiling on active serving units (TRX)
    pub max_capacity_units: u32,
    /// Towers eligible to receive offloaded load, in preference order
    #[serde(default)]
    pub neighbors: Vec<String>,
    #[serde(default)]
    pub warm_spares: Vec<String>,
    #[serde(default)]
    pub role: TowerRole,
}

impl Tower {
    pub fn new(tower_id: impl Into<String>, max_capacity: u32, max_capacity_units: u32) -> Self {
        Self {
            tower_id: tower_id.into(),
            name: String::new(),
            region: String::new(),
            max_capacity,
            max_capacity_units: max_capacity_units.max(1),
            neighbors: Vec::new(),
            warm_spares: Vec::new(),
            role: TowerRole::Primary,
        }
    }

    /// Create a warm spare tower
    pub fn spare(tower_id: impl Into<String>, max_capacity: u32, max_capacity_units: u32) -> Self {
        Self {
            role: TowerRole::WarmSpare,
            ..Self::new(tower_id, max_capacity, max_capacity_units)
        }
    }

    pub fn with_name(mut self, name: impl Into<String>, region: impl Into<String>) -> Self {
        self.name = name.into();
        self.region = region.into();
        self
    }

    pub fn with_neighbors<I, S>(mut self, neighbors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.neighbors = neighbors.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_warm_spares<I, S>(mut self, spares: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.warm_spares = spares.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_warm_spare(&self) -> bool {
        self.role == TowerRole::WarmSpare
    }

    /// State a tower starts with before anything has been recorded for it
    pub fn default_state(&self) -> TowerState {
        match self.role {
            TowerRole::Primary => TowerState {
                tower_id: self.tower_id.clone(),
                active_connections: DEFAULT_CONNECTIONS,
                active_capacity_units: DEFAULT_ACTIVE_UNITS.min(self.max_capacity_units),
                operating_mode: OperatingMode::Normal,
                cpu_usage: DEFAULT_CPU_USAGE,
                latency_ms: DEFAULT_LATENCY_MS,
                power_consumption: BASE_POWER_KW,
                status: TowerStatus::Healthy,
                last_updated: Utc::now(),
            },
            TowerRole::WarmSpare => TowerState {
                tower_id: self.tower_id.clone(),
                active_connections: 0,
                active_capacity_units: 1,
                operating_mode: OperatingMode::Standby,
                cpu_usage: SPARE_CPU_USAGE,
                latency_ms: SPARE_LATENCY_MS,
                power_consumption: round2(BASE_POWER_KW * OperatingMode::Standby.power_multiplier()),
                status: TowerStatus::Healthy,
                last_updated: Utc::now(),
            },
        }
    }
}

/// Radio operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperatingMode {
    Normal,
    Eco,
    Boost,
    Standby,
}

impl OperatingMode {
    /// Power draw relative to normal mode
    pub fn power_multiplier(&self) -> f64 {
        match self {
            OperatingMode::Normal => 1.0,
            OperatingMode::Eco => 0.7,
            OperatingMode::Boost => 1.3,
            OperatingMode::Standby => 0.3,
        }
    }
}

impl std::fmt::Display for OperatingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingMode::Normal => write!(f, "normal"),
            OperatingMode::Eco => write!(f, "eco"),
            OperatingMode::Boost => write!(f, "boost"),
            OperatingMode::Standby => write!(f, "standby"),
        }
    }
}

impl std::str::FromStr for OperatingMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "normal" => Ok(OperatingMode::Normal),
            "eco" => Ok(OperatingMode::Eco),
            "boost" => Ok(OperatingMode::Boost),
            "standby" => Ok(OperatingMode::Standby),
            other => Err(format!("unknown operating mode: {other}")),
        }
    }
}

/// Coarse tower health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TowerStatus {
    Healthy,
    Warning,
    Critical,
    Down,
}

impl std::fmt::Display for TowerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TowerStatus::Healthy => write!(f, "healthy"),
            TowerStatus::Warning => write!(f, "warning"),
            TowerStatus::Critical => write!(f, "critical"),
            TowerStatus::Down => write!(f, "down"),
        }
    }
}

/// Mutable runtime state of a tower
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TowerState {
    pub tower_id: String,
    pub active_connections: u32,
    pub active_capacity_units: u32,
    pub operating_mode: OperatingMode,
    /// CPU usage in percent
    pub cpu_usage: f64,
    pub latency_ms: f64,
    /// Power draw in kW
    pub power_consumption: f64,
    pub status: TowerStatus,
    pub last_updated: DateTime<Utc>,
}

impl TowerState {
    /// Apply a partial update. Returns true if any field was present.
    pub fn apply(&mut self, patch: &StatePatch) -> bool {
        let mut touched = false;
        if let Some(v) = patch.active_connections {
            self.active_connections = v;
            touched = true;
        }
        if let Some(v) = patch.active_capacity_units {
            self.active_capacity_units = v;
            touched = true;
        }
        if let Some(v) = patch.operating_mode {
            self.operating_mode = v;
            touched = true;
        }
        if let Some(v) = patch.cpu_usage {
            self.cpu_usage = v.max(0.0);
            touched = true;
        }
        if let Some(v) = patch.latency_ms {
            self.latency_ms = v.max(0.0);
            touched = true;
        }
        if let Some(v) = patch.power_consumption {
            self.power_consumption = v.max(0.0);
            touched = true;
        }
        if let Some(v) = patch.status {
            self.status = v;
            touched = true;
        }
        touched
    }

    /// Fraction of `max_capacity` in use
    pub fn load_ratio(&self, max_capacity: u32) -> f64 {
        if max_capacity == 0 {
            return 0.0;
        }
        self.active_connections as f64 / max_capacity as f64
    }

    /// True when every reading matches, ignoring `last_updated`
    pub fn same_readings(&self, other: &TowerState) -> bool {
        self.tower_id == other.tower_id
            && self.active_connections == other.active_connections
            && self.active_capacity_units == other.active_capacity_units
            && self.operating_mode == other.operating_mode
            && self.cpu_usage == other.cpu_usage
            && self.latency_ms == other.latency_ms
            && self.power_consumption == other.power_consumption
            && self.status == other.status
    }
}

/// Partial tower state update; absent fields are left unchanged
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StatePatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub active_capacity_units: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operating_mode: Option<OperatingMode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_usage: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latency_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub power_consumption: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<TowerStatus>,
}

/// Round to one decimal place for reported percentages
pub fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

/// Round to two decimal places for reported power figures
pub fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
