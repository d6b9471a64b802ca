//! Agent configuration
//!
//! Values come from an optional config file (`TRACE_CONFIG`, default
//! `trace-agent.toml`) overlaid with `TRACE_*` environment variables. Nested
//! keys use `__`, e.g. `TRACE_REDISTRIBUTION__TARGET_LOAD_BPS=6500`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;
use trace_engine::{EngineConfig, HealingPolicy, RedistributionPolicy, SchedulerConfig, Topology};

const DEFAULT_CONFIG_FILE: &str = "trace-agent.toml";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub node_name: String,

    /// API server port
    pub api_port: u16,

    /// Seconds between detection cycles
    pub scan_interval_secs: u64,

    /// Remediate detected issues without a caller asking
    pub auto_heal: bool,

    /// JSON topology file; the built-in network is used when unset
    pub topology_path: Option<PathBuf>,

    /// Tower state snapshot; state lives in memory only when unset
    pub state_path: Option<PathBuf>,

    /// Remediation ledger file
    pub ledger_path: Option<PathBuf>,

    pub persistence_timeout_ms: u64,

    pub redistribution: RedistributionPolicy,

    pub healing: HealingPolicy,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            node_name: std::env::var("NODE_NAME").unwrap_or_else(|_| "trace-node".to_string()),
            api_port: 8080,
            scan_interval_secs: 30,
            auto_heal: false,
            topology_path: None,
            state_path: None,
            ledger_path: None,
            persistence_timeout_ms: 2000,
            redistribution: RedistributionPolicy::default(),
            healing: HealingPolicy::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the config file and environment
    pub fn load() -> Result<Self> {
        let file = std::env::var("TRACE_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_FILE.to_string());
        Self::from_file(Path::new(&file))
    }

    /// Load from `path` if it exists, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .add_source(
                config::Environment::with_prefix("TRACE")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to read agent configuration")?;

        let config: AgentConfig = config
            .try_deserialize()
            .context("Invalid agent configuration")?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.scan_interval_secs == 0 {
            anyhow::bail!("scan_interval_secs must be at least 1");
        }
        if self.persistence_timeout_ms == 0 {
            anyhow::bail!("persistence_timeout_ms must be at least 1");
        }
        if self.healing.connections_per_unit == 0 {
            anyhow::bail!("healing.connections_per_unit must be at least 1");
        }
        Ok(())
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            redistribution: self.redistribution,
            healing: self.healing,
            persistence_timeout: Duration::from_millis(self.persistence_timeout_ms),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            interval: Duration::from_secs(self.scan_interval_secs),
            auto_heal: self.auto_heal,
        }
    }

    pub fn topology(&self) -> Result<Topology> {
        match &self.topology_path {
            Some(path) => Topology::from_file(path)
                .with_context(|| format!("Failed to load topology from {}", path.display())),
            None => Ok(Topology::builtin()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use trace_engine::BasisPoints;

    #[test]
    fn test_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AgentConfig::from_file(&dir.path().join("absent.toml")).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.scan_interval_secs, 30);
        assert!(!config.auto_heal);
        assert_eq!(config.redistribution, RedistributionPolicy::default());
        assert_eq!(
            config.engine_config().persistence_timeout,
            Duration::from_secs(2)
        );
    }

    #[test]
    fn test_file_overrides_policy() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            r#"
api_port = 9100
auto_heal = true

[redistribution]
target_load_bps = 6500

[healing]
connections_per_unit = 80
"#,
        )
        .unwrap();

        let config = AgentConfig::from_file(&path).unwrap();
        assert_eq!(config.api_port, 9100);
        assert!(config.auto_heal);
        assert_eq!(config.redistribution.target_load, BasisPoints(6500));
        assert_eq!(
            config.redistribution.neighbor_ceiling,
            RedistributionPolicy::default().neighbor_ceiling
        );
        assert_eq!(config.healing.connections_per_unit, 80);
        assert!(config.scheduler_config().auto_heal);
    }

    #[test]
    fn test_zero_interval_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "scan_interval_secs = 0\n").unwrap();

        assert!(AgentConfig::from_file(&path).is_err());
    }

    #[test]
    fn test_builtin_topology_without_path() {
        let config = AgentConfig {
            topology_path: None,
            ..Default::default()
        };
        assert!(config.topology().unwrap().contains("tower-001"));
    }
}
