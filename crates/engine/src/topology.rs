//! Static network topology
//!
//! The topology is the seed for every other component: it names the towers,
//! their capacities and which towers may take offloaded traffic.

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{EngineError, EngineResult};
use crate::models::Tower;

/// Capacity given to warm spares in the built-in topology
const SPARE_CAPACITY: u32 = 400;
const SPARE_UNITS: u32 = 4;

/// On-disk topology document
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TopologyFile {
    towers: Vec<Tower>,
}

/// Read-only tower topology
#[derive(Debug, Clone)]
pub struct Topology {
    towers: Vec<Tower>,
    index: HashMap<String, usize>,
}

impl Topology {
    /// Build a topology, validating that every reference resolves
    pub fn new(towers: Vec<Tower>) -> EngineResult<Self> {
        let mut index = HashMap::with_capacity(towers.len());
        for (i, tower) in towers.iter().enumerate() {
            if tower.max_capacity == 0 {
                return Err(EngineError::InvalidRequest(format!(
                    "tower {} has zero capacity",
                    tower.tower_id
                )));
            }
            if index.insert(tower.tower_id.clone(), i).is_some() {
                return Err(EngineError::InvalidRequest(format!(
                    "duplicate tower id {}",
                    tower.tower_id
                )));
            }
        }

        for tower in &towers {
            for neighbor in &tower.neighbors {
                if neighbor == &tower.tower_id || !index.contains_key(neighbor) {
                    return Err(EngineError::InvalidRequest(format!(
                        "tower {} lists invalid neighbor {}",
                        tower.tower_id, neighbor
                    )));
                }
            }
            for spare in &tower.warm_spares {
                match index.get(spare).map(|&i| &towers[i]) {
                    Some(t) if t.is_warm_spare() => {}
                    _ => {
                        return Err(EngineError::InvalidRequest(format!(
                            "tower {} lists {} as warm spare but it is not a spare tower",
                            tower.tower_id, spare
                        )))
                    }
                }
            }
        }

        Ok(Self { towers, index })
    }

    /// Load a topology from a JSON document of the form `{"towers": [...]}`
    pub fn from_file(path: &Path) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let file: TopologyFile = serde_json::from_str(&content)?;
        let topology = Self::new(file.towers)?;
        info!(
            path = %path.display(),
            towers = topology.len(),
            "Loaded tower topology"
        );
        Ok(topology)
    }

    /// The five-tower TRACE reference network with its warm spares
    pub fn builtin() -> Self {
        let towers = vec![
            Tower::new("tower-001", 500, 8)
                .with_name("Downtown Tower A", "region-a")
                .with_neighbors(["tower-002", "tower-005"])
                .with_warm_spares(["tower-001-spare"]),
            Tower::new("tower-002", 400, 6)
                .with_name("Uptown Tower B", "region-a")
                .with_neighbors(["tower-001", "tower-005"])
                .with_warm_spares(["tower-002-spare"]),
            Tower::new("tower-003", 450, 8)
                .with_name("Harbor Tower C", "region-b")
                .with_neighbors(["tower-004"])
                .with_warm_spares(["tower-003-spare"]),
            Tower::new("tower-004", 350, 6)
                .with_name("Industrial Tower D", "region-b")
                .with_neighbors(["tower-003"]),
            Tower::new("tower-005", 300, 4)
                .with_name("Suburban Tower E", "region-a")
                .with_neighbors(["tower-001", "tower-002"])
                .with_warm_spares(["tower-005-spare"]),
            Tower::spare("tower-001-spare", SPARE_CAPACITY, SPARE_UNITS)
                .with_name("Downtown Spare", "region-a"),
            Tower::spare("tower-002-spare", SPARE_CAPACITY, SPARE_UNITS)
                .with_name("Uptown Spare", "region-a"),
            Tower::spare("tower-003-spare", SPARE_CAPACITY, SPARE_UNITS)
                .with_name("Harbor Spare", "region-b"),
            Tower::spare("tower-005-spare", SPARE_CAPACITY, SPARE_UNITS)
                .with_name("Suburban Spare", "region-a"),
        ];

        match Self::new(towers) {
            Ok(topology) => topology,
            Err(e) => unreachable!("built-in topology is invalid: {e}"),
        }
    }

    pub fn get(&self, tower_id: &str) -> EngineResult<&Tower> {
        self.index
            .get(tower_id)
            .map(|&i| &self.towers[i])
            .ok_or_else(|| EngineError::UnknownTower(tower_id.to_string()))
    }

    pub fn contains(&self, tower_id: &str) -> bool {
        self.index.contains_key(tower_id)
    }

    /// All towers in declaration order
    pub fn towers(&self) -> &[Tower] {
        &self.towers
    }

    pub fn tower_ids(&self) -> impl Iterator<Item = &str> {
        self.towers.iter().map(|t| t.tower_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.towers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.towers.is_empty()
    }
}
