//! Simulator configuration

use anyhow::{Context, Result};
use cosync_session::SyncConfig;
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    /// Number of simulated editors
    pub peers: usize,
    /// Workload steps per peer
    pub steps: usize,
    /// Delay between steps (ms)
    pub tick_ms: u64,
    pub sync: SyncConfig,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            peers: 3,
            steps: 40,
            tick_ms: 10,
            sync: SyncConfig::default(),
        }
    }
}

impl SimConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))
    }
}
