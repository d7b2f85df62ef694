//! Session configuration

use crate::error::{Result, SyncError};
use cosync_core::ContainerKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// One top-level partition of the document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionConfig {
    pub key: String,
    #[serde(default = "default_kind")]
    pub kind: ContainerKind,
}

impl PartitionConfig {
    pub fn map(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ContainerKind::Map,
        }
    }

    pub fn array(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            kind: ContainerKind::Array,
        }
    }
}

fn default_kind() -> ContainerKind {
    ContainerKind::Map
}

/// Document sync configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Trailing throttle window for local changes, in milliseconds
    pub throttle_ms: u64,
    pub partitions: Vec<PartitionConfig>,
    /// Fixed origin tag, a fresh uuid per session when unset
    pub origin: Option<String>,
    /// Host state key holding the synchronized document
    pub document_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            throttle_ms: 50,
            partitions: vec![PartitionConfig::map("nodes"), PartitionConfig::map("scenes")],
            origin: None,
            document_key: "document".to_string(),
        }
    }
}

impl SyncConfig {
    pub fn throttle_window(&self) -> Duration {
        Duration::from_millis(self.throttle_ms)
    }

    pub fn partition_keys(&self) -> Vec<&str> {
        self.partitions.iter().map(|p| p.key.as_str()).collect()
    }

    pub fn validate(&self) -> Result<()> {
        if self.document_key.is_empty() {
            return Err(SyncError::Config("document_key must not be empty".into()));
        }
        if self.partitions.is_empty() {
            return Err(SyncError::Config("at least one partition is required".into()));
        }

        let mut seen = HashSet::new();
        for partition in &self.partitions {
            if partition.key.is_empty() {
                return Err(SyncError::Config("partition key must not be empty".into()));
            }
            if !seen.insert(partition.key.as_str()) {
                return Err(SyncError::Config(format!(
                    "duplicate partition {}",
                    partition.key
                )));
            }
        }
        Ok(())
    }
}
