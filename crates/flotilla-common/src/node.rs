use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::accelerator::Accelerator;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Unknown,
    Online,
    Offline,
    Busy,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CpuInfo {
    pub model: String,
    pub cores: u32,
    pub architecture: String,
    pub vendor: String,
}

/// One host machine exposing zero or more accelerators.
///
/// The node exclusively owns its accelerator list; a refresh replaces the
/// list wholesale. `status == Online` implies `last_heartbeat_ms` is within
/// the liveness threshold; the aggregator demotes stale nodes but never
/// promotes one; promotion only happens from a fresh report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,

    #[serde(default)]
    pub accelerators: Vec<Accelerator>,

    pub status: NodeStatus,
    pub last_heartbeat_ms: u64,

    #[serde(default)]
    pub memory_total_mb: Option<u64>,
    #[serde(default)]
    pub memory_available_mb: Option<u64>,
    #[serde(default)]
    pub cpu: Option<CpuInfo>,

    /// Hostname, OS, and the vendor credentials needed to reach the node.
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn is_stale(&self, now_ms: u64, threshold_ms: u64) -> bool {
        now_ms.saturating_sub(self.last_heartbeat_ms) > threshold_ms
    }
}
