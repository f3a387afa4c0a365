use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Starting,
    Online,
    Offline,
}

/// One running serving workload bound to one or more accelerators.
///
/// Created by a deployment task; demoted to Offline only after repeated
/// liveness-poll failures. Never silently deleted: an offline instance
/// stays queryable until explicitly purged.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelInstance {
    pub id: String,
    pub model_name: String,
    #[serde(default)]
    pub model_type: Option<String>,

    pub accelerator_ids: Vec<String>,
    #[serde(default)]
    pub primary_accelerator_id: Option<String>,

    /// Externally reachable endpoint, e.g. "http://10.0.0.1:21002".
    pub endpoint: String,

    pub status: InstanceStatus,
    pub node_id: String,
    /// Filled in by the aggregator when it persists the instance.
    #[serde(default)]
    pub cluster_id: Option<String>,

    pub created_at_ms: u64,
    #[serde(default)]
    pub offline_at_ms: Option<u64>,
}
