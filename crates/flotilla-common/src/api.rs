use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::cluster::ClusterConfig;
use crate::instance::ModelInstance;
use crate::node::{CpuInfo, Node};

/// Envelope every mutating call answers with.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ApiResponse {
    pub status: String,
    pub message: String,
}

impl ApiResponse {
    pub fn success(message: impl Into<String>) -> Self {
        Self {
            status: "success".to_string(),
            message: message.into(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            status: "error".to_string(),
            message: message.into(),
        }
    }
}

/// Agent → aggregator registration push. `node` is the full record with its
/// nested accelerator list; the aggregator upserts by node id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterNodeRequest {
    pub cluster_id: String,
    pub node_info: Node,
}

/// External caller → aggregator cluster registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterClusterRequest {
    pub name: String,
    pub adapter_type: String,
    pub entry_address: String,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub config: Option<ClusterConfig>,
}

/// Deploy request as accepted by an agent (or relayed by the aggregator).
/// Either `gpu_id` or a {count, memory, vendor} requirement must be given.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeployRequest {
    pub model_name: String,
    #[serde(default)]
    pub model_type: Option<String>,

    #[serde(default)]
    pub gpu_id: Option<String>,
    #[serde(default)]
    pub gpu_count: Option<u32>,
    #[serde(default)]
    pub memory_required: Option<u64>,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub gpu_type: Option<String>,

    /// Routing field used by the aggregator; agents ignore it.
    #[serde(default)]
    pub cluster_id: Option<String>,

    #[serde(default)]
    pub deploy_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub status: String,
    pub task_id: String,
    #[serde(default)]
    pub gpu_id: Option<String>,
}

/// Agent's answer to the aggregator's model-instance poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInstancesInfo {
    pub status: String,
    pub cluster_id: String,
    pub cluster_name: String,
    pub model_instances: Vec<ModelInstance>,
    pub timestamp: u64,
}

/// Agent's answer to the aggregator's node-status poll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeStatusInfo {
    pub status: String,
    pub cluster_id: String,
    pub nodes: Vec<Node>,
    pub timestamp: u64,
}

/// Operator tool → aggregator partial node update. Metadata is merged into
/// the existing map, not replaced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNodeRequest {
    pub node_id: String,
    #[serde(default)]
    pub memory_total: Option<u64>,
    #[serde(default)]
    pub memory_available: Option<u64>,
    #[serde(default)]
    pub cpu_info: Option<CpuInfo>,
    #[serde(default)]
    pub metadata: Option<HashMap<String, String>>,
}
