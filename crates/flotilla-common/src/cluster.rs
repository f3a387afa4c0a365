use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::node::{Node, NodeStatus};

/// One entry of the cluster config's node list. Missing fields are
/// defaulted during discovery; a descriptor without an address is skipped.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct NodeDescriptor {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

/// Reachability info for a cluster's entry point plus its node descriptors.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ClusterConfig {
    #[serde(default)]
    pub nodes: Vec<NodeDescriptor>,
    #[serde(default)]
    pub entry_address: Option<String>,
    #[serde(default)]
    pub agent_url: Option<String>,
    #[serde(default)]
    pub center_url: Option<String>,
}

/// A named group of nodes governed by one vendor adapter and one agent.
/// Nodes are exclusively owned: no node belongs to two clusters.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cluster {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub nodes: Vec<Node>,
    pub adapter_type: String,
    #[serde(default)]
    pub config: ClusterConfig,
}

impl Cluster {
    pub fn accelerator_count(&self) -> usize {
        self.nodes.iter().map(|n| n.accelerators.len()).sum()
    }

    /// A cluster is online when any of its nodes is.
    pub fn derived_status(&self) -> NodeStatus {
        if self.nodes.iter().any(|n| n.status == NodeStatus::Online) {
            NodeStatus::Online
        } else {
            NodeStatus::Offline
        }
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            id: self.id.clone(),
            name: self.name.clone(),
            adapter_type: self.adapter_type.clone(),
            node_count: self.nodes.len(),
            accelerator_count: self.accelerator_count(),
            status: self.derived_status(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterSummary {
    pub id: String,
    pub name: String,
    pub adapter_type: String,
    pub node_count: usize,
    pub accelerator_count: usize,
    pub status: NodeStatus,
}
