use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

use flotilla_common::{
    Accelerator, AcceleratorVendor, Cluster, ClusterConfig, Node, NodeStatus,
};

use crate::apple::AppleAdapter;
use crate::nvidia::NvidiaAdapter;

/// A node whose heartbeat is older than this is considered offline.
pub const HEARTBEAT_STALE_MS: u64 = 60_000;

/// Everything needed to build a serving-workload launch command. Optional
/// fields are required by the adapters; a missing one is an explicit
/// incomplete-parameters failure, never a panic.
#[derive(Debug, Clone, Default)]
pub struct LaunchParams {
    pub model_name: String,
    pub model_path: Option<String>,
    pub image: Option<String>,
    pub port: Option<u16>,
    pub extra_args: Vec<String>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LaunchError {
    #[error("incomplete parameters: missing {0}")]
    IncompleteParams(&'static str),
    #[error("no accelerators bound to launch")]
    NoAccelerators,
}

/// Capability set implemented once per vendor family. Discovery is additive
/// and partial-failure-tolerant: a bad node yields a placeholder record, it
/// never aborts the pass for the rest of the cluster.
#[async_trait]
pub trait VendorAdapter: Send + Sync {
    fn adapter_type(&self) -> &'static str;

    fn vendor(&self) -> AcceleratorVendor;

    /// Build one Node per config descriptor, defaulting missing fields and
    /// skipping descriptors with no reachable address.
    fn discover_nodes(&self, config: &ClusterConfig) -> Vec<Node>;

    /// Vendor-specific accelerator probe. Failures degrade to a placeholder
    /// record.
    async fn read_accelerators(&self, node: &Node) -> Vec<Accelerator>;

    /// Liveness decided purely from heartbeat staleness. Probing actively is
    /// vendor-specific and may be expensive, so it is not done here.
    fn probe_liveness(&self, node: &Node, now_ms: u64) -> NodeStatus {
        if node.is_stale(now_ms, HEARTBEAT_STALE_MS) {
            NodeStatus::Offline
        } else {
            NodeStatus::Online
        }
    }

    /// The exact invocation that starts a serving workload bound to the
    /// given accelerators.
    fn build_launch_command(
        &self,
        node: &Node,
        accelerator_ids: &[String],
        params: &LaunchParams,
    ) -> Result<String, LaunchError>;
}

/// Adapter lookup by tag. The vendor set stays open: adding a vendor means
/// one new implementation and one new arm here.
pub fn create_adapter(adapter_type: &str) -> Option<Arc<dyn VendorAdapter>> {
    match adapter_type {
        "nvidia" => Some(Arc::new(NvidiaAdapter::new())),
        "apple" => Some(Arc::new(AppleAdapter::new())),
        _ => None,
    }
}

/// Shared descriptor-to-node construction used by every adapter.
pub(crate) fn nodes_from_config(config: &ClusterConfig, name_prefix: &str) -> Vec<Node> {
    let mut nodes = Vec::new();
    for desc in &config.nodes {
        let Some(address) = desc.address.clone().filter(|a| !a.is_empty()) else {
            tracing::warn!(name=?desc.name, "skipping node descriptor without address");
            continue;
        };
        let id = desc
            .id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let name = desc
            .name
            .clone()
            .unwrap_or_else(|| format!("{name_prefix}-node-{}", nodes.len()));
        nodes.push(Node {
            id,
            name,
            address,
            port: desc.port.unwrap_or(22),
            accelerators: Vec::new(),
            status: NodeStatus::Unknown,
            last_heartbeat_ms: 0,
            memory_total_mb: None,
            memory_available_mb: None,
            cpu: None,
            metadata: desc.metadata.clone(),
        });
    }
    nodes
}

/// Best-effort stand-in recorded when a probe fails, so the registry still
/// sees the node even while its hardware is unreadable.
pub(crate) fn placeholder_accelerator(node: &Node, vendor: AcceleratorVendor) -> Accelerator {
    let mut extra = serde_json::Map::new();
    extra.insert("placeholder".to_string(), serde_json::Value::Bool(true));
    Accelerator {
        id: format!("{}-gpu-0", node.id),
        name: format!("{} (unprobed)", vendor.as_tag()),
        memory_total_mb: 0,
        vendor,
        compute_capability: None,
        extra,
    }
}

/// Map accelerator ids back to device indices for visibility env vars.
/// Ids follow the `{node_id}-gpu-{index}` convention.
pub(crate) fn device_indices(accelerator_ids: &[String]) -> Vec<String> {
    accelerator_ids
        .iter()
        .map(|id| {
            id.rsplit_once("-gpu-")
                .map(|(_, idx)| idx.to_string())
                .unwrap_or_else(|| id.clone())
        })
        .collect()
}

pub(crate) fn is_local(address: &str) -> bool {
    matches!(address, "127.0.0.1" | "localhost" | "::1")
}

/// Apply a fully-built Cluster from a discovery pass: nodes own their
/// accelerators, liveness comes from the adapter.
pub(crate) async fn populate_cluster(
    adapter: &dyn VendorAdapter,
    cluster: &mut Cluster,
    now_ms: u64,
) {
    let mut nodes = adapter.discover_nodes(&cluster.config);
    for node in &mut nodes {
        node.accelerators = adapter.read_accelerators(node).await;
        node.last_heartbeat_ms = now_ms;
        node.status = adapter.probe_liveness(node, now_ms);
    }
    cluster.nodes = nodes;
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_common::NodeDescriptor;

    #[test]
    fn test_nodes_from_config_defaults_and_skips() {
        let config = ClusterConfig {
            nodes: vec![
                NodeDescriptor {
                    id: Some("n1".into()),
                    name: Some("gpu-box".into()),
                    address: Some("10.0.0.1".into()),
                    port: Some(2222),
                    ..Default::default()
                },
                NodeDescriptor {
                    address: Some("10.0.0.2".into()),
                    ..Default::default()
                },
                // no address: skipped
                NodeDescriptor {
                    name: Some("ghost".into()),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };

        let nodes = nodes_from_config(&config, "nvidia");
        assert_eq!(nodes.len(), 2);
        assert_eq!(nodes[0].id, "n1");
        assert_eq!(nodes[0].port, 2222);
        assert_eq!(nodes[1].name, "nvidia-node-1");
        assert_eq!(nodes[1].port, 22);
        assert_eq!(nodes[1].status, NodeStatus::Unknown);
    }

    #[test]
    fn test_device_indices() {
        let ids = vec!["n1-gpu-0".to_string(), "n1-gpu-3".to_string()];
        assert_eq!(device_indices(&ids), vec!["0", "3"]);
    }

    #[test]
    fn test_create_adapter_lookup() {
        assert!(create_adapter("nvidia").is_some());
        assert!(create_adapter("apple").is_some());
        assert!(create_adapter("tpu").is_none());
    }

    #[test]
    fn test_probe_liveness_is_pure_staleness() {
        let adapter = NvidiaAdapter::new();
        let mut node = nodes_from_config(
            &ClusterConfig {
                nodes: vec![NodeDescriptor {
                    address: Some("10.0.0.1".into()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            "nvidia",
        )
        .remove(0);

        node.last_heartbeat_ms = 100_000;
        assert_eq!(adapter.probe_liveness(&node, 100_000 + 1_000), NodeStatus::Online);
        assert_eq!(
            adapter.probe_liveness(&node, 100_000 + HEARTBEAT_STALE_MS + 1),
            NodeStatus::Offline
        );
    }
}
