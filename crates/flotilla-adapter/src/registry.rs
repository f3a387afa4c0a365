use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use thiserror::Error;

use flotilla_common::{Accelerator, AcceleratorVendor, Cluster, ClusterConfig, Node, NodeStatus};

use crate::adapter::{populate_cluster, VendorAdapter};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("cluster {0} already registered")]
    DuplicateCluster(String),
    #[error("cluster {0} not found")]
    ClusterNotFound(String),
    #[error("no adapter registered for type {0}")]
    UnknownAdapter(String),
}

/// A "find me an accelerator" predicate: vendor (None = any) and a minimum
/// memory budget.
#[derive(Debug, Clone, Default)]
pub struct AcceleratorRequirement {
    pub vendor: Option<AcceleratorVendor>,
    pub min_memory_mb: u64,
}

impl AcceleratorRequirement {
    fn matches(&self, accelerator: &Accelerator) -> bool {
        if let Some(vendor) = self.vendor {
            if accelerator.vendor != vendor {
                return false;
            }
        }
        accelerator.memory_total_mb >= self.min_memory_mb
    }
}

/// In-memory catalog of clusters → nodes → accelerators plus the adapter
/// table. Owned state: constructed at process startup and passed by
/// reference into whatever needs it. No globals.
///
/// Clusters live in a BTreeMap so scans have a stable iteration order and
/// first-fit answers are deterministic.
pub struct ResourceRegistry {
    clusters: BTreeMap<String, Cluster>,
    adapters: HashMap<String, Arc<dyn VendorAdapter>>,
}

impl ResourceRegistry {
    pub fn new() -> Self {
        Self {
            clusters: BTreeMap::new(),
            adapters: HashMap::new(),
        }
    }

    pub fn register_adapter(&mut self, adapter: Arc<dyn VendorAdapter>) {
        tracing::info!(adapter_type = adapter.adapter_type(), "registering adapter");
        self.adapters.insert(adapter.adapter_type().to_string(), adapter);
    }

    pub fn adapter_for(&self, adapter_type: &str) -> Option<Arc<dyn VendorAdapter>> {
        self.adapters.get(adapter_type).cloned()
    }

    /// Duplicate ids are rejected, never overwritten.
    pub fn register_cluster(&mut self, cluster: Cluster) -> Result<(), RegistryError> {
        if self.clusters.contains_key(&cluster.id) {
            return Err(RegistryError::DuplicateCluster(cluster.id));
        }
        tracing::info!(cluster_id=%cluster.id, name=%cluster.name, "registered cluster");
        self.clusters.insert(cluster.id.clone(), cluster);
        Ok(())
    }

    pub fn remove_cluster(&mut self, cluster_id: &str) -> Result<Cluster, RegistryError> {
        self.clusters
            .remove(cluster_id)
            .ok_or_else(|| RegistryError::ClusterNotFound(cluster_id.to_string()))
    }

    pub fn get_cluster(&self, cluster_id: &str) -> Option<&Cluster> {
        self.clusters.get(cluster_id)
    }

    pub fn get_cluster_mut(&mut self, cluster_id: &str) -> Option<&mut Cluster> {
        self.clusters.get_mut(cluster_id)
    }

    pub fn list_clusters(&self) -> impl Iterator<Item = &Cluster> {
        self.clusters.values()
    }

    /// Run a full discovery pass for the named adapter type and register the
    /// resulting cluster: nodes, accelerators, and liveness populated.
    pub async fn discover_cluster(
        &mut self,
        cluster_id: String,
        name: String,
        adapter_type: &str,
        config: ClusterConfig,
        now_ms: u64,
    ) -> Result<&Cluster, RegistryError> {
        let adapter = self
            .adapter_for(adapter_type)
            .ok_or_else(|| RegistryError::UnknownAdapter(adapter_type.to_string()))?;

        let mut cluster = Cluster {
            id: cluster_id,
            name,
            nodes: Vec::new(),
            adapter_type: adapter_type.to_string(),
            config,
        };
        populate_cluster(adapter.as_ref(), &mut cluster, now_ms).await;

        let id = cluster.id.clone();
        self.register_cluster(cluster)?;
        Ok(self.clusters.get(&id).expect("cluster registered above"))
    }

    /// Refresh an existing cluster in place: same identity, contents
    /// replaced. A node whose probe answers gets a fresh heartbeat and a
    /// wholesale-replaced accelerator list; one whose probe fails keeps its
    /// old heartbeat so the staleness check can demote it. Returns every
    /// accelerator refreshed this pass.
    pub async fn refresh_cluster(
        &mut self,
        cluster_id: &str,
        now_ms: u64,
    ) -> Result<Vec<Accelerator>, RegistryError> {
        let cluster = self
            .clusters
            .get_mut(cluster_id)
            .ok_or_else(|| RegistryError::ClusterNotFound(cluster_id.to_string()))?;
        let adapter = self
            .adapters
            .get(&cluster.adapter_type)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownAdapter(cluster.adapter_type.clone()))?;

        let mut refreshed = Vec::new();
        for node in &mut cluster.nodes {
            let accelerators = adapter.read_accelerators(node).await;
            let probe_ok = !accelerators
                .iter()
                .all(|a| a.extra.contains_key("placeholder"));
            if probe_ok {
                node.last_heartbeat_ms = now_ms;
                node.accelerators = accelerators.clone();
                refreshed.extend(accelerators);
            } else {
                tracing::warn!(node=%node.name, "probe failed, heartbeat not refreshed");
            }

            let next = adapter.probe_liveness(node, now_ms);
            if node.status != next {
                tracing::info!(node=%node.name, from=?node.status, to=?next, "node status changed");
            }
            node.status = next;
        }
        Ok(refreshed)
    }

    /// First-fit lookup: linear scan across online nodes in stable order,
    /// short-circuiting on the first accelerator whose vendor and memory
    /// satisfy the requirement. First-fit, not best-fit, keeps this O(total
    /// accelerators) and deterministic.
    pub fn find_accelerator(
        &self,
        requirement: &AcceleratorRequirement,
    ) -> Option<(&Node, &Accelerator)> {
        for cluster in self.clusters.values() {
            for node in &cluster.nodes {
                if node.status != NodeStatus::Online {
                    continue;
                }
                for accelerator in &node.accelerators {
                    if requirement.matches(accelerator) {
                        return Some((node, accelerator));
                    }
                }
            }
        }
        None
    }
}

impl Default for ResourceRegistry {
    fn default() -> Self {
        Self::new()
    }
}
