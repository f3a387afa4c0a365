use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use flotilla_common::{Cluster, InstanceStatus, ModelInstance};

use crate::types::MetaStore;

const CLUSTER_PREFIX: &str = "/clusters/";
const INSTANCE_PREFIX: &str = "/instances/";
const TASK_PREFIX: &str = "/tasks/";
const INDEX_ONLINE: &str = "/index/instances/online/";
const INDEX_OFFLINE: &str = "/index/instances/offline/";
const INDEX_CLUSTER: &str = "/index/instances/cluster/";
const INDEX_NODE: &str = "/index/instances/node/";

fn cluster_key(cluster_id: &str) -> String {
    format!("{CLUSTER_PREFIX}{cluster_id}")
}

fn instance_key(instance_id: &str) -> String {
    format!("{INSTANCE_PREFIX}{instance_id}")
}

fn status_index_key(status: InstanceStatus, instance_id: &str) -> String {
    let prefix = match status {
        InstanceStatus::Offline => INDEX_OFFLINE,
        _ => INDEX_ONLINE,
    };
    format!("{prefix}{instance_id}")
}

fn cluster_index_key(cluster_id: &str, instance_id: &str) -> String {
    format!("{INDEX_CLUSTER}{cluster_id}/{instance_id}")
}

fn node_index_key(node_id: &str, instance_id: &str) -> String {
    format!("{INDEX_NODE}{node_id}/{instance_id}")
}

/// Correlates a relayed deployment task with the cluster/agent that owns it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskRef {
    pub task_id: String,
    pub cluster_id: String,
    pub model_name: String,
    pub created_at_ms: u64,
}

/// Persistence layer over the shared store: one entry per cluster, one per
/// model instance, plus index entries for online/offline membership and
/// per-cluster / per-node lookup.
///
/// The aggregator is the only writer; `write_lock` serializes the
/// record-plus-index updates so the indices never diverge from the
/// instance table.
pub struct Catalog {
    store: Arc<dyn MetaStore>,
    write_lock: Mutex<()>,
}

impl Catalog {
    pub fn new(store: Arc<dyn MetaStore>) -> Self {
        Self {
            store,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn put_cluster(&self, cluster: &Cluster) -> Result<()> {
        let bytes = serde_json::to_vec(cluster)?;
        self.store.put(&cluster_key(&cluster.id), bytes, None).await?;
        Ok(())
    }

    pub async fn get_cluster(&self, cluster_id: &str) -> Result<Option<Cluster>> {
        match self.store.get(&cluster_key(cluster_id)).await? {
            Some((bytes, _rev)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn list_clusters(&self) -> Result<Vec<Cluster>> {
        let mut out = Vec::new();
        for (_k, bytes, _rev) in self.store.list_prefix(CLUSTER_PREFIX).await? {
            if let Ok(cluster) = serde_json::from_slice::<Cluster>(&bytes) {
                out.push(cluster);
            }
        }
        Ok(out)
    }

    /// Remove a cluster and purge its instances. This is the only purge
    /// path; the pollers never delete instances.
    pub async fn delete_cluster(&self, cluster_id: &str) -> Result<bool> {
        let _guard = self.write_lock.lock().await;
        if self.store.get(&cluster_key(cluster_id)).await?.is_none() {
            return Ok(false);
        }
        self.store.delete(&cluster_key(cluster_id)).await?;

        let index = self
            .store
            .list_prefix(&format!("{INDEX_CLUSTER}{cluster_id}/"))
            .await?;
        for (key, bytes, _rev) in index {
            let instance_id = String::from_utf8_lossy(&bytes).to_string();
            if let Some(inst) = self.get_instance(&instance_id).await? {
                self.remove_index_entries(&inst).await?;
                self.store.delete(&instance_key(&instance_id)).await?;
            } else {
                self.store.delete(&key).await?;
            }
        }
        Ok(true)
    }

    /// Upsert an instance together with its index entries.
    pub async fn put_instance(&self, instance: &ModelInstance) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let previous = self.get_instance(&instance.id).await?;

        let bytes = serde_json::to_vec(instance)?;
        self.store.put(&instance_key(&instance.id), bytes, None).await?;

        if let Some(prev) = previous {
            self.remove_index_entries(&prev).await?;
        }
        self.add_index_entries(instance).await?;
        Ok(())
    }

    pub async fn get_instance(&self, instance_id: &str) -> Result<Option<ModelInstance>> {
        match self.store.get(&instance_key(instance_id)).await? {
            Some((bytes, _rev)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    pub async fn list_instances(&self, include_offline: bool) -> Result<Vec<ModelInstance>> {
        let mut out = Vec::new();
        for (_k, bytes, _rev) in self.store.list_prefix(INSTANCE_PREFIX).await? {
            if let Ok(inst) = serde_json::from_slice::<ModelInstance>(&bytes) {
                if include_offline || inst.status != InstanceStatus::Offline {
                    out.push(inst);
                }
            }
        }
        Ok(out)
    }

    pub async fn list_instances_for_cluster(
        &self,
        cluster_id: &str,
        include_offline: bool,
    ) -> Result<Vec<ModelInstance>> {
        self.list_by_index(&format!("{INDEX_CLUSTER}{cluster_id}/"), include_offline)
            .await
    }

    pub async fn list_instances_for_node(
        &self,
        node_id: &str,
        include_offline: bool,
    ) -> Result<Vec<ModelInstance>> {
        self.list_by_index(&format!("{INDEX_NODE}{node_id}/"), include_offline)
            .await
    }

    /// Flip an instance to Offline, stamping `offline_at_ms`. No-op when the
    /// instance is unknown or already offline.
    pub async fn mark_instance_offline(&self, instance_id: &str, now_ms: u64) -> Result<bool> {
        let Some(mut inst) = self.get_instance(instance_id).await? else {
            return Ok(false);
        };
        if inst.status == InstanceStatus::Offline {
            return Ok(false);
        }
        inst.status = InstanceStatus::Offline;
        inst.offline_at_ms = Some(now_ms);
        self.put_instance(&inst).await?;
        Ok(true)
    }

    pub async fn put_task_ref(&self, task: &TaskRef) -> Result<()> {
        let bytes = serde_json::to_vec(task)?;
        self.store
            .put(&format!("{TASK_PREFIX}{}", task.task_id), bytes, None)
            .await?;
        Ok(())
    }

    pub async fn get_task_ref(&self, task_id: &str) -> Result<Option<TaskRef>> {
        match self.store.get(&format!("{TASK_PREFIX}{task_id}")).await? {
            Some((bytes, _rev)) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn list_by_index(
        &self,
        index_prefix: &str,
        include_offline: bool,
    ) -> Result<Vec<ModelInstance>> {
        let mut out = Vec::new();
        for (_k, bytes, _rev) in self.store.list_prefix(index_prefix).await? {
            let instance_id = String::from_utf8_lossy(&bytes).to_string();
            if let Some(inst) = self.get_instance(&instance_id).await? {
                if include_offline || inst.status != InstanceStatus::Offline {
                    out.push(inst);
                }
            }
        }
        Ok(out)
    }

    async fn add_index_entries(&self, instance: &ModelInstance) -> Result<()> {
        let id_bytes = instance.id.clone().into_bytes();
        self.store
            .put(&status_index_key(instance.status, &instance.id), id_bytes.clone(), None)
            .await?;
        if let Some(cluster_id) = instance.cluster_id.as_deref() {
            self.store
                .put(&cluster_index_key(cluster_id, &instance.id), id_bytes.clone(), None)
                .await?;
        }
        self.store
            .put(&node_index_key(&instance.node_id, &instance.id), id_bytes, None)
            .await?;
        Ok(())
    }

    async fn remove_index_entries(&self, instance: &ModelInstance) -> Result<()> {
        self.store
            .delete(&status_index_key(instance.status, &instance.id))
            .await?;
        if let Some(cluster_id) = instance.cluster_id.as_deref() {
            self.store
                .delete(&cluster_index_key(cluster_id, &instance.id))
                .await?;
        }
        self.store
            .delete(&node_index_key(&instance.node_id, &instance.id))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryMetaStore;

    fn make_catalog() -> Catalog {
        Catalog::new(Arc::new(MemoryMetaStore::new()))
    }

    fn make_instance(id: &str, cluster_id: &str, node_id: &str) -> ModelInstance {
        ModelInstance {
            id: id.to_string(),
            model_name: "qwen2.5-0.5b".to_string(),
            model_type: None,
            accelerator_ids: vec![format!("{node_id}-gpu-0")],
            primary_accelerator_id: Some(format!("{node_id}-gpu-0")),
            endpoint: "http://127.0.0.1:21002".to_string(),
            status: InstanceStatus::Online,
            node_id: node_id.to_string(),
            cluster_id: Some(cluster_id.to_string()),
            created_at_ms: 1,
            offline_at_ms: None,
        }
    }

    #[tokio::test]
    async fn test_instance_round_trip_with_indices() {
        let catalog = make_catalog();
        let inst = make_instance("m-1", "c1", "n1");
        catalog.put_instance(&inst).await.unwrap();

        let got = catalog.get_instance("m-1").await.unwrap().unwrap();
        assert_eq!(got, inst);

        let by_cluster = catalog.list_instances_for_cluster("c1", false).await.unwrap();
        assert_eq!(by_cluster.len(), 1);
        let by_node = catalog.list_instances_for_node("n1", false).await.unwrap();
        assert_eq!(by_node.len(), 1);
    }

    #[tokio::test]
    async fn test_offline_filtered_unless_requested() {
        let catalog = make_catalog();
        catalog.put_instance(&make_instance("m-1", "c1", "n1")).await.unwrap();
        catalog.put_instance(&make_instance("m-2", "c1", "n1")).await.unwrap();

        assert!(catalog.mark_instance_offline("m-1", 99).await.unwrap());

        let visible = catalog.list_instances(false).await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "m-2");

        let all = catalog.list_instances(true).await.unwrap();
        assert_eq!(all.len(), 2);
        let offline = all.iter().find(|i| i.id == "m-1").unwrap();
        assert_eq!(offline.status, InstanceStatus::Offline);
        assert_eq!(offline.offline_at_ms, Some(99));

        // Demoting again is a no-op.
        assert!(!catalog.mark_instance_offline("m-1", 120).await.unwrap());
    }

    #[tokio::test]
    async fn test_status_index_moves_with_instance() {
        let catalog = make_catalog();
        catalog.put_instance(&make_instance("m-1", "c1", "n1")).await.unwrap();
        catalog.mark_instance_offline("m-1", 5).await.unwrap();

        let store = &catalog.store;
        assert!(store.get("/index/instances/online/m-1").await.unwrap().is_none());
        assert!(store.get("/index/instances/offline/m-1").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_delete_cluster_purges_instances() {
        let catalog = make_catalog();
        let cluster = Cluster {
            id: "c1".to_string(),
            name: "test".to_string(),
            nodes: vec![],
            adapter_type: "nvidia".to_string(),
            config: Default::default(),
        };
        catalog.put_cluster(&cluster).await.unwrap();
        catalog.put_instance(&make_instance("m-1", "c1", "n1")).await.unwrap();

        assert!(catalog.delete_cluster("c1").await.unwrap());
        assert!(catalog.get_cluster("c1").await.unwrap().is_none());
        assert!(catalog.get_instance("m-1").await.unwrap().is_none());
        assert!(catalog.list_instances(true).await.unwrap().is_empty());

        // Unknown cluster is reported, not silently ignored.
        assert!(!catalog.delete_cluster("c1").await.unwrap());
    }
}
