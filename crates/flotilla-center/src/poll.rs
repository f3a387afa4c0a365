use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use flotilla_common::telemetry::now_ms;
use flotilla_common::{Cluster, ModelInstancesInfo, NodeStatus, NodeStatusInfo};
use flotilla_meta::Catalog;

use crate::state::AppState;

/// Consecutive poll failures against one agent before its cluster's nodes
/// and instances are demoted. One timeout is a cycle failure, not a death
/// sentence.
pub const POLL_FAILURE_THRESHOLD: u32 = 3;

/// A node heartbeat older than this has actually elapsed its liveness
/// window; only then may the reaper demote it.
pub const NODE_STALE_MS: u64 = 60_000;

/// Per-agent consecutive failure counters.
#[derive(Debug, Default)]
pub struct FailureTracker {
    counts: DashMap<String, u32>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true when this failure crosses the demotion threshold.
    pub fn record_failure(&self, source: &str) -> bool {
        let mut count = self.counts.entry(source.to_string()).or_insert(0);
        *count += 1;
        if *count >= POLL_FAILURE_THRESHOLD {
            *count = 0;
            true
        } else {
            false
        }
    }

    pub fn record_success(&self, source: &str) {
        self.counts.remove(source);
    }
}

/// Background loop: poll each known cluster's agent for its instance list,
/// persist the answers, and demote sources that keep failing. Also reaps
/// genuinely stale nodes each cycle.
pub async fn poll_loop(state: AppState) {
    let tracker = Arc::new(FailureTracker::new());
    let interval = Duration::from_millis(state.args.poll_interval_ms);
    loop {
        if let Err(e) = poll_once(&state, &tracker).await {
            tracing::warn!(error=%e, "poll cycle failed");
        }
        tokio::time::sleep(interval).await;
    }
}

async fn poll_once(state: &AppState, tracker: &FailureTracker) -> anyhow::Result<()> {
    let clusters = state.catalog.list_clusters().await?;
    for cluster in &clusters {
        reap_stale_nodes(&state.catalog, cluster, now_ms()).await?;

        let Some(agent_url) = cluster.config.agent_url.clone() else {
            continue;
        };
        let url = format!("{}/model-instances-info", agent_url.trim_end_matches('/'));
        let report = match state.http.get(&url).send().await {
            Ok(resp) if resp.status().is_success() => {
                match resp.json::<ModelInstancesInfo>().await {
                    Ok(report) => Some(report),
                    Err(e) => {
                        tracing::warn!(cluster_id=%cluster.id, error=%e, "bad instance report");
                        None
                    }
                }
            }
            Ok(resp) => {
                tracing::warn!(cluster_id=%cluster.id, status=%resp.status(), "instance poll rejected");
                None
            }
            Err(e) => {
                tracing::warn!(cluster_id=%cluster.id, error=%e, "instance poll failed");
                None
            }
        };

        match report {
            Some(report) => {
                tracker.record_success(&cluster.id);
                persist_report(&state.catalog, cluster, report).await?;
                poll_node_status(state, cluster, &agent_url).await;
            }
            None => {
                if tracker.record_failure(&cluster.id) {
                    tracing::warn!(cluster_id=%cluster.id, "poll failure threshold crossed, demoting cluster");
                    demote_cluster(&state.catalog, cluster, now_ms()).await?;
                }
            }
        }
    }
    Ok(())
}

/// Secondary poll against a live agent: pick up the freshest node records.
/// Failures just leave the pushed records in place until the next cycle.
async fn poll_node_status(state: &AppState, cluster: &Cluster, agent_url: &str) {
    let url = format!("{}/node-status", agent_url.trim_end_matches('/'));
    let info = match state.http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<NodeStatusInfo>().await {
            Ok(info) => info,
            Err(e) => {
                tracing::warn!(cluster_id=%cluster.id, error=%e, "bad node-status report");
                return;
            }
        },
        _ => return,
    };

    let Ok(Some(mut stored)) = state.catalog.get_cluster(&cluster.id).await else {
        return;
    };
    for node in info.nodes {
        crate::handlers::upsert_node(&mut stored, node);
    }
    if let Err(e) = state.catalog.put_cluster(&stored).await {
        tracing::warn!(cluster_id=%cluster.id, error=%e, "failed to persist node records");
    }
}

/// Persist an agent's instance report, tagging each instance with its
/// owning cluster for later lookup.
pub async fn persist_report(
    catalog: &Catalog,
    cluster: &Cluster,
    report: ModelInstancesInfo,
) -> anyhow::Result<()> {
    for mut instance in report.model_instances {
        instance.cluster_id = Some(cluster.id.clone());
        catalog.put_instance(&instance).await?;
    }
    Ok(())
}

/// Demote everything the dead agent owned: its instances go offline (still
/// queryable), its nodes go offline in the cluster record.
pub async fn demote_cluster(catalog: &Catalog, cluster: &Cluster, now: u64) -> anyhow::Result<()> {
    for instance in catalog.list_instances_for_cluster(&cluster.id, false).await? {
        catalog.mark_instance_offline(&instance.id, now).await?;
    }

    if let Some(mut stored) = catalog.get_cluster(&cluster.id).await? {
        let mut changed = false;
        for node in &mut stored.nodes {
            if node.status == NodeStatus::Online {
                node.status = NodeStatus::Offline;
                changed = true;
            }
        }
        if changed {
            catalog.put_cluster(&stored).await?;
        }
    }
    Ok(())
}

/// Demote Online nodes whose heartbeat window has actually elapsed. A node
/// that simply hasn't pushed yet (heartbeat still fresh) is left alone, so
/// demotion never races the agent's first report.
pub async fn reap_stale_nodes(
    catalog: &Catalog,
    cluster: &Cluster,
    now: u64,
) -> anyhow::Result<()> {
    let Some(mut stored) = catalog.get_cluster(&cluster.id).await? else {
        return Ok(());
    };
    let mut changed = false;
    for node in &mut stored.nodes {
        if node.status == NodeStatus::Online && node.is_stale(now, NODE_STALE_MS) {
            tracing::warn!(cluster_id=%cluster.id, node=%node.id, "node heartbeat stale, demoting");
            node.status = NodeStatus::Offline;
            changed = true;
        }
    }
    if changed {
        catalog.put_cluster(&stored).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_common::{ClusterConfig, InstanceStatus, ModelInstance, Node};
    use flotilla_meta::MemoryMetaStore;

    fn make_catalog() -> Catalog {
        Catalog::new(Arc::new(MemoryMetaStore::new()))
    }

    fn make_node(id: &str, status: NodeStatus, last_heartbeat_ms: u64) -> Node {
        Node {
            id: id.to_string(),
            name: id.to_string(),
            address: "10.0.0.1".to_string(),
            port: 22,
            accelerators: vec![],
            status,
            last_heartbeat_ms,
            memory_total_mb: None,
            memory_available_mb: None,
            cpu: None,
            metadata: Default::default(),
        }
    }

    fn make_cluster(id: &str, nodes: Vec<Node>) -> Cluster {
        Cluster {
            id: id.to_string(),
            name: id.to_string(),
            nodes,
            adapter_type: "nvidia".to_string(),
            config: ClusterConfig::default(),
        }
    }

    fn make_instance(id: &str, node_id: &str) -> ModelInstance {
        ModelInstance {
            id: id.to_string(),
            model_name: "qwen2.5-0.5b".to_string(),
            model_type: None,
            accelerator_ids: vec![],
            primary_accelerator_id: None,
            endpoint: "http://127.0.0.1:21002".to_string(),
            status: InstanceStatus::Online,
            node_id: node_id.to_string(),
            cluster_id: None,
            created_at_ms: 1,
            offline_at_ms: None,
        }
    }

    #[test]
    fn test_tracker_demotes_on_third_consecutive_failure() {
        let tracker = FailureTracker::new();
        assert!(!tracker.record_failure("c1"));
        assert!(!tracker.record_failure("c1"));
        assert!(tracker.record_failure("c1"));
    }

    #[test]
    fn test_tracker_success_resets() {
        let tracker = FailureTracker::new();
        tracker.record_failure("c1");
        tracker.record_failure("c1");
        tracker.record_success("c1");
        assert!(!tracker.record_failure("c1"));
        assert!(!tracker.record_failure("c1"));
        assert!(tracker.record_failure("c1"));
    }

    #[tokio::test]
    async fn test_persist_report_tags_cluster() {
        let catalog = make_catalog();
        let cluster = make_cluster("c1", vec![]);
        catalog.put_cluster(&cluster).await.unwrap();

        let report = ModelInstancesInfo {
            status: "success".to_string(),
            cluster_id: "c1".to_string(),
            cluster_name: "c1".to_string(),
            model_instances: vec![make_instance("m-1", "n1")],
            timestamp: 0,
        };
        persist_report(&catalog, &cluster, report).await.unwrap();

        let stored = catalog.get_instance("m-1").await.unwrap().unwrap();
        assert_eq!(stored.cluster_id.as_deref(), Some("c1"));
        assert_eq!(
            catalog.list_instances_for_cluster("c1", false).await.unwrap().len(),
            1
        );
    }

    #[tokio::test]
    async fn test_demote_cluster_hides_instances_from_default_queries() {
        let catalog = make_catalog();
        let cluster = make_cluster("c1", vec![make_node("n1", NodeStatus::Online, 0)]);
        catalog.put_cluster(&cluster).await.unwrap();

        let report = ModelInstancesInfo {
            status: "success".to_string(),
            cluster_id: "c1".to_string(),
            cluster_name: "c1".to_string(),
            model_instances: vec![make_instance("m-1", "n1")],
            timestamp: 0,
        };
        persist_report(&catalog, &cluster, report).await.unwrap();

        demote_cluster(&catalog, &cluster, 42).await.unwrap();

        // Excluded by default, present with include_offline, never deleted.
        assert!(catalog.list_instances(false).await.unwrap().is_empty());
        let all = catalog.list_instances(true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, InstanceStatus::Offline);
        assert_eq!(all[0].offline_at_ms, Some(42));

        let stored = catalog.get_cluster("c1").await.unwrap().unwrap();
        assert_eq!(stored.nodes[0].status, NodeStatus::Offline);
    }

    #[tokio::test]
    async fn test_reaper_only_demotes_elapsed_heartbeats() {
        let catalog = make_catalog();
        let now = 1_000_000;
        let cluster = make_cluster(
            "c1",
            vec![
                make_node("fresh", NodeStatus::Online, now - 5_000),
                make_node("stale", NodeStatus::Online, now - NODE_STALE_MS - 1),
                make_node("already-off", NodeStatus::Offline, 0),
            ],
        );
        catalog.put_cluster(&cluster).await.unwrap();

        reap_stale_nodes(&catalog, &cluster, now).await.unwrap();

        let stored = catalog.get_cluster("c1").await.unwrap().unwrap();
        assert_eq!(stored.nodes[0].status, NodeStatus::Online);
        assert_eq!(stored.nodes[1].status, NodeStatus::Offline);
        assert_eq!(stored.nodes[2].status, NodeStatus::Offline);
    }
}
