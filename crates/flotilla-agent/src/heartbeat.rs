use std::sync::Arc;
use std::time::Duration;

use flotilla_common::telemetry::now_ms;
use flotilla_common::{ApiResponse, Node, NodeStatus, RegisterNodeRequest};

use crate::state::AgentState;

/// Heartbeat loop: refresh liveness for every managed node, re-probe
/// accelerator attributes, and re-push node records to the center
/// (idempotent upsert by node id). Runs until process exit.
pub async fn heartbeat_loop(state: Arc<AgentState>) {
    let interval = Duration::from_millis(state.args.heartbeat_interval_ms);
    loop {
        refresh_once(&state).await;
        push_nodes(&state).await;
        tokio::time::sleep(interval).await;
    }
}

/// One refresh pass: liveness plus accelerator attributes through the
/// registry, then the ledger learns about every refreshed device.
pub async fn refresh_once(state: &Arc<AgentState>) {
    let refreshed = {
        let mut registry = state.registry.lock().await;
        match registry.refresh_cluster(&state.args.cluster_id, now_ms()).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                tracing::warn!(error=%e, "cluster refresh failed");
                return;
            }
        }
    };

    let mut manager = state.manager.lock().await;
    for acc in &refreshed {
        manager.register_accelerator(acc);
    }
}

/// Push every node record to the center's registration endpoint. Transient
/// failures are logged and retried on the next interval.
pub async fn push_nodes(state: &Arc<AgentState>) {
    let Some(center_url) = state.args.center_url.as_deref() else {
        return;
    };

    let nodes: Vec<Node> = {
        let registry = state.registry.lock().await;
        match registry.get_cluster(&state.args.cluster_id) {
            Some(cluster) => cluster.nodes.clone(),
            None => return,
        }
    };

    let url = format!("{}/api/register_node", center_url.trim_end_matches('/'));
    for node in nodes {
        let payload = RegisterNodeRequest {
            cluster_id: state.args.cluster_id.clone(),
            node_info: node,
        };
        match state.http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: ApiResponse = resp.json().await.unwrap_or_else(|_| {
                    ApiResponse::success("")
                });
                if body.status != "success" {
                    tracing::warn!(node=%payload.node_info.id, message=%body.message, "center rejected node registration");
                }
            }
            Ok(resp) => {
                tracing::warn!(node=%payload.node_info.id, status=%resp.status(), "node registration failed");
            }
            Err(e) => {
                tracing::warn!(node=%payload.node_info.id, error=%e, "failed to reach center, will retry");
            }
        }
    }
}

/// Mark a node online once, at startup, after its first successful
/// discovery. Separate from the loop so startup state is correct before
/// the first push.
pub async fn mark_discovered_nodes_online(state: &Arc<AgentState>) {
    let now = now_ms();
    let mut registry = state.registry.lock().await;
    if let Some(cluster) = registry.get_cluster_mut(&state.args.cluster_id) {
        for node in &mut cluster.nodes {
            node.last_heartbeat_ms = now;
            node.status = NodeStatus::Online;
        }
    }
}
