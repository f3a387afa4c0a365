use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;

use flotilla_common::telemetry::now_ms;
use flotilla_common::{
    ApiResponse, Cluster, ClusterConfig, DeployRequest, DeployResponse, InstanceStatus, Node,
    RegisterClusterRequest, RegisterNodeRequest, UpdateNodeRequest,
};
use flotilla_meta::TaskRef;

use crate::provision::{is_local_host, provision_agent, ProvisionOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct InstanceQuery {
    #[serde(default)]
    pub include_offline: bool,
}

fn internal(e: anyhow::Error) -> Response {
    tracing::error!(error=%e, "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(ApiResponse::error(e.to_string())),
    )
        .into_response()
}

fn not_found(message: String) -> Response {
    (StatusCode::NOT_FOUND, Json(ApiResponse::error(message))).into_response()
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Register a new cluster: persist the record and provision its agent.
/// A failed local launch unwinds the persisted record.
pub async fn register_cluster(
    State(state): State<AppState>,
    Json(req): Json<RegisterClusterRequest>,
) -> Response {
    if req.name.trim().is_empty() || req.adapter_type.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("name and adapter_type are required")),
        )
            .into_response();
    }
    if req.entry_address.trim().is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("entry_address is required")),
        )
            .into_response();
    }

    let cluster_id = uuid::Uuid::new_v4().to_string();
    let agent_url = req.agent_url.clone().or_else(|| {
        is_local_host(&req.entry_address).then(|| "http://127.0.0.1:21001".to_string())
    });

    let mut config = req.config.clone().unwrap_or_else(ClusterConfig::default);
    config.entry_address = Some(req.entry_address.clone());
    config.agent_url = agent_url;
    config.center_url = Some(state.args.advertise_url.clone());

    let cluster = Cluster {
        id: cluster_id.clone(),
        name: req.name.clone(),
        nodes: Vec::new(),
        adapter_type: req.adapter_type.clone(),
        config,
    };

    if let Err(e) = state.catalog.put_cluster(&cluster).await {
        return internal(e);
    }

    let provisioned = match provision_agent(&state.args, &cluster).await {
        Ok(outcome) => outcome,
        Err(e) => {
            // Registration without a launchable agent is a lie; unwind it.
            let _ = state.catalog.delete_cluster(&cluster_id).await;
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error(format!("failed to launch cluster agent: {e}"))),
            )
                .into_response();
        }
    };

    let message = match provisioned {
        ProvisionOutcome::LaunchedLocally => "cluster registered, agent launched locally",
        ProvisionOutcome::Delegated => {
            "cluster registered, provision the agent on the entry host to begin reporting"
        }
    };
    tracing::info!(cluster_id=%cluster_id, name=%req.name, "cluster registered");
    Json(json!({
        "status": "success",
        "message": message,
        "data": { "cluster_id": cluster_id, "name": req.name }
    }))
    .into_response()
}

pub async fn list_clusters(State(state): State<AppState>) -> Response {
    match state.catalog.list_clusters().await {
        Ok(clusters) => {
            let summaries: Vec<_> = clusters.iter().map(|c| c.summary()).collect();
            Json(json!({ "status": "success", "data": summaries })).into_response()
        }
        Err(e) => internal(e),
    }
}

pub async fn get_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Response {
    match state.catalog.get_cluster(&cluster_id).await {
        Ok(Some(cluster)) => {
            Json(json!({ "status": "success", "data": cluster })).into_response()
        }
        Ok(None) => not_found(format!("cluster {cluster_id} not found")),
        Err(e) => internal(e),
    }
}

pub async fn delete_cluster(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Response {
    match state.catalog.delete_cluster(&cluster_id).await {
        Ok(true) => {
            tracing::info!(cluster_id=%cluster_id, "cluster deleted");
            Json(ApiResponse::success(format!("cluster {cluster_id} deleted"))).into_response()
        }
        Ok(false) => not_found(format!("cluster {cluster_id} not found")),
        Err(e) => internal(e),
    }
}

pub async fn get_cluster_nodes(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
) -> Response {
    match state.catalog.get_cluster(&cluster_id).await {
        Ok(Some(cluster)) => {
            Json(json!({ "status": "success", "data": cluster.nodes })).into_response()
        }
        Ok(None) => not_found(format!("cluster {cluster_id} not found")),
        Err(e) => internal(e),
    }
}

/// Agent push: upsert the node record by id inside the cluster's node list.
pub async fn register_node(
    State(state): State<AppState>,
    Json(req): Json<RegisterNodeRequest>,
) -> Response {
    let cluster = match state.catalog.get_cluster(&req.cluster_id).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return not_found(format!("cluster {} not found", req.cluster_id)),
        Err(e) => return internal(e),
    };

    let mut cluster = cluster;
    upsert_node(&mut cluster, req.node_info);

    match state.catalog.put_cluster(&cluster).await {
        Ok(()) => Json(ApiResponse::success("node registered")).into_response(),
        Err(e) => internal(e),
    }
}

pub fn upsert_node(cluster: &mut Cluster, node: Node) {
    match cluster.nodes.iter_mut().find(|n| n.id == node.id) {
        Some(existing) => *existing = node,
        None => cluster.nodes.push(node),
    }
}

/// Operator patch: partial update, metadata merged rather than replaced.
pub async fn update_node(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
    Json(req): Json<UpdateNodeRequest>,
) -> Response {
    let mut cluster = match state.catalog.get_cluster(&cluster_id).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return not_found(format!("cluster {cluster_id} not found")),
        Err(e) => return internal(e),
    };

    let Some(node) = cluster.nodes.iter_mut().find(|n| n.id == req.node_id) else {
        return not_found(format!("node {} not found in cluster", req.node_id));
    };
    apply_node_patch(node, &req);

    match state.catalog.put_cluster(&cluster).await {
        Ok(()) => Json(ApiResponse::success("node information updated")).into_response(),
        Err(e) => internal(e),
    }
}

pub fn apply_node_patch(node: &mut Node, req: &UpdateNodeRequest) {
    if let Some(total) = req.memory_total {
        node.memory_total_mb = Some(total);
    }
    if let Some(available) = req.memory_available {
        node.memory_available_mb = Some(available);
    }
    if let Some(cpu) = &req.cpu_info {
        node.cpu = Some(cpu.clone());
    }
    if let Some(metadata) = &req.metadata {
        for (k, v) in metadata {
            node.metadata.insert(k.clone(), v.clone());
        }
    }
}

pub async fn list_instances(
    State(state): State<AppState>,
    Query(query): Query<InstanceQuery>,
) -> Response {
    match state.catalog.list_instances(query.include_offline).await {
        Ok(instances) => Json(json!({ "status": "success", "data": instances })).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn list_cluster_instances(
    State(state): State<AppState>,
    Path(cluster_id): Path<String>,
    Query(query): Query<InstanceQuery>,
) -> Response {
    match state
        .catalog
        .list_instances_for_cluster(&cluster_id, query.include_offline)
        .await
    {
        Ok(instances) => Json(json!({ "status": "success", "data": instances })).into_response(),
        Err(e) => internal(e),
    }
}

pub async fn list_node_instances(
    State(state): State<AppState>,
    Path(node_id): Path<String>,
    Query(query): Query<InstanceQuery>,
) -> Response {
    match state
        .catalog
        .list_instances_for_node(&node_id, query.include_offline)
        .await
    {
        Ok(instances) => Json(json!({ "status": "success", "data": instances })).into_response(),
        Err(e) => internal(e),
    }
}

/// Relay a deploy request to the cluster's agent and record the
/// correlating task id.
pub async fn deploy(State(state): State<AppState>, Json(req): Json<DeployRequest>) -> Response {
    let Some(cluster_id) = req.cluster_id.clone() else {
        return (
            StatusCode::BAD_REQUEST,
            Json(ApiResponse::error("cluster_id is required")),
        )
            .into_response();
    };

    let cluster = match state.catalog.get_cluster(&cluster_id).await {
        Ok(Some(cluster)) => cluster,
        Ok(None) => return not_found(format!("cluster {cluster_id} not found")),
        Err(e) => return internal(e),
    };
    let Some(agent_url) = cluster.config.agent_url.clone() else {
        return (
            StatusCode::BAD_GATEWAY,
            Json(ApiResponse::error(format!(
                "cluster {cluster_id} has no reachable agent"
            ))),
        )
            .into_response();
    };

    let url = format!("{}/deploy", agent_url.trim_end_matches('/'));
    let resp = match state.http.post(&url).json(&req).send().await {
        Ok(resp) => resp,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error(format!("agent unreachable: {e}"))),
            )
                .into_response();
        }
    };

    if !resp.status().is_success() {
        let status = resp.status();
        let body: ApiResponse = resp
            .json()
            .await
            .unwrap_or_else(|_| ApiResponse::error("agent rejected the deploy request"));
        let code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::BAD_GATEWAY);
        return (code, Json(body)).into_response();
    }

    let deploy_resp: DeployResponse = match resp.json().await {
        Ok(r) => r,
        Err(e) => {
            return (
                StatusCode::BAD_GATEWAY,
                Json(ApiResponse::error(format!("bad agent response: {e}"))),
            )
                .into_response();
        }
    };

    let task_ref = TaskRef {
        task_id: deploy_resp.task_id.clone(),
        cluster_id: cluster_id.clone(),
        model_name: req.model_name.clone(),
        created_at_ms: now_ms(),
    };
    if let Err(e) = state.catalog.put_task_ref(&task_ref).await {
        tracing::warn!(task_id=%deploy_resp.task_id, error=%e, "failed to record task ref");
    }

    tracing::info!(task_id=%deploy_resp.task_id, cluster_id=%cluster_id, model=%req.model_name, "deploy relayed");
    Json(deploy_resp).into_response()
}

/// Task lookup: resolve the owning cluster and relay to its agent for the
/// live task record.
pub async fn get_task(State(state): State<AppState>, Path(task_id): Path<String>) -> Response {
    let task_ref = match state.catalog.get_task_ref(&task_id).await {
        Ok(Some(r)) => r,
        Ok(None) => return not_found(format!("task {task_id} not found")),
        Err(e) => return internal(e),
    };

    let agent_url = match state.catalog.get_cluster(&task_ref.cluster_id).await {
        Ok(Some(cluster)) => cluster.config.agent_url,
        Ok(None) => None,
        Err(e) => return internal(e),
    };
    let Some(agent_url) = agent_url else {
        // Best view we have: the correlation record itself.
        return Json(json!({ "status": "success", "data": task_ref })).into_response();
    };

    let url = format!("{}/tasks/{}", agent_url.trim_end_matches('/'), task_id);
    match state.http.get(&url).send().await {
        Ok(resp) if resp.status().is_success() => match resp.json::<serde_json::Value>().await {
            Ok(task) => Json(json!({ "status": "success", "data": task })).into_response(),
            Err(e) => internal(anyhow::anyhow!("bad agent response: {e}")),
        },
        _ => Json(json!({ "status": "success", "data": task_ref })).into_response(),
    }
}

/// Aggregate counts over the persisted state.
pub async fn dashboard(State(state): State<AppState>) -> Response {
    let clusters = match state.catalog.list_clusters().await {
        Ok(c) => c,
        Err(e) => return internal(e),
    };
    let instances = match state.catalog.list_instances(true).await {
        Ok(i) => i,
        Err(e) => return internal(e),
    };

    let num_nodes: usize = clusters.iter().map(|c| c.nodes.len()).sum();
    let num_accelerators: usize = clusters.iter().map(|c| c.accelerator_count()).sum();
    let online = instances
        .iter()
        .filter(|i| i.status != InstanceStatus::Offline)
        .count();

    Json(json!({
        "status": "success",
        "data": {
            "num_clusters": clusters.len(),
            "num_nodes": num_nodes,
            "num_accelerators": num_accelerators,
            "num_instances_online": online,
            "num_instances_offline": instances.len() - online,
            "generated_at": chrono::Utc::now().to_rfc3339(),
        }
    }))
    .into_response()
}
