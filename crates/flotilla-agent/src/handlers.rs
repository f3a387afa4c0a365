use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use tokio::process::Command;

use flotilla_common::telemetry::now_ms;
use flotilla_common::{
    ApiResponse, DeployRequest, DeployResponse, DeployTask, InstanceStatus, ModelInstancesInfo,
    NodeStatusInfo, TaskStatus,
};

use crate::deploy::{resolve_accelerators, run_task, validate_deploy};
use crate::state::AgentState;

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// Accept a deployment task. Resolution happens synchronously so the
/// response carries the granted accelerator; the launch itself runs
/// asynchronously and is observed via `GET /tasks/{id}`.
pub async fn deploy(
    State(state): State<Arc<AgentState>>,
    Json(req): Json<DeployRequest>,
) -> impl IntoResponse {
    if let Err(message) = validate_deploy(&req) {
        return (StatusCode::BAD_REQUEST, Json(ApiResponse::error(message))).into_response();
    }

    let task_id = format!("task-{}", uuid::Uuid::new_v4());

    let resolved = {
        let registry = state.registry.lock().await;
        let Some(cluster) = registry.get_cluster(&state.args.cluster_id) else {
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(ApiResponse::error("cluster not registered")),
            )
                .into_response();
        };
        let mut manager = state.manager.lock().await;
        resolve_accelerators(&mut manager, cluster, &task_id, &req)
    };

    let accelerator_ids = match resolved {
        Ok(ids) => ids,
        Err(message) => {
            tracing::warn!(model=%req.model_name, error=%message, "deploy rejected");
            return (StatusCode::CONFLICT, Json(ApiResponse::error(message))).into_response();
        }
    };

    let task = DeployTask {
        id: task_id.clone(),
        model_name: req.model_name.clone(),
        model_type: req.model_type.clone(),
        requested_accelerator_id: req.gpu_id.clone(),
        requested_count: req.gpu_count,
        requested_memory_mb: req.memory_required,
        requested_vendor: req.gpu_type.clone(),
        accelerator_ids: accelerator_ids.clone(),
        status: TaskStatus::Pending,
        message: None,
        created_at_ms: now_ms(),
        started_at_ms: None,
        completed_at_ms: None,
        deploy_command: req.deploy_command.clone(),
    };
    state.tasks.lock().await.insert(task_id.clone(), task);

    let port = state.next_instance_port();
    tokio::spawn(run_task(state.clone(), task_id.clone(), port));

    tracing::info!(task_id=%task_id, model=%req.model_name, gpus=?accelerator_ids, "deploy accepted");
    Json(DeployResponse {
        status: "success".to_string(),
        task_id,
        gpu_id: accelerator_ids.first().cloned(),
    })
    .into_response()
}

pub async fn get_task(
    State(state): State<Arc<AgentState>>,
    Path(task_id): Path<String>,
) -> impl IntoResponse {
    match state.tasks.lock().await.get(&task_id) {
        Some(task) => Json(task.clone()).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("task {task_id} not found"))),
        )
            .into_response(),
    }
}

/// The aggregator polls this for the cluster's current instance list.
pub async fn model_instances_info(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    let instances = state.instances.lock().await.values().cloned().collect();
    Json(ModelInstancesInfo {
        status: "success".to_string(),
        cluster_id: state.args.cluster_id.clone(),
        cluster_name: state.args.cluster_name.clone(),
        model_instances: instances,
        timestamp: now_ms(),
    })
}

pub async fn node_status(State(state): State<Arc<AgentState>>) -> impl IntoResponse {
    let registry = state.registry.lock().await;
    let nodes = registry
        .get_cluster(&state.args.cluster_id)
        .map(|c| c.nodes.clone())
        .unwrap_or_default();
    Json(NodeStatusInfo {
        status: "success".to_string(),
        cluster_id: state.args.cluster_id.clone(),
        nodes,
        timestamp: now_ms(),
    })
}

/// Stop a running instance: best-effort container stop, release its
/// accelerators, mark it offline. The record stays queryable.
pub async fn stop_instance(
    State(state): State<Arc<AgentState>>,
    Path(instance_id): Path<String>,
) -> impl IntoResponse {
    let Some((endpoint, model_name, accelerator_ids)) = ({
        let instances = state.instances.lock().await;
        instances
            .get(&instance_id)
            .map(|i| (i.endpoint.clone(), i.model_name.clone(), i.accelerator_ids.clone()))
    }) else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::error(format!("instance {instance_id} not found"))),
        )
            .into_response();
    };

    if let Some(port) = endpoint.rsplit(':').next().and_then(|p| p.parse::<u16>().ok()) {
        let container = format!("flotilla-{}-{port}", model_name.replace([' ', '/'], "_"));
        let _ = Command::new("docker")
            .args(["stop", "-t", "10", &container])
            .output()
            .await;
    }

    {
        let mut manager = state.manager.lock().await;
        for id in &accelerator_ids {
            if let Err(e) = manager.release(id) {
                tracing::warn!(accelerator=%id, error=%e, "release on stop failed");
            }
        }
    }

    let mut instances = state.instances.lock().await;
    if let Some(inst) = instances.get_mut(&instance_id) {
        inst.status = InstanceStatus::Offline;
        inst.offline_at_ms = Some(now_ms());
    }

    tracing::info!(instance_id=%instance_id, "instance stopped");
    Json(ApiResponse::success(format!("instance {instance_id} stopped"))).into_response()
}
