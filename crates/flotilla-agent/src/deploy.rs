use std::sync::Arc;

use tokio::process::Command;

use flotilla_common::telemetry::now_ms;
use flotilla_common::{
    AcceleratorVendor, Cluster, DeployRequest, DeployTask, InstanceStatus, ModelInstance,
    TaskStatus,
};
use flotilla_adapter::{LaunchError, LaunchParams};
use flotilla_sched::ResourceManager;

use crate::state::AgentState;

/// Reject a request before any side effect when it carries neither an
/// explicit accelerator id nor a {count, memory, vendor} requirement.
pub fn validate_deploy(req: &DeployRequest) -> Result<(), String> {
    if req.model_name.trim().is_empty() {
        return Err("missing required field: model_name".to_string());
    }
    if req.gpu_id.is_none()
        && req.gpu_count.is_none()
        && req.memory_required.is_none()
        && req.gpu_type.is_none()
    {
        return Err(
            "either gpu_id or a gpu_count/memory_required/gpu_type requirement is required"
                .to_string(),
        );
    }
    Ok(())
}

/// Resolve the accelerator set for a task, committing grants into the
/// ledger. Multi-accelerator requests go through the active policy and are
/// all-or-nothing; every error path leaves the ledger untouched.
pub fn resolve_accelerators(
    manager: &mut ResourceManager,
    cluster: &Cluster,
    consumer_id: &str,
    req: &DeployRequest,
) -> Result<Vec<String>, String> {
    let memory = req.memory_required.unwrap_or(0);

    if let Some(gpu_id) = req.gpu_id.as_deref() {
        manager
            .allocate(consumer_id, gpu_id, memory)
            .map_err(|e| e.to_string())?;
        return Ok(vec![gpu_id.to_string()]);
    }

    let count = req.gpu_count.unwrap_or(1);
    if count <= 1 {
        let vendor = req.gpu_type.as_deref().map(AcceleratorVendor::from_tag);
        let Some(id) = manager.find_free(memory, vendor) else {
            return Err("insufficient accelerators: need 1, found 0".to_string());
        };
        manager
            .allocate(consumer_id, &id, memory)
            .map_err(|e| e.to_string())?;
        return Ok(vec![id]);
    }

    let outcome = manager.allocate_with_policy(cluster, consumer_id, count, memory);
    if !outcome.success {
        return Err(outcome.message);
    }
    Ok(outcome.accelerator_ids())
}

/// Execute an accepted task: build the launch command, spawn the workload,
/// and record the resulting model instance. Any failure releases every
/// accelerator granted to the task and marks it failed; a task is never
/// left holding a grant with no recovery path.
pub async fn run_task(state: Arc<AgentState>, task_id: String, port: u16) {
    set_task(&state, &task_id, |t| {
        t.status = TaskStatus::Processing;
        t.started_at_ms = Some(now_ms());
    })
    .await;

    match launch(&state, &task_id, port).await {
        Ok(instance) => {
            tracing::info!(task_id=%task_id, instance_id=%instance.id, endpoint=%instance.endpoint, "deployment launched");
            let instance_id = instance.id.clone();
            state
                .instances
                .lock()
                .await
                .insert(instance.id.clone(), instance);
            set_task(&state, &task_id, |t| {
                t.status = TaskStatus::Completed;
                t.completed_at_ms = Some(now_ms());
                t.message = Some(format!("instance {instance_id} starting"));
            })
            .await;
        }
        Err(message) => {
            tracing::warn!(task_id=%task_id, error=%message, "deployment failed, releasing grants");
            let released = state.manager.lock().await.release_consumer(&task_id);
            set_task(&state, &task_id, |t| {
                t.status = TaskStatus::Failed;
                t.completed_at_ms = Some(now_ms());
                t.message = Some(message);
            })
            .await;
            if !released.is_empty() {
                tracing::info!(task_id=%task_id, count=released.len(), "released accelerators after failure");
            }
        }
    }
}

async fn launch(
    state: &Arc<AgentState>,
    task_id: &str,
    port: u16,
) -> Result<ModelInstance, String> {
    let task = state
        .tasks
        .lock()
        .await
        .get(task_id)
        .cloned()
        .ok_or_else(|| format!("task {task_id} not found"))?;

    let (node, accelerator_ids) = {
        let registry = state.registry.lock().await;
        let cluster = registry
            .get_cluster(&state.args.cluster_id)
            .ok_or_else(|| "cluster not registered".to_string())?;
        let node = cluster
            .nodes
            .iter()
            .find(|n| {
                n.accelerators
                    .iter()
                    .any(|a| task.accelerator_ids.contains(&a.id))
            })
            .or_else(|| cluster.nodes.first())
            .ok_or_else(|| "cluster has no nodes".to_string())?;
        (node.clone(), task.accelerator_ids.clone())
    };

    let command = match task.deploy_command.as_deref() {
        Some(custom) => custom.to_string(),
        None => {
            let params = LaunchParams {
                model_name: task.model_name.clone(),
                model_path: Some(format!(
                    "{}/{}",
                    state.args.model_dir.trim_end_matches('/'),
                    task.model_name
                )),
                image: state.args.serving_image.clone(),
                port: Some(port),
                extra_args: Vec::new(),
            };
            state
                .adapter
                .build_launch_command(&node, &accelerator_ids, &params)
                .map_err(|e: LaunchError| e.to_string())?
        }
    };

    tracing::info!(task_id=%task_id, command=%command, "spawning workload");
    let output = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .output()
        .await
        .map_err(|e| format!("failed to spawn workload: {e}"))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(format!(
            "workload launch exited with {}: {}",
            output.status,
            stderr.trim()
        ));
    }

    Ok(ModelInstance {
        id: format!("mi-{}", uuid::Uuid::new_v4()),
        model_name: task.model_name.clone(),
        model_type: task.model_type.clone(),
        accelerator_ids: accelerator_ids.clone(),
        primary_accelerator_id: accelerator_ids.first().cloned(),
        endpoint: format!("http://{}:{}", state.args.advertise_addr, port),
        status: InstanceStatus::Starting,
        node_id: node.id,
        cluster_id: Some(state.args.cluster_id.clone()),
        created_at_ms: now_ms(),
        offline_at_ms: None,
    })
}

async fn set_task(state: &Arc<AgentState>, task_id: &str, f: impl FnOnce(&mut DeployTask)) {
    if let Some(task) = state.tasks.lock().await.get_mut(task_id) {
        f(task);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_common::{Accelerator, ClusterConfig, Node, NodeStatus};
    use flotilla_sched::{create_policy, AllocationStatus};

    fn make_cluster() -> Cluster {
        let accelerators: Vec<Accelerator> = (0..2)
            .map(|i| Accelerator {
                id: format!("n1-gpu-{i}"),
                name: "Tesla V100".to_string(),
                memory_total_mb: 16384,
                vendor: AcceleratorVendor::Nvidia,
                compute_capability: None,
                extra: serde_json::Map::new(),
            })
            .collect();
        Cluster {
            id: "c1".to_string(),
            name: "test".to_string(),
            nodes: vec![Node {
                id: "n1".to_string(),
                name: "n1".to_string(),
                address: "10.0.0.1".to_string(),
                port: 22,
                accelerators,
                status: NodeStatus::Online,
                last_heartbeat_ms: 0,
                memory_total_mb: None,
                memory_available_mb: None,
                cpu: None,
                metadata: Default::default(),
            }],
            adapter_type: "nvidia".to_string(),
            config: ClusterConfig::default(),
        }
    }

    fn make_manager(cluster: &Cluster) -> ResourceManager {
        let mut manager = ResourceManager::new(create_policy("single_node_first").unwrap());
        for node in &cluster.nodes {
            for acc in &node.accelerators {
                manager.register_accelerator(acc);
            }
        }
        manager
    }

    #[test]
    fn test_validate_requires_id_or_requirement() {
        let empty = DeployRequest {
            model_name: "m".to_string(),
            ..Default::default()
        };
        assert!(validate_deploy(&empty).is_err());

        let by_id = DeployRequest {
            model_name: "m".to_string(),
            gpu_id: Some("n1-gpu-0".to_string()),
            ..Default::default()
        };
        assert!(validate_deploy(&by_id).is_ok());

        let by_requirement = DeployRequest {
            model_name: "m".to_string(),
            gpu_count: Some(2),
            memory_required: Some(8000),
            ..Default::default()
        };
        assert!(validate_deploy(&by_requirement).is_ok());

        let unnamed = DeployRequest {
            gpu_id: Some("n1-gpu-0".to_string()),
            ..Default::default()
        };
        assert!(validate_deploy(&unnamed).is_err());
    }

    #[test]
    fn test_resolve_explicit_id() {
        let cluster = make_cluster();
        let mut manager = make_manager(&cluster);
        let req = DeployRequest {
            model_name: "m".to_string(),
            gpu_id: Some("n1-gpu-1".to_string()),
            memory_required: Some(8000),
            ..Default::default()
        };
        let ids = resolve_accelerators(&mut manager, &cluster, "t-1", &req).unwrap();
        assert_eq!(ids, vec!["n1-gpu-1".to_string()]);
        assert_eq!(
            manager.status("n1-gpu-1").unwrap().status,
            AllocationStatus::Allocated
        );
    }

    #[test]
    fn test_resolve_explicit_id_already_taken() {
        let cluster = make_cluster();
        let mut manager = make_manager(&cluster);
        manager.allocate("other", "n1-gpu-0", 0).unwrap();

        let req = DeployRequest {
            model_name: "m".to_string(),
            gpu_id: Some("n1-gpu-0".to_string()),
            ..Default::default()
        };
        let err = resolve_accelerators(&mut manager, &cluster, "t-1", &req).unwrap_err();
        assert!(err.contains("not available, current status: allocated"));
    }

    #[test]
    fn test_resolve_single_by_requirement() {
        let cluster = make_cluster();
        let mut manager = make_manager(&cluster);
        let req = DeployRequest {
            model_name: "m".to_string(),
            memory_required: Some(8000),
            gpu_type: Some("nvidia".to_string()),
            ..Default::default()
        };
        let ids = resolve_accelerators(&mut manager, &cluster, "t-1", &req).unwrap();
        assert_eq!(ids.len(), 1);
    }

    #[test]
    fn test_resolve_multi_rolls_back_on_shortfall() {
        let cluster = make_cluster();
        let mut manager = make_manager(&cluster);
        let req = DeployRequest {
            model_name: "m".to_string(),
            gpu_count: Some(3),
            memory_required: Some(8000),
            ..Default::default()
        };
        let err = resolve_accelerators(&mut manager, &cluster, "t-1", &req).unwrap_err();
        assert!(err.contains("need 3, found 2"));
        assert!(manager.is_free("n1-gpu-0"));
        assert!(manager.is_free("n1-gpu-1"));
    }
}
