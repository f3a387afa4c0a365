mod args;
mod deploy;
mod discovery;
mod handlers;
mod heartbeat;
mod poller;
mod state;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;

use flotilla_adapter::{create_adapter, ResourceRegistry};
use flotilla_common::telemetry::init_tracing;
use flotilla_sched::{create_policy, ResourceManager};

use crate::args::Args;
use crate::state::AgentState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    tracing::info!(
        cluster_id = %args.cluster_id,
        adapter = %args.adapter_type,
        policy = %args.policy,
        "flotilla-agent starting..."
    );

    let adapter = create_adapter(&args.adapter_type)
        .ok_or_else(|| anyhow::anyhow!("unknown adapter type: {}", args.adapter_type))?;
    let policy = create_policy(&args.policy).map_err(|e| anyhow::anyhow!(e))?;

    let mut registry = ResourceRegistry::new();
    let mut manager = ResourceManager::new(policy);
    discovery::initial_discovery(&args, adapter.clone(), &mut registry, &mut manager).await?;

    let listen_addr = args.listen_addr.clone();
    let state = AgentState::new(args, adapter, registry, manager);

    // First successful discovery promotes the nodes, then the record goes up.
    heartbeat::mark_discovered_nodes_online(&state).await;
    heartbeat::push_nodes(&state).await;

    tokio::spawn(heartbeat::heartbeat_loop(state.clone()));
    tokio::spawn(poller::poll_loop(state.clone()));

    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route("/deploy", post(handlers::deploy))
        .route("/tasks/:task_id", get(handlers::get_task))
        .route("/model-instances-info", get(handlers::model_instances_info))
        .route("/node-status", get(handlers::node_status))
        .route("/models/:instance_id/stop", post(handlers::stop_instance))
        .with_state(state);

    tracing::info!(addr = %listen_addr, "agent listening");
    let listener = tokio::net::TcpListener::bind(&listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
