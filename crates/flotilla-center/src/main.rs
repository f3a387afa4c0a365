mod args;
mod handlers;
mod poll;
mod provision;
mod state;

use std::sync::Arc;

use axum::{
    routing::{get, post},
    Router,
};
use clap::Parser;

use flotilla_common::telemetry::init_tracing;
use flotilla_meta::{Catalog, EtcdMetaStore, MemoryMetaStore, MetaStore};

use crate::args::Args;
use crate::state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let args = Args::parse();
    tracing::info!(addr = %args.listen_addr, "flotilla-center starting...");

    let store: Arc<dyn MetaStore> = match args.etcd_endpoint.clone() {
        Some(endpoint) => {
            let store = EtcdMetaStore::connect(std::slice::from_ref(&endpoint)).await?;
            tracing::info!(%endpoint, "connected to etcd");
            Arc::new(store)
        }
        None => {
            tracing::warn!("no etcd endpoint configured, state is in-process only");
            Arc::new(MemoryMetaStore::new())
        }
    };
    let catalog = Arc::new(Catalog::new(store));

    let state = AppState::new(args.clone(), catalog);

    tokio::spawn(poll::poll_loop(state.clone()));

    let app = Router::new()
        .route("/healthz", get(handlers::healthz))
        .route(
            "/api/clusters",
            get(handlers::list_clusters).post(handlers::register_cluster),
        )
        .route(
            "/api/clusters/:cluster_id",
            get(handlers::get_cluster).delete(handlers::delete_cluster),
        )
        .route("/api/clusters/:cluster_id/nodes", get(handlers::get_cluster_nodes))
        .route("/api/clusters/:cluster_id/update_node", post(handlers::update_node))
        .route(
            "/api/clusters/:cluster_id/model-instances",
            get(handlers::list_cluster_instances),
        )
        .route("/api/register_node", post(handlers::register_node))
        .route("/api/model-instances", get(handlers::list_instances))
        .route(
            "/api/nodes/:node_id/model-instances",
            get(handlers::list_node_instances),
        )
        .route("/api/deploy", post(handlers::deploy))
        .route("/api/tasks/:task_id", get(handlers::get_task))
        .route("/api/dashboard", get(handlers::dashboard))
        .with_state(state.clone());

    tracing::info!(addr = %state.args.listen_addr, "center listening");
    let listener = tokio::net::TcpListener::bind(&state.args.listen_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}
