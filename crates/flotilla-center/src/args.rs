use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct Args {
    #[arg(long, default_value = "0.0.0.0:5001")]
    pub listen_addr: String,

    /// URL agents use to reach this aggregator (handed to locally
    /// provisioned agents).
    #[arg(long, env = "FLOTILLA_ADVERTISE_URL", default_value = "http://127.0.0.1:5001")]
    pub advertise_url: String,

    /// Shared-store endpoint. Without it the aggregator keeps state in an
    /// in-process store (lost on restart).
    #[arg(long, env = "FLOTILLA_ETCD_ENDPOINT")]
    pub etcd_endpoint: Option<String>,

    #[arg(long, default_value_t = 30_000)]
    pub poll_interval_ms: u64,

    /// Agent binary spawned when a registered cluster's entry point is this
    /// host.
    #[arg(long, default_value = "flotilla-agent")]
    pub agent_binary: String,
}
