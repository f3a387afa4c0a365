use clap::Parser;

#[derive(Debug, Clone, Parser)]
pub struct Args {
    /// Cluster this agent manages.
    #[arg(long, env = "FLOTILLA_CLUSTER_ID")]
    pub cluster_id: String,

    #[arg(long, env = "FLOTILLA_CLUSTER_NAME", default_value = "default")]
    pub cluster_name: String,

    /// Vendor adapter governing every node in this cluster.
    #[arg(long, env = "FLOTILLA_ADAPTER", default_value = "nvidia")]
    pub adapter_type: String,

    /// Path to a JSON cluster config (node descriptors). Without it the
    /// agent manages the local host only.
    #[arg(long, env = "FLOTILLA_CONFIG")]
    pub config: Option<String>,

    /// Center aggregator base URL. Without it the agent runs standalone.
    #[arg(long, env = "FLOTILLA_CENTER_URL")]
    pub center_url: Option<String>,

    #[arg(long, default_value = "0.0.0.0:21001")]
    pub listen_addr: String,

    /// Address other processes use to reach instances launched here.
    #[arg(long, default_value = "127.0.0.1")]
    pub advertise_addr: String,

    #[arg(long, default_value_t = 30_000)]
    pub heartbeat_interval_ms: u64,

    #[arg(long, default_value_t = 30_000)]
    pub poll_interval_ms: u64,

    /// Allocation policy: single_node_first, memory_optimized, utilization_aware.
    #[arg(long, default_value = "single_node_first")]
    pub policy: String,

    /// Serving image used when a deploy request has no command override.
    #[arg(long, env = "FLOTILLA_SERVING_IMAGE")]
    pub serving_image: Option<String>,

    /// Directory the model weights live under; a deploy for model M mounts
    /// {model_dir}/{M}.
    #[arg(long, default_value = "/models")]
    pub model_dir: String,

    /// First port handed to launched instances; subsequent launches count up.
    #[arg(long, default_value_t = 21002)]
    pub instance_base_port: u16,
}
