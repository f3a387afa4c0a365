use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use flotilla_common::{Accelerator, AcceleratorVendor, ClusterConfig, Node};

use crate::adapter::{
    is_local, nodes_from_config, placeholder_accelerator, LaunchError, LaunchParams, VendorAdapter,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Apple Silicon: one unified-memory GPU on the local host, probed with
/// sysctl. Remote Apple nodes cannot be probed from here and get a
/// placeholder until their own agent reports in.
pub struct AppleAdapter;

impl AppleAdapter {
    pub fn new() -> Self {
        Self
    }

    async fn sysctl(key: &str) -> Option<String> {
        let fut = Command::new("sysctl").arg("-n").arg(key).output();
        match tokio::time::timeout(PROBE_TIMEOUT, fut).await {
            Ok(Ok(out)) if out.status.success() => {
                Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
            }
            _ => None,
        }
    }
}

impl Default for AppleAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VendorAdapter for AppleAdapter {
    fn adapter_type(&self) -> &'static str {
        "apple"
    }

    fn vendor(&self) -> AcceleratorVendor {
        AcceleratorVendor::Apple
    }

    fn discover_nodes(&self, config: &ClusterConfig) -> Vec<Node> {
        nodes_from_config(config, "apple")
    }

    async fn read_accelerators(&self, node: &Node) -> Vec<Accelerator> {
        if !is_local(&node.address) {
            tracing::warn!(node=%node.name, "remote apple node, recording placeholder");
            return vec![placeholder_accelerator(node, AcceleratorVendor::Apple)];
        }

        let Some(memsize) = Self::sysctl("hw.memsize").await else {
            tracing::warn!(node=%node.name, "sysctl probe failed, recording placeholder");
            return vec![placeholder_accelerator(node, AcceleratorVendor::Apple)];
        };
        let memory_total_mb = memsize.parse::<u64>().unwrap_or(0) / (1024 * 1024);

        let chip = Self::sysctl("machdep.cpu.brand_string")
            .await
            .unwrap_or_else(|| "Apple Silicon".to_string());

        let mut extra = serde_json::Map::new();
        extra.insert("unified_memory".to_string(), serde_json::Value::Bool(true));
        if let Some(cores) = Self::sysctl("hw.ncpu").await.and_then(|s| s.parse::<u64>().ok()) {
            extra.insert("cpu_cores".to_string(), serde_json::Value::from(cores));
        }

        vec![Accelerator {
            id: format!("{}-gpu-0", node.id),
            name: chip,
            memory_total_mb,
            vendor: AcceleratorVendor::Apple,
            compute_capability: None,
            extra,
        }]
    }

    fn build_launch_command(
        &self,
        _node: &Node,
        accelerator_ids: &[String],
        params: &LaunchParams,
    ) -> Result<String, LaunchError> {
        if accelerator_ids.is_empty() {
            return Err(LaunchError::NoAccelerators);
        }
        let model_path = params
            .model_path
            .as_deref()
            .ok_or(LaunchError::IncompleteParams("model_path"))?;
        let image = params
            .image
            .as_deref()
            .ok_or(LaunchError::IncompleteParams("image"))?;
        let port = params.port.ok_or(LaunchError::IncompleteParams("port"))?;

        let container = format!("flotilla-{}-{port}", params.model_name.replace([' ', '/'], "_"));

        // No device-visibility flags: the unified-memory GPU is shared with
        // the host and Docker on macOS has no --gpus equivalent.
        let mut cmd = format!(
            "docker run -d --name {container} \
             -p {port}:{port} -v {model_path}:/model {image} \
             --model /model --host 0.0.0.0 --port {port}"
        );
        for arg in &params.extra_args {
            cmd.push(' ');
            cmd.push_str(arg);
        }
        Ok(cmd)
    }
}
