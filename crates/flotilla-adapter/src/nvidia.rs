use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use flotilla_common::{Accelerator, AcceleratorVendor, ClusterConfig, Node};

use crate::adapter::{
    device_indices, is_local, nodes_from_config, placeholder_accelerator, LaunchError,
    LaunchParams, VendorAdapter,
};

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

const SMI_QUERY: &str =
    "nvidia-smi --query-gpu=index,name,memory.total,driver_version,utilization.gpu \
     --format=csv,noheader,nounits";

/// Discrete NVIDIA GPUs, probed with nvidia-smi: locally for loopback
/// nodes, over ssh otherwise (credentials come from node metadata).
pub struct NvidiaAdapter;

impl NvidiaAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NvidiaAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl VendorAdapter for NvidiaAdapter {
    fn adapter_type(&self) -> &'static str {
        "nvidia"
    }

    fn vendor(&self) -> AcceleratorVendor {
        AcceleratorVendor::Nvidia
    }

    fn discover_nodes(&self, config: &ClusterConfig) -> Vec<Node> {
        nodes_from_config(config, "nvidia")
    }

    async fn read_accelerators(&self, node: &Node) -> Vec<Accelerator> {
        let output = if is_local(&node.address) {
            Command::new("sh").arg("-c").arg(SMI_QUERY).output()
        } else {
            let user = node
                .metadata
                .get("username")
                .cloned()
                .unwrap_or_else(|| "root".to_string());
            let mut cmd = Command::new("ssh");
            cmd.arg("-o")
                .arg("StrictHostKeyChecking=no")
                .arg("-o")
                .arg("ConnectTimeout=5")
                .arg("-p")
                .arg(node.port.to_string())
                .arg(format!("{user}@{}", node.address))
                .arg(SMI_QUERY);
            cmd.output()
        };

        let output = match tokio::time::timeout(PROBE_TIMEOUT, output).await {
            Ok(Ok(out)) if out.status.success() => out,
            Ok(Ok(out)) => {
                tracing::warn!(
                    node=%node.name,
                    status=%out.status,
                    "nvidia-smi probe failed, recording placeholder"
                );
                return vec![placeholder_accelerator(node, AcceleratorVendor::Nvidia)];
            }
            Ok(Err(e)) => {
                tracing::warn!(node=%node.name, error=%e, "nvidia-smi probe failed, recording placeholder");
                return vec![placeholder_accelerator(node, AcceleratorVendor::Nvidia)];
            }
            Err(_) => {
                tracing::warn!(node=%node.name, "nvidia-smi probe timed out, recording placeholder");
                return vec![placeholder_accelerator(node, AcceleratorVendor::Nvidia)];
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let accelerators = parse_nvidia_smi(&node.id, &stdout);
        if accelerators.is_empty() {
            tracing::warn!(node=%node.name, "nvidia-smi output had no parseable GPUs");
            return vec![placeholder_accelerator(node, AcceleratorVendor::Nvidia)];
        }
        accelerators
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

        let devices = device_indices(accelerator_ids).join(",");
        let container = format!("flotilla-{}-{port}", params.model_name.replace([' ', '/'], "_"));

        let mut cmd = format!(
            "docker run -d --name {container} --gpus '\"device={devices}\"' \
             -e CUDA_VISIBLE_DEVICES={devices} \
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

/// Parse `nvidia-smi --query-gpu=index,name,memory.total,driver_version,
/// utilization.gpu` CSV output into accelerator records.
fn parse_nvidia_smi(node_id: &str, output: &str) -> Vec<Accelerator> {
    let mut out = Vec::new();
    for line in output.lines() {
        let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
        if parts.len() < 3 {
            continue;
        }
        let index = parts[0];
        let name = parts[1].to_string();
        let memory_total_mb = parts[2].parse::<u64>().unwrap_or(0);

        let mut extra = serde_json::Map::new();
        if let Some(driver) = parts.get(3).filter(|s| !s.is_empty()) {
            extra.insert(
                "driver_version".to_string(),
                serde_json::Value::String(driver.to_string()),
            );
        }
        if let Some(util) = parts.get(4).and_then(|s| s.parse::<u64>().ok()) {
            extra.insert("utilization".to_string(), serde_json::Value::from(util));
        }

        out.push(Accelerator {
            id: format!("{node_id}-gpu-{index}"),
            name,
            memory_total_mb,
            vendor: AcceleratorVendor::Nvidia,
            compute_capability: None,
            extra,
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_common::NodeDescriptor;

    fn make_node() -> Node {
        nodes_from_config(
            &ClusterConfig {
                nodes: vec![NodeDescriptor {
                    id: Some("n1".into()),
                    address: Some("10.0.0.1".into()),
                    ..Default::default()
                }],
                ..Default::default()
            },
            "nvidia",
        )
        .remove(0)
    }

    #[test]
    fn test_parse_nvidia_smi() {
        let output = "0, NVIDIA A100-SXM4-40GB, 40960, 535.129.03, 12\n\
                      1, NVIDIA A100-SXM4-40GB, 40960, 535.129.03, 0\n";
        let accs = parse_nvidia_smi("n1", output);
        assert_eq!(accs.len(), 2);
        assert_eq!(accs[0].id, "n1-gpu-0");
        assert_eq!(accs[0].memory_total_mb, 40960);
        assert_eq!(accs[0].vendor, AcceleratorVendor::Nvidia);
        assert_eq!(accs[0].utilization(), 12);
        assert_eq!(accs[1].utilization(), 0);
        assert_eq!(
            accs[0].extra.get("driver_version").and_then(|v| v.as_str()),
            Some("535.129.03")
        );
    }

    #[test]
    fn test_parse_nvidia_smi_skips_garbage() {
        let accs = parse_nvidia_smi("n1", "not,csv\n\n0, Tesla V100, 16384\n");
        assert_eq!(accs.len(), 1);
        assert_eq!(accs[0].name, "Tesla V100");
        assert_eq!(accs[0].utilization(), 0);
    }

    #[test]
    fn test_build_launch_command() {
        let adapter = NvidiaAdapter::new();
        let node = make_node();
        let params = LaunchParams {
            model_name: "qwen2.5-0.5b".into(),
            model_path: Some("/models/qwen".into()),
            image: Some("vllm/vllm-openai:v0.6".into()),
            port: Some(21002),
            extra_args: vec!["--max-model-len".into(), "4096".into()],
        };
        let cmd = adapter
            .build_launch_command(&node, &["n1-gpu-0".into(), "n1-gpu-1".into()], &params)
            .unwrap();
        assert!(cmd.contains("device=0,1"));
        assert!(cmd.contains("CUDA_VISIBLE_DEVICES=0,1"));
        assert!(cmd.contains("-p 21002:21002"));
        assert!(cmd.contains("-v /models/qwen:/model"));
        assert!(cmd.ends_with("--max-model-len 4096"));
    }

    #[test]
    fn test_build_launch_command_incomplete_params() {
        let adapter = NvidiaAdapter::new();
        let node = make_node();
        let params = LaunchParams {
            model_name: "m".into(),
            model_path: None,
            image: Some("img".into()),
            port: Some(1),
            extra_args: vec![],
        };
        let err = adapter
            .build_launch_command(&node, &["n1-gpu-0".into()], &params)
            .unwrap_err();
        assert_eq!(err, LaunchError::IncompleteParams("model_path"));
        assert!(err.to_string().contains("incomplete parameters"));
    }
}
