use std::sync::Arc;

use anyhow::Context;
use tokio::process::Command;

use flotilla_adapter::{ResourceRegistry, VendorAdapter};
use flotilla_common::telemetry::now_ms;
use flotilla_common::{ClusterConfig, CpuInfo, Node, NodeDescriptor};
use flotilla_sched::ResourceManager;

use crate::args::Args;

/// Load the cluster config from disk, or fall back to a single local-host
/// descriptor so a bare `flotilla-agent` run manages its own machine.
pub async fn load_config(args: &Args) -> anyhow::Result<ClusterConfig> {
    match args.config.as_deref() {
        Some(path) => {
            let raw = tokio::fs::read_to_string(path)
                .await
                .with_context(|| format!("reading config {path}"))?;
            let config: ClusterConfig =
                serde_json::from_str(&raw).with_context(|| format!("parsing config {path}"))?;
            Ok(config)
        }
        None => Ok(ClusterConfig {
            nodes: vec![NodeDescriptor {
                id: Some(format!("{}-local", args.cluster_id)),
                name: Some(hostname().await),
                address: Some("127.0.0.1".to_string()),
                port: Some(22),
                ..Default::default()
            }],
            ..Default::default()
        }),
    }
}

/// Startup pass: discover the cluster, enrich local nodes with host info,
/// and register every discovered accelerator as free.
pub async fn initial_discovery(
    args: &Args,
    adapter: Arc<dyn VendorAdapter>,
    registry: &mut ResourceRegistry,
    manager: &mut ResourceManager,
) -> anyhow::Result<()> {
    let config = load_config(args).await?;
    registry.register_adapter(adapter.clone());

    let cluster = registry
        .discover_cluster(
            args.cluster_id.clone(),
            args.cluster_name.clone(),
            &args.adapter_type,
            config,
            now_ms(),
        )
        .await?;

    let accelerators: Vec<_> = cluster
        .nodes
        .iter()
        .flat_map(|n| n.accelerators.iter().cloned())
        .collect();
    tracing::info!(
        cluster_id = %args.cluster_id,
        nodes = cluster.nodes.len(),
        accelerators = accelerators.len(),
        "discovery pass complete"
    );

    for acc in &accelerators {
        manager.register_accelerator(acc);
    }

    if let Some(cluster) = registry.get_cluster_mut(&args.cluster_id) {
        for node in &mut cluster.nodes {
            if node.address == "127.0.0.1" || node.address == "localhost" {
                enrich_local_node(node).await;
            }
        }
    }

    Ok(())
}

async fn hostname() -> String {
    match Command::new("hostname").output().await {
        Ok(out) if out.status.success() => {
            String::from_utf8_lossy(&out.stdout).trim().to_string()
        }
        _ => "localhost".to_string(),
    }
}

async fn shell(cmd: &str) -> Option<String> {
    let out = Command::new("sh").arg("-c").arg(cmd).output().await.ok()?;
    if !out.status.success() {
        return None;
    }
    Some(String::from_utf8_lossy(&out.stdout).trim().to_string())
}

/// Fill in host memory, CPU, and OS metadata for a node running on this
/// machine. Best-effort: a missing tool just leaves the field unset.
pub async fn enrich_local_node(node: &mut Node) {
    if !node.metadata.contains_key("hostname") {
        let hostname = hostname().await;
        node.metadata.insert("hostname".to_string(), hostname);
    }
    node.metadata
        .entry("os".to_string())
        .or_insert_with(|| std::env::consts::OS.to_string());

    if std::env::consts::OS == "macos" {
        if let Some(mem) = shell("sysctl -n hw.memsize").await {
            node.memory_total_mb = mem.parse::<u64>().ok().map(|b| b / (1024 * 1024));
        }
        let model = shell("sysctl -n machdep.cpu.brand_string").await;
        let cores = shell("sysctl -n hw.ncpu").await;
        if let Some(model) = model {
            node.cpu = Some(CpuInfo {
                model,
                cores: cores.and_then(|c| c.parse().ok()).unwrap_or(0),
                architecture: std::env::consts::ARCH.to_string(),
                vendor: "Apple".to_string(),
            });
        }
    } else {
        // free(1) line: Mem: total used free shared buff/cache available
        if let Some(mem_line) = shell("free -m | grep Mem").await {
            let parts: Vec<&str> = mem_line.split_whitespace().collect();
            if parts.len() >= 7 {
                node.memory_total_mb = parts[1].parse().ok();
                node.memory_available_mb = parts[6].parse().ok();
            }
        }
        if let Some(lscpu) = shell("lscpu").await {
            node.cpu = Some(parse_lscpu(&lscpu));
        }
    }
}

fn parse_lscpu(output: &str) -> CpuInfo {
    let mut model = "Unknown".to_string();
    let mut cores = 0u32;
    let mut architecture = "Unknown".to_string();
    let mut vendor = "Unknown".to_string();
    for line in output.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key.trim() {
            "Model name" => model = value.to_string(),
            "CPU(s)" => cores = value.parse().unwrap_or(0),
            "Architecture" => architecture = value.to_string(),
            "Vendor ID" => vendor = value.to_string(),
            _ => {}
        }
    }
    CpuInfo {
        model,
        cores,
        architecture,
        vendor,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_lscpu() {
        let output = "Architecture:        x86_64\n\
                      CPU(s):              64\n\
                      Vendor ID:           GenuineIntel\n\
                      Model name:          Intel(R) Xeon(R) Platinum 8358\n\
                      Weird line without colon value\n";
        let cpu = parse_lscpu(output);
        assert_eq!(cpu.cores, 64);
        assert_eq!(cpu.architecture, "x86_64");
        assert_eq!(cpu.vendor, "GenuineIntel");
        assert!(cpu.model.starts_with("Intel(R) Xeon(R)"));
    }
}
