use tokio::process::Command;

use flotilla_common::Cluster;

use crate::args::Args;

/// Outcome of agent provisioning for a freshly registered cluster.
pub enum ProvisionOutcome {
    /// Agent spawned on this host.
    LaunchedLocally,
    /// Entry point is remote: installing and starting the agent there is
    /// an operator concern, not ours.
    Delegated,
}

pub fn is_local_host(address: &str) -> bool {
    matches!(address, "127.0.0.1" | "localhost" | "::1")
}

/// Provision the cluster's agent. Loopback entry points get a local child
/// process; anything else is acknowledged and left to the operator.
pub async fn provision_agent(args: &Args, cluster: &Cluster) -> anyhow::Result<ProvisionOutcome> {
    let entry = cluster.config.entry_address.as_deref().unwrap_or_default();
    if !is_local_host(entry) {
        tracing::info!(
            cluster_id = %cluster.id,
            entry = %entry,
            "remote entry point, agent provisioning delegated to operator"
        );
        return Ok(ProvisionOutcome::Delegated);
    }

    let mut cmd = Command::new(&args.agent_binary);
    cmd.arg("--cluster-id")
        .arg(&cluster.id)
        .arg("--cluster-name")
        .arg(&cluster.name)
        .arg("--adapter-type")
        .arg(&cluster.adapter_type)
        .arg("--center-url")
        .arg(&args.advertise_url);

    let child = cmd.spawn()?;
    tracing::info!(
        cluster_id = %cluster.id,
        pid = ?child.id(),
        "launched local cluster agent"
    );
    // The agent outlives this handle; it re-registers on its own heartbeat.
    drop(child);
    Ok(ProvisionOutcome::LaunchedLocally)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_local_host() {
        assert!(is_local_host("127.0.0.1"));
        assert!(is_local_host("localhost"));
        assert!(!is_local_host("10.0.0.1"));
        assert!(!is_local_host(""));
    }
}
