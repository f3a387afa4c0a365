use flotilla_common::{Accelerator, Cluster, Node, NodeStatus};

/// Result of a policy run. Policies are pure: they pick accelerators, the
/// resource manager commits (or rolls back) the grants.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationOutcome {
    pub success: bool,
    /// node id → accelerator ids granted on that node.
    pub per_node: Vec<(String, Vec<String>)>,
    pub message: String,
}

impl AllocationOutcome {
    fn failure(message: String) -> Self {
        Self {
            success: false,
            per_node: Vec::new(),
            message,
        }
    }

    fn shortfall(needed: u32, found: usize) -> Self {
        Self::failure(format!("insufficient accelerators: need {needed}, found {found}"))
    }

    pub fn accelerator_ids(&self) -> Vec<String> {
        self.per_node
            .iter()
            .flat_map(|(_, ids)| ids.iter().cloned())
            .collect()
    }
}

/// Trait for pluggable allocation strategies. The request is "count
/// accelerators, each with at least memory_mb" against the cluster's
/// current view; all-or-nothing, ties broken by accelerator id for
/// reproducibility.
pub trait AllocationPolicy: Send + Sync {
    fn allocate(&self, cluster: &Cluster, count: u32, memory_mb: u64) -> AllocationOutcome;

    /// Human-readable name for logging / selection.
    fn name(&self) -> &'static str;
}

fn eligible<'a>(node: &'a Node, memory_mb: u64) -> Vec<&'a Accelerator> {
    if node.status != NodeStatus::Online {
        return Vec::new();
    }
    node.accelerators
        .iter()
        .filter(|a| a.memory_total_mb >= memory_mb)
        .collect()
}

fn group_per_node(selected: Vec<(&Node, &Accelerator)>) -> Vec<(String, Vec<String>)> {
    let mut per_node: Vec<(String, Vec<String>)> = Vec::new();
    for (node, acc) in selected {
        match per_node.iter_mut().find(|(id, _)| *id == node.id) {
            Some((_, ids)) => ids.push(acc.id.clone()),
            None => per_node.push((node.id.clone(), vec![acc.id.clone()])),
        }
    }
    per_node
}

// ---------------------------------------------------------------------------
// SingleNodeFirst — keep a model's accelerators on one node when possible
// ---------------------------------------------------------------------------

pub struct SingleNodeFirst;

impl AllocationPolicy for SingleNodeFirst {
    fn allocate(&self, cluster: &Cluster, count: u32, memory_mb: u64) -> AllocationOutcome {
        let count_usize = count as usize;

        // Phase 1: one node that can hold the whole request, largest
        // accelerators first.
        for node in &cluster.nodes {
            let mut candidates = eligible(node, memory_mb);
            if candidates.len() < count_usize {
                continue;
            }
            candidates.sort_by(|a, b| {
                b.memory_total_mb
                    .cmp(&a.memory_total_mb)
                    .then_with(|| a.id.cmp(&b.id))
            });
            let ids: Vec<String> = candidates[..count_usize].iter().map(|a| a.id.clone()).collect();
            return AllocationOutcome {
                success: true,
                per_node: vec![(node.id.clone(), ids)],
                message: format!("allocated {count} accelerator(s) on node {}", node.name),
            };
        }

        // Phase 2: greedy cross-node pass, visiting nodes with the most
        // eligible accelerators first to touch as few nodes as possible.
        let mut ranked: Vec<(&Node, Vec<&Accelerator>)> = cluster
            .nodes
            .iter()
            .map(|n| (n, eligible(n, memory_mb)))
            .filter(|(_, accs)| !accs.is_empty())
            .collect();
        ranked.sort_by(|(na, a), (nb, b)| b.len().cmp(&a.len()).then_with(|| na.id.cmp(&nb.id)));

        let total: usize = ranked.iter().map(|(_, accs)| accs.len()).sum();
        if total < count_usize {
            return AllocationOutcome::shortfall(count, total);
        }

        let mut selected: Vec<(&Node, &Accelerator)> = Vec::new();
        let mut remaining = count_usize;
        for (node, mut accs) in ranked {
            if remaining == 0 {
                break;
            }
            accs.sort_by(|a, b| {
                b.memory_total_mb
                    .cmp(&a.memory_total_mb)
                    .then_with(|| a.id.cmp(&b.id))
            });
            for acc in accs.into_iter().take(remaining) {
                selected.push((node, acc));
                remaining -= 1;
            }
        }

        let node_count = selected
            .iter()
            .map(|(n, _)| n.id.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len();
        AllocationOutcome {
            success: true,
            per_node: group_per_node(selected),
            message: format!("allocated {count} accelerator(s) across {node_count} node(s)"),
        }
    }

    fn name(&self) -> &'static str {
        "single_node_first"
    }
}

// ---------------------------------------------------------------------------
// MemoryOptimized — biggest free memory per device, for large single models
// ---------------------------------------------------------------------------

pub struct MemoryOptimized;

impl AllocationPolicy for MemoryOptimized {
    fn allocate(&self, cluster: &Cluster, count: u32, memory_mb: u64) -> AllocationOutcome {
        let mut flat: Vec<(&Node, &Accelerator)> = cluster
            .nodes
            .iter()
            .flat_map(|n| eligible(n, memory_mb).into_iter().map(move |a| (n, a)))
            .collect();

        if flat.len() < count as usize {
            return AllocationOutcome::shortfall(count, flat.len());
        }

        flat.sort_by(|(_, a), (_, b)| {
            b.memory_total_mb
                .cmp(&a.memory_total_mb)
                .then_with(|| a.id.cmp(&b.id))
        });
        flat.truncate(count as usize);

        AllocationOutcome {
            success: true,
            per_node: group_per_node(flat),
            message: format!("allocated {count} accelerator(s) by descending memory"),
        }
    }

    fn name(&self) -> &'static str {
        "memory_optimized"
    }
}

// ---------------------------------------------------------------------------
// UtilizationAware — lowest reported utilization first, to balance load.
// The utilization sample defaults to 0 when unknown; treat this policy as a
// stub until a real telemetry source feeds the sample.
// ---------------------------------------------------------------------------

pub struct UtilizationAware;

impl AllocationPolicy for UtilizationAware {
    fn allocate(&self, cluster: &Cluster, count: u32, memory_mb: u64) -> AllocationOutcome {
        let mut flat: Vec<(&Node, &Accelerator)> = cluster
            .nodes
            .iter()
            .flat_map(|n| eligible(n, memory_mb).into_iter().map(move |a| (n, a)))
            .collect();

        if flat.len() < count as usize {
            return AllocationOutcome::shortfall(count, flat.len());
        }

        flat.sort_by(|(_, a), (_, b)| {
            a.utilization()
                .cmp(&b.utilization())
                .then_with(|| a.id.cmp(&b.id))
        });
        flat.truncate(count as usize);

        AllocationOutcome {
            success: true,
            per_node: group_per_node(flat),
            message: format!("allocated {count} accelerator(s) by ascending utilization"),
        }
    }

    fn name(&self) -> &'static str {
        "utilization_aware"
    }
}

/// Parse a policy name into a boxed policy.
pub fn create_policy(name: &str) -> Result<Box<dyn AllocationPolicy>, String> {
    match name {
        "single_node_first" => Ok(Box::new(SingleNodeFirst)),
        "memory_optimized" => Ok(Box::new(MemoryOptimized)),
        "utilization_aware" => Ok(Box::new(UtilizationAware)),
        other => Err(format!(
            "unknown allocation policy '{}', available: single_node_first, memory_optimized, utilization_aware",
            other
        )),
    }
}
