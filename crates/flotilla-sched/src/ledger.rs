use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

use flotilla_common::{Accelerator, AcceleratorVendor, Cluster};

use crate::policy::{AllocationOutcome, AllocationPolicy};

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Free,
    Allocated,
}

impl std::fmt::Display for AllocationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AllocationStatus::Free => write!(f, "free"),
            AllocationStatus::Allocated => write!(f, "allocated"),
        }
    }
}

/// One ledger row. Invariant: `status == Allocated` iff `consumer_id` is
/// set; release clears both together.
#[derive(Debug, Clone, PartialEq)]
pub struct AllocationRecord {
    pub consumer_id: Option<String>,
    pub memory_mb: u64,
    pub status: AllocationStatus,
    pub allocated_at_ms: u64,
}

impl AllocationRecord {
    fn free() -> Self {
        Self {
            consumer_id: None,
            memory_mb: 0,
            status: AllocationStatus::Free,
            allocated_at_ms: 0,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("accelerator {0} not found")]
    NotFound(String),
    #[error("accelerator {id} not available, current status: {status}")]
    NotAvailable { id: String, status: AllocationStatus },
}

#[derive(Debug, Clone)]
struct Entry {
    vendor: AcceleratorVendor,
    memory_total_mb: u64,
    record: AllocationRecord,
}

/// The authoritative map from accelerator id to its current owner. Wraps
/// the active policy; every multi-accelerator grant commits fully or rolls
/// back fully. Callers serialize access (the agent holds this behind a
/// mutex); the ledger itself is plain owned state.
pub struct ResourceManager {
    policy: Box<dyn AllocationPolicy>,
    entries: BTreeMap<String, Entry>,
}

impl ResourceManager {
    pub fn new(policy: Box<dyn AllocationPolicy>) -> Self {
        Self {
            policy,
            entries: BTreeMap::new(),
        }
    }

    pub fn policy_name(&self) -> &'static str {
        self.policy.name()
    }

    pub fn set_policy(&mut self, policy: Box<dyn AllocationPolicy>) {
        tracing::info!(policy = policy.name(), "allocation policy changed");
        self.policy = policy;
    }

    /// Register (or re-register) an accelerator as free. Discovery calls
    /// this for every device it finds; re-registering an allocated
    /// accelerator keeps its current grant.
    pub fn register_accelerator(&mut self, accelerator: &Accelerator) {
        self.entries
            .entry(accelerator.id.clone())
            .and_modify(|e| {
                e.vendor = accelerator.vendor;
                e.memory_total_mb = accelerator.memory_total_mb;
            })
            .or_insert(Entry {
                vendor: accelerator.vendor,
                memory_total_mb: accelerator.memory_total_mb,
                record: AllocationRecord::free(),
            });
    }

    pub fn allocate(
        &mut self,
        consumer_id: &str,
        accelerator_id: &str,
        memory_mb: u64,
    ) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get_mut(accelerator_id)
            .ok_or_else(|| LedgerError::NotFound(accelerator_id.to_string()))?;
        if entry.record.status != AllocationStatus::Free {
            return Err(LedgerError::NotAvailable {
                id: accelerator_id.to_string(),
                status: entry.record.status,
            });
        }
        entry.record = AllocationRecord {
            consumer_id: Some(consumer_id.to_string()),
            memory_mb,
            status: AllocationStatus::Allocated,
            allocated_at_ms: now_ms(),
        };
        Ok(())
    }

    /// Release clears the consumer and the grant atomically; the
    /// accelerator is immediately eligible for reselection.
    pub fn release(&mut self, accelerator_id: &str) -> Result<(), LedgerError> {
        let entry = self
            .entries
            .get_mut(accelerator_id)
            .ok_or_else(|| LedgerError::NotFound(accelerator_id.to_string()))?;
        entry.record = AllocationRecord::free();
        Ok(())
    }

    pub fn status(&self, accelerator_id: &str) -> Result<&AllocationRecord, LedgerError> {
        self.entries
            .get(accelerator_id)
            .map(|e| &e.record)
            .ok_or_else(|| LedgerError::NotFound(accelerator_id.to_string()))
    }

    pub fn is_free(&self, accelerator_id: &str) -> bool {
        self.entries
            .get(accelerator_id)
            .map(|e| e.record.status == AllocationStatus::Free)
            .unwrap_or(false)
    }

    /// First free accelerator matching the vendor/memory requirement, in
    /// stable id order.
    pub fn find_free(&self, memory_mb: u64, vendor: Option<AcceleratorVendor>) -> Option<String> {
        self.entries
            .iter()
            .find(|(_, e)| {
                e.record.status == AllocationStatus::Free
                    && e.memory_total_mb >= memory_mb
                    && vendor.map(|v| e.vendor == v).unwrap_or(true)
            })
            .map(|(id, _)| id.clone())
    }

    /// Run the active policy against the ledger-free view of the cluster
    /// and commit every grant; a failed commit rolls all of them back.
    pub fn allocate_with_policy(
        &mut self,
        cluster: &Cluster,
        consumer_id: &str,
        count: u32,
        memory_mb: u64,
    ) -> AllocationOutcome {
        // Policy only ever sees accelerators the ledger can actually grant.
        let mut view = cluster.clone();
        for node in &mut view.nodes {
            node.accelerators.retain(|a| self.is_free(&a.id));
        }

        let outcome = self.policy.allocate(&view, count, memory_mb);
        if !outcome.success {
            return outcome;
        }

        let mut granted: Vec<String> = Vec::new();
        for id in outcome.accelerator_ids() {
            match self.allocate(consumer_id, &id, memory_mb) {
                Ok(()) => granted.push(id),
                Err(e) => {
                    for g in &granted {
                        let _ = self.release(g);
                    }
                    return AllocationOutcome {
                        success: false,
                        per_node: Vec::new(),
                        message: format!("allocation rolled back: {e}"),
                    };
                }
            }
        }
        outcome
    }

    /// Release every accelerator held by a consumer (task cleanup path).
    pub fn release_consumer(&mut self, consumer_id: &str) -> Vec<String> {
        let held: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, e)| e.record.consumer_id.as_deref() == Some(consumer_id))
            .map(|(id, _)| id.clone())
            .collect();
        for id in &held {
            let _ = self.release(id);
        }
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{MemoryOptimized, SingleNodeFirst};
    use flotilla_common::{ClusterConfig, Node, NodeStatus};

    fn make_acc(node_id: &str, index: u32, memory_mb: u64) -> Accelerator {
        Accelerator {
            id: format!("{node_id}-gpu-{index}"),
            name: "Tesla V100".to_string(),
            memory_total_mb: memory_mb,
            vendor: AcceleratorVendor::Nvidia,
            compute_capability: None,
            extra: serde_json::Map::new(),
        }
    }

    fn make_cluster(accs_per_node: &[(&str, &[u64])]) -> Cluster {
        let nodes = accs_per_node
            .iter()
            .map(|(id, mems)| Node {
                id: id.to_string(),
                name: id.to_string(),
                address: "10.0.0.1".to_string(),
                port: 22,
                accelerators: mems
                    .iter()
                    .enumerate()
                    .map(|(i, m)| make_acc(id, i as u32, *m))
                    .collect(),
                status: NodeStatus::Online,
                last_heartbeat_ms: 0,
                memory_total_mb: None,
                memory_available_mb: None,
                cpu: None,
                metadata: Default::default(),
            })
            .collect();
        Cluster {
            id: "c1".to_string(),
            name: "test".to_string(),
            nodes,
            adapter_type: "nvidia".to_string(),
            config: ClusterConfig::default(),
        }
    }

    fn make_manager(cluster: &Cluster) -> ResourceManager {
        let mut manager = ResourceManager::new(Box::new(SingleNodeFirst));
        for node in &cluster.nodes {
            for acc in &node.accelerators {
                manager.register_accelerator(acc);
            }
        }
        manager
    }

    #[test]
    fn test_allocate_one_of_two() {
        let cluster = make_cluster(&[("n1", &[16384, 16384])]);
        let mut manager = make_manager(&cluster);

        let out = manager.allocate_with_policy(&cluster, "m-1", 1, 8000);
        assert!(out.success);
        let ids = out.accelerator_ids();
        assert_eq!(ids.len(), 1);

        let record = manager.status(&ids[0]).unwrap();
        assert_eq!(record.status, AllocationStatus::Allocated);
        assert_eq!(record.consumer_id.as_deref(), Some("m-1"));
        assert_eq!(record.memory_mb, 8000);
    }

    #[test]
    fn test_shortfall_leaves_ledger_untouched() {
        let cluster = make_cluster(&[("n1", &[16384, 16384])]);
        let mut manager = make_manager(&cluster);

        let out = manager.allocate_with_policy(&cluster, "m-1", 3, 8000);
        assert!(!out.success);
        assert!(out.message.contains("need 3, found 2"));
        assert!(manager.is_free("n1-gpu-0"));
        assert!(manager.is_free("n1-gpu-1"));
    }

    #[test]
    fn test_allocated_accelerators_invisible_to_policy() {
        let cluster = make_cluster(&[("n1", &[16384, 16384])]);
        let mut manager = make_manager(&cluster);

        assert!(manager.allocate_with_policy(&cluster, "m-1", 2, 8000).success);
        let out = manager.allocate_with_policy(&cluster, "m-2", 1, 8000);
        assert!(!out.success);
        assert!(out.message.contains("need 1, found 0"));
    }

    #[test]
    fn test_double_allocate_reports_current_status() {
        let cluster = make_cluster(&[("n1", &[16384])]);
        let mut manager = make_manager(&cluster);

        manager.allocate("m-1", "n1-gpu-0", 8000).unwrap();
        let err = manager.allocate("m-2", "n1-gpu-0", 8000).unwrap_err();
        assert_eq!(
            err.to_string(),
            "accelerator n1-gpu-0 not available, current status: allocated"
        );
    }

    #[test]
    fn test_release_unknown_is_not_found() {
        let mut manager = ResourceManager::new(Box::new(SingleNodeFirst));
        let err = manager.release("ghost").unwrap_err();
        assert_eq!(err, LedgerError::NotFound("ghost".to_string()));
    }

    #[test]
    fn test_release_clears_consumer_and_status_together() {
        let cluster = make_cluster(&[("n1", &[16384])]);
        let mut manager = make_manager(&cluster);

        manager.allocate("m-1", "n1-gpu-0", 8000).unwrap();
        manager.release("n1-gpu-0").unwrap();

        let record = manager.status("n1-gpu-0").unwrap();
        assert_eq!(record.status, AllocationStatus::Free);
        assert_eq!(record.consumer_id, None);
        assert_eq!(record.memory_mb, 0);
    }

    #[test]
    fn test_released_accelerator_reselected_by_memory_optimized() {
        let cluster = make_cluster(&[("n1", &[40960, 16384])]);
        let mut manager = make_manager(&cluster);
        manager.set_policy(Box::new(MemoryOptimized));

        let first = manager.allocate_with_policy(&cluster, "m-1", 1, 8000);
        assert_eq!(first.accelerator_ids(), vec!["n1-gpu-0".to_string()]);

        manager.release("n1-gpu-0").unwrap();

        // Now the largest free accelerator again → same id.
        let second = manager.allocate_with_policy(&cluster, "m-2", 1, 8000);
        assert_eq!(second.accelerator_ids(), vec!["n1-gpu-0".to_string()]);
    }

    #[test]
    fn test_find_free_respects_vendor_and_memory() {
        let cluster = make_cluster(&[("n1", &[16384, 40960])]);
        let mut manager = make_manager(&cluster);

        assert_eq!(
            manager.find_free(20000, Some(AcceleratorVendor::Nvidia)),
            Some("n1-gpu-1".to_string())
        );
        assert_eq!(manager.find_free(8000, Some(AcceleratorVendor::Apple)), None);

        manager.allocate("m-1", "n1-gpu-1", 20000).unwrap();
        assert_eq!(manager.find_free(20000, None), None);
    }

    #[test]
    fn test_release_consumer_frees_everything_it_held() {
        let cluster = make_cluster(&[("n1", &[16384, 16384, 16384])]);
        let mut manager = make_manager(&cluster);

        assert!(manager.allocate_with_policy(&cluster, "m-1", 2, 8000).success);
        manager.allocate("m-2", "n1-gpu-2", 8000).unwrap();

        let mut released = manager.release_consumer("m-1");
        released.sort();
        assert_eq!(released.len(), 2);
        assert!(manager.is_free(&released[0]));
        assert!(manager.is_free(&released[1]));
        // m-2's grant untouched.
        assert_eq!(
            manager.status("n1-gpu-2").unwrap().status,
            AllocationStatus::Allocated
        );
    }
}
