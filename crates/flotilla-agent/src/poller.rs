use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use flotilla_common::telemetry::now_ms;
use flotilla_common::InstanceStatus;

use crate::state::AgentState;

/// Consecutive poll failures before an instance is demoted to offline.
/// Counting consecutive failures (not single ones) tolerates transient
/// network blips without flapping instance status.
pub const OFFLINE_THRESHOLD: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollVerdict {
    Healthy,
    FailedBelowThreshold,
    Demote,
}

/// Tracks consecutive failures per instance id.
#[derive(Debug, Default)]
pub struct PollTracker {
    counts: HashMap<String, u32>,
}

impl PollTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, instance_id: &str, healthy: bool) -> PollVerdict {
        if healthy {
            self.counts.remove(instance_id);
            return PollVerdict::Healthy;
        }
        let count = self.counts.entry(instance_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= OFFLINE_THRESHOLD {
            PollVerdict::Demote
        } else {
            PollVerdict::FailedBelowThreshold
        }
    }

    pub fn forget(&mut self, instance_id: &str) {
        self.counts.remove(instance_id);
    }
}

/// Background poller: hit each known instance's status endpoint on a fixed
/// interval and demote after repeated failures. A timed-out probe is a
/// failure for that cycle, not a crash; the loop retries next interval.
pub async fn poll_loop(state: Arc<AgentState>) {
    let interval = Duration::from_millis(state.args.poll_interval_ms);
    let mut tracker = PollTracker::new();
    loop {
        poll_once(&state, &mut tracker).await;
        tokio::time::sleep(interval).await;
    }
}

pub async fn poll_once(state: &Arc<AgentState>, tracker: &mut PollTracker) {
    let targets: Vec<(String, String)> = {
        let instances = state.instances.lock().await;
        instances
            .values()
            .filter(|i| i.status != InstanceStatus::Offline)
            .map(|i| (i.id.clone(), i.endpoint.clone()))
            .collect()
    };

    for (instance_id, endpoint) in targets {
        let url = format!("{}/health", endpoint.trim_end_matches('/'));
        let healthy = matches!(
            state.http.get(&url).send().await,
            Ok(resp) if resp.status().is_success()
        );

        match tracker.record(&instance_id, healthy) {
            PollVerdict::Healthy => {
                let mut instances = state.instances.lock().await;
                if let Some(inst) = instances.get_mut(&instance_id) {
                    if inst.status == InstanceStatus::Starting {
                        tracing::info!(instance_id=%instance_id, "instance is up");
                    }
                    inst.status = InstanceStatus::Online;
                }
            }
            PollVerdict::FailedBelowThreshold => {
                tracing::warn!(instance_id=%instance_id, "instance poll failed");
            }
            PollVerdict::Demote => {
                tracing::warn!(instance_id=%instance_id, "instance offline after repeated poll failures");
                let mut instances = state.instances.lock().await;
                if let Some(inst) = instances.get_mut(&instance_id) {
                    inst.status = InstanceStatus::Offline;
                    inst.offline_at_ms = Some(now_ms());
                }
                tracker.forget(&instance_id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_failure_does_not_demote() {
        let mut tracker = PollTracker::new();
        assert_eq!(tracker.record("m-1", false), PollVerdict::FailedBelowThreshold);
        assert_eq!(tracker.record("m-1", false), PollVerdict::FailedBelowThreshold);
    }

    #[test]
    fn test_threshold_demotes() {
        let mut tracker = PollTracker::new();
        tracker.record("m-1", false);
        tracker.record("m-1", false);
        assert_eq!(tracker.record("m-1", false), PollVerdict::Demote);
    }

    #[test]
    fn test_success_resets_counter() {
        let mut tracker = PollTracker::new();
        tracker.record("m-1", false);
        tracker.record("m-1", false);
        assert_eq!(tracker.record("m-1", true), PollVerdict::Healthy);
        // Counter restarted: two more failures still below threshold.
        assert_eq!(tracker.record("m-1", false), PollVerdict::FailedBelowThreshold);
        assert_eq!(tracker.record("m-1", false), PollVerdict::FailedBelowThreshold);
    }

    #[test]
    fn test_counters_are_per_instance() {
        let mut tracker = PollTracker::new();
        tracker.record("m-1", false);
        tracker.record("m-1", false);
        assert_eq!(tracker.record("m-2", false), PollVerdict::FailedBelowThreshold);
        assert_eq!(tracker.record("m-1", false), PollVerdict::Demote);
    }
}
