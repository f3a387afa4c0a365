use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

/// The unit of work that resolves a resource request into a running model
/// instance. One task produces at most one instance.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeployTask {
    pub id: String,
    pub model_name: String,
    #[serde(default)]
    pub model_type: Option<String>,

    /// Explicit accelerator requested by the caller, if any.
    #[serde(default)]
    pub requested_accelerator_id: Option<String>,
    #[serde(default)]
    pub requested_count: Option<u32>,
    #[serde(default)]
    pub requested_memory_mb: Option<u64>,
    #[serde(default)]
    pub requested_vendor: Option<String>,

    /// Accelerators granted to this task once scheduled.
    #[serde(default)]
    pub accelerator_ids: Vec<String>,

    pub status: TaskStatus,
    #[serde(default)]
    pub message: Option<String>,

    pub created_at_ms: u64,
    #[serde(default)]
    pub started_at_ms: Option<u64>,
    #[serde(default)]
    pub completed_at_ms: Option<u64>,

    /// Custom launch command override; when set, the adapter-built command
    /// is not used.
    #[serde(default)]
    pub deploy_command: Option<String>,
}
