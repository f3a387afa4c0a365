pub mod accelerator;
pub mod api;
pub mod cluster;
pub mod instance;
pub mod node;
pub mod task;
pub mod telemetry;

pub use accelerator::{Accelerator, AcceleratorVendor};
pub use api::{
    ApiResponse, DeployRequest, DeployResponse, ModelInstancesInfo, NodeStatusInfo,
    RegisterClusterRequest, RegisterNodeRequest, UpdateNodeRequest,
};
pub use cluster::{Cluster, ClusterConfig, ClusterSummary, NodeDescriptor};
pub use instance::{InstanceStatus, ModelInstance};
pub use node::{CpuInfo, Node, NodeStatus};
pub use task::{DeployTask, TaskStatus};
