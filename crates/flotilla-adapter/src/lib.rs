pub mod adapter;
pub mod apple;
pub mod nvidia;
pub mod registry;

pub use adapter::{create_adapter, LaunchError, LaunchParams, VendorAdapter, HEARTBEAT_STALE_MS};
pub use apple::AppleAdapter;
pub use nvidia::NvidiaAdapter;
pub use registry::{AcceleratorRequirement, RegistryError, ResourceRegistry};
