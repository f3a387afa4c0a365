pub mod ledger;
pub mod policy;

pub use ledger::{AllocationRecord, AllocationStatus, LedgerError, ResourceManager};
pub use policy::{
    create_policy, AllocationOutcome, AllocationPolicy, MemoryOptimized, SingleNodeFirst,
    UtilizationAware,
};
