use std::collections::HashMap;
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use flotilla_adapter::{ResourceRegistry, VendorAdapter};
use flotilla_common::{DeployTask, ModelInstance};
use flotilla_sched::ResourceManager;

use crate::args::Args;

pub struct AgentState {
    pub args: Args,
    pub adapter: Arc<dyn VendorAdapter>,

    /// Local catalog: exactly one cluster, owned by this process.
    pub registry: Mutex<ResourceRegistry>,
    /// The allocation ledger. Single source of truth for accelerator
    /// ownership; every mutation goes through this lock.
    pub manager: Mutex<ResourceManager>,

    pub instances: Mutex<HashMap<String, ModelInstance>>,
    pub tasks: Mutex<HashMap<String, DeployTask>>,

    next_port: AtomicU16,
    pub http: reqwest::Client,
}

impl AgentState {
    pub fn new(
        args: Args,
        adapter: Arc<dyn VendorAdapter>,
        registry: ResourceRegistry,
        manager: ResourceManager,
    ) -> Arc<Self> {
        let base_port = args.instance_base_port;
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Arc::new(Self {
            args,
            adapter,
            registry: Mutex::new(registry),
            manager: Mutex::new(manager),
            instances: Mutex::new(HashMap::new()),
            tasks: Mutex::new(HashMap::new()),
            next_port: AtomicU16::new(base_port),
            http,
        })
    }

    pub fn next_instance_port(&self) -> u16 {
        self.next_port.fetch_add(1, Ordering::Relaxed)
    }
}
