use std::sync::Arc;
use std::time::Duration;

use flotilla_meta::Catalog;

use crate::args::Args;

#[derive(Clone)]
pub struct AppState {
    pub args: Args,
    pub catalog: Arc<Catalog>,
    pub http: reqwest::Client,
}

impl AppState {
    pub fn new(args: Args, catalog: Arc<Catalog>) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(3))
            .timeout(Duration::from_secs(5))
            .build()
            .unwrap_or_default();
        Self {
            args,
            catalog,
            http,
        }
    }
}
