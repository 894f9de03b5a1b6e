use crate::{config::AppConfig, ingest::IngestService};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub ingest: IngestService,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, ingest: IngestService) -> Self {
        Self { config, ingest }
    }
}
