use crate::{config::AppConfig, pipeline::Pipeline};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub pipeline: Arc<Pipeline>,
}

impl AppState {
    pub fn new(config: Arc<AppConfig>, pipeline: Arc<Pipeline>) -> Self {
        Self { config, pipeline }
    }
}
