pub mod api;
pub mod config;
pub mod db;
pub mod errors;
pub mod execution;
pub mod ingestion;
pub mod metrics;
pub mod models;
pub mod routing;
pub mod services;
pub mod settlement;
pub mod venues;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::db::Store;
use crate::services::notifier::Notifier;
use crate::services::{HealthRegistry, Pipeline};

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn Store>,
    pub pipeline: Pipeline,
    pub config: Arc<AppConfig>,
    pub metrics_handle: metrics_exporter_prometheus::PrometheusHandle,
    pub notifier: Option<Arc<Notifier>>,
    pub health: HealthRegistry,
}
