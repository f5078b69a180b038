//! Application state.

use std::sync::Arc;
use std::time::Instant;

use caseq_queue::JobBroker;

use crate::config::ApiConfig;

/// Extra component status merged into the health response.
pub trait HealthProbe: Send + Sync {
    /// Key under which the status appears.
    fn name(&self) -> &'static str;

    fn status(&self) -> serde_json::Value;
}

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub broker: Arc<dyn JobBroker>,
    pub started_at: Instant,
    pub probes: Vec<Arc<dyn HealthProbe>>,
}

impl AppState {
    pub fn new(config: ApiConfig, broker: Arc<dyn JobBroker>) -> Self {
        Self {
            config,
            broker,
            started_at: Instant::now(),
            probes: Vec::new(),
        }
    }

    pub fn with_probe(mut self, probe: Arc<dyn HealthProbe>) -> Self {
        self.probes.push(probe);
        self
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
