//! Storage-server management agent: host collectors, a REST surface, and a
//! real-time WebSocket telemetry stream with per-session scheduling.
use crate::config::AgentConfig;
use crate::control::{AdapterRegistry, ShellRunner};
use skiff_stream::{ConnectionManager, MetricStore};
use std::sync::Arc;
use std::time::Instant;

pub mod api;
pub mod collect;
pub mod config;
pub mod control;
pub mod observability;
pub mod ws;

/// Shared handles threaded through every HTTP and WebSocket handler.
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<ConnectionManager>,
    pub store: Arc<MetricStore>,
    pub adapters: Arc<AdapterRegistry>,
    pub config: Arc<AgentConfig>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(config: AgentConfig) -> Self {
        let adapters = AdapterRegistry::with_defaults(Arc::new(ShellRunner));
        Self::with_adapters(config, adapters)
    }

    /// Test seam: swap the adapter registry for one backed by a fake runner.
    pub fn with_adapters(config: AgentConfig, adapters: AdapterRegistry) -> Self {
        Self {
            manager: Arc::new(ConnectionManager::new(config.max_sessions)),
            store: Arc::new(MetricStore::new()),
            adapters: Arc::new(adapters),
            config: Arc::new(config),
            started_at: Instant::now(),
        }
    }
}
