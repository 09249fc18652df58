//! Shared application state passed to every handler via Axum's `State` extractor.

use std::sync::Arc;
use std::time::Instant;

use crate::backend::Backend;
use crate::config::Config;
use crate::resolver::Resolver;

/// Shared application state for the resolver host.
#[derive(Clone)]
pub struct AppState {
    /// Immutable configuration loaded at startup.
    pub config: Arc<Config>,
    /// Monotonic instant when the server started (for uptime calculation).
    pub start_time: Instant,
    pub resolver: Arc<Resolver>,
}

impl AppState {
    pub fn new(config: Config, backend: Arc<dyn Backend>) -> Self {
        let resolver = Resolver::new(backend, config.backend.device_role.clone());
        Self {
            config: Arc::new(config),
            start_time: Instant::now(),
            resolver: Arc::new(resolver),
        }
    }
}
