//! Shared application state for the API server.

use std::sync::Arc;
use std::time::Duration;

use patchloop::service::Service;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Synchronous service; handlers call it through `spawn_blocking`.
    pub service: Arc<Service>,
    /// Delay between store polls in task event streams.
    pub stream_poll: Duration,
}

impl AppState {
    pub fn new(service: Service) -> Self {
        let stream_poll = service.config().poll_interval();
        Self {
            service: Arc::new(service),
            stream_poll,
        }
    }
}
