//! Shared gateway state

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use kb_core::SessionClient;

/// State handed to every gateway handler
#[derive(Clone)]
pub struct GatewayState {
    /// Remote API client, shared read-only by every request
    pub client: Arc<dyn SessionClient>,
    /// Host cancellation token
    pub shutdown: CancellationToken,
    /// Drain window for WebSocket relays
    pub drain_timeout: Duration,
    /// Upgraded WebSocket relays, which outlive their HTTP connection
    pub relays: TaskTracker,
}

impl GatewayState {
    pub fn new(
        client: Arc<dyn SessionClient>,
        shutdown: CancellationToken,
        drain_timeout: Duration,
    ) -> Self {
        Self {
            client,
            shutdown,
            drain_timeout,
            relays: TaskTracker::new(),
        }
    }

    /// Whether the host has started shutting down
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
