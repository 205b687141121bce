//! Relay engine tuning

use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Timeouts and buffer sizes used by every proxy session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayConfig {
    /// How long the surviving direction may keep running after the other
    /// direction of a session has ended
    #[serde(with = "duration_secs")]
    pub drain_timeout: Duration,

    /// Pause after the listener stops so socket teardown can finish
    pub shutdown_grace_ms: u64,

    /// Maximum bytes read from a local socket per upstream frame
    pub read_buffer_size: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            drain_timeout: Duration::from_secs(5),
            shutdown_grace_ms: 100,
            read_buffer_size: 8192,
        }
    }
}

impl RelayConfig {
    /// Grace period as a Duration
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}
