//! Remote API endpoint configuration

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// How to reach the remote API
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the API (`http://` or `https://`)
    pub endpoint: String,

    /// Upper bound on establishing an upstream connection
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Static headers attached to every upstream call
    pub headers: BTreeMap<String, String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:8081".to_string(),
            connect_timeout: Duration::from_secs(10),
            headers: BTreeMap::new(),
        }
    }
}

impl ApiConfig {
    /// Endpoint without a trailing slash
    pub fn base_url(&self) -> &str {
        self.endpoint.trim_end_matches('/')
    }

    /// WebSocket flavour of the endpoint (`ws://` / `wss://`)
    pub fn websocket_base_url(&self) -> String {
        let base = self.base_url();
        if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        }
    }
}
