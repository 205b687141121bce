//! Front-end listener configuration

use serde::{Deserialize, Serialize};

/// Settings for the local TCP proxy (`kbridge app`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Host or address to bind
    pub bind_host: String,
    /// Port to listen for local connections
    pub port: u16,
    /// Transport declared by the remote application (`http`, `tcp`, ...)
    pub protocol: String,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: "http".to_string(),
        }
    }
}

impl LocalConfig {
    /// Bind address as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}

/// Settings for the HTTP gateway (`kbridge proxy`)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub bind_host: String,
    pub port: u16,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            bind_host: "localhost".to_string(),
            port: 8084,
        }
    }
}

impl GatewayConfig {
    /// Bind address as `host:port`
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }
}
