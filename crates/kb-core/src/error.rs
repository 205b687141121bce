//! Core error types for kbridge

use bytes::Bytes;
use std::path::PathBuf;
use thiserror::Error;

/// Errors surfaced by the relay engine and the proxy front-ends
#[derive(Error, Debug)]
pub enum ProxyError {
    /// The remote endpoint could not be reached (connect, DNS, TLS, timeout)
    #[error("Upstream unreachable: {0}")]
    UpstreamUnreachable(String),

    /// The remote API answered with a structured error
    #[error("Upstream rejected the request: {status} {reason}")]
    UpstreamRejected {
        status: u16,
        reason: String,
        body: Bytes,
    },

    /// Malformed or unexpected frame from the remote peer
    #[error("Upstream protocol error: {0}")]
    UpstreamProtocol(String),

    /// Read or write failure on the local side of a session
    #[error("Local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),

    /// Anything the session handlers did not anticipate
    #[error("Internal fault: {0}")]
    Internal(String),
}

impl ProxyError {
    /// Build a protocol error from anything displayable
    pub fn protocol(detail: impl std::fmt::Display) -> Self {
        Self::UpstreamProtocol(detail.to_string())
    }

    /// Build a local I/O error from a foreign error type
    pub fn local(err: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::LocalIo(std::io::Error::other(err))
    }
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}
