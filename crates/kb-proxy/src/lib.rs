//! kb-proxy: Front-ends that pair local connections with remote sessions
//!
//! Two front-ends share the relay engine from `kb-relay`:
//!
//! - [`LocalProxyListener`] accepts raw TCP connections and bridges each one
//!   to a kernel service WebSocket (`kbridge app`)
//! - [`GatewayProxyServer`] maps inbound HTTP requests and WebSocket upgrades
//!   one-to-one onto remote API calls (`kbridge proxy`)
//!
//! Both reach the remote API through a shared [`kb_core::SessionClient`];
//! [`ApiSession`] is the stock implementation.

pub mod client;
pub mod gateway;
pub mod local;

pub use client::ApiSession;
pub use gateway::{GatewayProxyServer, GatewayState};
pub use local::{LocalProxyListener, LocalTarget};
