//! kb-core: Core abstractions and configuration for kbridge
//!
//! This crate provides the error taxonomy, frame/message types, the
//! `SessionClient` collaborator trait and configuration structures shared
//! by the relay engine, the proxy front-ends and the CLI.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use error::{ConfigError, ProxyError};
pub use traits::{
    BodyStream, HttpCall, MessageSink, MessageStream, SessionClient, UpstreamResponse,
    UpstreamSocket,
};
pub use types::{CloseReason, Frame, FrameKind, WsMessage};
