//! Trait definitions for kbridge collaborators

mod client;

pub use client::{
    BodyStream, HttpCall, MessageSink, MessageStream, SessionClient, UpstreamResponse,
    UpstreamSocket,
};
