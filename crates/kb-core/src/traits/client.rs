//! Session client traits
//!
//! The session client is the collaborator that knows how to reach the remote
//! API. The relay engine and the front-ends only ever open calls through it,
//! so a single instance is shared by every concurrent session.

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::{Sink, Stream, StreamExt};
use http::{HeaderMap, Method, StatusCode};

use crate::error::ProxyError;
use crate::types::WsMessage;

/// A streamed request or response body
pub type BodyStream = BoxStream<'static, Result<Bytes, std::io::Error>>;

/// Sending half of a message-stream connection
pub type MessageSink = std::pin::Pin<Box<dyn Sink<WsMessage, Error = ProxyError> + Send>>;

/// Receiving half of a message-stream connection
pub type MessageStream = BoxStream<'static, Result<WsMessage, ProxyError>>;

/// An outbound HTTP call to the remote API
pub struct HttpCall {
    /// Request method, passed through unchanged
    pub method: Method,
    /// Path and query relative to the API endpoint
    pub path: String,
    /// Content type of the request body, if any
    pub content_type: Option<String>,
    /// Request body, streamed to the remote as it is read
    pub body: Option<BodyStream>,
}

impl HttpCall {
    /// Create a call without a body
    pub fn new(method: Method, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            content_type: None,
            body: None,
        }
    }

    /// Attach a streamed body with its content type
    pub fn with_body(mut self, content_type: Option<String>, body: BodyStream) -> Self {
        self.content_type = content_type;
        self.body = Some(body);
        self
    }
}

impl fmt::Debug for HttpCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpCall")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("content_type", &self.content_type)
            .field("has_body", &self.body.is_some())
            .finish()
    }
}

/// A streaming response from the remote API
pub struct UpstreamResponse {
    pub status: StatusCode,
    /// Reason phrase as sent by the remote
    pub reason: Option<String>,
    pub headers: HeaderMap,
    /// Body chunks, yielded as they arrive
    pub body: BodyStream,
}

impl fmt::Debug for UpstreamResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamResponse")
            .field("status", &self.status)
            .field("reason", &self.reason)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// An open upstream WebSocket, already split into its two halves
pub struct UpstreamSocket {
    pub sink: MessageSink,
    pub stream: MessageStream,
}

impl UpstreamSocket {
    /// Box an existing sink/stream pair
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<WsMessage, Error = ProxyError> + Send + 'static,
        R: Stream<Item = Result<WsMessage, ProxyError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

impl fmt::Debug for UpstreamSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpstreamSocket").finish_non_exhaustive()
    }
}

/// Abstraction over the remote API client
///
/// Implementations must be safe to share between concurrently running
/// sessions; the proxy never mutates them.
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// Open a streaming HTTP call
    ///
    /// Fails with `UpstreamUnreachable` when the remote cannot be reached and
    /// with `UpstreamRejected` when it answers with an error status.
    async fn open_http_call(&self, call: HttpCall) -> Result<UpstreamResponse, ProxyError>;

    /// Open a WebSocket to the given path, with the same failure modes
    async fn open_websocket(&self, path: &str) -> Result<UpstreamSocket, ProxyError>;

    /// Release any pooled connections held by the client
    async fn close(&self);
}
