//! Downstream connection adapters
//!
//! The downstream is the local peer of a session. It is either a raw byte
//! stream (a TCP socket accepted by the local proxy) or a message stream (a
//! WebSocket upgraded by the gateway). Both are split into a reader and a
//! writer so the two relay directions can run in separate tasks.

use async_trait::async_trait;
use bytes::Bytes;
use futures::{Sink, SinkExt, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};

use kb_core::types::CLOSE_INTERNAL_ERROR;
use kb_core::{CloseReason, Frame, MessageSink, MessageStream, ProxyError, WsMessage};

/// Longest reason text a close frame can carry
const MAX_CLOSE_REASON: usize = 123;

/// Error reported by the upstream, to be shown to the local peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamFault {
    /// Close frame sent by the upstream, when there was one
    pub close: Option<CloseReason>,
    pub detail: String,
}

impl UpstreamFault {
    /// Fault derived from an abnormal close frame
    pub fn from_close(reason: &CloseReason) -> Self {
        Self {
            close: Some(reason.clone()),
            detail: reason.to_string(),
        }
    }

    /// Fault derived from a stream error
    pub fn from_error(err: &ProxyError) -> Self {
        Self {
            close: None,
            detail: err.to_string(),
        }
    }
}

/// The HTTP error block written to a byte-stream peer when the upstream
/// fails
pub fn service_unavailable_block(detail: &str) -> String {
    format!(
        "HTTP/1.1 503 Service Unavailable\r\nConnection: Closed\r\n\r\nWebSocket reply: {}",
        detail
    )
}

/// Read side of a downstream connection
#[async_trait]
pub trait DownstreamReader: Send + 'static {
    /// Next frame from the local peer, `None` on a clean end of stream
    ///
    /// Must be cancel safe: the relay drops this future on shutdown.
    async fn read_frame(&mut self) -> Result<Option<Frame>, ProxyError>;

    /// Whether the peer may still read after its end of stream
    ///
    /// Byte streams can be half-closed; a message stream's close ends the
    /// whole conversation.
    fn supports_half_close(&self) -> bool {
        false
    }
}

/// Write side of a downstream connection
#[async_trait]
pub trait DownstreamWriter: Send + 'static {
    /// Deliver one frame to the local peer
    async fn write_frame(&mut self, frame: Frame) -> Result<(), ProxyError>;

    /// Tell the local peer the upstream failed
    async fn write_fault(&mut self, fault: &UpstreamFault) -> Result<(), ProxyError>;

    /// Close the connection; a no-op when already closed
    async fn close(&mut self, reason: Option<CloseReason>);
}

/// A local connection that can be split into its two directions
pub trait Downstream: Send + 'static {
    type Reader: DownstreamReader;
    type Writer: DownstreamWriter;

    fn split(self) -> (Self::Reader, Self::Writer);
}

// ============================================================================
// Byte-stream downstream
// ============================================================================

/// A raw byte stream such as an accepted TCP socket
pub struct ByteDownstream<S> {
    stream: S,
    buffer_size: usize,
}

impl<S> ByteDownstream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap a stream; each read yields at most `buffer_size` bytes
    pub fn new(stream: S, buffer_size: usize) -> Self {
        Self {
            stream,
            buffer_size: buffer_size.max(1),
        }
    }
}

impl<S> Downstream for ByteDownstream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    type Reader = ByteReader<S>;
    type Writer = ByteWriter<S>;

    fn split(self) -> (Self::Reader, Self::Writer) {
        let (read, write) = tokio::io::split(self.stream);
        (
            ByteReader {
                inner: read,
                buf: vec![0u8; self.buffer_size],
            },
            ByteWriter {
                inner: write,
                closed: false,
            },
        )
    }
}

/// Read half of a [`ByteDownstream`]
pub struct ByteReader<S> {
    inner: ReadHalf<S>,
    buf: Vec<u8>,
}

#[async_trait]
impl<S> DownstreamReader for ByteReader<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        let n = self.inner.read(&mut self.buf).await?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(Frame::binary(Bytes::copy_from_slice(&self.buf[..n]))))
    }

    fn supports_half_close(&self) -> bool {
        true
    }
}

/// Write half of a [`ByteDownstream`]
pub struct ByteWriter<S> {
    inner: WriteHalf<S>,
    closed: bool,
}

#[async_trait]
impl<S> DownstreamWriter for ByteWriter<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_frame(&mut self, frame: Frame) -> Result<(), ProxyError> {
        // Text payloads are written as their UTF-8 bytes; a byte stream has
        // no framing to preserve.
        self.inner.write_all(&frame.payload).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn write_fault(&mut self, fault: &UpstreamFault) -> Result<(), ProxyError> {
        let block = service_unavailable_block(&fault.detail);
        self.inner.write_all(block.as_bytes()).await?;
        self.inner.flush().await?;
        Ok(())
    }

    async fn close(&mut self, _reason: Option<CloseReason>) {
        if self.closed {
            return;
        }
        self.closed = true;
        if let Err(e) = self.inner.shutdown().await {
            tracing::debug!("Local socket already gone during shutdown: {}", e);
        }
    }
}

// ============================================================================
// Message-stream downstream
// ============================================================================

/// A message-oriented local connection, e.g. an upgraded WebSocket
pub struct MessageDownstream {
    sink: MessageSink,
    stream: MessageStream,
}

impl MessageDownstream {
    /// Build from the two halves of a message connection
    pub fn new<Si, St>(sink: Si, stream: St) -> Self
    where
        Si: Sink<WsMessage, Error = ProxyError> + Send + 'static,
        St: Stream<Item = Result<WsMessage, ProxyError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: stream.boxed(),
        }
    }
}

impl Downstream for MessageDownstream {
    type Reader = MessageReader;
    type Writer = MessageWriter;

    fn split(self) -> (Self::Reader, Self::Writer) {
        (
            MessageReader {
                stream: self.stream,
            },
            MessageWriter {
                sink: self.sink,
                closed: false,
            },
        )
    }
}

/// Read half of a [`MessageDownstream`]
pub struct MessageReader {
    stream: MessageStream,
}

#[async_trait]
impl DownstreamReader for MessageReader {
    async fn read_frame(&mut self) -> Result<Option<Frame>, ProxyError> {
        loop {
            match self.stream.next().await {
                Some(Ok(WsMessage::Data(frame))) => return Ok(Some(frame)),
                // Control frames are answered by the WebSocket layer itself
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) | None => return Ok(None),
                Some(Err(e)) => return Err(e),
            }
        }
    }
}

/// Write half of a [`MessageDownstream`]
pub struct MessageWriter {
    sink: MessageSink,
    closed: bool,
}

#[async_trait]
impl DownstreamWriter for MessageWriter {
    async fn write_frame(&mut self, frame: Frame) -> Result<(), ProxyError> {
        self.sink.send(WsMessage::Data(frame)).await
    }

    async fn write_fault(&mut self, fault: &UpstreamFault) -> Result<(), ProxyError> {
        // Pass a sendable upstream close through as is; anything else
        // becomes 1011 with the whole detail as its reason
        let reason = match &fault.close {
            Some(close) if is_sendable_close_code(close.code) => CloseReason {
                code: close.code,
                reason: truncate_reason(&close.reason),
            },
            _ => CloseReason {
                code: CLOSE_INTERNAL_ERROR,
                reason: truncate_reason(&fault.detail),
            },
        };
        self.closed = true;
        let sent = self.sink.send(WsMessage::Close(Some(reason))).await;
        let _ = self.sink.close().await;
        sent
    }

    async fn close(&mut self, reason: Option<CloseReason>) {
        if self.closed {
            return;
        }
        self.closed = true;
        let reason = reason
            .filter(|r| is_sendable_close_code(r.code))
            .unwrap_or_else(CloseReason::normal);
        if let Err(e) = self.sink.send(WsMessage::Close(Some(reason))).await {
            tracing::debug!("Local WebSocket already closed: {}", e);
        }
        let _ = self.sink.close().await;
    }
}

/// Close codes that may appear on the wire (1005, 1006 and 1015 are
/// reserved for local reporting only)
fn is_sendable_close_code(code: u16) -> bool {
    matches!(code, 1000..=1003 | 1007..=1014 | 3000..=4999)
}

fn truncate_reason(detail: &str) -> String {
    if detail.len() <= MAX_CLOSE_REASON {
        return detail.to_string();
    }
    let mut end = MAX_CLOSE_REASON;
    while !detail.is_char_boundary(end) {
        end -= 1;
    }
    detail[..end].to_string()
}
