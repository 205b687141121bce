//! tokio-tungstenite adapters
//!
//! Converts between tungstenite messages and [`WsMessage`] so that a client
//! WebSocket can serve as the upstream end of a relay.

use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use kb_core::{CloseReason, Frame, FrameKind, ProxyError, UpstreamSocket, WsMessage};

/// Convert a tungstenite message; raw frames are not surfaced
pub fn from_tungstenite(msg: Message) -> Option<WsMessage> {
    match msg {
        Message::Text(text) => Some(WsMessage::Data(Frame {
            payload: Bytes::copy_from_slice(text.as_str().as_bytes()),
            kind: FrameKind::Text,
        })),
        Message::Binary(data) => Some(WsMessage::Data(Frame::binary(data))),
        Message::Ping(data) => Some(WsMessage::Ping(data)),
        Message::Pong(data) => Some(WsMessage::Pong(data)),
        Message::Close(frame) => Some(WsMessage::Close(frame.map(|f| CloseReason {
            code: u16::from(f.code),
            reason: f.reason.as_str().to_owned(),
        }))),
        Message::Frame(_) => None,
    }
}

/// Convert to a tungstenite message
///
/// Fails when a text frame does not hold valid UTF-8.
pub fn to_tungstenite(msg: WsMessage) -> Result<Message, ProxyError> {
    Ok(match msg {
        WsMessage::Data(Frame {
            payload,
            kind: FrameKind::Text,
        }) => {
            let text = String::from_utf8(payload.to_vec())
                .map_err(|e| ProxyError::protocol(format!("text frame is not UTF-8: {}", e)))?;
            Message::Text(text.into())
        }
        WsMessage::Data(Frame {
            payload,
            kind: FrameKind::Binary,
        }) => Message::Binary(payload),
        WsMessage::Ping(data) => Message::Ping(data),
        WsMessage::Pong(data) => Message::Pong(data),
        WsMessage::Close(reason) => Message::Close(reason.map(|r| CloseFrame {
            code: CloseCode::from(r.code),
            reason: r.reason.into(),
        })),
    })
}

/// Map an error raised on an established WebSocket
pub fn map_stream_error(err: tungstenite::Error) -> ProxyError {
    match err {
        tungstenite::Error::Io(e) => ProxyError::protocol(format!("connection lost: {}", e)),
        other => ProxyError::protocol(other),
    }
}

/// Wrap a connected client WebSocket as the upstream end of a relay
pub fn upstream_socket<S>(ws: WebSocketStream<S>) -> UpstreamSocket
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = ws.split();
    let sink = sink
        .sink_map_err(map_stream_error)
        .with(|msg: WsMessage| future::ready(to_tungstenite(msg)));
    let stream = stream.filter_map(|item| {
        future::ready(match item {
            Ok(msg) => from_tungstenite(msg).map(Ok),
            // A peer that vanished after its close frame is not a fault
            Err(tungstenite::Error::ConnectionClosed) => None,
            Err(e) => Some(Err(map_stream_error(e))),
        })
    });
    UpstreamSocket::new(sink, stream)
}
