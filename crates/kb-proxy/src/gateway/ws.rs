//! WebSocket relay

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{StatusCode, Uri};
use axum::response::Response;
use bytes::Bytes;
use futures::{future, SinkExt, StreamExt};
use tracing::Instrument;

use kb_core::{CloseReason, Frame, FrameKind, ProxyError, WsMessage};
use kb_relay::{DuplexRelay, MessageDownstream};

use super::plain::{error_response, text_response, upstream_target, MSG_SHUTTING_DOWN};
use super::state::GatewayState;

/// Upgrade the inbound request and relay it to the matching upstream socket
///
/// The upstream is opened before the upgrade so that a refusal can still be
/// reported as a plain HTTP response.
pub(super) async fn websocket_relay(
    State(state): State<GatewayState>,
    uri: Uri,
    ws: WebSocketUpgrade,
) -> Response {
    if state.is_shutting_down() {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, MSG_SHUTTING_DOWN);
    }

    let path = upstream_target(&uri);
    let opened = tokio::select! {
        _ = state.shutdown.cancelled() => {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, MSG_SHUTTING_DOWN);
        }
        opened = state.client.open_websocket(&path) => opened,
    };
    let upstream = match opened {
        Ok(upstream) => upstream,
        Err(e) => return error_response(e),
    };

    let span = tracing::info_span!("ws_session", path = %path);
    let tracked = state.relays.token();
    ws.on_upgrade(move |socket| {
        async move {
            tracing::info!("WebSocket relay started");
            let result = DuplexRelay::new(path, message_downstream(socket), upstream, state.shutdown)
                .with_drain_timeout(state.drain_timeout)
                .run()
                .await;

            match result {
                Ok(outcome) if outcome.termination.is_failure() => {
                    tracing::warn!("WebSocket relay terminated: {}", outcome.termination);
                }
                Ok(outcome) => {
                    tracing::info!(
                        "WebSocket relay terminated ({}; {} frames up, {} frames down)",
                        outcome.termination,
                        outcome.frames_up,
                        outcome.frames_down
                    );
                }
                Err(e) => tracing::error!("WebSocket relay failed: {}", e),
            }
            drop(tracked);
        }
        .instrument(span)
    })
}

/// Wrap an upgraded axum socket for the relay
fn message_downstream(socket: WebSocket) -> MessageDownstream {
    let (sink, stream) = socket.split();
    let sink = sink
        .sink_map_err(ProxyError::local)
        .with(|msg: WsMessage| future::ready(to_axum(msg)));
    let stream = stream.map(|item| item.map(from_axum).map_err(ProxyError::local));
    MessageDownstream::new(sink, stream)
}

fn from_axum(msg: Message) -> WsMessage {
    match msg {
        Message::Text(text) => WsMessage::Data(Frame {
            payload: Bytes::copy_from_slice(text.as_str().as_bytes()),
            kind: FrameKind::Text,
        }),
        Message::Binary(data) => WsMessage::Data(Frame::binary(data)),
        Message::Ping(data) => WsMessage::Ping(data),
        Message::Pong(data) => WsMessage::Pong(data),
        Message::Close(frame) => WsMessage::Close(frame.map(|f| CloseReason {
            code: f.code,
            reason: f.reason.as_str().to_owned(),
        })),
    }
}

fn to_axum(msg: WsMessage) -> Result<Message, ProxyError> {
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
            code: r.code,
            reason: r.reason.into(),
        })),
    })
}
