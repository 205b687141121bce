//! Shared fixtures: an in-memory session client with scripted upstreams

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::channel::mpsc;
use futures::{stream, SinkExt, StreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::{HeaderMap, StatusCode};

use kb_core::config::RelayConfig;
use kb_core::{
    CloseReason, Frame, HttpCall, ProxyError, SessionClient, UpstreamResponse, UpstreamSocket,
    WsMessage,
};

pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// How the fake answers `open_http_call`
pub enum HttpBehavior {
    /// Read the request body and send it back with the same content type
    Echo,
    /// Answer with fixed status, headers and body chunks
    Reply {
        status: u16,
        headers: Vec<(&'static str, &'static str)>,
        chunks: Vec<&'static str>,
    },
    /// Fail with the produced error
    Fail(fn() -> ProxyError),
}

/// How the fake answers `open_websocket`
pub enum WsBehavior {
    /// Send every data frame back unchanged; answer a close with a close
    Echo,
    /// Wait for an HTTP request head, send this response, then close
    Respond(&'static str),
    /// Fail with the produced error
    Fail(fn() -> ProxyError),
}

/// Session client double recording the calls it receives
pub struct FakeClient {
    http: HttpBehavior,
    ws: WsBehavior,
    pub http_calls: Mutex<Vec<String>>,
    pub ws_paths: Mutex<Vec<String>>,
    pub closed: AtomicBool,
    /// One clone per upstream stream the relays still hold
    upstreams: Arc<()>,
    upstreams_open_at_close: Mutex<Option<usize>>,
}

impl FakeClient {
    pub fn new(http: HttpBehavior, ws: WsBehavior) -> Arc<Self> {
        Arc::new(Self {
            http,
            ws,
            http_calls: Mutex::new(Vec::new()),
            ws_paths: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
            upstreams: Arc::new(()),
            upstreams_open_at_close: Mutex::new(None),
        })
    }

    pub fn http(http: HttpBehavior) -> Arc<Self> {
        Self::new(http, WsBehavior::Echo)
    }

    pub fn ws(ws: WsBehavior) -> Arc<Self> {
        Self::new(HttpBehavior::Echo, ws)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn ws_paths(&self) -> Vec<String> {
        self.ws_paths.lock().unwrap().clone()
    }

    pub fn http_calls(&self) -> Vec<String> {
        self.http_calls.lock().unwrap().clone()
    }

    /// Upstream sockets not yet released by their relay
    pub fn open_upstreams(&self) -> usize {
        Arc::strong_count(&self.upstreams) - 1
    }

    /// `open_upstreams` as seen when `close` was called
    pub fn upstreams_open_at_close(&self) -> Option<usize> {
        *self.upstreams_open_at_close.lock().unwrap()
    }
}

#[async_trait]
impl SessionClient for FakeClient {
    async fn open_http_call(&self, call: HttpCall) -> Result<UpstreamResponse, ProxyError> {
        self.http_calls
            .lock()
            .unwrap()
            .push(format!("{} {}", call.method, call.path));

        match &self.http {
            HttpBehavior::Echo => {
                let mut collected = Vec::new();
                if let Some(mut body) = call.body {
                    while let Some(chunk) = body.next().await {
                        collected.extend_from_slice(&chunk?);
                    }
                }
                let mut headers = HeaderMap::new();
                if let Some(content_type) = call.content_type {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_str(&content_type).unwrap());
                }
                Ok(UpstreamResponse {
                    status: StatusCode::OK,
                    reason: None,
                    headers,
                    body: stream::iter(vec![Ok(Bytes::from(collected))]).boxed(),
                })
            }
            HttpBehavior::Reply {
                status,
                headers,
                chunks,
            } => {
                let mut map = HeaderMap::new();
                for (name, value) in headers {
                    map.insert(
                        HeaderName::from_static(*name),
                        HeaderValue::from_static(*value),
                    );
                }
                let chunks: Vec<Result<Bytes, std::io::Error>> = chunks
                    .iter()
                    .map(|chunk| Ok(Bytes::from_static((*chunk).as_bytes())))
                    .collect();
                Ok(UpstreamResponse {
                    status: StatusCode::from_u16(*status).unwrap(),
                    reason: None,
                    headers: map,
                    body: stream::iter(chunks).boxed(),
                })
            }
            HttpBehavior::Fail(make) => Err(make()),
        }
    }

    async fn open_websocket(&self, path: &str) -> Result<UpstreamSocket, ProxyError> {
        self.ws_paths.lock().unwrap().push(path.to_string());

        let UpstreamSocket { sink, stream } = match &self.ws {
            WsBehavior::Echo => spawn_echo_upstream(),
            WsBehavior::Respond(response) => spawn_http_upstream(*response),
            WsBehavior::Fail(make) => return Err(make()),
        };

        let held = Arc::clone(&self.upstreams);
        let stream = stream
            .map(move |item| {
                let _held = &held;
                item
            })
            .boxed();
        Ok(UpstreamSocket { sink, stream })
    }

    async fn close(&self) {
        *self.upstreams_open_at_close.lock().unwrap() = Some(self.open_upstreams());
        self.closed.store(true, Ordering::SeqCst);
    }
}

fn channel_upstream() -> (
    UpstreamSocket,
    mpsc::UnboundedSender<Result<WsMessage, ProxyError>>,
    mpsc::UnboundedReceiver<WsMessage>,
) {
    let (to_relay, relay_rx) = mpsc::unbounded();
    let (relay_tx, from_relay) = mpsc::unbounded();
    let socket = UpstreamSocket::new(relay_tx.sink_map_err(ProxyError::protocol), relay_rx);
    (socket, to_relay, from_relay)
}

/// An upstream that echoes data frames
pub fn spawn_echo_upstream() -> UpstreamSocket {
    let (socket, to_relay, mut from_relay) = channel_upstream();
    tokio::spawn(async move {
        while let Some(msg) = from_relay.next().await {
            match msg {
                WsMessage::Data(frame) => {
                    if to_relay.unbounded_send(Ok(frame.into())).is_err() {
                        break;
                    }
                }
                WsMessage::Close(reason) => {
                    let _ = to_relay.unbounded_send(Ok(WsMessage::Close(reason)));
                    break;
                }
                WsMessage::Ping(_) | WsMessage::Pong(_) => {}
            }
        }
    });
    socket
}

/// An upstream behaving like a one-shot HTTP service
pub fn spawn_http_upstream(response: &'static str) -> UpstreamSocket {
    let (socket, to_relay, mut from_relay) = channel_upstream();
    tokio::spawn(async move {
        let mut request = Vec::new();
        while let Some(WsMessage::Data(frame)) = from_relay.next().await {
            request.extend_from_slice(&frame.payload);
            if request.windows(4).any(|w| w == b"\r\n\r\n") {
                let reply = Frame::binary(Bytes::from_static(response.as_bytes()));
                let _ = to_relay.unbounded_send(Ok(reply.into()));
                let _ = to_relay.unbounded_send(Ok(WsMessage::Close(Some(CloseReason::normal()))));
                break;
            }
        }
    });
    socket
}

/// Relay settings with short timeouts
pub fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        drain_timeout: Duration::from_millis(500),
        shutdown_grace_ms: 10,
        ..Default::default()
    }
}
