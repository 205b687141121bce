//! Reference session client
//!
//! `ApiSession` talks to the remote API over plain HTTP(S) and WebSockets.
//! It never signs requests: the static headers from `[api]` are attached to
//! every call, which is enough for an endpoint sitting behind an
//! authenticating gateway.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::header::{HeaderName, HeaderValue, CONTENT_TYPE};
use http::HeaderMap;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as WsError;

use kb_core::config::ApiConfig;
use kb_core::{HttpCall, ProxyError, SessionClient, UpstreamResponse, UpstreamSocket};

/// Session client backed by `reqwest` and `tokio-tungstenite`
pub struct ApiSession {
    http: reqwest::Client,
    base_url: String,
    ws_base_url: String,
    headers: HeaderMap,
    connect_timeout: Duration,
}

impl ApiSession {
    /// Build a client for the configured endpoint
    pub fn new(config: &ApiConfig) -> Result<Self, ProxyError> {
        let headers = static_headers(config)?;
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .default_headers(headers.clone())
            .build()
            .map_err(|e| ProxyError::Internal(format!("Failed to build HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url: config.base_url().to_string(),
            ws_base_url: config.websocket_base_url(),
            headers,
            connect_timeout: config.connect_timeout,
        })
    }

    /// HTTP base URL every call is resolved against
    pub fn endpoint(&self) -> &str {
        &self.base_url
    }
}

fn static_headers(config: &ApiConfig) -> Result<HeaderMap, ProxyError> {
    let mut headers = HeaderMap::new();
    for (name, value) in &config.headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| ProxyError::Internal(format!("Invalid header name {:?}: {}", name, e)))?;
        let value = HeaderValue::from_str(value)
            .map_err(|e| ProxyError::Internal(format!("Invalid value for header {}: {}", name, e)))?;
        headers.insert(name, value);
    }
    Ok(headers)
}

#[async_trait]
impl SessionClient for ApiSession {
    async fn open_http_call(&self, call: HttpCall) -> Result<UpstreamResponse, ProxyError> {
        let url = format!("{}{}", self.base_url, call.path);
        tracing::debug!("{} {}", call.method, url);

        let mut request = self.http.request(call.method, &url);
        if let Some(content_type) = call.content_type {
            request = request.header(CONTENT_TYPE, content_type);
        }
        if let Some(body) = call.body {
            request = request.body(reqwest::Body::wrap_stream(body));
        }

        let response = request.send().await.map_err(map_request_error)?;
        let status = response.status();
        let reason = reason_phrase(&response);

        if !status.is_success() {
            let body = match response.bytes().await {
                Ok(body) => body,
                Err(e) => {
                    tracing::debug!("Failed to read rejection body from {}: {}", url, e);
                    Bytes::new()
                }
            };
            return Err(ProxyError::UpstreamRejected {
                status: status.as_u16(),
                reason: reason.unwrap_or_default(),
                body,
            });
        }

        let headers = response.headers().clone();
        let body = response
            .bytes_stream()
            .map_err(std::io::Error::other)
            .boxed();

        Ok(UpstreamResponse {
            status,
            reason,
            headers,
            body,
        })
    }

    async fn open_websocket(&self, path: &str) -> Result<UpstreamSocket, ProxyError> {
        let url = format!("{}{}", self.ws_base_url, path);
        tracing::debug!("Opening WebSocket {}", url);

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(map_handshake_error)?;
        request.headers_mut().extend(self.headers.clone());

        let (ws, _) = tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        .map_err(|_| {
            ProxyError::UpstreamUnreachable(format!(
                "Timed out after {:?} connecting to {}",
                self.connect_timeout, url
            ))
        })?
        .map_err(map_handshake_error)?;

        Ok(kb_relay::ws::upstream_socket(ws))
    }

    async fn close(&self) {
        // Pooled connections go away with the last clone of the client.
        tracing::debug!("Closing API session for {}", self.base_url);
    }
}

/// Reason phrase as sent on the wire, falling back to the canonical one
fn reason_phrase(response: &reqwest::Response) -> Option<String> {
    response
        .extensions()
        .get::<hyper::ext::ReasonPhrase>()
        .map(|phrase| String::from_utf8_lossy(phrase.as_bytes()).into_owned())
        .or_else(|| response.status().canonical_reason().map(str::to_string))
}

fn map_request_error(err: reqwest::Error) -> ProxyError {
    if err.is_builder() {
        ProxyError::Internal(format!("Invalid upstream request: {}", err))
    } else if err.is_body() {
        ProxyError::local(err)
    } else {
        // Connect, DNS, TLS, timeout and mid-request resets alike
        ProxyError::UpstreamUnreachable(error_chain(&err))
    }
}

fn map_handshake_error(err: WsError) -> ProxyError {
    match err {
        WsError::Http(response) => {
            let status = response.status();
            let body = response
                .body()
                .clone()
                .map(Bytes::from)
                .unwrap_or_default();
            ProxyError::UpstreamRejected {
                status: status.as_u16(),
                reason: status.canonical_reason().unwrap_or_default().to_string(),
                body,
            }
        }
        WsError::Io(e) => ProxyError::UpstreamUnreachable(e.to_string()),
        WsError::Tls(e) => ProxyError::UpstreamUnreachable(e.to_string()),
        WsError::Url(e) => ProxyError::UpstreamUnreachable(format!("Invalid endpoint: {}", e)),
        other => ProxyError::protocol(other),
    }
}

/// Flatten an error and its sources into one line
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}
