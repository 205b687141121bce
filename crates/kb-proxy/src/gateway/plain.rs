//! Streaming HTTP relay

use std::sync::LazyLock;

use axum::body::{Body, HttpBody};
use axum::extract::{Request, State};
use axum::response::Response;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::StatusCode;
use hyper::ext::ReasonPhrase;
use regex::Regex;

use kb_core::{HttpCall, ProxyError, UpstreamResponse};

use super::state::GatewayState;

static VERSION_PREFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/?v(\d+)/").expect("version prefix pattern is valid"));

/// Headers that only make sense for a single connection
static HOP_BY_HOP: [HeaderName; 8] = [
    header::CONNECTION,
    HeaderName::from_static("keep-alive"),
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

pub(super) const MSG_UNREACHABLE: &str = "The proxy target server is inaccessible.";
pub(super) const MSG_SHUTTING_DOWN: &str = "The proxy is being shut down.";
pub(super) const MSG_INTERNAL: &str = "Something has gone wrong.";

/// Strip a leading API version segment (`/v4/kernel` → `/kernel`)
pub fn upstream_path(path: &str) -> String {
    VERSION_PREFIX.replace(path, "/").into_owned()
}

/// Path and query of an inbound request as sent upstream
pub(super) fn upstream_target(uri: &http::Uri) -> String {
    let mut target = upstream_path(uri.path());
    if let Some(query) = uri.query() {
        target.push('?');
        target.push_str(query);
    }
    target
}

/// Relay any request to the remote API, streaming both bodies
pub(super) async fn plain_relay(State(state): State<GatewayState>, request: Request) -> Response {
    if state.is_shutting_down() {
        return text_response(StatusCode::SERVICE_UNAVAILABLE, MSG_SHUTTING_DOWN);
    }

    let (parts, body) = request.into_parts();
    let mut call = HttpCall::new(parts.method, upstream_target(&parts.uri));
    if !body.is_end_stream() {
        let content_type = parts
            .headers
            .get(header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string);
        let stream = body
            .into_data_stream()
            .map_err(std::io::Error::other)
            .boxed();
        call = call.with_body(content_type, stream);
    }
    tracing::debug!("Relaying {} {}", call.method, call.path);

    let opened = tokio::select! {
        _ = state.shutdown.cancelled() => {
            return text_response(StatusCode::SERVICE_UNAVAILABLE, MSG_SHUTTING_DOWN);
        }
        opened = state.client.open_http_call(call) => opened,
    };

    match opened {
        Ok(upstream) => stream_response(upstream, &state),
        Err(e) => error_response(e),
    }
}

/// Forward an upstream response, streaming its body as it arrives
fn stream_response(upstream: UpstreamResponse, state: &GatewayState) -> Response {
    let UpstreamResponse {
        status,
        reason,
        headers,
        body,
    } = upstream;

    let body = body.take_until(state.shutdown.clone().cancelled_owned());
    let mut response = Response::new(Body::from_stream(body));
    *response.status_mut() = status;
    *response.headers_mut() = forwarded_headers(headers);
    response.headers_mut().insert(
        header::ACCESS_CONTROL_ALLOW_ORIGIN,
        HeaderValue::from_static("*"),
    );
    set_reason(&mut response, reason);
    response
}

fn forwarded_headers(mut headers: HeaderMap) -> HeaderMap {
    for name in HOP_BY_HOP.iter() {
        headers.remove(name);
    }
    headers
}

/// Translate a failed upstream call into the response shown to the caller
pub(super) fn error_response(err: ProxyError) -> Response {
    match err {
        ProxyError::UpstreamRejected {
            status,
            reason,
            body,
        } => {
            let status = StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(body));
            *response.status_mut() = status;
            set_reason(&mut response, Some(reason));
            response
        }
        ProxyError::UpstreamUnreachable(detail) => {
            tracing::warn!("Proxy target unreachable: {}", detail);
            text_response(StatusCode::BAD_GATEWAY, MSG_UNREACHABLE)
        }
        other => {
            tracing::error!("Internal server error: {}", other);
            text_response(StatusCode::INTERNAL_SERVER_ERROR, MSG_INTERNAL)
        }
    }
}

pub(super) fn text_response(status: StatusCode, message: &'static str) -> Response {
    let mut response = Response::new(Body::from(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response
}

/// Carry a non-standard reason phrase through to the caller
fn set_reason(response: &mut Response, reason: Option<String>) {
    let Some(reason) = reason else {
        return;
    };
    if reason.is_empty() || response.status().canonical_reason() == Some(reason.as_str()) {
        return;
    }
    match ReasonPhrase::try_from(reason) {
        Ok(phrase) => {
            response.extensions_mut().insert(phrase);
        }
        Err(e) => tracing::debug!("Dropping invalid reason phrase: {}", e),
    }
}
