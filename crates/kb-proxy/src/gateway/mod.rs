//! HTTP/WebSocket gateway to the remote API
//!
//! Every inbound request is mapped one-to-one onto a remote call:
//!
//! - `GET /stream/{path}` and `GET /wsproxy/{path}` upgrade to a WebSocket
//!   and are relayed frame by frame
//! - everything else is relayed as a streaming HTTP exchange
//!
//! A leading `/v{N}/` segment is stripped from every path.

mod plain;
mod state;
mod ws;

pub use plain::upstream_path;
pub use state::GatewayState;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use kb_core::config::RelayConfig;
use kb_core::SessionClient;

/// Build the gateway router
pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route(
            "/stream/{*path}",
            get(ws::websocket_relay).fallback(plain::plain_relay),
        )
        .route(
            "/wsproxy/{*path}",
            get(ws::websocket_relay).fallback(plain::plain_relay),
        )
        .fallback(plain::plain_relay)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// HTTP server relaying requests to the remote API
pub struct GatewayProxyServer {
    listener: TcpListener,
    state: GatewayState,
    relay: RelayConfig,
}

impl GatewayProxyServer {
    /// Bind the gateway socket
    pub async fn bind(
        bind_addr: &str,
        client: Arc<dyn SessionClient>,
        relay: RelayConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            listener,
            state: GatewayState::new(client, cancel, relay.drain_timeout),
            relay,
        })
    }

    /// Address the server is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    /// Serve until the cancellation token fires, then close the client
    ///
    /// Upgraded WebSocket relays are not tracked by the HTTP server; they are
    /// awaited separately before the client goes away.
    pub async fn serve(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!("Gateway listening on {}", local_addr);

        let GatewayProxyServer {
            listener,
            state,
            relay,
        } = self;
        let shutdown = state.shutdown.clone();
        let client = Arc::clone(&state.client);
        let relays = state.relays.clone();

        axum::serve(listener, router(state))
            .with_graceful_shutdown(async move {
                shutdown.cancelled().await;
                tracing::info!("Gateway shutting down");
            })
            .await
            .context("gateway server exited")?;

        relays.close();
        tracing::debug!("Waiting for {} WebSocket relay(s) to close", relays.len());
        relays.wait().await;

        tokio::time::sleep(relay.shutdown_grace()).await;
        client.close().await;

        tracing::info!("Gateway stopped");
        Ok(())
    }
}
