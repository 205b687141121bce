//! Local proxy listener
//!
//! Accepts local TCP connections and bridges each one to the kernel service
//! WebSocket of a compute session.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::Instrument;

use kb_core::config::RelayConfig;
use kb_core::SessionClient;
use kb_relay::{service_unavailable_block, ByteDownstream, DuplexRelay};

/// The kernel service a local proxy forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalTarget {
    /// Compute session ID
    pub session_id: String,
    /// Service name, shown to the operator
    pub app: String,
    /// Transport of the service (`http`, `tcp`, ...)
    pub protocol: String,
}

impl LocalTarget {
    pub fn new(
        session_id: impl Into<String>,
        app: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            app: app.into(),
            protocol: protocol.into(),
        }
    }

    /// Path of the upstream WebSocket for this service
    pub fn upstream_path(&self) -> String {
        format!(
            "/stream/kernel/{}/{}proxy",
            self.session_id, self.protocol
        )
    }
}

impl fmt::Display for LocalTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.session_id, self.app)
    }
}

/// TCP listener that opens one upstream WebSocket per accepted connection
pub struct LocalProxyListener {
    /// Bound socket
    listener: TcpListener,
    /// Target service, shared read-only by every session
    target: Arc<LocalTarget>,
    /// Remote API client
    client: Arc<dyn SessionClient>,
    /// Relay tuning
    relay: RelayConfig,
    /// Cancellation token for graceful shutdown
    cancel: CancellationToken,
}

impl LocalProxyListener {
    /// Bind the local socket
    ///
    /// Nothing is accepted until [`serve`](Self::serve) runs, so callers can
    /// report the bound address first.
    pub async fn bind(
        bind_addr: &str,
        target: LocalTarget,
        client: Arc<dyn SessionClient>,
        relay: RelayConfig,
        cancel: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(bind_addr)
            .await
            .with_context(|| format!("Failed to bind to {}", bind_addr))?;

        Ok(Self {
            listener,
            target: Arc::new(target),
            client,
            relay,
            cancel,
        })
    }

    /// Address the listener is bound to
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener
            .local_addr()
            .context("Failed to read local address")
    }

    pub fn target(&self) -> &LocalTarget {
        &self.target
    }

    /// Accept connections until the cancellation token fires
    ///
    /// On shutdown, in-flight sessions are closed cleanly and awaited, then
    /// the session client is closed after a short grace delay.
    pub async fn serve(self) -> Result<()> {
        let local_addr = self.local_addr()?;
        tracing::info!(
            "Local proxy for {} listening on {}",
            self.target,
            local_addr
        );

        let sessions = TaskTracker::new();

        loop {
            tokio::select! {
                // Check for shutdown
                _ = self.cancel.cancelled() => {
                    tracing::info!("Local proxy shutting down");
                    break;
                }

                // Accept new connections
                result = self.listener.accept() => {
                    match result {
                        Ok((socket, peer_addr)) => {
                            self.handle_connection(&sessions, socket, peer_addr);
                        }
                        Err(e) => {
                            tracing::error!("Failed to accept connection: {}", e);
                        }
                    }
                }
            }
        }

        let LocalProxyListener {
            listener,
            client,
            relay,
            ..
        } = self;
        drop(listener);

        sessions.close();
        tracing::debug!("Waiting for {} session(s) to close", sessions.len());
        sessions.wait().await;

        tokio::time::sleep(relay.shutdown_grace()).await;
        client.close().await;

        tracing::info!("Local proxy stopped");
        Ok(())
    }

    /// Spawn a session for a newly accepted connection
    fn handle_connection(&self, sessions: &TaskTracker, socket: TcpStream, peer_addr: SocketAddr) {
        tracing::info!("New connection from {}", peer_addr);

        let path = self.target.upstream_path();
        let client = Arc::clone(&self.client);
        let relay = self.relay.clone();
        let cancel = self.cancel.clone();
        let span = tracing::info_span!("session", service = %self.target, peer = %peer_addr);

        sessions.spawn(
            run_session(socket, peer_addr, path, client, relay, cancel).instrument(span),
        );
    }
}

async fn run_session(
    mut socket: TcpStream,
    peer_addr: SocketAddr,
    path: String,
    client: Arc<dyn SessionClient>,
    relay: RelayConfig,
    cancel: CancellationToken,
) {
    let opened = tokio::select! {
        _ = cancel.cancelled() => {
            tracing::debug!("Cancelled before the upstream opened");
            let _ = socket.shutdown().await;
            return;
        }
        opened = client.open_websocket(&path) => opened,
    };

    let upstream = match opened {
        Ok(upstream) => upstream,
        Err(e) => {
            tracing::warn!("Could not open {}: {}", path, e);
            let block = service_unavailable_block(&e.to_string());
            if let Err(write_err) = socket.write_all(block.as_bytes()).await {
                tracing::debug!("Could not report failure to {}: {}", peer_addr, write_err);
            }
            let _ = socket.shutdown().await;
            return;
        }
    };

    let downstream = ByteDownstream::new(socket, relay.read_buffer_size);
    let result = DuplexRelay::new(peer_addr.to_string(), downstream, upstream, cancel)
        .with_drain_timeout(relay.drain_timeout)
        .run()
        .await;

    match result {
        Ok(outcome) if outcome.termination.is_failure() => {
            tracing::warn!(
                "Connection from {} closed with error: {}",
                peer_addr,
                outcome.termination
            );
        }
        Ok(outcome) => {
            tracing::info!(
                "Connection from {} closed ({}; {} bytes up, {} bytes down)",
                peer_addr,
                outcome.termination,
                outcome.bytes_up,
                outcome.bytes_down
            );
        }
        Err(e) => {
            tracing::error!("Session for {} failed: {}", peer_addr, e);
        }
    }
}
