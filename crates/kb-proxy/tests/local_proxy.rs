//! Local proxy integration tests
//!
//! Real loopback sockets on the local side, scripted upstreams behind a fake
//! session client.

mod common;

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use common::{fast_relay_config, FakeClient, WsBehavior, TEST_TIMEOUT};
use kb_core::ProxyError;
use kb_proxy::{LocalProxyListener, LocalTarget};

const JUPYTER_RESPONSE: &str =
    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: 11\r\n\r\n<h1>hi</h1>";

async fn start_proxy(
    client: Arc<FakeClient>,
    target: LocalTarget,
) -> (SocketAddr, CancellationToken, JoinHandle<anyhow::Result<()>>) {
    let cancel = CancellationToken::new();
    let listener = LocalProxyListener::bind(
        "127.0.0.1:0",
        target,
        client,
        fast_relay_config(),
        cancel.clone(),
    )
    .await
    .expect("bind local proxy");
    let addr = listener.local_addr().unwrap();
    let handle = tokio::spawn(listener.serve());
    (addr, cancel, handle)
}

#[tokio::test]
async fn test_http_request_reaches_kernel_service() {
    let client = FakeClient::ws(WsBehavior::Respond(JUPYTER_RESPONSE));
    let (addr, cancel, handle) =
        start_proxy(client.clone(), LocalTarget::new("sess-1", "jupyter", "http")).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\n\r\n")
        .await
        .unwrap();

    let mut response = String::new();
    timeout(TEST_TIMEOUT, conn.read_to_string(&mut response))
        .await
        .expect("upstream close did not reach the local socket")
        .unwrap();
    assert_eq!(response, JUPYTER_RESPONSE);
    assert_eq!(client.ws_paths(), vec!["/stream/kernel/sess-1/httpproxy"]);

    cancel.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
    assert!(client.is_closed());
}

#[tokio::test]
async fn test_unreachable_upstream_writes_error_block() {
    let client = FakeClient::ws(WsBehavior::Fail(|| {
        ProxyError::UpstreamUnreachable("connection refused".into())
    }));
    let (addr, cancel, handle) =
        start_proxy(client.clone(), LocalTarget::new("sess-1", "jupyter", "http")).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    let mut response = String::new();
    timeout(TEST_TIMEOUT, conn.read_to_string(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        response,
        "HTTP/1.1 503 Service Unavailable\r\nConnection: Closed\r\n\r\nWebSocket reply: Upstream unreachable: connection refused"
    );

    // The listener keeps serving after a failed session
    let mut second = TcpStream::connect(addr).await.unwrap();
    let mut again = String::new();
    timeout(TEST_TIMEOUT, second.read_to_string(&mut again))
        .await
        .unwrap()
        .unwrap();
    assert!(again.starts_with("HTTP/1.1 503 Service Unavailable"));

    cancel.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_concurrent_sessions_are_isolated() {
    let client = FakeClient::ws(WsBehavior::Echo);
    let (addr, cancel, handle) =
        start_proxy(client.clone(), LocalTarget::new("sess-2", "ssh", "tcp")).await;

    let mut clients = Vec::new();
    for i in 0..50 {
        clients.push(tokio::spawn(async move {
            let payload: Vec<u8> = format!("client-{:02}|", i).repeat(200).into_bytes();
            let mut conn = TcpStream::connect(addr).await.unwrap();
            let (mut read, mut write) = conn.split();

            let send = async {
                write.write_all(&payload).await.unwrap();
                write.shutdown().await.unwrap();
            };
            let mut echoed = Vec::new();
            let recv = read.read_to_end(&mut echoed);
            let (_, received) = tokio::join!(send, recv);
            received.unwrap();
            assert_eq!(echoed, payload, "session {} got foreign bytes", i);
        }));
    }

    for client_task in clients {
        timeout(TEST_TIMEOUT, client_task).await.unwrap().unwrap();
    }
    assert_eq!(client.ws_paths().len(), 50);
    assert!(client
        .ws_paths()
        .iter()
        .all(|path| path == "/stream/kernel/sess-2/tcpproxy"));

    cancel.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();
}

#[tokio::test]
async fn test_shutdown_closes_open_sessions_cleanly() {
    let client = FakeClient::ws(WsBehavior::Echo);
    let (addr, cancel, handle) =
        start_proxy(client.clone(), LocalTarget::new("sess-3", "ttyd", "http")).await;

    let mut conn = TcpStream::connect(addr).await.unwrap();
    conn.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    timeout(TEST_TIMEOUT, conn.read_exact(&mut buf))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(&buf, b"ping");

    cancel.cancel();
    timeout(TEST_TIMEOUT, handle).await.unwrap().unwrap().unwrap();

    // Plain EOF: no error block on cancellation
    let mut rest = Vec::new();
    timeout(TEST_TIMEOUT, conn.read_to_end(&mut rest))
        .await
        .unwrap()
        .unwrap();
    assert!(rest.is_empty());
    assert!(client.is_closed());

    // Nothing listens any more
    assert!(TcpStream::connect(addr).await.is_err());
}
