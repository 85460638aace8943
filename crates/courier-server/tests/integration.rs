//! End-to-end tests against a real listener and WebSocket clients.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use courier_server::{CourierServer, ServerConfig};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

const TIMEOUT: Duration = Duration::from_secs(5);

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

async fn boot_server(config: ServerConfig) -> (SocketAddr, Arc<CourierServer>, JoinHandle<()>) {
    let config = ServerConfig { port: 0, ..config };
    let server = Arc::new(CourierServer::new(
        config,
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .build_recorder()
            .handle(),
    ));
    let (addr, handle) = server.listen().await.unwrap();
    (addr, server, handle)
}

/// Defaults with keepalive off, so clients that never read stay connected.
fn no_pings() -> ServerConfig {
    ServerConfig {
        ping_interval_secs: 0,
        ..ServerConfig::default()
    }
}

async fn connect(addr: SocketAddr) -> WsStream {
    let (ws, _) = connect_async(format!("ws://{addr}/ws")).await.unwrap();
    ws
}

/// Next text frame, skipping control frames.
async fn next_text(ws: &mut WsStream) -> String {
    timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(msg)) if msg.is_text() => return msg.to_text().unwrap().to_owned(),
                Some(Ok(_)) => continue,
                other => panic!("stream ended: {other:?}"),
            }
        }
    })
    .await
    .expect("timed out waiting for text frame")
}

async fn health(addr: SocketAddr) -> Value {
    reqwest::get(format!("http://{addr}/health"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap()
}

async fn wait_for_workers(addr: SocketAddr, n: u64) {
    timeout(TIMEOUT, async {
        loop {
            if health(addr).await["active_workers"].as_u64() == Some(n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("worker count never settled");
}

async fn broadcast(addr: SocketAddr, message: &str) -> u64 {
    let body: Value = reqwest::Client::new()
        .get(format!("http://{addr}/broadcast"))
        .query(&[("message", message)])
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    body["recipients"].as_u64().unwrap()
}

#[tokio::test]
async fn client_message_is_echoed() {
    let (addr, server, _handle) = boot_server(no_pings()).await;
    let mut ws = connect(addr).await;

    ws.send(Message::text("hi there")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "Client message: hi there");

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn broadcast_reaches_every_client() {
    let (addr, server, _handle) = boot_server(no_pings()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_workers(addr, 2).await;

    assert_eq!(broadcast(addr, "to everyone").await, 2);
    assert_eq!(next_text(&mut a).await, "to everyone");
    assert_eq!(next_text(&mut b).await, "to everyone");

    let h = health(addr).await;
    assert_eq!(h["status"], "ok");
    assert_eq!(h["active_connections"], 2);

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn disconnect_removes_worker() {
    let (addr, server, _handle) = boot_server(no_pings()).await;
    let mut a = connect(addr).await;
    let mut b = connect(addr).await;
    wait_for_workers(addr, 2).await;

    a.close(None).await.unwrap();
    wait_for_workers(addr, 1).await;

    assert_eq!(broadcast(addr, "who is left").await, 1);
    assert_eq!(next_text(&mut b).await, "who is left");
    assert_eq!(server.registry().connection_count(), 1);

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn messages_arrive_in_order() {
    let (addr, server, _handle) = boot_server(no_pings()).await;
    let mut ws = connect(addr).await;
    wait_for_workers(addr, 1).await;

    for i in 0..20 {
        assert_eq!(broadcast(addr, &format!("n{i}")).await, 1);
    }
    for i in 0..20 {
        assert_eq!(next_text(&mut ws).await, format!("n{i}"));
    }

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn connection_limit_is_enforced() {
    let (addr, server, _handle) = boot_server(ServerConfig {
        max_connections: 1,
        ..no_pings()
    })
    .await;
    let _first = connect(addr).await;
    wait_for_workers(addr, 1).await;

    let second = connect_async(format!("ws://{addr}/ws")).await;
    assert!(second.is_err());

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_sessions_and_server() {
    let (addr, server, handle) = boot_server(no_pings()).await;
    let mut ws = connect(addr).await;
    wait_for_workers(addr, 1).await;

    assert!(server.drain(vec![handle]).await);
    assert_eq!(server.registry().count(), 0);

    let ended = timeout(TIMEOUT, async {
        loop {
            match ws.next().await {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                Some(Ok(_)) => continue,
            }
        }
    })
    .await;
    assert!(ended.is_ok(), "client never saw the connection end");
}

#[tokio::test]
async fn binary_frames_are_not_echoed() {
    let (addr, server, _handle) = boot_server(no_pings()).await;
    let mut ws = connect(addr).await;

    ws.send(Message::binary(vec![0u8, 1, 2])).await.unwrap();
    ws.send(Message::text("text only")).await.unwrap();
    assert_eq!(next_text(&mut ws).await, "Client message: text only");

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn silent_client_is_dropped_after_ping_timeout() {
    let (addr, server, _handle) = boot_server(ServerConfig {
        ping_interval_secs: 1,
        ping_timeout_secs: 1,
        receive_timeout_ms: 200,
        ..ServerConfig::default()
    })
    .await;

    // Never read, so pings go unanswered.
    let _silent = connect(addr).await;
    wait_for_workers(addr, 1).await;

    wait_for_workers(addr, 0).await;
    assert_eq!(server.registry().connection_count(), 0);

    let _ = server.shutdown().await;
}

#[tokio::test]
async fn responsive_client_survives_pings() {
    let (addr, server, _handle) = boot_server(ServerConfig {
        ping_interval_secs: 1,
        ping_timeout_secs: 1,
        receive_timeout_ms: 200,
        ..ServerConfig::default()
    })
    .await;
    let mut ws = connect(addr).await;
    wait_for_workers(addr, 1).await;

    // Reading drives the client's automatic pongs.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(4);
    while tokio::time::Instant::now() < deadline {
        if let Ok(Some(Ok(msg))) = timeout(Duration::from_millis(100), ws.next()).await {
            assert!(msg.is_ping() || msg.is_pong(), "unexpected frame: {msg:?}");
        }
    }
    assert_eq!(health(addr).await["active_workers"], 1);

    let _ = server.shutdown().await;
}
