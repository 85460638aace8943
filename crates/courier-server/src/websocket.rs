//! Transport halves over an axum WebSocket.

use std::time::Duration;

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket};
use courier_core::{MessageSink, MessageSource, Received, TransportError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::time::Instant;
use tracing::debug;

/// Stand-in deadline for receive timeouts too large to add to `now`.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365);

/// Split a socket into the halves a session needs.
///
/// `idle_timeout` bounds how long the peer may stay silent (no frames, no
/// pongs) before the source reports it as gone.
pub fn split(socket: WebSocket, idle_timeout: Duration) -> (WsSink, WsSource) {
    let (tx, rx) = socket.split();
    (
        WsSink { tx, open: true },
        WsSource {
            rx,
            last_seen: Instant::now(),
            idle_timeout,
        },
    )
}

pub struct WsSink {
    tx: SplitSink<WebSocket, Message>,
    open: bool,
}

impl WsSink {
    async fn write(&mut self, msg: Message) -> Result<(), TransportError> {
        if !self.open {
            return Err(TransportError::Closed);
        }
        self.tx.send(msg).await.map_err(|e| {
            self.open = false;
            TransportError::Io(e.to_string())
        })
    }
}

#[async_trait]
impl MessageSink for WsSink {
    fn is_open(&self) -> bool {
        self.open
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        self.write(Message::Text(text.into())).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        self.write(Message::Ping(Bytes::new())).await
    }
}

pub struct WsSource {
    rx: SplitStream<WebSocket>,
    last_seen: Instant,
    idle_timeout: Duration,
}

#[async_trait]
impl MessageSource for WsSource {
    async fn receive(&mut self, timeout: Duration) -> Received {
        let now = Instant::now();
        let deadline = now.checked_add(timeout).unwrap_or(now + FAR_FUTURE);
        loop {
            let frame = match tokio::time::timeout_at(deadline, self.rx.next()).await {
                Err(_) => {
                    if self.last_seen.elapsed() > self.idle_timeout {
                        debug!(
                            idle_ms = self.last_seen.elapsed().as_millis() as u64,
                            "peer silent past idle timeout"
                        );
                        return Received::Disconnected;
                    }
                    return Received::TimedOut;
                }
                Ok(None) => return Received::Disconnected,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "websocket receive failed");
                    return Received::Disconnected;
                }
                Ok(Some(Ok(frame))) => frame,
            };

            self.last_seen = Instant::now();
            match frame {
                Message::Text(text) => return Received::Text(text.as_str().to_owned()),
                Message::Close(_) => return Received::Disconnected,
                Message::Binary(data) => {
                    debug!(len = data.len(), "ignoring binary frame");
                }
                Message::Ping(_) | Message::Pong(_) => {}
            }
        }
    }
}
