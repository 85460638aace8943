//! Transport seams.
//!
//! A connection is split into an outbound [`MessageSink`], owned exclusively
//! by the connection's mailbox worker, and an inbound [`MessageSource`],
//! owned by the session loop. Neither half knows about the other.

use std::time::Duration;

use async_trait::async_trait;

use crate::errors::TransportError;

/// Outcome of a bounded receive.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Received {
    /// A text frame from the peer.
    Text(String),
    /// Nothing arrived before the timeout; the peer may still be there.
    TimedOut,
    /// The peer is gone or the transport failed.
    Disconnected,
}

/// Outbound half of a connection.
#[async_trait]
pub trait MessageSink: Send + 'static {
    /// Whether the transport can still carry messages.
    ///
    /// A sink that is already closed when a worker is created is treated as
    /// an absent connection.
    fn is_open(&self) -> bool {
        true
    }

    /// Deliver one text message to the peer.
    async fn send(&mut self, text: &str) -> Result<(), TransportError>;

    /// Transport-level keepalive. Transports without one succeed trivially.
    async fn ping(&mut self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// Inbound half of a connection.
#[async_trait]
pub trait MessageSource: Send {
    /// Wait at most `timeout` for the next text message.
    async fn receive(&mut self, timeout: Duration) -> Received;
}

#[async_trait]
impl<S: MessageSink + ?Sized> MessageSink for Box<S> {
    fn is_open(&self) -> bool {
        (**self).is_open()
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        (**self).send(text).await
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        (**self).ping().await
    }
}

#[async_trait]
impl<S: MessageSource + ?Sized> MessageSource for Box<S> {
    async fn receive(&mut self, timeout: Duration) -> Received {
        (**self).receive(timeout).await
    }
}
