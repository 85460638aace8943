//! In-process transport.
//!
//! [`channel`] returns the two halves a session needs plus a [`MemoryPeer`]
//! playing the remote side. The peer can read what was sent, inject inbound
//! text, close the link, and inject send failures or stalls. Used by tests
//! and by embedders that want a worker without a network socket.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;

use crate::errors::TransportError;
use crate::transport::{MessageSink, MessageSource, Received};

struct LinkState {
    closed: CancellationToken,
    fail_sends: AtomicBool,
    stalled: AtomicBool,
    released: Notify,
    send_attempts: AtomicUsize,
    pings: AtomicUsize,
}

/// Create a connected sink/source pair and the peer that observes them.
pub fn channel() -> (MemorySink, MemorySource, MemoryPeer) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, in_rx) = mpsc::unbounded_channel();
    let state = Arc::new(LinkState {
        closed: CancellationToken::new(),
        fail_sends: AtomicBool::new(false),
        stalled: AtomicBool::new(false),
        released: Notify::new(),
        send_attempts: AtomicUsize::new(0),
        pings: AtomicUsize::new(0),
    });

    let sink = MemorySink {
        outbound: out_tx,
        state: Arc::clone(&state),
    };
    let source = MemorySource {
        inbound: in_rx,
        state: Arc::clone(&state),
    };
    let peer = MemoryPeer {
        outbound: out_rx,
        inbound: in_tx,
        state,
    };
    (sink, source, peer)
}

/// Outbound half of an in-memory link.
pub struct MemorySink {
    outbound: mpsc::UnboundedSender<String>,
    state: Arc<LinkState>,
}

#[async_trait]
impl MessageSink for MemorySink {
    fn is_open(&self) -> bool {
        !self.state.closed.is_cancelled() && !self.outbound.is_closed()
    }

    async fn send(&mut self, text: &str) -> Result<(), TransportError> {
        let _ = self.state.send_attempts.fetch_add(1, Ordering::Relaxed);

        while self.state.stalled.load(Ordering::Acquire) {
            let released = self.state.released.notified();
            if !self.state.stalled.load(Ordering::Acquire) {
                break;
            }
            tokio::select! {
                () = self.state.closed.cancelled() => return Err(TransportError::Disconnected),
                () = released => {}
            }
        }

        if self.state.closed.is_cancelled() {
            return Err(TransportError::Disconnected);
        }
        if self.state.fail_sends.load(Ordering::Relaxed) {
            return Err(TransportError::Io("injected send failure".into()));
        }
        self.outbound
            .send(text.to_owned())
            .map_err(|_| TransportError::Closed)
    }

    async fn ping(&mut self) -> Result<(), TransportError> {
        let _ = self.state.pings.fetch_add(1, Ordering::Relaxed);
        if self.state.closed.is_cancelled() || self.outbound.is_closed() {
            Err(TransportError::Disconnected)
        } else {
            Ok(())
        }
    }
}

/// Inbound half of an in-memory link.
pub struct MemorySource {
    inbound: mpsc::UnboundedReceiver<String>,
    state: Arc<LinkState>,
}

#[async_trait]
impl MessageSource for MemorySource {
    async fn receive(&mut self, timeout: Duration) -> Received {
        if self.state.closed.is_cancelled() {
            return Received::Disconnected;
        }
        tokio::select! {
            biased;
            () = self.state.closed.cancelled() => Received::Disconnected,
            res = tokio::time::timeout(timeout, self.inbound.recv()) => match res {
                Ok(Some(text)) => Received::Text(text),
                Ok(None) => Received::Disconnected,
                Err(_) => Received::TimedOut,
            },
        }
    }
}

/// The remote end of an in-memory link.
pub struct MemoryPeer {
    outbound: mpsc::UnboundedReceiver<String>,
    inbound: mpsc::UnboundedSender<String>,
    state: Arc<LinkState>,
}

impl MemoryPeer {
    /// Next message the sink delivered, waiting if none is queued.
    pub async fn recv(&mut self) -> Option<String> {
        self.outbound.recv().await
    }

    /// Next delivered message, if one is already queued.
    pub fn try_recv(&mut self) -> Option<String> {
        self.outbound.try_recv().ok()
    }

    /// Everything delivered so far, without waiting.
    pub fn drain(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.outbound.try_recv() {
            out.push(text);
        }
        out
    }

    /// Queue a message for the source to receive.
    pub fn push(&self, text: impl Into<String>) -> bool {
        self.inbound.send(text.into()).is_ok()
    }

    /// Drop the link from the peer side. Both halves observe a disconnect.
    pub fn close(&self) {
        self.state.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.state.closed.is_cancelled()
    }

    /// Make every subsequent send fail with an I/O error.
    pub fn fail_sends(&self, fail: bool) {
        self.state.fail_sends.store(fail, Ordering::Relaxed);
    }

    /// Hold sends in flight until released or the link closes.
    pub fn stall_sends(&self, stall: bool) {
        self.state.stalled.store(stall, Ordering::Release);
        if !stall {
            self.state.released.notify_waiters();
        }
    }

    /// Number of send calls the sink has started, successful or not.
    pub fn send_attempts(&self) -> usize {
        self.state.send_attempts.load(Ordering::Relaxed)
    }

    pub fn ping_count(&self) -> usize {
        self.state.pings.load(Ordering::Relaxed)
    }
}
