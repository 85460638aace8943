//! Per-connection session loop.
//!
//! Creates the connection's worker, registers it, feeds inbound text back as
//! echoes, and retires the worker when the peer leaves, the worker dies, or
//! the process shuts down.

use std::sync::Arc;
use std::time::Duration;

use courier_core::{ConnectionId, MessageSink, MessageSource, Received, WorkerError, WorkerId};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::registry::WorkerRegistry;
use crate::worker::{WorkerConfig, WorkerHandle};

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Upper bound on a single receive wait.
    pub receive_timeout: Duration,
    /// Post each inbound message back to the sender.
    pub echo: bool,
    pub echo_prefix: String,
    pub worker: WorkerConfig,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            receive_timeout: Duration::from_secs(1),
            echo: true,
            echo_prefix: "Client message: ".into(),
            worker: WorkerConfig::default(),
        }
    }
}

/// Why a session ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SessionEnd {
    PeerDisconnected,
    WorkerStopped,
    Shutdown,
}

impl SessionEnd {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PeerDisconnected => "peer_disconnected",
            Self::WorkerStopped => "worker_stopped",
            Self::Shutdown => "shutdown",
        }
    }
}

#[derive(Clone, Debug)]
pub struct SessionSummary {
    pub connection_id: ConnectionId,
    pub worker_id: WorkerId,
    /// Text messages received from the peer.
    pub received: u64,
    pub end: SessionEnd,
}

/// Stops and unregisters the worker exactly once.
///
/// If the session future is dropped before [`finish`](Self::finish) runs,
/// `Drop` unregisters immediately and hands the stop to the runtime.
struct SessionGuard {
    connection_id: ConnectionId,
    worker: WorkerHandle,
    registry: Arc<WorkerRegistry>,
    armed: bool,
}

impl SessionGuard {
    async fn finish(mut self) {
        self.worker.stop().await;
        self.armed = false;
        let _ = self.registry.deregister_for_connection(&self.connection_id);
    }
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let _ = self.registry.deregister_for_connection(&self.connection_id);
        debug!(connection_id = %self.connection_id, "session dropped, cleaning up");
        if let Ok(rt) = tokio::runtime::Handle::try_current() {
            let worker = self.worker.clone();
            let _ = rt.spawn(async move { worker.stop().await });
        }
    }
}

/// Drive one connection until it ends.
///
/// Fails only if the worker cannot be created; in that case nothing was
/// registered.
pub async fn run_session<S, R>(
    connection_id: ConnectionId,
    sink: S,
    mut source: R,
    registry: Arc<WorkerRegistry>,
    config: &SessionConfig,
    shutdown: CancellationToken,
) -> Result<SessionSummary, WorkerError>
where
    S: MessageSink,
    R: MessageSource,
{
    let worker = WorkerHandle::start(sink, &config.worker).inspect_err(|e| {
        warn!(connection_id = %connection_id, error = %e, "could not start worker");
    })?;
    let _ = registry.register_for_connection(connection_id.clone(), worker.clone());
    let worker_id = worker.id().clone();
    debug!(connection_id = %connection_id, worker_id = %worker_id, "session started");

    let guard = SessionGuard {
        connection_id: connection_id.clone(),
        worker,
        registry,
        armed: true,
    };

    let mut received = 0u64;
    let end = loop {
        let next = tokio::select! {
            biased;
            () = shutdown.cancelled() => break SessionEnd::Shutdown,
            () = guard.worker.stopped() => break SessionEnd::WorkerStopped,
            next = source.receive(config.receive_timeout) => next,
        };
        match next {
            Received::Text(text) => {
                received += 1;
                if config.echo {
                    let _ = guard.worker.post(format!("{}{}", config.echo_prefix, text));
                }
            }
            Received::TimedOut => continue,
            Received::Disconnected => break SessionEnd::PeerDisconnected,
        }
    };

    guard.finish().await;
    debug!(
        connection_id = %connection_id,
        worker_id = %worker_id,
        received,
        end = end.as_str(),
        "session ended"
    );

    Ok(SessionSummary {
        connection_id,
        worker_id,
        received,
        end,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::WorkerState;
    use courier_core::memory;

    fn config(echo: bool) -> SessionConfig {
        SessionConfig {
            receive_timeout: Duration::from_millis(50),
            echo,
            echo_prefix: "Client message: ".into(),
            worker: WorkerConfig {
                stop_timeout: Duration::from_secs(1),
                ping_interval: None,
            },
        }
    }

    async fn wait_for(mut cond: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn echoes_and_cleans_up_on_disconnect() {
        let registry = Arc::new(WorkerRegistry::new());
        let (sink, source, mut peer) = memory::channel();
        let conn = ConnectionId::new();
        let session = tokio::spawn({
            let registry = Arc::clone(&registry);
            let conn = conn.clone();
            async move {
                let shutdown = CancellationToken::new();
                run_session(conn, sink, source, registry, &config(true), shutdown).await
            }
        });

        wait_for(|| registry.connection_count() == 1).await;
        let worker = registry.worker_for_connection(&conn).unwrap();

        assert!(peer.push("hi"));
        assert_eq!(peer.recv().await.unwrap(), "Client message: hi");

        peer.close();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.end, SessionEnd::PeerDisconnected);
        assert_eq!(summary.received, 1);
        assert_eq!(summary.connection_id, conn);
        assert_eq!(&summary.worker_id, worker.id());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.connection_count(), 0);
        assert_eq!(worker.state(), WorkerState::Stopped);
    }

    #[tokio::test]
    async fn echo_can_be_disabled() {
        let registry = Arc::new(WorkerRegistry::new());
        let (sink, source, mut peer) = memory::channel();
        let session = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                run_session(
                    ConnectionId::new(),
                    sink,
                    source,
                    registry,
                    &config(false),
                    CancellationToken::new(),
                )
                .await
            }
        });

        wait_for(|| registry.count() == 1).await;
        assert!(peer.push("quiet"));
        assert_eq!(registry.broadcast("from server"), 1);
        assert_eq!(peer.recv().await.unwrap(), "from server");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(peer.try_recv().is_none());

        peer.close();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.received, 1);
    }

    #[tokio::test]
    async fn closed_connection_fails_without_registering() {
        let registry = Arc::new(WorkerRegistry::new());
        let (sink, source, peer) = memory::channel();
        peer.close();

        let result = run_session(
            ConnectionId::new(),
            sink,
            source,
            Arc::clone(&registry),
            &config(true),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(WorkerError::InvalidArgument(_))));
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.connection_count(), 0);
    }

    #[tokio::test]
    async fn outbound_failure_ends_session() {
        let registry = Arc::new(WorkerRegistry::new());
        let (sink, source, peer) = memory::channel();
        let session = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                run_session(
                    ConnectionId::new(),
                    sink,
                    source,
                    registry,
                    &config(true),
                    CancellationToken::new(),
                )
                .await
            }
        });

        wait_for(|| registry.count() == 1).await;
        peer.fail_sends(true);
        assert!(peer.push("trigger echo"));

        let summary = tokio::time::timeout(Duration::from_secs(2), session)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(summary.end, SessionEnd::WorkerStopped);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn shutdown_token_ends_session() {
        let registry = Arc::new(WorkerRegistry::new());
        let shutdown = CancellationToken::new();
        let (sink, source, _peer) = memory::channel();
        let session = tokio::spawn({
            let registry = Arc::clone(&registry);
            let shutdown = shutdown.clone();
            async move {
                let conn = ConnectionId::new();
                run_session(conn, sink, source, registry, &config(true), shutdown).await
            }
        });

        wait_for(|| registry.count() == 1).await;
        shutdown.cancel();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.end, SessionEnd::Shutdown);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_peer_keeps_session_open() {
        let registry = Arc::new(WorkerRegistry::new());
        let (sink, source, peer) = memory::channel();
        let mut cfg = config(true);
        cfg.receive_timeout = Duration::from_secs(1);
        let session = tokio::spawn({
            let registry = Arc::clone(&registry);
            async move {
                let shutdown = CancellationToken::new();
                run_session(ConnectionId::new(), sink, source, registry, &cfg, shutdown).await
            }
        });

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert!(!session.is_finished());
        assert_eq!(registry.count(), 1);

        peer.close();
        let summary = session.await.unwrap().unwrap();
        assert_eq!(summary.end, SessionEnd::PeerDisconnected);
        assert_eq!(summary.received, 0);
    }

    #[tokio::test]
    async fn aborted_session_still_cleans_up() {
        let registry = Arc::new(WorkerRegistry::new());
        let (sink, source, _peer) = memory::channel();
        let conn = ConnectionId::new();
        let session = tokio::spawn({
            let registry = Arc::clone(&registry);
            let conn = conn.clone();
            async move {
                let shutdown = CancellationToken::new();
                run_session(conn, sink, source, registry, &config(true), shutdown).await
            }
        });

        wait_for(|| registry.connection_count() == 1).await;
        let worker = registry.worker_for_connection(&conn).unwrap();

        session.abort();
        assert!(session.await.unwrap_err().is_cancelled());
        assert_eq!(registry.count(), 0);
        assert_eq!(registry.connection_count(), 0);

        tokio::time::timeout(Duration::from_secs(1), worker.stopped())
            .await
            .unwrap();
    }
}
