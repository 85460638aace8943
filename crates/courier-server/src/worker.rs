//! Mailbox worker.
//!
//! A worker owns the outbound half of one connection and a single delivery
//! task. Anyone holding a [`WorkerHandle`] may [`post`](WorkerHandle::post);
//! the delivery task drains the mailbox in order and is the only place the
//! sink is ever touched. A failed send or ping stops the worker from the
//! inside, without retrying.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use courier_core::{MessageSink, WorkerError, WorkerId};
use courier_telemetry::metrics::{
    MESSAGES_DELIVERED_TOTAL, MESSAGES_DROPPED_TOTAL, SEND_FAILURES_TOTAL, WORKERS_STARTED_TOTAL,
    WORKERS_STOPPED_TOTAL, WORKER_STOP_TIMEOUTS_TOTAL,
};
use metrics::counter;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lifecycle of a worker. Transitions only move forward.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl WorkerState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
        }
    }
}

#[derive(Clone, Debug)]
pub struct WorkerConfig {
    /// How long `stop` waits for the delivery task before aborting it.
    pub stop_timeout: Duration,
    /// Keepalive interval. `None` disables pings.
    pub ping_interval: Option<Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            stop_timeout: Duration::from_secs(5),
            ping_interval: None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StopReason {
    Requested,
    SendFailure,
    Orphaned,
}

impl StopReason {
    fn as_str(self) -> &'static str {
        match self {
            Self::Requested => "requested",
            Self::SendFailure => "send_failure",
            Self::Orphaned => "orphaned",
        }
    }
}

struct Shared {
    id: WorkerId,
    state: AtomicU8,
    /// Fired to ask the delivery task to exit.
    cancel: CancellationToken,
    /// Fired once the worker is `Stopped`.
    stopped: CancellationToken,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Shared {
    fn state(&self) -> WorkerState {
        WorkerState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn begin_stopping(&self) {
        let _ = self.state.compare_exchange(
            WorkerState::Running as u8,
            WorkerState::Stopping as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    fn record_dropped(&self, n: u64) {
        if n == 0 {
            return;
        }
        let _ = self.dropped.fetch_add(n, Ordering::Relaxed);
        counter!(MESSAGES_DROPPED_TOTAL).increment(n);
    }

    fn finish(&self, reason: StopReason) {
        let prev = self.state.swap(WorkerState::Stopped as u8, Ordering::AcqRel);
        if prev != WorkerState::Stopped as u8 {
            counter!(WORKERS_STOPPED_TOTAL, "reason" => reason.as_str()).increment(1);
            debug!(worker_id = %self.id, reason = reason.as_str(), "worker stopped");
        }
        self.stopped.cancel();
    }
}

/// Cloneable handle to a running worker.
#[derive(Clone)]
pub struct WorkerHandle {
    shared: Arc<Shared>,
    mailbox: mpsc::UnboundedSender<Arc<str>>,
    task: Arc<Mutex<Option<JoinHandle<()>>>>,
    stop_timeout: Duration,
}

impl std::fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerHandle")
            .field("id", &self.shared.id)
            .field("state", &self.state())
            .finish()
    }
}

impl WorkerHandle {
    /// Bind a worker to `sink` and spawn its delivery task.
    ///
    /// Fails with [`WorkerError::InvalidArgument`] if the sink is already
    /// closed. Must be called from within a tokio runtime.
    pub fn start<S: MessageSink>(sink: S, config: &WorkerConfig) -> Result<Self, WorkerError> {
        if !sink.is_open() {
            return Err(WorkerError::InvalidArgument(
                "connection is absent or already closed".into(),
            ));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            id: WorkerId::new(),
            state: AtomicU8::new(WorkerState::Created as u8),
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        });

        shared
            .state
            .store(WorkerState::Running as u8, Ordering::Release);
        let task = tokio::spawn(deliver(sink, rx, Arc::clone(&shared), config.ping_interval));

        counter!(WORKERS_STARTED_TOTAL).increment(1);
        debug!(worker_id = %shared.id, "worker started");

        Ok(Self {
            shared,
            mailbox: tx,
            task: Arc::new(Mutex::new(Some(task))),
            stop_timeout: config.stop_timeout,
        })
    }

    pub fn id(&self) -> &WorkerId {
        &self.shared.id
    }

    pub fn state(&self) -> WorkerState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.state() == WorkerState::Running
    }

    /// Messages the sink accepted.
    pub fn delivered(&self) -> u64 {
        self.shared.delivered.load(Ordering::Relaxed)
    }

    /// Messages posted but never delivered.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Enqueue a message. Never blocks.
    ///
    /// Returns `false` when the worker is no longer running; the message is
    /// discarded.
    pub fn post(&self, text: impl Into<Arc<str>>) -> bool {
        if self.is_running() && self.mailbox.send(text.into()).is_ok() {
            return true;
        }
        self.shared.record_dropped(1);
        debug!(
            worker_id = %self.shared.id,
            state = self.state().as_str(),
            "post to stopped worker dropped"
        );
        false
    }

    /// Stop the worker and wait for its delivery task.
    ///
    /// Idempotent. The in-flight send, if any, is abandoned. If the task does
    /// not finish within the stop timeout it is aborted and reported.
    pub async fn stop(&self) {
        self.shared.begin_stopping();
        self.shared.cancel.cancel();

        let task = self.task.lock().take();
        let Some(mut task) = task else {
            // Someone else is joining the task; wait for them.
            let _ = tokio::time::timeout(self.stop_timeout, self.shared.stopped.cancelled()).await;
            return;
        };

        match tokio::time::timeout(self.stop_timeout, &mut task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) if e.is_panic() => {
                warn!(worker_id = %self.shared.id, "delivery task panicked");
            }
            Ok(Err(_)) => {}
            Err(_) => {
                task.abort();
                counter!(WORKER_STOP_TIMEOUTS_TOTAL).increment(1);
                warn!(
                    worker_id = %self.shared.id,
                    timeout_ms = self.stop_timeout.as_millis() as u64,
                    "delivery task did not exit in time, aborted"
                );
            }
        }
        self.shared.finish(StopReason::Requested);
    }

    /// Resolves once the worker has reached `Stopped`, for any reason.
    pub async fn stopped(&self) {
        self.shared.stopped.cancelled().await;
    }
}

enum Step {
    Send(Arc<str>),
    Ping,
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(interval) => {
            let _ = interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

async fn deliver<S: MessageSink>(
    mut sink: S,
    mut rx: mpsc::UnboundedReceiver<Arc<str>>,
    shared: Arc<Shared>,
    ping_interval: Option<Duration>,
) {
    let mut ticker = ping_interval.and_then(|period| {
        let start = Instant::now().checked_add(period)?;
        let mut interval = tokio::time::interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        Some(interval)
    });

    let reason = loop {
        let step = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => break StopReason::Requested,
            msg = rx.recv() => match msg {
                Some(text) => Step::Send(text),
                None => break StopReason::Orphaned,
            },
            () = tick(&mut ticker) => Step::Ping,
        };

        let is_send = matches!(step, Step::Send(_));
        let outcome = tokio::select! {
            biased;
            () = shared.cancel.cancelled() => None,
            res = async {
                match &step {
                    Step::Send(text) => sink.send(text).await,
                    Step::Ping => sink.ping().await,
                }
            } => Some(res),
        };

        match outcome {
            None => {
                if is_send {
                    shared.record_dropped(1);
                }
                break StopReason::Requested;
            }
            Some(Ok(())) => {
                if is_send {
                    let _ = shared.delivered.fetch_add(1, Ordering::Relaxed);
                    counter!(MESSAGES_DELIVERED_TOTAL).increment(1);
                }
            }
            Some(Err(e)) => {
                if is_send {
                    shared.record_dropped(1);
                }
                counter!(SEND_FAILURES_TOTAL, "error_kind" => e.error_kind()).increment(1);
                warn!(
                    worker_id = %shared.id,
                    error = %e,
                    op = if is_send { "send" } else { "ping" },
                    "transport failed, stopping worker"
                );
                break StopReason::SendFailure;
            }
        }
    };

    shared.begin_stopping();
    rx.close();
    let mut leftover = 0;
    while rx.try_recv().is_ok() {
        leftover += 1;
    }
    shared.record_dropped(leftover);
    if reason == StopReason::SendFailure {
        info!(worker_id = %shared.id, dropped = leftover, "worker stopped itself");
    }
    shared.finish(reason);
}
