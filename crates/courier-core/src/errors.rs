/// Failure reported by a transport half.
///
/// A worker never retries on any of these: a failed send means the peer is
/// gone or the link is broken, and the worker stops itself.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("peer disconnected")]
    Disconnected,
    #[error("transport closed")]
    Closed,
    #[error("transport error: {0}")]
    Io(String),
}

impl TransportError {
    /// Short, stable label for logs and metric labels.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Closed => "closed",
            Self::Io(_) => "io",
        }
    }
}

/// Errors surfaced by the worker API.
///
/// Only `InvalidArgument` is ever returned to a caller; `SendFailure` is
/// contained inside the delivery loop and appears in logs.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("send failed: {0}")]
    SendFailure(#[from] TransportError),
}

impl WorkerError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::InvalidArgument(_) => "invalid_argument",
            Self::SendFailure(_) => "send_failure",
        }
    }
}
