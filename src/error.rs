use std::error::Error as StdError;

/// Boxed error type used at hook and transport seams.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Errors produced by the messaging core.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum WsError {
    /// Operation on a closed connection, pool, or hub.
    #[error("closed")]
    Closed,

    /// Non-blocking submit to a full queue.
    #[error("queue full")]
    Full,

    /// The caller's deadline expired before admission or delivery.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Invalid frame or malformed wire data.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid JSON.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Broker publish or subscribe failure.
    #[error("broker error: {0}")]
    Upstream(#[source] BoxError),

    /// Recoverable I/O error on the wire. The affected connection is closed;
    /// the client reconnect loop treats this as retryable.
    #[error("transport error: {0}")]
    Transport(#[source] BoxError),

    /// Listener bind failure or other fatal I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl WsError {
    /// Wrap a broker error.
    pub fn upstream(err: impl Into<BoxError>) -> Self {
        Self::Upstream(err.into())
    }

    /// Wrap a wire-level error.
    pub fn transport(err: impl Into<BoxError>) -> Self {
        Self::Transport(err.into())
    }
}
