use thiserror::Error;

/// Link-level failures. These are recovered locally by reconnection - the engine never
///  surfaces them to `send()` callers directly.
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("link is not open")]
    NotOpen,
    #[error("peer disconnected")]
    Disconnected,
    #[error("connect failed: {0}")]
    Connect(String),
    #[error("link i/o failed: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("payload of {len} bytes exceeds the frame limit of {max} bytes")]
    PayloadTooLarge { len: usize, max: usize },
}

/// Failure outcomes of a `send()` call. Decode anomalies and link loss are *not* part of
///  this - they are handled inside the engine.
#[derive(Debug, Error)]
pub enum SendError {
    /// all retries exhausted without receiving an acknowledgement
    #[error("no acknowledgement after all retries")]
    AckTimeout,
    /// the session was stopped while the send was pending
    #[error("send cancelled by session shutdown")]
    Cancelled,
    #[error(transparent)]
    Encode(#[from] EncodeError),
}
