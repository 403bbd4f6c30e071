//! Server error types.

use thiserror::Error;

/// Fatal errors starting or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Binding or serving the TCP listener failed.
    #[error("listener error: {0}")]
    Io(#[from] std::io::Error),
    /// The Prometheus recorder could not be installed.
    #[error("failed to install metrics recorder: {0}")]
    Metrics(String),
}

/// Soft failure of a single best-effort delivery.
///
/// Returned per recipient and never propagated past a broadcast loop.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq)]
pub enum DeliveryError {
    /// The peer's outbound queue is full.
    #[error("outbound queue full")]
    Full,
    /// The peer's writer has gone away.
    #[error("outbound channel closed")]
    Closed,
    /// The message could not be serialized.
    #[error("message could not be encoded")]
    Encode,
}

impl DeliveryError {
    /// Metric label for this failure.
    pub fn as_label(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::Closed => "closed",
            Self::Encode => "encode",
        }
    }
}
