//! Error types for the stornet core.

use thiserror::Error;

use crate::crypto::NoiseError;

/// Errors surfaced by listeners, dialers, connections, and drivers.
#[derive(Debug, Error)]
pub enum Error {
    /// Nothing to read at the current cursor. Recoverable; the caller polls.
    #[error("no data available")]
    NoData,

    /// No registered driver exists for the requested URL scheme.
    #[error("unsupported scheme: {0}")]
    UnsupportedScheme(String),

    /// The provided options result in an invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Required handshake or token SAS values are missing from the URL.
    #[error("missing handshake or token SAS in URL")]
    MissingSas,

    /// A SAS value is not properly URL/base64 encoded.
    #[error("invalid SAS encoding")]
    InvalidSas,

    /// The decrypted token payload could not be decoded.
    #[error("failed to decode token payload: {0}")]
    DecodeToken(#[from] serde_json::Error),

    /// The rendezvous handshake post or token fetch failed irrecoverably.
    #[error("failed to exchange handshake: {0}")]
    HandshakeExchange(String),

    /// Noise handshake or data-channel cryptography failed.
    #[error(transparent)]
    Noise(#[from] NoiseError),

    /// Operation against a closed connection or listener.
    #[error("connection closed")]
    Closed,

    /// Write against a connection whose write side was shut down.
    #[error("closed pipe")]
    ClosedPipe,

    /// The per-side deadline elapsed before the operation could complete.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// The owning cancellation scope was cancelled while blocking.
    #[error("operation cancelled")]
    Cancelled,

    /// Raw transport or rendezvous failure other than [`Error::NoData`].
    #[error("driver error: {0}")]
    Driver(String),

    /// Underlying I/O failure from a local driver.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// True when the error is the recoverable no-data condition.
    pub fn is_no_data(&self) -> bool {
        matches!(self, Error::NoData)
    }
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;
