//! Error Types
//!
//! Every protocol operation returns [`TransferError`]. Nothing is retried
//! internally: a failed chunk read, a hash mismatch or a rejected handshake
//! aborts the whole transfer and the caller decides whether to start a new
//! session.

use std::io;

use thiserror::Error;

/// Errors produced by the transfer protocol
#[derive(Error, Debug)]
pub enum TransferError {
    /// Dial, listen, accept, read, write, handshake or deadline failure
    #[error("Transport error ({context}): {source}")]
    Transport {
        context: &'static str,
        #[source]
        source: io::Error,
    },

    /// Local filesystem failure
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or truncated length-prefixed field
    #[error("Framing error: {0}")]
    Framing(String),

    /// Metadata JSON could not be encoded or decoded
    #[error("Metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// Content hash mismatch or undecodable payload
    #[error("Integrity check failed: {0}")]
    Integrity(String),

    /// Declared and actual byte counts differ
    #[error("Size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    /// Key generation or cipher failure
    #[error("Crypto error: {0}")]
    Crypto(String),

    /// PEM/X.509 decode failure or session-binding mismatch
    #[error("Certificate error: {0}")]
    Certificate(String),
}

pub type Result<T, E = TransferError> = std::result::Result<T, E>;

impl TransferError {
    /// Adapter for `map_err` on network operations
    pub fn transport(context: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| TransferError::Transport { context, source }
    }

    /// True when the failure was a deadline expiring
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            TransferError::Transport { source, .. } if source.kind() == io::ErrorKind::TimedOut
        )
    }
}
