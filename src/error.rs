//! Error types for termgate.

use thiserror::Error;

/// Main error type for session connection operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error from underlying system calls.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Frame encoding failed.
    #[error("codec error: {message}")]
    Codec { message: String },

    /// Transport layer error.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The console origin could not be turned into a channel address.
    #[error("invalid endpoint: {message}")]
    InvalidEndpoint { message: String },

    /// The channel was closed.
    #[error("connection closed")]
    ConnectionClosed,
}

impl Error {
    /// Returns true if this error is transient and reconnection may help.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Transport { .. } | Error::ConnectionClosed | Error::Io(_)
        )
    }
}

/// Convenience result type for termgate operations.
pub type Result<T> = std::result::Result<T, Error>;
