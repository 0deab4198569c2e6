//! Error types for the SafeView environment abstraction.

use thiserror::Error;

/// Errors that can occur in the environment abstraction layer.
#[derive(Debug, Error)]
pub enum EnvError {
    /// Socket-level failure on an open connection
    #[error("Network error: {0}")]
    NetworkError(String),

    /// The remote end could not be reached or refused the handshake
    #[error("Connect to {url} failed: {reason}")]
    ConnectFailed { url: String, reason: String },

    /// Operation timed out
    #[error("Timeout after {0}ms")]
    Timeout(u64),
}

impl EnvError {
    /// Creates a network error.
    pub fn network(msg: impl Into<String>) -> Self {
        Self::NetworkError(msg.into())
    }

    /// Creates a connect error for the given endpoint.
    pub fn connect_failed(url: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Self::ConnectFailed {
            url: url.into(),
            reason: reason.to_string(),
        }
    }
}
