//! Server error types.

use thiserror::Error;

/// Errors that stop the server from running.
///
/// Request-level failures never surface here; they become HTTP
/// responses.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The configured address does not parse.
    #[error("Invalid address '{addr}': {reason}")]
    InvalidAddress {
        /// The address as configured.
        addr: String,
        /// Parser message.
        reason: String,
    },

    /// Binding the listener failed.
    #[error("Failed to bind to {addr}: {source}")]
    Bind {
        /// The address that could not be bound.
        addr: std::net::SocketAddr,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// I/O error during server operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration could not be loaded.
    #[error(transparent)]
    Config(#[from] portico_config::ConfigError),
}

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;
