//! Relay client error types.

/// Errors that can occur in the relay client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Handshake error: {0}")]
    Handshake(String),

    #[error("Relay rejected connection: {0}")]
    Rejected(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),

    #[error("Relay session task has stopped")]
    Closed,

    #[error("Settings store error: {0}")]
    Store(#[from] printsalot_core::Error),
}
