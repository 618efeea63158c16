//! Common error types for AudioSync

use thiserror::Error;

/// Common result type for AudioSync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types across AudioSync services
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Wire protocol decode or encode error
    #[error("Protocol error: {0}")]
    Protocol(#[from] crate::protocol::ProtocolError),
}
