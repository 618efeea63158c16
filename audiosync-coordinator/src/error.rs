//! Error types for audiosync-coordinator

use audiosync_common::ProtocolError;
use thiserror::Error;

/// Main error type for the coordinator
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration file loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// No device registered under this id
    #[error("Device not found: {0}")]
    DeviceNotFound(String),

    /// Request value outside its accepted range
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// `start_streaming` while a stream is running
    #[error("Already streaming {0}")]
    AlreadyStreaming(String),

    /// Chunk source could not be opened
    #[error("Audio source error: {0}")]
    Source(String),

    /// Inbound message could not be decoded
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// Errors bubbled up from shared code
    #[error(transparent)]
    Common(#[from] audiosync_common::Error),
}

/// Convenience Result type using the coordinator Error
pub type Result<T> = std::result::Result<T, Error>;
