//! Error types for audiosync-receiver
//!
//! Only transport failures end a session; every other variant is reported and
//! the session carries on.

use audiosync_common::ProtocolError;
use thiserror::Error;

/// Main error type for the receiver
#[derive(Error, Debug)]
pub enum Error {
    /// Connection-level failure (session-fatal)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Inbound or outbound message could not be processed
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Audio output sink rejected samples
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Errors bubbled up from shared code
    #[error(transparent)]
    Common(#[from] audiosync_common::Error),
}

/// Convenience Result type using the receiver Error
pub type Result<T> = std::result::Result<T, Error>;
