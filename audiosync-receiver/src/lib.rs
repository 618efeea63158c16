//! # AudioSync Receiver
//!
//! Plays a coordinator's stream in lockstep with every other receiver:
//! - Clock Aligner: maps coordinator time onto the local clock
//! - Jitter Buffer: bounded reorder store keyed by sequence id
//! - Playback Scheduler: fires chunk playback at its aligned instant
//! - Session: connection/streaming state machine tying the above together
//! - Transport: WebSocket run loop

pub mod clock;
pub mod config;
pub mod error;
pub(crate) mod locks;
pub mod playback;
pub mod session;
pub mod transport;

pub use clock::{ClockAligner, SyncState};
pub use config::ReceiverConfig;
pub use error::{Error, Result};
pub use session::{ConnectionState, Session, SessionEvent, SessionSettings, StreamingPhase};
