//! # AudioSync Common Library
//!
//! Shared code for the AudioSync coordinator and receivers including:
//! - Wire protocol (tagged JSON message enums)
//! - Chunk and audio format model
//! - Device roster records
//! - Time sources (wall clock and manual test clock)
//! - Bootstrap configuration loading

pub mod chunk;
pub mod config;
pub mod device;
pub mod error;
pub mod protocol;
pub mod time;

pub use chunk::{AudioFormat, Chunk};
pub use device::{Device, DeviceInfo};
pub use error::{Error, Result};
pub use protocol::{ClientMessage, ProtocolError, ServerMessage};
pub use time::{LocalClock, ManualClock, SystemClock};
