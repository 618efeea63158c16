//! Buffered, time-aligned playback

pub mod jitter_buffer;
pub mod scheduler;
pub mod sink;

pub use jitter_buffer::{BufferHealth, InsertOutcome, JitterBuffer};
pub use scheduler::{PlaybackFailure, PlaybackHandle, PlaybackId, PlaybackScheduler, Scheduled};
pub use sink::{AudioSink, NullSink};
