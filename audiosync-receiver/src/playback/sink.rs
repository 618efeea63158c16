//! Audio output seam
//!
//! Playback callbacks hand each drained chunk's samples to an [`AudioSink`].
//! The platform DAC write lives behind this trait; [`NullSink`] only counts.

use std::sync::atomic::{AtomicU64, Ordering};

use audiosync_common::AudioFormat;
use tracing::trace;

use crate::error::Result;

/// Destination for volume-adjusted interleaved samples
pub trait AudioSink: Send + Sync {
    /// Play one chunk's samples now
    fn play(&self, format: AudioFormat, samples: &[f32]) -> Result<()>;

    /// Called when a stream ends or is torn down
    fn flush(&self) {}
}

/// Sink that discards audio and counts what it was given
#[derive(Debug, Default)]
pub struct NullSink {
    frames: AtomicU64,
    chunks: AtomicU64,
}

impl NullSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Total sample frames played
    pub fn frames_played(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Total chunks played
    pub fn chunks_played(&self) -> u64 {
        self.chunks.load(Ordering::Relaxed)
    }
}

impl AudioSink for NullSink {
    fn play(&self, format: AudioFormat, samples: &[f32]) -> Result<()> {
        let frames = samples.len() / format.channels.max(1) as usize;
        self.frames.fetch_add(frames as u64, Ordering::Relaxed);
        self.chunks.fetch_add(1, Ordering::Relaxed);
        trace!("NullSink consumed {} frames", frames);
        Ok(())
    }
}

/// Clamp a volume to 0.0-1.0
pub fn clamp_volume(volume: f32) -> f32 {
    if volume.is_finite() {
        volume.clamp(0.0, 1.0)
    } else {
        1.0
    }
}

/// Scale samples by `volume` (clamped), borrowing when unity gain
pub fn apply_volume(samples: &[f32], volume: f32) -> std::borrow::Cow<'_, [f32]> {
    let volume = clamp_volume(volume);
    if volume == 1.0 {
        std::borrow::Cow::Borrowed(samples)
    } else {
        std::borrow::Cow::Owned(samples.iter().map(|s| s * volume).collect())
    }
}
