//! Chunk sources
//!
//! The coordinator pulls fixed-size blocks of interleaved samples from a
//! [`ChunkSource`]. Decoding real files happens outside this crate; the built-in
//! [`ToneSource`] generates a stereo sine test tone.

use std::f64::consts::TAU;
use std::sync::Arc;

use audiosync_common::AudioFormat;

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};

/// Producer of consecutive sample blocks for one stream
pub trait ChunkSource: Send {
    fn format(&self) -> AudioFormat;

    /// Next block of interleaved samples, `None` at end of stream
    fn next_chunk(&mut self) -> Option<Vec<f32>>;
}

/// Opens a source for the `audio_file` named in `start_streaming`
pub type SourceFactory = Arc<dyn Fn(&str) -> Result<Box<dyn ChunkSource>> + Send + Sync>;

/// Sine wave on every channel
#[derive(Debug, Clone)]
pub struct ToneSource {
    format: AudioFormat,
    frequency: f64,
    total_frames: usize,
    chunk_frames: usize,
    position: usize,
}

impl ToneSource {
    pub fn new(
        format: AudioFormat,
        frequency: f64,
        duration_secs: f64,
        chunk_frames: usize,
    ) -> Self {
        let total_frames = (format.sample_rate as f64 * duration_secs.max(0.0)) as usize;
        Self {
            format,
            frequency,
            total_frames,
            chunk_frames: chunk_frames.max(1),
            position: 0,
        }
    }
}

impl ChunkSource for ToneSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn next_chunk(&mut self) -> Option<Vec<f32>> {
        if self.position >= self.total_frames {
            return None;
        }
        let frames = self.chunk_frames.min(self.total_frames - self.position);
        let channels = self.format.channels.max(1) as usize;
        let rate = self.format.sample_rate.max(1) as f64;

        let mut samples = Vec::with_capacity(frames * channels);
        for frame in self.position..self.position + frames {
            let value = (TAU * self.frequency * frame as f64 / rate).sin() as f32;
            samples.extend(std::iter::repeat(value).take(channels));
        }
        self.position += frames;
        Some(samples)
    }
}

/// Pre-decoded samples split into fixed frame counts
#[derive(Debug, Clone)]
pub struct BufferSource {
    format: AudioFormat,
    chunks: std::vec::IntoIter<Vec<f32>>,
}

impl BufferSource {
    pub fn new(format: AudioFormat, samples: &[f32], chunk_frames: usize) -> Self {
        let chunks = split_into_chunks(samples, format.channels, chunk_frames);
        Self {
            format,
            chunks: chunks.into_iter(),
        }
    }
}

impl ChunkSource for BufferSource {
    fn format(&self) -> AudioFormat {
        self.format
    }

    fn next_chunk(&mut self) -> Option<Vec<f32>> {
        self.chunks.next()
    }
}

/// Split interleaved samples into blocks of `chunk_frames` frames
///
/// The last block may be shorter. A trailing partial frame is dropped.
pub fn split_into_chunks(samples: &[f32], channels: u16, chunk_frames: usize) -> Vec<Vec<f32>> {
    let channels = channels.max(1) as usize;
    let whole = samples.len() - samples.len() % channels;
    samples[..whole]
        .chunks(chunk_frames.max(1) * channels)
        .map(<[f32]>::to_vec)
        .collect()
}

/// Factory that answers every request with the configured test tone
pub fn tone_factory(config: &CoordinatorConfig) -> SourceFactory {
    let format = config.format();
    let frequency = config.tone_frequency_hz;
    let duration = config.tone_duration_secs;
    let chunk_frames = config.chunk_frames;

    Arc::new(move |audio_file: &str| {
        if !frequency.is_finite() || frequency <= 0.0 {
            return Err(Error::Source(format!(
                "invalid tone frequency {} for {}",
                frequency, audio_file
            )));
        }
        Ok(Box::new(ToneSource::new(format, frequency, duration, chunk_frames))
            as Box<dyn ChunkSource>)
    })
}
