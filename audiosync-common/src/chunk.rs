//! Streamed audio units and their sample format

use serde::{Deserialize, Serialize};

/// Nominal wire size of one chunk in bytes
pub const CHUNK_BYTES: usize = 4096;

/// Default stream sample rate (Hz)
pub const DEFAULT_SAMPLE_RATE: u32 = 44_100;

/// Default stream channel count
pub const DEFAULT_CHANNELS: u16 = 2;

/// Default bit depth used for duration estimates
pub const DEFAULT_BITS_PER_SAMPLE: u16 = 16;

/// Sample format announced by `prepare_streaming`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
}

impl AudioFormat {
    pub fn new(sample_rate: u32, channels: u16) -> Self {
        Self {
            sample_rate,
            channels,
            bits_per_sample: DEFAULT_BITS_PER_SAMPLE,
        }
    }

    /// Bytes per second of audio at this format
    pub fn byte_rate(&self) -> f64 {
        self.sample_rate as f64 * self.channels as f64 * (self.bits_per_sample as f64 / 8.0)
    }

    /// Playback duration of a nominal [`CHUNK_BYTES`] chunk in seconds
    pub fn nominal_chunk_duration(&self) -> f64 {
        let rate = self.byte_rate();
        if rate > 0.0 {
            CHUNK_BYTES as f64 / rate
        } else {
            0.0
        }
    }

    /// Duration in seconds of `frames` sample frames
    pub fn frames_to_secs(&self, frames: usize) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        frames as f64 / self.sample_rate as f64
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::new(DEFAULT_SAMPLE_RATE, DEFAULT_CHANNELS)
    }
}

/// One timestamped unit of the media stream
///
/// Immutable once created. `target_timestamp` is in coordinator time;
/// `payload` holds interleaved samples.
#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    sequence_id: u64,
    target_timestamp: f64,
    payload: Vec<f32>,
    is_final: bool,
}

impl Chunk {
    pub fn new(sequence_id: u64, target_timestamp: f64, payload: Vec<f32>, is_final: bool) -> Self {
        Self {
            sequence_id,
            target_timestamp,
            payload,
            is_final,
        }
    }

    pub fn sequence_id(&self) -> u64 {
        self.sequence_id
    }

    pub fn target_timestamp(&self) -> f64 {
        self.target_timestamp
    }

    pub fn payload(&self) -> &[f32] {
        &self.payload
    }

    pub fn is_final(&self) -> bool {
        self.is_final
    }

    /// Number of sample frames in the payload for `channels` interleaved channels
    pub fn frame_count(&self, channels: u16) -> usize {
        self.payload.len() / channels.max(1) as usize
    }

    /// Consume the chunk, returning its payload
    pub fn into_payload(self) -> Vec<f32> {
        self.payload
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_chunk_duration_cd_quality() {
        // 4096 bytes at 44.1kHz stereo 16-bit ≈ 23.2ms
        let format = AudioFormat::default();
        let duration = format.nominal_chunk_duration();
        assert!((duration - 4096.0 / 176_400.0).abs() < 1e-12);
    }

    #[test]
    fn test_zero_rate_format_has_no_duration() {
        let format = AudioFormat::new(0, 2);
        assert_eq!(format.nominal_chunk_duration(), 0.0);
        assert_eq!(format.frames_to_secs(1024), 0.0);
    }

    #[test]
    fn test_chunk_frame_count() {
        let chunk = Chunk::new(3, 12.5, vec![0.0; 2048], false);
        assert_eq!(chunk.frame_count(2), 1024);
        assert_eq!(chunk.frame_count(0), 2048);
        assert_eq!(chunk.sequence_id(), 3);
        assert_eq!(chunk.target_timestamp(), 12.5);
        assert!(!chunk.is_final());
    }
}
