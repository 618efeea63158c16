//! Coordinator bootstrap configuration
//!
//! Loaded once at startup from TOML (see [`audiosync_common::config`] for file
//! resolution). The listening port can be overridden from the command line.

use std::path::Path;
use std::time::Duration;

use audiosync_common::chunk::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use audiosync_common::config::{load_toml, ConfigResolver, LoggingConfig};
use audiosync_common::AudioFormat;
use serde::Deserialize;

use crate::error::{Error, Result};

/// Module name used for `<config dir>/audiosync/<module>.toml`
pub const MODULE_NAME: &str = "coordinator";

/// Default listening port
pub const DEFAULT_PORT: u16 = 8765;

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct CoordinatorConfig {
    pub port: u16,

    /// Minimum delay between `prepare_streaming` and the sync instant
    pub lead_time_secs: f64,

    /// How far ahead of its target each chunk is sent
    pub send_ahead_secs: f64,

    pub sample_rate: u32,
    pub channels: u16,

    /// Sample frames per chunk
    pub chunk_frames: usize,

    /// Test tone used when no decoder is plugged in
    pub tone_frequency_hz: f64,
    pub tone_duration_secs: f64,

    /// Acknowledgement silence after which a device is shown unhealthy
    pub ack_timeout_secs: f64,

    /// Devices unseen for longer are hidden from the roster
    pub device_active_window_secs: f64,

    /// Devices unseen for longer are removed
    pub device_cleanup_secs: f64,

    pub monitor_interval_secs: f64,

    /// Latency samples kept per device
    pub latency_window: usize,

    /// Capacity of the SSE event bus
    pub event_capacity: usize,

    pub logging: LoggingConfig,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            lead_time_secs: 2.0,
            send_ahead_secs: 0.5,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            chunk_frames: 1024,
            tone_frequency_hz: 440.0,
            tone_duration_secs: 10.0,
            ack_timeout_secs: 5.0,
            device_active_window_secs: 30.0,
            device_cleanup_secs: 60.0,
            monitor_interval_secs: 5.0,
            latency_window: 10,
            event_capacity: 1000,
            logging: LoggingConfig::default(),
        }
    }
}

impl CoordinatorConfig {
    /// Resolve and load the config file, falling back to defaults
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = ConfigResolver::new(MODULE_NAME).resolve(cli_path);
        let config: Self = load_toml(path.as_deref())?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values the streaming loop cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.sample_rate == 0 || self.channels == 0 {
            return Err(Error::Config(
                "sample_rate and channels must be non-zero".to_string(),
            ));
        }
        if self.chunk_frames == 0 {
            return Err(Error::Config("chunk_frames must be non-zero".to_string()));
        }
        let durations = [
            ("lead_time_secs", self.lead_time_secs),
            ("send_ahead_secs", self.send_ahead_secs),
            ("tone_duration_secs", self.tone_duration_secs),
            ("ack_timeout_secs", self.ack_timeout_secs),
            ("device_active_window_secs", self.device_active_window_secs),
            ("device_cleanup_secs", self.device_cleanup_secs),
        ];
        for (name, value) in durations {
            if !value.is_finite() || value < 0.0 {
                return Err(Error::Config(format!("{} must be >= 0, got {}", name, value)));
            }
        }
        if !(self.monitor_interval_secs.is_finite() && self.monitor_interval_secs > 0.0) {
            return Err(Error::Config("monitor_interval_secs must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn format(&self) -> AudioFormat {
        AudioFormat::new(self.sample_rate, self.channels)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs_f64(self.monitor_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = CoordinatorConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.lead_time_secs, 2.0);
        assert_eq!(config.chunk_frames, 1024);
        assert_eq!(config.format(), AudioFormat::default());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "port = 9100\nlead_time_secs = 3.5\n[logging]\nlevel = \"debug\"").unwrap();

        let config = CoordinatorConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.port, 9100);
        assert_eq!(config.lead_time_secs, 3.5);
        assert_eq!(config.send_ahead_secs, 0.5);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn test_zero_chunk_frames_rejected() {
        let config = CoordinatorConfig {
            chunk_frames: 0,
            ..CoordinatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_negative_lead_time_rejected() {
        let config = CoordinatorConfig {
            lead_time_secs: -1.0,
            ..CoordinatorConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
