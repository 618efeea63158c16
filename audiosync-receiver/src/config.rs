//! Receiver bootstrap configuration
//!
//! Loaded once at startup from TOML (see [`audiosync_common::config`] for file
//! resolution). Individual values can be overridden from the command line.

use std::path::Path;
use std::time::Duration;

use audiosync_common::config::{load_toml, ConfigResolver, LoggingConfig};
use serde::Deserialize;

use crate::error::Result;
use crate::playback::jitter_buffer::{DEFAULT_CAPACITY, DEFAULT_MAX_AGE_SECS};

/// Module name used for `<config dir>/audiosync/<module>.toml`
pub const MODULE_NAME: &str = "receiver";

#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Coordinator WebSocket endpoint
    pub server_url: String,

    /// Name announced in `device_info`
    pub device_name: String,
    pub platform: String,
    pub capabilities: Vec<String>,

    /// Self-reported output latency (seconds)
    pub output_latency_secs: f64,

    /// Jitter buffer capacity in chunks (minimum 10)
    pub buffer_capacity: usize,

    /// Age beyond which buffered chunks are evicted first on overflow
    pub max_chunk_age_secs: f64,

    /// Interval between `sync_request` probes while connected (0 disables)
    pub sync_interval_secs: f64,

    /// Local output volume (0.0-1.0)
    pub volume: f32,

    /// Weight kept from the previous clock offset on re-sync (0.0 = replace)
    pub offset_smoothing: f64,

    /// Session event channel capacity
    pub event_capacity: usize,

    pub logging: LoggingConfig,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://127.0.0.1:8765/ws".to_string(),
            device_name: "AudioSync Receiver".to_string(),
            platform: std::env::consts::OS.to_string(),
            capabilities: vec!["pcm_f32".to_string()],
            output_latency_secs: 0.0,
            buffer_capacity: DEFAULT_CAPACITY,
            max_chunk_age_secs: DEFAULT_MAX_AGE_SECS,
            sync_interval_secs: 10.0,
            volume: 1.0,
            offset_smoothing: 0.0,
            event_capacity: 256,
            logging: LoggingConfig::default(),
        }
    }
}

impl ReceiverConfig {
    /// Resolve and load the config file, falling back to defaults
    pub fn load(cli_path: Option<&Path>) -> Result<Self> {
        let path = ConfigResolver::new(MODULE_NAME).resolve(cli_path);
        Ok(load_toml(path.as_deref())?)
    }

    /// Sync probe period, `None` when disabled
    pub fn sync_interval(&self) -> Option<Duration> {
        if self.sync_interval_secs.is_finite() && self.sync_interval_secs > 0.0 {
            Some(Duration::from_secs_f64(self.sync_interval_secs))
        } else {
            None
        }
    }
}
