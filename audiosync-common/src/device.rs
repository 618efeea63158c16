//! Device roster records shared between coordinator and receivers

use serde::{Deserialize, Serialize};

/// Self-description a receiver sends once upon connecting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    /// Human readable device name
    #[serde(alias = "device_name", default = "default_device_name")]
    pub name: String,
    /// Platform identifier (e.g. "linux", "android")
    #[serde(default = "default_platform")]
    pub platform: String,
    /// Capability flags (free-form)
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Self-reported output latency in seconds
    #[serde(default)]
    pub latency: f64,
}

fn default_device_name() -> String {
    "Unknown Device".to_string()
}

fn default_platform() -> String {
    "unknown".to_string()
}

impl Default for DeviceInfo {
    fn default() -> Self {
        Self {
            name: default_device_name(),
            platform: default_platform(),
            capabilities: Vec::new(),
            latency: 0.0,
        }
    }
}

/// Coordinator-side summary of one connected session
///
/// Serialized as-is into `device_list` roster snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: String,
    pub name: String,
    pub platform: String,
    pub capabilities: Vec<String>,
    /// Latency the device reported about itself (seconds)
    pub latency: f64,
    /// Rolling mean of measured acknowledgement latency, absent until sampled
    #[serde(default)]
    pub average_latency: Option<f64>,
    #[serde(default = "default_volume")]
    pub volume: f64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// False when acknowledgements stopped arriving during a stream
    #[serde(default = "default_enabled")]
    pub healthy: bool,
    /// Seconds since the Unix epoch
    pub last_seen: f64,
    /// Seconds since the Unix epoch of the last chunk acknowledgement
    #[serde(default)]
    pub last_ack: Option<f64>,
}

fn default_volume() -> f64 {
    1.0
}

fn default_enabled() -> bool {
    true
}

impl Device {
    pub fn new(id: impl Into<String>, info: DeviceInfo, now: f64) -> Self {
        Self {
            id: id.into(),
            name: info.name,
            platform: info.platform,
            capabilities: info.capabilities,
            latency: info.latency,
            average_latency: None,
            volume: default_volume(),
            enabled: true,
            healthy: true,
            last_seen: now,
            last_ack: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_info_accepts_legacy_device_name() {
        let info: DeviceInfo =
            serde_json::from_str(r#"{"device_name":"Kitchen","platform":"linux"}"#).unwrap();
        assert_eq!(info.name, "Kitchen");
        assert_eq!(info.platform, "linux");
        assert!(info.capabilities.is_empty());
        assert_eq!(info.latency, 0.0);
    }

    #[test]
    fn test_device_info_defaults_when_empty() {
        let info: DeviceInfo = serde_json::from_str("{}").unwrap();
        assert_eq!(info, DeviceInfo::default());
    }

    #[test]
    fn test_new_device_is_enabled_and_healthy() {
        let device = Device::new("client_0", DeviceInfo::default(), 10.0);
        assert!(device.enabled);
        assert!(device.healthy);
        assert_eq!(device.volume, 1.0);
        assert_eq!(device.last_seen, 10.0);
        assert!(device.average_latency.is_none());
    }
}
