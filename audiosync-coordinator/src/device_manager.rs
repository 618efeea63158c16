//! Device roster and latency tracking
//!
//! Holds one [`Device`] record per session that has announced itself, plus a
//! rolling window of measured acknowledgement latencies. All timestamps are
//! coordinator clock seconds passed in by the caller.

use std::collections::{HashMap, VecDeque};

use audiosync_common::{Device, DeviceInfo};
use tracing::{debug, info};

use crate::config::CoordinatorConfig;
use crate::error::{Error, Result};

/// Margin added to the slowest device's latency for the sync delay
pub const SYNC_DELAY_MARGIN_SECS: f64 = 0.1;

/// Roster timing limits
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceLimits {
    pub latency_window: usize,
    pub active_window_secs: f64,
    pub cleanup_secs: f64,
    pub ack_timeout_secs: f64,
}

impl Default for DeviceLimits {
    fn default() -> Self {
        Self::from(&CoordinatorConfig::default())
    }
}

impl From<&CoordinatorConfig> for DeviceLimits {
    fn from(config: &CoordinatorConfig) -> Self {
        Self {
            latency_window: config.latency_window.max(1),
            active_window_secs: config.device_active_window_secs,
            cleanup_secs: config.device_cleanup_secs,
            ack_timeout_secs: config.ack_timeout_secs,
        }
    }
}

struct Entry {
    device: Device,
    latencies: VecDeque<f64>,
}

impl Entry {
    fn average_latency(&self) -> Option<f64> {
        if self.latencies.is_empty() {
            return None;
        }
        Some(self.latencies.iter().sum::<f64>() / self.latencies.len() as f64)
    }
}

/// Coordinator-side device registry
pub struct DeviceManager {
    entries: HashMap<String, Entry>,
    limits: DeviceLimits,
}

impl DeviceManager {
    pub fn new(limits: DeviceLimits) -> Self {
        Self {
            entries: HashMap::new(),
            limits,
        }
    }

    /// Create or refresh a device from its self-description
    ///
    /// Volume, enabled flag and latency history survive a repeated `device_info`.
    pub fn update_device(&mut self, id: &str, info: DeviceInfo, now: f64) -> Device {
        match self.entries.get_mut(id) {
            Some(entry) => {
                let device = &mut entry.device;
                device.name = info.name;
                device.platform = info.platform;
                device.capabilities = info.capabilities;
                device.latency = info.latency;
                device.last_seen = now;
                debug!("Device {} updated ({})", id, device.name);
                device.clone()
            }
            None => {
                let device = Device::new(id, info, now);
                info!(
                    "Device {} registered: {} ({})",
                    id, device.name, device.platform
                );
                self.entries.insert(
                    id.to_string(),
                    Entry {
                        device: device.clone(),
                        latencies: VecDeque::with_capacity(self.limits.latency_window),
                    },
                );
                device
            }
        }
    }

    /// Mark a device as seen; false when unknown
    pub fn touch(&mut self, id: &str, now: f64) -> bool {
        match self.entries.get_mut(id) {
            Some(entry) => {
                entry.device.last_seen = now;
                true
            }
            None => false,
        }
    }

    pub fn remove_device(&mut self, id: &str) -> Option<Device> {
        self.entries.remove(id).map(|entry| entry.device)
    }

    /// Devices seen within the active window, sorted by id
    pub fn device_list(&self, now: f64) -> Vec<Device> {
        let mut devices: Vec<Device> = self
            .entries
            .values()
            .filter(|entry| now - entry.device.last_seen < self.limits.active_window_secs)
            .map(|entry| entry.device.clone())
            .collect();
        devices.sort_by(|a, b| a.id.cmp(&b.id));
        devices
    }

    pub fn device(&self, id: &str) -> Option<Device> {
        self.entries.get(id).map(|entry| entry.device.clone())
    }

    pub fn device_by_name(&self, name: &str) -> Option<Device> {
        self.entries
            .values()
            .find(|entry| entry.device.name == name)
            .map(|entry| entry.device.clone())
    }

    /// Number of devices in the active roster
    pub fn device_count(&self, now: f64) -> usize {
        self.device_list(now).len()
    }

    /// Push one latency sample into the device's rolling window
    pub fn update_latency(&mut self, id: &str, latency: f64) -> Option<f64> {
        let window = self.limits.latency_window;
        let entry = self.entries.get_mut(id)?;
        entry.latencies.push_back(latency);
        while entry.latencies.len() > window {
            entry.latencies.pop_front();
        }
        let average = entry.average_latency();
        entry.device.average_latency = average;
        average
    }

    /// Record a chunk acknowledgement and its measured latency
    pub fn record_ack(&mut self, id: &str, latency: f64, now: f64) -> Option<f64> {
        let average = self.update_latency(id, latency)?;
        if let Some(entry) = self.entries.get_mut(id) {
            entry.device.last_ack = Some(now);
            entry.device.last_seen = now;
        }
        Some(average)
    }

    /// Rolling mean latency, 0.0 when nothing was measured
    pub fn average_latency(&self, id: &str) -> f64 {
        self.entries
            .get(id)
            .and_then(Entry::average_latency)
            .unwrap_or(0.0)
    }

    /// Largest rolling mean across all devices
    pub fn max_latency(&self) -> f64 {
        self.entries
            .values()
            .filter_map(Entry::average_latency)
            .fold(0.0, f64::max)
    }

    /// Delay that covers the slowest device plus a network margin
    pub fn synchronization_delay(&self) -> f64 {
        self.max_latency() + SYNC_DELAY_MARGIN_SECS
    }

    /// Set a device's volume, clamped to 0.0-1.0
    pub fn set_volume(&mut self, id: &str, volume: f64) -> Result<Device> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        entry.device.volume = volume.clamp(0.0, 1.0);
        Ok(entry.device.clone())
    }

    /// Volume of a device, 1.0 when unknown
    pub fn volume(&self, id: &str) -> f64 {
        self.entries
            .get(id)
            .map(|entry| entry.device.volume)
            .unwrap_or(1.0)
    }

    pub fn set_enabled(&mut self, id: &str, enabled: bool) -> Result<Device> {
        let entry = self
            .entries
            .get_mut(id)
            .ok_or_else(|| Error::DeviceNotFound(id.to_string()))?;
        entry.device.enabled = enabled;
        Ok(entry.device.clone())
    }

    /// Whether chunks go to this session
    ///
    /// Sessions that have not sent `device_info` yet are treated as enabled.
    pub fn is_enabled(&self, id: &str) -> bool {
        self.entries
            .get(id)
            .map(|entry| entry.device.enabled)
            .unwrap_or(true)
    }

    /// Recompute ack-based health; returns the devices whose health flipped
    ///
    /// `acks_due_from` is the coordinator time the current stream's first chunk
    /// went out, or `None` when idle (every device is then healthy).
    pub fn refresh_health(&mut self, now: f64, acks_due_from: Option<f64>) -> Vec<(String, bool)> {
        let timeout = self.limits.ack_timeout_secs;
        let mut changed = Vec::new();

        for (id, entry) in self.entries.iter_mut() {
            let healthy = match acks_due_from {
                None => true,
                Some(due) => {
                    let reference = entry.device.last_ack.map_or(due, |ack| ack.max(due));
                    now - reference <= timeout
                }
            };
            if entry.device.healthy != healthy {
                entry.device.healthy = healthy;
                changed.push((id.clone(), healthy));
            }
        }
        changed.sort();
        changed
    }

    /// Remove devices unseen for longer than the cleanup timeout
    pub fn cleanup_inactive(&mut self, now: f64) -> Vec<String> {
        let timeout = self.limits.cleanup_secs;
        let mut removed: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now - entry.device.last_seen > timeout)
            .map(|(id, _)| id.clone())
            .collect();
        for id in &removed {
            self.entries.remove(id);
        }
        removed.sort();
        if !removed.is_empty() {
            info!("Removed {} inactive devices", removed.len());
        }
        removed
    }
}

impl Default for DeviceManager {
    fn default() -> Self {
        Self::new(DeviceLimits::default())
    }
}
