//! Coordinator events and the broadcast bus feeding SSE subscribers

use audiosync_common::Device;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum CoordinatorEvent {
    SessionConnected {
        client_id: String,
        timestamp: DateTime<Utc>,
    },

    SessionDisconnected {
        client_id: String,
        timestamp: DateTime<Utc>,
    },

    DeviceListChanged {
        devices: Vec<Device>,
        timestamp: DateTime<Utc>,
    },

    DeviceHealthChanged {
        client_id: String,
        healthy: bool,
        timestamp: DateTime<Utc>,
    },

    StreamingStarted {
        audio_file: String,
        sync_timestamp: f64,
        timestamp: DateTime<Utc>,
    },

    /// Every chunk of the stream has been sent
    StreamingFinished {
        audio_file: String,
        chunks_sent: u64,
        timestamp: DateTime<Utc>,
    },

    StreamingStopped {
        timestamp: DateTime<Utc>,
    },
}

impl CoordinatorEvent {
    /// SSE `event:` field
    pub fn event_type(&self) -> &'static str {
        match self {
            CoordinatorEvent::SessionConnected { .. } => "SessionConnected",
            CoordinatorEvent::SessionDisconnected { .. } => "SessionDisconnected",
            CoordinatorEvent::DeviceListChanged { .. } => "DeviceListChanged",
            CoordinatorEvent::DeviceHealthChanged { .. } => "DeviceHealthChanged",
            CoordinatorEvent::StreamingStarted { .. } => "StreamingStarted",
            CoordinatorEvent::StreamingFinished { .. } => "StreamingFinished",
            CoordinatorEvent::StreamingStopped { .. } => "StreamingStopped",
        }
    }
}

/// Fan-out of coordinator events to any number of subscribers
///
/// Slow subscribers lag and lose the oldest events; emitters never block.
pub struct EventBus {
    tx: broadcast::Sender<CoordinatorEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.tx.subscribe()
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: CoordinatorEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
