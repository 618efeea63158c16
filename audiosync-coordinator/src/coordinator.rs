//! Broadcast Coordinator
//!
//! Picks one future sync instant per stream, announces it identically to every
//! connected session, then sends each chunk stamped with
//! `sync + cumulative playback offset` a fixed interval ahead of its target.
//! Acknowledgements feed per-device latency, which in turn can stretch the
//! lead time of the next stream.
//!
//! # Concurrency
//! - One outbound queue per session; the connection task drains it
//! - The sync instant is an atomic snapshot readable without locks
//! - Lock order is `stream` before `sessions` before `devices`
//! - Chunk sends and the `stop_streaming` broadcast both happen under the
//!   `stream` lock, so no chunk of a stopped stream follows its stop message

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use audiosync_common::time::secs_to_duration;
use audiosync_common::{AudioFormat, Chunk, ClientMessage, Device, LocalClock, ServerMessage};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, Mutex, RwLock};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::CoordinatorConfig;
use crate::device_manager::{DeviceLimits, DeviceManager};
use crate::error::{Error, Result};
use crate::events::{CoordinatorEvent, EventBus};
use crate::source::{ChunkSource, SourceFactory};

/// Outbound queue of one session
pub type Outbound = mpsc::UnboundedSender<Arc<ServerMessage>>;

/// Name used when `start_streaming` carries no file
pub const DEFAULT_AUDIO_FILE: &str = "default_audio.wav";

const WELCOME: &str = "Connected to AudioSync server";

/// Bit pattern meaning "no sync instant"
const NO_SYNC_INSTANT: u64 = 0x7ff8_0000_0000_0000;

/// Snapshot served by `GET /api/streaming`
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StreamStatus {
    pub streaming: bool,
    pub audio_file: Option<String>,
    pub sync_timestamp: Option<f64>,
    pub chunks_sent: u64,
    pub sessions: usize,
    pub devices: usize,
}

struct ActiveStream {
    generation: u64,
    audio_file: String,
    format: AudioFormat,
    sync_timestamp: f64,
    cancel: CancellationToken,
    chunks_sent: Arc<AtomicU64>,
}

struct StreamPlan {
    generation: u64,
    audio_file: String,
    sync_timestamp: f64,
    cancel: CancellationToken,
    chunks_sent: Arc<AtomicU64>,
}

pub struct Coordinator {
    clock: Arc<dyn LocalClock>,
    lead_time: f64,
    send_ahead: f64,
    sessions: RwLock<HashMap<String, Outbound>>,
    devices: RwLock<DeviceManager>,
    stream: Mutex<Option<ActiveStream>>,
    sync_instant: AtomicU64,
    next_client: AtomicU64,
    next_generation: AtomicU64,
    source_factory: SourceFactory,
    events: EventBus,
}

impl Coordinator {
    pub fn new(
        config: &CoordinatorConfig,
        clock: Arc<dyn LocalClock>,
        source_factory: SourceFactory,
    ) -> Self {
        Self {
            clock,
            lead_time: config.lead_time_secs,
            send_ahead: config.send_ahead_secs,
            sessions: RwLock::new(HashMap::new()),
            devices: RwLock::new(DeviceManager::new(DeviceLimits::from(config))),
            stream: Mutex::new(None),
            sync_instant: AtomicU64::new(NO_SYNC_INSTANT),
            next_client: AtomicU64::new(0),
            next_generation: AtomicU64::new(1),
            source_factory,
            events: EventBus::new(config.event_capacity),
        }
    }

    // ========================================================================
    // Sessions
    // ========================================================================

    /// Attach a session's outbound queue and assign it a client id
    ///
    /// The session receives `connection`, then the roster. A session joining
    /// mid-stream also receives the running stream's `prepare_streaming`.
    pub async fn register_session(&self, outbound: Outbound) -> String {
        let client_id = format!("client_{}", self.next_client.fetch_add(1, Ordering::Relaxed));

        let _ = outbound.send(Arc::new(ServerMessage::Connection {
            client_id: client_id.clone(),
            message: WELCOME.to_string(),
        }));

        {
            let stream = self.stream.lock().await;
            if let Some(active) = stream.as_ref() {
                let _ = outbound.send(Arc::new(ServerMessage::PrepareStreaming {
                    sync_timestamp: active.sync_timestamp,
                    server_timestamp: Some(self.clock.now()),
                    sample_rate: active.format.sample_rate,
                    channels: active.format.channels,
                    audio_file: active.audio_file.clone(),
                }));
            }
            self.sessions
                .write()
                .await
                .insert(client_id.clone(), outbound);
        }

        info!("Session {} connected", client_id);
        self.events.emit_lossy(CoordinatorEvent::SessionConnected {
            client_id: client_id.clone(),
            timestamp: Utc::now(),
        });
        self.broadcast_device_list().await;
        client_id
    }

    /// Drop a session and its device record
    pub async fn unregister_session(&self, client_id: &str) {
        let removed = self.sessions.write().await.remove(client_id).is_some();
        self.devices.write().await.remove_device(client_id);

        if removed {
            info!("Session {} disconnected", client_id);
            self.events.emit_lossy(CoordinatorEvent::SessionDisconnected {
                client_id: client_id.to_string(),
                timestamp: Utc::now(),
            });
            self.broadcast_device_list().await;
        }
    }

    /// Decode one inbound text frame and dispatch it
    ///
    /// Malformed and unknown messages are logged and dropped.
    pub async fn handle_text(self: &Arc<Self>, client_id: &str, raw: &str) -> Result<()> {
        let message = ClientMessage::decode(raw).map_err(|e| {
            warn!("Dropping message from {}: {}", client_id, e);
            Error::Protocol(e)
        })?;
        self.handle_message(client_id, message).await;
        Ok(())
    }

    pub async fn handle_message(self: &Arc<Self>, client_id: &str, message: ClientMessage) {
        let now = self.clock.now();
        self.devices.write().await.touch(client_id, now);
        debug!("{} from {}", message.kind(), client_id);

        match message {
            ClientMessage::DeviceInfo(info) => {
                self.devices
                    .write()
                    .await
                    .update_device(client_id, info, now);
                self.broadcast_device_list().await;
            }
            ClientMessage::StartStreaming { audio_file } => {
                if let Err(e) = self.start_streaming(audio_file).await {
                    info!("start_streaming from {} ignored: {}", client_id, e);
                }
            }
            ClientMessage::StopStreaming => {
                self.stop_streaming().await;
            }
            ClientMessage::AudioChunkAck {
                chunk_id,
                timestamp,
            } => self.handle_ack(client_id, chunk_id, timestamp).await,
            ClientMessage::SyncRequest => self.handle_sync_request(client_id).await,
        }
    }

    // ========================================================================
    // Streaming
    // ========================================================================

    /// Announce a sync instant and start sending chunks
    ///
    /// Fails with [`Error::AlreadyStreaming`] while a stream is running.
    pub async fn start_streaming(
        self: &Arc<Self>,
        audio_file: Option<String>,
    ) -> Result<StreamStatus> {
        let audio_file = audio_file.unwrap_or_else(|| DEFAULT_AUDIO_FILE.to_string());
        let mut stream = self.stream.lock().await;

        if let Some(active) = stream.as_ref() {
            return Err(Error::AlreadyStreaming(active.audio_file.clone()));
        }

        let source = (self.source_factory)(&audio_file)?;
        let format = source.format();

        let now = self.clock.now();
        let lead = self
            .lead_time
            .max(self.devices.read().await.synchronization_delay());
        let sync_timestamp = now + lead;
        self.sync_instant
            .store(sync_timestamp.to_bits(), Ordering::SeqCst);

        let announced = self
            .broadcast(ServerMessage::PrepareStreaming {
                sync_timestamp,
                server_timestamp: Some(now),
                sample_rate: format.sample_rate,
                channels: format.channels,
                audio_file: audio_file.clone(),
            })
            .await;

        let plan = StreamPlan {
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
            audio_file: audio_file.clone(),
            sync_timestamp,
            cancel: CancellationToken::new(),
            chunks_sent: Arc::new(AtomicU64::new(0)),
        };
        *stream = Some(ActiveStream {
            generation: plan.generation,
            audio_file: audio_file.clone(),
            format,
            sync_timestamp,
            cancel: plan.cancel.clone(),
            chunks_sent: Arc::clone(&plan.chunks_sent),
        });
        drop(stream);

        info!(
            "Streaming {} to {} sessions, sync instant in {:.3}s",
            audio_file, announced, lead
        );
        self.events.emit_lossy(CoordinatorEvent::StreamingStarted {
            audio_file,
            sync_timestamp,
            timestamp: Utc::now(),
        });

        tokio::spawn(Arc::clone(self).run_stream(source, plan));
        Ok(self.status().await)
    }

    /// Cancel the running stream and tell every session to stop
    ///
    /// `stop_streaming` is broadcast even when nothing was streaming. Returns
    /// whether a stream was running.
    pub async fn stop_streaming(&self) -> bool {
        let mut stream = self.stream.lock().await;
        let active = stream.take();
        self.sync_instant.store(NO_SYNC_INSTANT, Ordering::SeqCst);
        if let Some(active) = &active {
            active.cancel.cancel();
            info!(
                "Streaming {} stopped after {} chunks",
                active.audio_file,
                active.chunks_sent.load(Ordering::Relaxed)
            );
        }
        self.broadcast(ServerMessage::StopStreaming).await;
        drop(stream);

        self.events.emit_lossy(CoordinatorEvent::StreamingStopped {
            timestamp: Utc::now(),
        });
        active.is_some()
    }

    async fn run_stream(self: Arc<Self>, mut source: Box<dyn ChunkSource>, plan: StreamPlan) {
        let format = source.format();
        let channels = format.channels.max(1) as usize;
        let mut frames_sent = 0usize;
        let mut sequence_id = 0u64;
        let mut next = source.next_chunk();
        // An empty source completes immediately
        let mut completed = next.is_none();

        while let Some(payload) = next.take() {
            next = source.next_chunk();
            let is_final = next.is_none();
            let target = plan.sync_timestamp + format.frames_to_secs(frames_sent);
            frames_sent += payload.len() / channels;

            let wait = target - self.send_ahead - self.clock.now();
            if wait > 0.0 {
                tokio::select! {
                    _ = plan.cancel.cancelled() => break,
                    _ = tokio::time::sleep(secs_to_duration(wait)) => {}
                }
            }

            let chunk = Chunk::new(sequence_id, target, payload, is_final);
            {
                let _stream = self.stream.lock().await;
                if plan.cancel.is_cancelled() {
                    break;
                }
                let delivered = self.send_to_enabled(ServerMessage::from_chunk(&chunk)).await;
                trace!(
                    "Chunk {} (target {:.6}) sent to {} sessions",
                    sequence_id,
                    target,
                    delivered
                );
            }
            plan.chunks_sent.fetch_add(1, Ordering::Relaxed);
            sequence_id += 1;
            completed = is_final;
        }

        self.finish_stream(&plan, sequence_id, completed).await;
    }

    async fn finish_stream(&self, plan: &StreamPlan, chunks_sent: u64, completed: bool) {
        let mut stream = self.stream.lock().await;
        let current = stream
            .as_ref()
            .is_some_and(|active| active.generation == plan.generation);
        if !current {
            debug!("Stream {} already torn down", plan.generation);
            return;
        }
        *stream = None;
        self.sync_instant.store(NO_SYNC_INSTANT, Ordering::SeqCst);
        drop(stream);

        if completed {
            info!("Streaming {} finished ({} chunks)", plan.audio_file, chunks_sent);
            self.events.emit_lossy(CoordinatorEvent::StreamingFinished {
                audio_file: plan.audio_file.clone(),
                chunks_sent,
                timestamp: Utc::now(),
            });
        }
    }

    // ========================================================================
    // Latency
    // ========================================================================

    /// Record an acknowledgement: latency is `|now - timestamp|`
    pub async fn handle_ack(&self, client_id: &str, chunk_id: u64, timestamp: f64) {
        let now = self.clock.now();
        let latency = (now - timestamp).abs();
        match self
            .devices
            .write()
            .await
            .record_ack(client_id, latency, now)
        {
            Some(average) => trace!(
                "Ack {} from {}: {:.3} ms (avg {:.3} ms)",
                chunk_id,
                client_id,
                latency * 1000.0,
                average * 1000.0
            ),
            None => debug!("Ack {} from unregistered session {}", chunk_id, client_id),
        }
    }

    /// Reply with the coordinator's current time to that session only
    pub async fn handle_sync_request(&self, client_id: &str) {
        let reply = ServerMessage::SyncResponse {
            server_timestamp: self.clock.now(),
            client_id: Some(client_id.to_string()),
        };
        if !self.send_to(client_id, reply).await {
            debug!("Sync reply to {} not delivered", client_id);
        }
    }

    // ========================================================================
    // Devices
    // ========================================================================

    pub async fn devices(&self) -> Vec<Device> {
        self.devices.read().await.device_list(self.clock.now())
    }

    pub async fn device(&self, client_id: &str) -> Option<Device> {
        self.devices.read().await.device(client_id)
    }

    pub async fn set_device_volume(&self, client_id: &str, volume: f64) -> Result<Device> {
        let device = self.devices.write().await.set_volume(client_id, volume)?;
        info!("Device {} volume set to {:.2}", client_id, device.volume);
        self.broadcast_device_list().await;
        Ok(device)
    }

    pub async fn set_device_enabled(&self, client_id: &str, enabled: bool) -> Result<Device> {
        let device = self.devices.write().await.set_enabled(client_id, enabled)?;
        info!(
            "Device {} {}",
            client_id,
            if enabled { "enabled" } else { "disabled" }
        );
        self.broadcast_device_list().await;
        Ok(device)
    }

    /// One health pass: ack timeouts and inactive cleanup
    pub async fn check_devices(&self) {
        let now = self.clock.now();
        let acks_due_from = self
            .stream
            .lock()
            .await
            .as_ref()
            .map(|active| active.sync_timestamp - self.send_ahead);
        // Before the first chunk goes out nobody can be late
        let acks_due_from = acks_due_from.filter(|from| *from <= now);

        let (changed, removed) = {
            let mut devices = self.devices.write().await;
            (
                devices.refresh_health(now, acks_due_from),
                devices.cleanup_inactive(now),
            )
        };

        for (client_id, healthy) in &changed {
            if *healthy {
                info!("Device {} healthy again", client_id);
            } else {
                warn!("Device {} stopped acknowledging chunks", client_id);
            }
            self.events.emit_lossy(CoordinatorEvent::DeviceHealthChanged {
                client_id: client_id.clone(),
                healthy: *healthy,
                timestamp: Utc::now(),
            });
        }

        if !changed.is_empty() || !removed.is_empty() {
            self.broadcast_device_list().await;
        }
    }

    /// Run [`check_devices`](Self::check_devices) every `interval` until shutdown
    pub async fn run_health_monitor(
        self: Arc<Self>,
        interval: Duration,
        shutdown: CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!("Device health monitor started ({:?} interval)", interval);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => self.check_devices().await,
            }
        }
        debug!("Device health monitor stopped");
    }

    // ========================================================================
    // Observability
    // ========================================================================

    pub async fn status(&self) -> StreamStatus {
        let stream = self.stream.lock().await;
        let sessions = self.sessions.read().await.len();
        let devices = self
            .devices
            .read()
            .await
            .device_count(self.clock.now());

        match stream.as_ref() {
            Some(active) => StreamStatus {
                streaming: true,
                audio_file: Some(active.audio_file.clone()),
                sync_timestamp: Some(active.sync_timestamp),
                chunks_sent: active.chunks_sent.load(Ordering::Relaxed),
                sessions,
                devices,
            },
            None => StreamStatus {
                streaming: false,
                audio_file: None,
                sync_timestamp: None,
                chunks_sent: 0,
                sessions,
                devices,
            },
        }
    }

    /// Current sync instant, lock-free
    pub fn sync_instant(&self) -> Option<f64> {
        let value = f64::from_bits(self.sync_instant.load(Ordering::SeqCst));
        if value.is_nan() {
            None
        } else {
            Some(value)
        }
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    // ========================================================================
    // Fan-out
    // ========================================================================

    async fn broadcast_device_list(&self) {
        let devices = self.devices().await;
        self.broadcast(ServerMessage::DeviceList {
            devices: devices.clone(),
        })
        .await;
        self.events.emit_lossy(CoordinatorEvent::DeviceListChanged {
            devices,
            timestamp: Utc::now(),
        });
    }

    /// Queue a message for every session; returns how many accepted it
    async fn broadcast(&self, message: ServerMessage) -> usize {
        let message = Arc::new(message);
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .filter(|tx| tx.send(Arc::clone(&message)).is_ok())
            .count()
    }

    /// Queue a message for every session whose device is enabled
    async fn send_to_enabled(&self, message: ServerMessage) -> usize {
        let message = Arc::new(message);
        let sessions = self.sessions.read().await;
        let devices = self.devices.read().await;
        sessions
            .iter()
            .filter(|(client_id, _)| devices.is_enabled(client_id))
            .filter(|(_, tx)| tx.send(Arc::clone(&message)).is_ok())
            .count()
    }

    async fn send_to(&self, client_id: &str, message: ServerMessage) -> bool {
        self.sessions
            .read()
            .await
            .get(client_id)
            .is_some_and(|tx| tx.send(Arc::new(message)).is_ok())
    }
}
