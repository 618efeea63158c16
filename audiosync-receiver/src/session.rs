//! Session State Machine
//!
//! Drives one receiver's connection with the coordinator and routes each
//! inbound message to the clock aligner, jitter buffer and playback scheduler.
//!
//! # States
//!
//! ```text
//! Connection:  Disconnected -> Connecting -> Connected
//!                   ^              |             |
//!                   |              +--> Error <--+
//!                   +------------ (any) ----------
//!
//! Streaming:   Idle -> Prepared -> Active -> Idle
//! ```
//!
//! Leaving a stream (stop, disconnect, transport error) always tears down in
//! the same order: buffer cleared, pending playback cancelled, aligner reset.
//! No playback callback fires after teardown returns.
//!
//! A `Session` is owned by exactly one run loop; it is not shared.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use audiosync_common::{
    AudioFormat, Chunk, ClientMessage, Device, DeviceInfo, LocalClock, ServerMessage,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};

use crate::clock::ClockAligner;
use crate::config::ReceiverConfig;
use crate::error::{Error, Result};
use crate::locks;
use crate::playback::jitter_buffer::{BufferHealth, InsertOutcome, JitterBuffer};
use crate::playback::scheduler::{PlaybackFailure, PlaybackScheduler};
use crate::playback::sink::{apply_volume, clamp_volume, AudioSink};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StreamingPhase {
    /// No stream announced
    Idle,
    /// `prepare_streaming` received, no chunk yet
    Prepared,
    /// At least one chunk processed
    Active,
}

/// Notifications published to the session's observer
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    ConnectionChanged(ConnectionState),
    ClientIdAssigned(String),
    DeviceListUpdated(Vec<Device>),
    StreamPrepared {
        sync_timestamp: f64,
        format: AudioFormat,
        audio_file: String,
    },
    StreamStarted,
    /// The final chunk of stream `generation` has been handed to the sink
    PlaybackFinished { generation: u64 },
    StreamStopped,
    LatencyMeasured(f64),
    PlaybackFailed(PlaybackFailure),
}

/// Tunables a session takes from the receiver config
#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub device: DeviceInfo,
    pub buffer_capacity: usize,
    pub max_chunk_age_secs: f64,
    pub volume: f32,
    pub offset_smoothing: f64,
    pub event_capacity: usize,
}

impl From<&ReceiverConfig> for SessionSettings {
    fn from(config: &ReceiverConfig) -> Self {
        Self {
            device: DeviceInfo {
                name: config.device_name.clone(),
                platform: config.platform.clone(),
                capabilities: config.capabilities.clone(),
                latency: config.output_latency_secs,
            },
            buffer_capacity: config.buffer_capacity,
            max_chunk_age_secs: config.max_chunk_age_secs,
            volume: config.volume,
            offset_smoothing: config.offset_smoothing,
            event_capacity: config.event_capacity,
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from(&ReceiverConfig::default())
    }
}

/// One receiver's view of the coordinator
pub struct Session {
    state: ConnectionState,
    phase: StreamingPhase,
    client_id: Option<String>,
    devices: Vec<Device>,
    device_info: DeviceInfo,
    format: AudioFormat,
    latency: f64,
    /// Bumped whenever a stream is announced or torn down
    generation: u64,

    aligner: Arc<ClockAligner>,
    scheduler: PlaybackScheduler,
    buffer: Arc<Mutex<JitterBuffer>>,
    sink: Arc<dyn AudioSink>,
    volume: Arc<AtomicU32>,
    /// Volume the coordinator assigned to this device
    device_volume: Arc<AtomicU32>,

    outbound: mpsc::UnboundedSender<ClientMessage>,
    events: mpsc::Sender<SessionEvent>,
}

impl Session {
    /// Create a disconnected session
    ///
    /// Outbound protocol messages are queued on `outbound` for the transport.
    /// Must be called inside a Tokio runtime (the scheduler spawns its driver).
    pub fn new(
        settings: SessionSettings,
        clock: Arc<dyn LocalClock>,
        sink: Arc<dyn AudioSink>,
        outbound: mpsc::UnboundedSender<ClientMessage>,
    ) -> (Self, mpsc::Receiver<SessionEvent>) {
        let (events, events_rx) = mpsc::channel(settings.event_capacity.max(1));

        let aligner = Arc::new(ClockAligner::with_smoothing(
            clock,
            settings.offset_smoothing,
        ));

        let reporter_events = events.clone();
        let scheduler = PlaybackScheduler::with_failure_reporter(
            Arc::clone(&aligner),
            Arc::new(move |failure: PlaybackFailure| {
                emit(&reporter_events, SessionEvent::PlaybackFailed(failure));
            }),
        );

        let buffer = JitterBuffer::with_limits(
            Arc::clone(&aligner),
            settings.buffer_capacity,
            settings.max_chunk_age_secs,
        );

        let session = Self {
            state: ConnectionState::Disconnected,
            phase: StreamingPhase::Idle,
            client_id: None,
            devices: Vec::new(),
            device_info: settings.device,
            format: AudioFormat::default(),
            latency: 0.0,
            generation: 0,
            aligner,
            scheduler,
            buffer: Arc::new(Mutex::new(buffer)),
            sink,
            volume: Arc::new(AtomicU32::new(clamp_volume(settings.volume).to_bits())),
            device_volume: Arc::new(AtomicU32::new(1.0f32.to_bits())),
            outbound,
            events,
        };
        (session, events_rx)
    }

    // ========================================================================
    // Connection lifecycle
    // ========================================================================

    /// Begin connecting; false when already connecting or connected
    pub fn connect(&mut self) -> bool {
        match self.state {
            ConnectionState::Disconnected | ConnectionState::Error => {
                self.set_state(ConnectionState::Connecting);
                true
            }
            ConnectionState::Connecting | ConnectionState::Connected => {
                debug!("connect() ignored in state {:?}", self.state);
                false
            }
        }
    }

    /// Transport is up: announce this device
    pub fn on_transport_open(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!("Transport opened in unexpected state {:?}", self.state);
            return;
        }
        self.set_state(ConnectionState::Connected);
        self.send(ClientMessage::DeviceInfo(self.device_info.clone()));
    }

    /// Transport failed; the session does not retry
    pub fn on_transport_error(&mut self, reason: &str) {
        match self.state {
            ConnectionState::Connecting | ConnectionState::Connected => {
                error!("Transport error: {}", reason);
                self.teardown();
                self.set_state(ConnectionState::Error);
            }
            _ => debug!("Transport error ignored in state {:?}: {}", self.state, reason),
        }
    }

    pub fn on_transport_closed(&mut self) {
        info!("Transport closed");
        self.disconnect();
    }

    pub fn disconnect(&mut self) {
        self.teardown();
        self.client_id = None;
        if self.state != ConnectionState::Disconnected {
            self.set_state(ConnectionState::Disconnected);
        }
    }

    // ========================================================================
    // Inbound messages
    // ========================================================================

    /// Decode one inbound text frame and dispatch it
    ///
    /// Malformed or unknown messages are logged and dropped; the returned
    /// error only classifies what happened.
    pub fn handle_text(&mut self, raw: &str) -> Result<()> {
        match ServerMessage::decode(raw) {
            Ok(message) => {
                self.handle_message(message);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping inbound message: {}", e);
                Err(Error::Protocol(e))
            }
        }
    }

    pub fn handle_message(&mut self, message: ServerMessage) {
        if self.state != ConnectionState::Connected {
            debug!(
                "Ignoring {} while {:?}",
                message.kind(),
                self.state
            );
            return;
        }

        match message {
            ServerMessage::Connection { client_id, message } => {
                info!("Connected as {} ({})", client_id, message);
                self.client_id = Some(client_id.clone());
                emit(&self.events, SessionEvent::ClientIdAssigned(client_id));
            }
            ServerMessage::DeviceList { devices } => {
                debug!("Device list: {} devices", devices.len());
                self.apply_device_volume(&devices);
                self.devices = devices.clone();
                emit(&self.events, SessionEvent::DeviceListUpdated(devices));
            }
            ServerMessage::PrepareStreaming {
                sync_timestamp,
                server_timestamp,
                sample_rate,
                channels,
                audio_file,
            } => self.prepare(
                sync_timestamp,
                server_timestamp,
                AudioFormat::new(sample_rate, channels),
                audio_file,
            ),
            ServerMessage::AudioChunk {
                chunk_id,
                timestamp,
                data,
                is_final,
            } => self.accept_chunk(Chunk::new(chunk_id, timestamp, data, is_final)),
            ServerMessage::StopStreaming => {
                info!("Coordinator stopped the stream");
                self.stop_playback();
            }
            ServerMessage::SyncResponse {
                server_timestamp, ..
            } => {
                let latency =
                    ClockAligner::estimate_latency(server_timestamp, self.aligner.local_now());
                debug!("Measured latency {:.3} ms", latency * 1000.0);
                self.latency = latency;
                emit(&self.events, SessionEvent::LatencyMeasured(latency));
            }
        }
    }

    fn prepare(
        &mut self,
        sync_timestamp: f64,
        server_timestamp: Option<f64>,
        format: AudioFormat,
        audio_file: String,
    ) {
        if self.phase != StreamingPhase::Idle {
            debug!("New stream announced while {:?}, restarting", self.phase);
            self.teardown();
        }

        match server_timestamp {
            Some(now) => {
                self.aligner.set_reference(now);
            }
            None if self.aligner.is_active() => {
                debug!("prepare_streaming without server timestamp, keeping reference");
            }
            None => {
                warn!("prepare_streaming without server timestamp, using local clock");
            }
        }

        self.generation += 1;
        locks::lock(&self.buffer).init(format);
        self.format = format;
        self.phase = StreamingPhase::Prepared;

        info!(
            "Stream prepared: {} at {:.3} ({} Hz, {} ch), starts in {:.3}s",
            audio_file,
            sync_timestamp,
            format.sample_rate,
            format.channels,
            self.aligner.time_until(sync_timestamp)
        );
        emit(
            &self.events,
            SessionEvent::StreamPrepared {
                sync_timestamp,
                format,
                audio_file,
            },
        );
    }

    fn accept_chunk(&mut self, chunk: Chunk) {
        let id = chunk.sequence_id();
        let target = chunk.target_timestamp();
        let received_at = self.aligner.local_now();

        let outcome = locks::lock(&self.buffer).insert(chunk);
        self.send(ClientMessage::AudioChunkAck {
            chunk_id: id,
            timestamp: received_at,
        });

        if outcome == InsertOutcome::Stale {
            trace!("Chunk {} already played, acknowledged only", id);
            return;
        }

        if self.phase != StreamingPhase::Active {
            if self.phase == StreamingPhase::Idle {
                debug!("Chunk {} arrived without prepare_streaming", id);
            }
            self.phase = StreamingPhase::Active;
            emit(&self.events, SessionEvent::StreamStarted);
        }

        let fire_at = ClockAligner::adjust_for_latency(target, self.latency);
        let callback = self.playback_callback(id);
        self.scheduler.schedule(fire_at, callback);
    }

    /// Work run when chunk `sequence_id` is due
    fn playback_callback(&self, sequence_id: u64) -> impl FnOnce() -> Result<()> + Send + 'static {
        let buffer = Arc::clone(&self.buffer);
        let sink = Arc::clone(&self.sink);
        let volume = Arc::clone(&self.volume);
        let device_volume = Arc::clone(&self.device_volume);
        let events = self.events.clone();
        let format = self.format;
        let generation = self.generation;

        move || {
            let drained = locks::lock(&buffer).consume_through(sequence_id);
            let gain = f32::from_bits(volume.load(Ordering::Relaxed))
                * f32::from_bits(device_volume.load(Ordering::Relaxed));

            let mut first_error = None;
            let mut finished = false;
            for chunk in &drained {
                if let Err(e) = sink.play(format, &apply_volume(chunk.payload(), gain)) {
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                }
                finished |= chunk.is_final();
            }

            if finished {
                sink.flush();
                emit(&events, SessionEvent::PlaybackFinished { generation });
            }
            match first_error {
                Some(e) => Err(e),
                None => Ok(()),
            }
        }
    }

    // ========================================================================
    // Local requests
    // ========================================================================

    pub fn request_start(&mut self, audio_file: Option<String>) -> bool {
        self.send_connected(ClientMessage::StartStreaming { audio_file })
    }

    pub fn request_stop(&mut self) -> bool {
        self.send_connected(ClientMessage::StopStreaming)
    }

    pub fn request_sync(&mut self) -> bool {
        self.send_connected(ClientMessage::SyncRequest)
    }

    /// Stop playing locally without telling the coordinator
    pub fn stop_playback(&mut self) {
        let was_streaming = self.phase != StreamingPhase::Idle;
        self.teardown();
        if was_streaming {
            emit(&self.events, SessionEvent::StreamStopped);
        }
    }

    /// React to an event this session published
    ///
    /// Called by the run loop for every event it drains. A finish from an
    /// earlier stream is ignored.
    pub fn on_event(&mut self, event: &SessionEvent) {
        if let SessionEvent::PlaybackFinished { generation } = *event {
            if generation != self.generation {
                debug!(
                    "Ignoring finish of stream {} (current {})",
                    generation, self.generation
                );
                return;
            }
            info!("Final chunk played");
            self.stop_playback();
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn phase(&self) -> StreamingPhase {
        self.phase
    }

    pub fn client_id(&self) -> Option<&str> {
        self.client_id.as_deref()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    /// Latest measured latency (seconds)
    pub fn latency(&self) -> f64 {
        self.latency
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    pub fn buffer_health(&self) -> BufferHealth {
        locks::lock(&self.buffer).health()
    }

    /// Identifies the current stream in [`SessionEvent::PlaybackFinished`]
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn pending_playbacks(&self) -> usize {
        self.scheduler.pending_count()
    }

    pub fn aligner(&self) -> &Arc<ClockAligner> {
        &self.aligner
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume.load(Ordering::Relaxed))
    }

    /// Applies to chunks played from now on, including already scheduled ones
    pub fn set_volume(&self, volume: f32) {
        self.volume
            .store(clamp_volume(volume).to_bits(), Ordering::Relaxed);
    }

    /// Volume set for this device on the coordinator
    pub fn device_volume(&self) -> f32 {
        f32::from_bits(self.device_volume.load(Ordering::Relaxed))
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn apply_device_volume(&self, devices: &[Device]) {
        let Some(id) = self.client_id.as_deref() else {
            return;
        };
        if let Some(device) = devices.iter().find(|device| device.id == id) {
            let volume = clamp_volume(device.volume as f32);
            let previous = self
                .device_volume
                .swap(volume.to_bits(), Ordering::Relaxed);
            if f32::from_bits(previous) != volume {
                info!("Coordinator set device volume to {:.2}", volume);
            }
        }
    }

    fn teardown(&mut self) {
        locks::lock(&self.buffer).clear();
        let cancelled = self.scheduler.reset_all();
        self.aligner.reset();
        self.sink.flush();
        self.generation += 1;

        if self.phase != StreamingPhase::Idle {
            debug!("Stream torn down ({} pending playbacks cancelled)", cancelled);
        }
        self.phase = StreamingPhase::Idle;
    }

    fn set_state(&mut self, state: ConnectionState) {
        debug!("Connection state {:?} -> {:?}", self.state, state);
        self.state = state;
        emit(&self.events, SessionEvent::ConnectionChanged(state));
    }

    fn send_connected(&mut self, message: ClientMessage) -> bool {
        if self.state != ConnectionState::Connected {
            warn!("Cannot send {} while {:?}", message.kind(), self.state);
            return false;
        }
        self.send(message)
    }

    fn send(&self, message: ClientMessage) -> bool {
        let kind = message.kind();
        match self.outbound.send(message) {
            Ok(()) => {
                trace!("Queued {}", kind);
                true
            }
            Err(_) => {
                warn!("Outbound queue closed, dropping {}", kind);
                false
            }
        }
    }
}

/// Publish without blocking; a full or closed channel drops the event
fn emit(events: &mpsc::Sender<SessionEvent>, event: SessionEvent) {
    if let Err(e) = events.try_send(event) {
        match e {
            mpsc::error::TrySendError::Full(event) => {
                debug!("Session event channel full, dropping {:?}", event)
            }
            mpsc::error::TrySendError::Closed(_) => {}
        }
    }
}
