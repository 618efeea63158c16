//! Session state machine tests
//!
//! Drives a [`Session`] directly with protocol messages (no socket) on a
//! paused Tokio clock and a manual local clock.

use std::sync::Arc;
use std::time::Duration;

use audiosync_common::{ClientMessage, Device, DeviceInfo, ManualClock, ServerMessage};
use audiosync_receiver::playback::NullSink;
use audiosync_receiver::{ConnectionState, Session, SessionEvent, SessionSettings, StreamingPhase};
use tokio::sync::mpsc;

struct Harness {
    clock: Arc<ManualClock>,
    sink: Arc<NullSink>,
    session: Session,
    outbound: mpsc::UnboundedReceiver<ClientMessage>,
    events: mpsc::Receiver<SessionEvent>,
}

impl Harness {
    fn connected(now: f64) -> Self {
        let clock = Arc::new(ManualClock::new(now));
        let sink = Arc::new(NullSink::new());
        let (tx, outbound) = mpsc::unbounded_channel();
        let (mut session, events) =
            Session::new(SessionSettings::default(), clock.clone(), sink.clone(), tx);
        session.connect();
        session.on_transport_open();

        let mut harness = Self {
            clock,
            sink,
            session,
            outbound,
            events,
        };
        assert!(matches!(
            harness.next_outbound(),
            Some(ClientMessage::DeviceInfo(_))
        ));
        harness
    }

    fn next_outbound(&mut self) -> Option<ClientMessage> {
        self.outbound.try_recv().ok()
    }

    fn drain_events(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }

    fn prepare(&mut self, server_timestamp: f64, sync_timestamp: f64) {
        self.session.handle_message(ServerMessage::PrepareStreaming {
            sync_timestamp,
            server_timestamp: Some(server_timestamp),
            sample_rate: 44_100,
            channels: 2,
            audio_file: "test_tone".to_string(),
        });
    }

    fn chunk(&mut self, id: u64, timestamp: f64, is_final: bool) {
        self.session.handle_message(ServerMessage::AudioChunk {
            chunk_id: id,
            timestamp,
            data: vec![0.5; 8],
            is_final,
        });
    }
}

#[tokio::test(start_paused = true)]
async fn test_connection_message_records_client_id() {
    let mut h = Harness::connected(0.0);
    h.session
        .handle_text(r#"{"type":"connection","client_id":"client_7","message":"Connected to sync server"}"#)
        .unwrap();

    assert_eq!(h.session.client_id(), Some("client_7"));
    assert!(h
        .drain_events()
        .contains(&SessionEvent::ClientIdAssigned("client_7".to_string())));
}

#[tokio::test(start_paused = true)]
async fn test_malformed_and_unknown_messages_are_dropped() {
    let mut h = Harness::connected(0.0);

    assert!(h.session.handle_text("{not json").is_err());
    assert!(h.session.handle_text(r#"{"type":"volume_change","volume":1}"#).is_err());

    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(h.session.phase(), StreamingPhase::Idle);
}

#[tokio::test(start_paused = true)]
async fn test_prepare_sets_reference_and_phase() {
    let mut h = Harness::connected(100.03);
    h.prepare(100.0, 102.0);

    let state = h.session.aligner().state();
    assert!(state.active);
    assert!((state.local_offset - 0.03).abs() < 1e-9);
    assert_eq!(h.session.phase(), StreamingPhase::Prepared);
    assert_eq!(h.session.format().sample_rate, 44_100);
}

#[tokio::test(start_paused = true)]
async fn test_chunk_is_acknowledged_with_local_receipt_time() {
    let mut h = Harness::connected(100.0);
    h.prepare(100.0, 102.0);

    h.clock.set(100.25);
    h.chunk(0, 102.0, false);

    match h.next_outbound() {
        Some(ClientMessage::AudioChunkAck {
            chunk_id,
            timestamp,
        }) => {
            assert_eq!(chunk_id, 0);
            assert_eq!(timestamp, 100.25);
        }
        other => panic!("expected ack, got {:?}", other),
    }
    assert_eq!(h.session.phase(), StreamingPhase::Active);
    assert_eq!(h.session.pending_playbacks(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_chunks_play_at_target_and_final_chunk_stops() {
    let mut h = Harness::connected(100.0);
    h.prepare(100.0, 100.5);

    h.chunk(0, 100.5, false);
    h.chunk(1, 100.6, false);
    h.chunk(2, 100.7, true);
    assert_eq!(h.sink.chunks_played(), 0);

    tokio::time::sleep(Duration::from_millis(550)).await;
    assert_eq!(h.sink.chunks_played(), 1);

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(h.sink.chunks_played(), 3);
    assert_eq!(h.sink.frames_played(), 12);

    let finished = h
        .drain_events()
        .into_iter()
        .find(|e| matches!(e, SessionEvent::PlaybackFinished { .. }))
        .expect("final chunk should report PlaybackFinished");

    // The run loop reacts to PlaybackFinished with a local stop
    h.session.on_event(&finished);
    assert_eq!(h.session.phase(), StreamingPhase::Idle);
    assert!(!h.session.aligner().is_active());
    assert_eq!(h.session.state(), ConnectionState::Connected);
}

#[tokio::test(start_paused = true)]
async fn test_late_chunk_plays_immediately() {
    let mut h = Harness::connected(200.0);
    h.prepare(200.0, 199.0);

    h.chunk(0, 199.5, false);
    assert_eq!(h.sink.chunks_played(), 1);
    assert_eq!(h.session.pending_playbacks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_stale_chunk_is_acknowledged_only() {
    let mut h = Harness::connected(200.0);
    h.prepare(200.0, 199.0);

    h.chunk(0, 199.5, false);
    let _ = h.next_outbound();
    h.chunk(0, 199.5, false);

    assert!(matches!(
        h.next_outbound(),
        Some(ClientMessage::AudioChunkAck { chunk_id: 0, .. })
    ));
    assert_eq!(h.sink.chunks_played(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_stop_streaming_cancels_pending_playback() {
    let mut h = Harness::connected(50.0);
    h.prepare(50.0, 52.0);

    h.chunk(0, 52.0, false);
    h.chunk(1, 52.1, false);
    h.chunk(2, 52.2, false);
    assert_eq!(h.session.pending_playbacks(), 3);
    assert_eq!(h.session.buffer_health().size, 3);

    h.session.handle_message(ServerMessage::StopStreaming);

    assert_eq!(h.session.buffer_health().size, 0);
    assert!(!h.session.aligner().is_active());
    assert_eq!(h.session.pending_playbacks(), 0);
    assert_eq!(h.session.phase(), StreamingPhase::Idle);
    assert_eq!(h.session.state(), ConnectionState::Connected);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sink.chunks_played(), 0);
    assert!(h.drain_events().contains(&SessionEvent::StreamStopped));
}

#[tokio::test(start_paused = true)]
async fn test_finish_of_previous_stream_keeps_new_stream() {
    let mut h = Harness::connected(100.0);
    h.prepare(100.0, 100.5);
    h.chunk(0, 100.5, true);

    tokio::time::sleep(Duration::from_millis(600)).await;
    assert_eq!(h.sink.chunks_played(), 1);
    let finished = h
        .drain_events()
        .into_iter()
        .find(|e| matches!(e, SessionEvent::PlaybackFinished { .. }))
        .expect("final chunk should report PlaybackFinished");

    // A new stream is handled before the run loop drains the old finish
    h.prepare(100.6, 102.0);
    h.chunk(0, 102.0, false);
    assert_eq!(h.session.pending_playbacks(), 1);

    h.session.on_event(&finished);
    assert_eq!(h.session.phase(), StreamingPhase::Active);
    assert_eq!(h.session.pending_playbacks(), 1);
    assert!(h.session.aligner().is_active());
    assert_eq!(h.session.buffer_health().size, 1);

    // The current stream's own finish still stops it
    h.session.on_event(&SessionEvent::PlaybackFinished {
        generation: h.session.generation(),
    });
    assert_eq!(h.session.phase(), StreamingPhase::Idle);
    assert_eq!(h.session.pending_playbacks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_transport_error_tears_down_stream() {
    let mut h = Harness::connected(50.0);
    h.prepare(50.0, 52.0);

    h.chunk(0, 52.0, false);
    h.chunk(1, 52.1, false);
    h.chunk(2, 52.2, false);
    assert_eq!(h.session.pending_playbacks(), 3);

    h.session.on_transport_error("connection reset");

    assert_eq!(h.session.state(), ConnectionState::Error);
    assert_eq!(h.session.phase(), StreamingPhase::Idle);
    assert_eq!(h.session.pending_playbacks(), 0);
    assert_eq!(h.session.buffer_health().size, 0);
    assert!(!h.session.aligner().is_active());

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(h.sink.chunks_played(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_far_future_chunk_is_acknowledged_and_held() {
    let mut h = Harness::connected(100.0);
    h.prepare(100.0, 100.5);

    h.session
        .handle_text(
            r#"{"type":"audio_chunk","chunk_id":0,"timestamp":1e300,"data":[0.0],"is_final":false}"#,
        )
        .unwrap();

    assert!(matches!(
        h.next_outbound(),
        Some(ClientMessage::AudioChunkAck { chunk_id: 0, .. })
    ));
    assert_eq!(h.session.state(), ConnectionState::Connected);
    assert_eq!(h.session.pending_playbacks(), 1);
    assert_eq!(h.sink.chunks_played(), 0);

    h.session.handle_message(ServerMessage::StopStreaming);
    assert_eq!(h.session.pending_playbacks(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_disconnect_tears_down_stream() {
    let mut h = Harness::connected(50.0);
    h.prepare(50.0, 51.0);
    h.chunk(0, 51.0, false);

    h.session.on_transport_closed();

    assert_eq!(h.session.state(), ConnectionState::Disconnected);
    assert_eq!(h.session.pending_playbacks(), 0);
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(h.sink.chunks_played(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_sync_response_updates_latency() {
    let mut h = Harness::connected(300.0);
    assert!(h.session.request_sync());
    assert_eq!(h.next_outbound(), Some(ClientMessage::SyncRequest));

    h.clock.set(300.04);
    h.session.handle_message(ServerMessage::SyncResponse {
        server_timestamp: 300.0,
        client_id: Some("client_1".to_string()),
    });

    assert!((h.session.latency() - 0.04).abs() < 1e-9);
    assert!(h
        .drain_events()
        .iter()
        .any(|e| matches!(e, SessionEvent::LatencyMeasured(_))));
}

#[tokio::test(start_paused = true)]
async fn test_local_requests_send_messages() {
    let mut h = Harness::connected(0.0);

    assert!(h.session.request_start(Some("song.wav".to_string())));
    assert_eq!(
        h.next_outbound(),
        Some(ClientMessage::StartStreaming {
            audio_file: Some("song.wav".to_string())
        })
    );

    assert!(h.session.request_stop());
    assert_eq!(h.next_outbound(), Some(ClientMessage::StopStreaming));
}

#[tokio::test(start_paused = true)]
async fn test_volume_scales_played_samples() {
    struct Capture(std::sync::Mutex<Vec<f32>>);
    impl audiosync_receiver::playback::AudioSink for Capture {
        fn play(
            &self,
            _format: audiosync_common::AudioFormat,
            samples: &[f32],
        ) -> audiosync_receiver::Result<()> {
            self.0.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
    }

    let clock = Arc::new(ManualClock::new(10.0));
    let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
    let (tx, _rx) = mpsc::unbounded_channel();
    let settings = SessionSettings {
        volume: 0.5,
        ..SessionSettings::default()
    };
    let (mut session, _events) = Session::new(settings, clock, capture.clone(), tx);
    session.connect();
    session.on_transport_open();

    session.handle_message(ServerMessage::AudioChunk {
        chunk_id: 0,
        timestamp: 9.0,
        data: vec![1.0, -1.0],
        is_final: false,
    });

    assert_eq!(*capture.0.lock().unwrap(), vec![0.5, -0.5]);
}

#[tokio::test(start_paused = true)]
async fn test_coordinator_volume_applies_to_own_device() {
    struct Capture(std::sync::Mutex<Vec<f32>>);
    impl audiosync_receiver::playback::AudioSink for Capture {
        fn play(
            &self,
            _format: audiosync_common::AudioFormat,
            samples: &[f32],
        ) -> audiosync_receiver::Result<()> {
            self.0.lock().unwrap().extend_from_slice(samples);
            Ok(())
        }
    }

    let clock = Arc::new(ManualClock::new(10.0));
    let capture = Arc::new(Capture(std::sync::Mutex::new(Vec::new())));
    let (tx, _rx) = mpsc::unbounded_channel();
    let settings = SessionSettings {
        volume: 0.5,
        ..SessionSettings::default()
    };
    let (mut session, _events) = Session::new(settings, clock, capture.clone(), tx);
    session.connect();
    session.on_transport_open();

    session
        .handle_text(r#"{"type":"connection","client_id":"client_3","message":"hi"}"#)
        .unwrap();

    let mut own = Device::new("client_3", DeviceInfo::default(), 10.0);
    own.volume = 0.5;
    let mut other = Device::new("client_4", DeviceInfo::default(), 10.0);
    other.volume = 0.0;
    session.handle_message(ServerMessage::DeviceList {
        devices: vec![own, other],
    });
    assert_eq!(session.device_volume(), 0.5);

    session.handle_message(ServerMessage::AudioChunk {
        chunk_id: 0,
        timestamp: 9.0,
        data: vec![1.0, -1.0],
        is_final: false,
    });

    assert_eq!(*capture.0.lock().unwrap(), vec![0.25, -0.25]);
}
