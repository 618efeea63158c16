//! End-to-end test of the `/ws` endpoint with a real WebSocket client

use std::sync::Arc;
use std::time::Duration;

use audiosync_common::{ClientMessage, DeviceInfo, ServerMessage, SystemClock};
use audiosync_coordinator::source::tone_factory;
use audiosync_coordinator::{build_router, AppState, Coordinator, CoordinatorConfig};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;

type Client = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

async fn recv_server(ws: &mut Client) -> ServerMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for the coordinator");
        match frame {
            Some(Ok(Message::Text(text))) => return ServerMessage::decode(&text).unwrap(),
            Some(Ok(_)) => continue,
            other => panic!("connection ended: {:?}", other),
        }
    }
}

async fn send_client(ws: &mut Client, message: ClientMessage) {
    ws.send(Message::Text(message.encode().unwrap())).await.unwrap();
}

#[tokio::test]
async fn test_receiver_session_over_websocket() {
    let config = CoordinatorConfig {
        sample_rate: 1_000,
        channels: 1,
        chunk_frames: 100,
        tone_duration_secs: 0.3,
        lead_time_secs: 0.2,
        send_ahead_secs: 0.1,
        ..CoordinatorConfig::default()
    };
    let coordinator = Arc::new(Coordinator::new(
        &config,
        Arc::new(SystemClock),
        tone_factory(&config),
    ));
    let shutdown = CancellationToken::new();
    let state = AppState::new(Arc::clone(&coordinator), shutdown.clone());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let server = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            axum::serve(listener, build_router(state))
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await
        }
    });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .unwrap();

    match recv_server(&mut ws).await {
        ServerMessage::Connection { client_id, .. } => assert_eq!(client_id, "client_0"),
        other => panic!("expected connection, got {:?}", other),
    }
    assert!(matches!(recv_server(&mut ws).await, ServerMessage::DeviceList { .. }));

    send_client(
        &mut ws,
        ClientMessage::DeviceInfo(DeviceInfo {
            name: "Kitchen".to_string(),
            platform: "linux".to_string(),
            capabilities: vec!["pcm_f32".to_string()],
            latency: 0.0,
        }),
    )
    .await;
    match recv_server(&mut ws).await {
        ServerMessage::DeviceList { devices } => {
            assert_eq!(devices.len(), 1);
            assert_eq!(devices[0].name, "Kitchen");
        }
        other => panic!("expected device_list, got {:?}", other),
    }

    send_client(&mut ws, ClientMessage::StartStreaming { audio_file: None }).await;
    let sync_timestamp = match recv_server(&mut ws).await {
        ServerMessage::PrepareStreaming {
            sync_timestamp,
            sample_rate,
            channels,
            ..
        } => {
            assert_eq!((sample_rate, channels), (1_000, 1));
            sync_timestamp
        }
        other => panic!("expected prepare_streaming, got {:?}", other),
    };

    let mut ids = Vec::new();
    loop {
        match recv_server(&mut ws).await {
            ServerMessage::AudioChunk {
                chunk_id,
                timestamp,
                is_final,
                ..
            } => {
                assert!((timestamp - (sync_timestamp + 0.1 * chunk_id as f64)).abs() < 1e-9);
                send_client(
                    &mut ws,
                    ClientMessage::AudioChunkAck {
                        chunk_id,
                        timestamp: audiosync_common::time::now_secs(),
                    },
                )
                .await;
                ids.push(chunk_id);
                if is_final {
                    break;
                }
            }
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(ids, vec![0, 1, 2]);

    ws.close(None).await.unwrap();
    for _ in 0..50 {
        if coordinator.session_count().await == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(coordinator.session_count().await, 0);
    assert!(coordinator.devices().await.is_empty());

    shutdown.cancel();
    server.await.unwrap().unwrap();
}
