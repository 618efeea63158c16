//! WebSocket transport and session run loop
//!
//! One task owns the [`Session`] and multiplexes:
//! - inbound frames from the coordinator
//! - outbound protocol messages queued by the session
//! - session events (forwarded to an optional observer)
//! - the periodic sync probe
//!
//! Transport failure ends the loop; reconnecting is the caller's decision.

use std::sync::Arc;
use std::time::Duration;

use audiosync_common::{ClientMessage, LocalClock};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{self, Interval, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::playback::sink::AudioSink;
use crate::session::{Session, SessionEvent, SessionSettings};

/// Connection parameters for one run
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub server_url: String,
    pub sync_interval: Option<Duration>,
}

/// Connect to the coordinator and run the session until shutdown or disconnect
///
/// Returns `Ok(())` after a clean close or shutdown, `Err(Error::Transport)`
/// when the connection fails.
pub async fn run(
    options: TransportOptions,
    settings: SessionSettings,
    clock: Arc<dyn LocalClock>,
    sink: Arc<dyn AudioSink>,
    observer: Option<mpsc::Sender<SessionEvent>>,
    shutdown: CancellationToken,
) -> Result<()> {
    let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
    let (mut session, mut events) = Session::new(settings, clock, sink, outbound_tx);

    session.connect();
    info!("Connecting to {}", options.server_url);

    let (ws_stream, _) = match connect_async(options.server_url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            let reason = format!("Failed to connect to {}: {}", options.server_url, e);
            session.on_transport_error(&reason);
            return Err(Error::Transport(reason));
        }
    };
    let (mut write, mut read) = ws_stream.split();
    session.on_transport_open();
    info!("Connected to {}", options.server_url);

    let mut sync_timer = options.sync_interval.map(|period| {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        interval
    });

    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutdown requested, closing connection");
                if let Err(e) = write.send(Message::Close(None)).await {
                    debug!("Close frame not sent: {}", e);
                }
                session.disconnect();
                break Ok(());
            }

            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    if let Err(e) = session.handle_text(&text) {
                        debug!("Inbound message dropped: {}", e);
                    }
                }
                Some(Ok(Message::Close(frame))) => {
                    debug!("Close frame received: {:?}", frame);
                    session.on_transport_closed();
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    let reason = e.to_string();
                    session.on_transport_error(&reason);
                    break Err(Error::Transport(reason));
                }
                None => {
                    session.on_transport_closed();
                    break Ok(());
                }
            },

            Some(message) = outbound_rx.recv() => {
                let text = match message.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Dropping outbound {}: {}", message.kind(), e);
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text)).await {
                    let reason = e.to_string();
                    session.on_transport_error(&reason);
                    break Err(Error::Transport(reason));
                }
            }

            Some(event) = events.recv() => {
                session.on_event(&event);
                forward(&observer, event);
            }

            _ = tick(&mut sync_timer) => {
                session.request_sync();
            }
        }
    };

    // Deliver whatever the teardown published
    while let Ok(event) = events.try_recv() {
        forward(&observer, event);
    }
    outcome
}

async fn tick(timer: &mut Option<Interval>) {
    match timer {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

fn forward(observer: &Option<mpsc::Sender<SessionEvent>>, event: SessionEvent) {
    match observer {
        Some(tx) => {
            if tx.try_send(event).is_err() {
                debug!("Observer not keeping up, event dropped");
            }
        }
        None => debug!("Session event: {:?}", event),
    }
}
