//! # AudioSync Coordinator
//!
//! Streams audio to every connected receiver so they all start at one sync
//! instant:
//! - Device Manager: roster, latency history, volume/enabled, health
//! - Coordinator: sessions, sync instant, chunk pacing, acknowledgements
//! - API: WebSocket endpoint for receivers, REST control, SSE events

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

pub mod api;
pub mod config;
pub mod coordinator;
pub mod device_manager;
pub mod error;
pub mod events;
pub mod source;

pub use config::CoordinatorConfig;
pub use coordinator::{Coordinator, StreamStatus};
pub use error::{Error, Result};

/// Application state shared across HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    /// Closes open WebSocket sessions on shutdown
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(coordinator: Arc<Coordinator>, shutdown: CancellationToken) -> Self {
        Self {
            coordinator,
            shutdown,
        }
    }
}

/// Build application router
pub fn build_router(state: AppState) -> Router {
    let api = Router::new()
        .route("/api/devices", get(api::handlers::list_devices))
        .route("/api/devices/:id/volume", post(api::handlers::set_device_volume))
        .route("/api/devices/:id/enabled", post(api::handlers::set_device_enabled))
        .route("/api/streaming", get(api::handlers::get_streaming))
        .route("/api/streaming/start", post(api::handlers::start_streaming))
        .route("/api/streaming/stop", post(api::handlers::stop_streaming))
        .route("/events", get(api::sse::event_stream))
        .route("/ws", get(api::ws::ws_handler));

    Router::new()
        .merge(api)
        .merge(api::health_routes())
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind `port` on all interfaces and serve until `shutdown` is cancelled
pub async fn serve(port: u16, state: AppState) -> Result<()> {
    let shutdown = state.shutdown.clone();
    let app = build_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("Failed to bind to {}: {}", addr, e)))?;
    info!("Listening on {} (WebSocket at /ws)", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| Error::Http(format!("Server error: {}", e)))
}
