//! REST handlers for devices and streaming control

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use audiosync_common::Device;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::coordinator::StreamStatus;
use crate::error::Error;
use crate::AppState;

type ApiResult<T> = Result<Json<T>, (StatusCode, Json<StatusResponse>)>;

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct DeviceListResponse {
    pub devices: Vec<Device>,
}

#[derive(Debug, Deserialize)]
pub struct VolumeRequest {
    /// 0.0 - 1.0
    pub volume: f64,
}

#[derive(Debug, Deserialize)]
pub struct EnabledRequest {
    pub enabled: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct StartRequest {
    #[serde(default)]
    pub audio_file: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct StopResponse {
    /// Whether a stream was running
    pub stopped: bool,
}

fn error_status(error: &Error) -> StatusCode {
    match error {
        Error::DeviceNotFound(_) => StatusCode::NOT_FOUND,
        Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
        Error::AlreadyStreaming(_) => StatusCode::CONFLICT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn into_rejection(error: Error) -> (StatusCode, Json<StatusResponse>) {
    (
        error_status(&error),
        Json(StatusResponse {
            status: error.to_string(),
        }),
    )
}

// ============================================================================
// Devices
// ============================================================================

/// GET /api/devices - active roster
pub async fn list_devices(State(state): State<AppState>) -> Json<DeviceListResponse> {
    Json(DeviceListResponse {
        devices: state.coordinator.devices().await,
    })
}

/// POST /api/devices/:id/volume
///
/// Rejects values outside 0.0 - 1.0 rather than clamping them.
pub async fn set_device_volume(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<VolumeRequest>,
) -> ApiResult<Device> {
    if !req.volume.is_finite() || !(0.0..=1.0).contains(&req.volume) {
        return Err(into_rejection(Error::InvalidInput(format!(
            "volume must be between 0.0 and 1.0, got {}",
            req.volume
        ))));
    }

    state
        .coordinator
        .set_device_volume(&client_id, req.volume)
        .await
        .map(Json)
        .map_err(into_rejection)
}

/// POST /api/devices/:id/enabled
pub async fn set_device_enabled(
    State(state): State<AppState>,
    Path(client_id): Path<String>,
    Json(req): Json<EnabledRequest>,
) -> ApiResult<Device> {
    state
        .coordinator
        .set_device_enabled(&client_id, req.enabled)
        .await
        .map(Json)
        .map_err(into_rejection)
}

// ============================================================================
// Streaming
// ============================================================================

/// POST /api/streaming/start
pub async fn start_streaming(
    State(state): State<AppState>,
    body: Option<Json<StartRequest>>,
) -> ApiResult<StreamStatus> {
    let req = body.map(|Json(req)| req).unwrap_or_default();
    info!(
        "Start streaming requested over HTTP: {}",
        req.audio_file.as_deref().unwrap_or("<default>")
    );

    match state.coordinator.start_streaming(req.audio_file).await {
        Ok(status) => Ok(Json(status)),
        Err(e) => {
            warn!("Start streaming rejected: {}", e);
            Err(into_rejection(e))
        }
    }
}

/// POST /api/streaming/stop
pub async fn stop_streaming(State(state): State<AppState>) -> Json<StopResponse> {
    let stopped = state.coordinator.stop_streaming().await;
    Json(StopResponse { stopped })
}

/// GET /api/streaming
pub async fn get_streaming(State(state): State<AppState>) -> Json<StreamStatus> {
    Json(state.coordinator.status().await)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        assert_eq!(
            error_status(&Error::DeviceNotFound("client_9".into())),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            error_status(&Error::AlreadyStreaming("a.wav".into())),
            StatusCode::CONFLICT
        );
        assert_eq!(
            error_status(&Error::Source("bad".into())),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
