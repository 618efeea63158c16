//! HTTP, SSE and WebSocket surface of the coordinator

pub mod handlers;
pub mod health;
pub mod sse;
pub mod ws;

pub use health::{health_check, health_routes, HealthResponse};
