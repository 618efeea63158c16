//! Timestamp utilities
//!
//! All protocol timestamps are `f64` seconds since the Unix epoch. Receivers read
//! their local clock through [`LocalClock`] so that clock alignment can be tested
//! against a [`ManualClock`].

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Get current UTC timestamp
pub fn now() -> DateTime<Utc> {
    Utc::now()
}

/// Current wall-clock time as seconds since the Unix epoch
pub fn now_secs() -> f64 {
    datetime_to_secs(Utc::now())
}

/// Convert a UTC timestamp to fractional seconds since the Unix epoch
pub fn datetime_to_secs(ts: DateTime<Utc>) -> f64 {
    ts.timestamp_micros() as f64 / 1_000_000.0
}

/// Longest duration [`secs_to_duration`] returns (one year)
///
/// Small enough that adding it to an `Instant` cannot overflow.
pub const MAX_DURATION: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// Convert fractional seconds to a duration
///
/// Negatives and NaN clamp to zero; anything above [`MAX_DURATION`] saturates.
pub fn secs_to_duration(secs: f64) -> Duration {
    if !(secs > 0.0) {
        return Duration::ZERO;
    }
    Duration::try_from_secs_f64(secs)
        .map(|d| d.min(MAX_DURATION))
        .unwrap_or(MAX_DURATION)
}

/// Source of "local now" for a receiver
pub trait LocalClock: Send + Sync {
    /// Local time in seconds since the Unix epoch
    fn now(&self) -> f64;
}

/// Wall-clock time source
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl LocalClock for SystemClock {
    fn now(&self) -> f64 {
        now_secs()
    }
}

/// Manually driven clock for deterministic tests and simulations
///
/// Stores the `f64` bit pattern in an atomic so it can be shared across tasks.
#[derive(Debug)]
pub struct ManualClock {
    bits: AtomicU64,
}

impl ManualClock {
    pub fn new(start: f64) -> Self {
        Self {
            bits: AtomicU64::new(start.to_bits()),
        }
    }

    /// Jump to an absolute time
    pub fn set(&self, secs: f64) {
        self.bits.store(secs.to_bits(), Ordering::SeqCst);
    }

    /// Move forward by `delta` seconds
    pub fn advance(&self, delta: f64) {
        let current = f64::from_bits(self.bits.load(Ordering::SeqCst));
        self.set(current + delta);
    }
}

impl LocalClock for ManualClock {
    fn now(&self) -> f64 {
        f64::from_bits(self.bits.load(Ordering::SeqCst))
    }
}
