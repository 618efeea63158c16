//! Clock Aligner
//!
//! Maps coordinator time onto this receiver's local clock using one reference
//! timestamp broadcast by the coordinator.
//!
//! ```text
//! set_reference(t_c):  local_offset = local_now() - t_c
//! current_time():      local_now() - local_offset      (raw local_now() when inactive)
//! ```
//!
//! The aligner also owns the playback epoch: every playback the scheduler
//! registers is tied to the current epoch token, and [`ClockAligner::reset`]
//! cancels that token before returning.

use std::sync::{Arc, Mutex, RwLock};

use audiosync_common::LocalClock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::locks;

/// Alignment state for one session
///
/// `local_offset` is only meaningful while `active` is true.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct SyncState {
    pub reference_timestamp: f64,
    pub local_offset: f64,
    pub active: bool,
}

/// Per-session coordinator/local clock mapping
pub struct ClockAligner {
    clock: Arc<dyn LocalClock>,
    state: RwLock<SyncState>,
    epoch: Mutex<CancellationToken>,
    /// Weight kept from the previous offset on re-sync (0.0 = replace)
    smoothing: f64,
}

impl ClockAligner {
    /// Create an inactive aligner that replaces its offset on every reference
    pub fn new(clock: Arc<dyn LocalClock>) -> Self {
        Self::with_smoothing(clock, 0.0)
    }

    /// Create an aligner that blends re-sync samples into the previous offset
    ///
    /// `smoothing` is clamped to `[0.0, 1.0)`. With `0.0` every call to
    /// [`set_reference`](Self::set_reference) fully replaces the state. Larger
    /// values keep that fraction of the previous offset when a reference arrives
    /// while already active; the first reference after a reset is never blended.
    pub fn with_smoothing(clock: Arc<dyn LocalClock>, smoothing: f64) -> Self {
        let smoothing = if smoothing.is_finite() {
            smoothing.clamp(0.0, 0.99)
        } else {
            0.0
        };
        Self {
            clock,
            state: RwLock::new(SyncState::default()),
            epoch: Mutex::new(CancellationToken::new()),
            smoothing,
        }
    }

    /// Raw local clock reading
    pub fn local_now(&self) -> f64 {
        self.clock.now()
    }

    /// Lock onto a coordinator timestamp taken "now"
    pub fn set_reference(&self, coordinator_time: f64) -> SyncState {
        let measured = self.clock.now() - coordinator_time;
        let mut state = locks::write(&self.state);

        let local_offset = if state.active && self.smoothing > 0.0 {
            self.smoothing * state.local_offset + (1.0 - self.smoothing) * measured
        } else {
            measured
        };

        *state = SyncState {
            reference_timestamp: coordinator_time,
            local_offset,
            active: true,
        };
        debug!(
            "Clock reference set: coordinator={:.6} offset={:.6}",
            coordinator_time, local_offset
        );
        *state
    }

    /// Estimate of coordinator time right now
    pub fn current_time(&self) -> f64 {
        let now = self.clock.now();
        let state = locks::read(&self.state);
        if state.active {
            now - state.local_offset
        } else {
            now
        }
    }

    /// Seconds until `target` (coordinator time); negative when already past
    pub fn time_until(&self, target: f64) -> f64 {
        target - self.current_time()
    }

    /// One-way latency estimate between a coordinator and a local timestamp
    pub fn estimate_latency(coordinator_time: f64, local_time: f64) -> f64 {
        (local_time - coordinator_time).abs()
    }

    /// Move a playback target earlier by the estimated transit delay
    pub fn adjust_for_latency(target: f64, estimated_latency: f64) -> f64 {
        target - estimated_latency
    }

    /// Clear alignment and cancel every playback scheduled in the current epoch
    pub fn reset(&self) {
        *locks::write(&self.state) = SyncState::default();

        let mut epoch = locks::lock(&self.epoch);
        epoch.cancel();
        *epoch = CancellationToken::new();
        debug!("Clock aligner reset");
    }

    /// Token cancelled by the next [`reset`](Self::reset)
    pub fn epoch(&self) -> CancellationToken {
        locks::lock(&self.epoch).clone()
    }

    pub fn is_active(&self) -> bool {
        locks::read(&self.state).active
    }

    pub fn state(&self) -> SyncState {
        *locks::read(&self.state)
    }
}
