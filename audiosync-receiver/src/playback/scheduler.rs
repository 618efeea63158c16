//! Playback Scheduler
//!
//! Fires a callback at a precise future local instant derived from a chunk's
//! target timestamp and the [`ClockAligner`] offset.
//!
//! # Design
//! - Targets at or before "now" fire synchronously inside [`PlaybackScheduler::schedule`]
//! - Future targets become [`PendingPlayback`] records in one ordered map keyed
//!   by `(deadline, id)`; a single driver task sleeps until the earliest deadline
//! - Every record carries a cancel token derived from the aligner's epoch, so an
//!   aligner reset cancels the whole session's pending playback synchronously
//! - Callback failures (errors or panics) are reported and never stop the driver

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use audiosync_common::time::secs_to_duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::clock::ClockAligner;
use crate::error::Result;
use crate::locks;

/// Work to run when a playback instant arrives
pub type PlaybackCallback = Box<dyn FnOnce() -> Result<()> + Send + 'static>;

/// Receives callback failures on behalf of the session layer
pub type FailureReporter = Arc<dyn Fn(PlaybackFailure) + Send + Sync>;

/// Monotonic identifier of one scheduled playback
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PlaybackId(u64);

impl PlaybackId {
    pub fn value(&self) -> u64 {
        self.0
    }
}

/// A callback that returned an error or panicked
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackFailure {
    pub id: PlaybackId,
    pub error: String,
}

/// Cancellation handle for a pending playback
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackHandle {
    id: PlaybackId,
    deadline: Instant,
    fire_at: f64,
}

impl PlaybackHandle {
    pub fn id(&self) -> PlaybackId {
        self.id
    }

    /// Local clock time (seconds) at which the callback is due
    pub fn fire_at(&self) -> f64 {
        self.fire_at
    }
}

/// Result of [`PlaybackScheduler::schedule`]
#[derive(Debug)]
pub enum Scheduled {
    /// Target was already due; the callback ran before `schedule` returned
    Immediate,
    /// Target is in the future; the handle can cancel it
    Pending(PlaybackHandle),
}

impl Scheduled {
    pub fn handle(&self) -> Option<&PlaybackHandle> {
        match self {
            Scheduled::Immediate => None,
            Scheduled::Pending(handle) => Some(handle),
        }
    }
}

struct PendingPlayback {
    id: PlaybackId,
    fire_at: f64,
    cancel: CancellationToken,
    callback: PlaybackCallback,
}

struct Inner {
    queue: Mutex<BTreeMap<(Instant, PlaybackId), PendingPlayback>>,
    wake: Notify,
    reporter: Option<FailureReporter>,
}

impl Inner {
    fn next_deadline(&self) -> Option<Instant> {
        locks::lock(&self.queue)
            .keys()
            .next()
            .map(|(deadline, _)| *deadline)
    }

    fn fire_due(&self) {
        let now = Instant::now();
        let due = {
            let mut queue = locks::lock(&self.queue);
            let later = queue.split_off(&(now + Duration::from_nanos(1), PlaybackId(0)));
            std::mem::replace(&mut *queue, later)
        };

        for (_, entry) in due {
            if entry.cancel.is_cancelled() {
                trace!("Skipping cancelled playback {}", entry.id.0);
                continue;
            }
            trace!("Firing playback {} (fire_at={:.6})", entry.id.0, entry.fire_at);
            self.invoke(entry.id, entry.callback);
        }
    }

    fn invoke(&self, id: PlaybackId, callback: PlaybackCallback) {
        let error = match panic::catch_unwind(AssertUnwindSafe(callback)) {
            Ok(Ok(())) => return,
            Ok(Err(e)) => e.to_string(),
            Err(_) => "playback callback panicked".to_string(),
        };

        warn!("Playback {} failed: {}", id.0, error);
        if let Some(reporter) = &self.reporter {
            reporter(PlaybackFailure { id, error });
        }
    }
}

/// Per-session timer service for chunk playback
///
/// Must be created inside a Tokio runtime; the driver task stops when the
/// scheduler is dropped.
pub struct PlaybackScheduler {
    aligner: Arc<ClockAligner>,
    inner: Arc<Inner>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
}

impl PlaybackScheduler {
    pub fn new(aligner: Arc<ClockAligner>) -> Self {
        Self::build(aligner, None)
    }

    pub fn with_failure_reporter(aligner: Arc<ClockAligner>, reporter: FailureReporter) -> Self {
        Self::build(aligner, Some(reporter))
    }

    fn build(aligner: Arc<ClockAligner>, reporter: Option<FailureReporter>) -> Self {
        let inner = Arc::new(Inner {
            queue: Mutex::new(BTreeMap::new()),
            wake: Notify::new(),
            reporter,
        });
        let shutdown = CancellationToken::new();

        tokio::spawn(drive(Arc::clone(&inner), shutdown.clone()));

        Self {
            aligner,
            inner,
            next_id: AtomicU64::new(1),
            shutdown,
        }
    }

    /// Run `callback` when coordinator time reaches `target`
    ///
    /// Never blocks. Already-due targets run inline before returning.
    pub fn schedule<F>(&self, target: f64, callback: F) -> Scheduled
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let id = PlaybackId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let delay = self.aligner.time_until(target);

        if delay <= 0.0 {
            trace!("Playback {} already due ({:.6}s late)", id.0, -delay);
            self.inner.invoke(id, Box::new(callback));
            return Scheduled::Immediate;
        }

        let deadline = Instant::now() + secs_to_duration(delay);
        let fire_at = self.aligner.local_now() + delay;
        let entry = PendingPlayback {
            id,
            fire_at,
            cancel: self.aligner.epoch().child_token(),
            callback: Box::new(callback),
        };

        locks::lock(&self.inner.queue).insert((deadline, id), entry);
        self.inner.wake.notify_one();

        trace!("Playback {} scheduled in {:.6}s", id.0, delay);
        Scheduled::Pending(PlaybackHandle {
            id,
            deadline,
            fire_at,
        })
    }

    /// Cancel one pending playback; false if it already fired or was cancelled
    pub fn cancel(&self, handle: &PlaybackHandle) -> bool {
        let removed = locks::lock(&self.inner.queue).remove(&(handle.deadline, handle.id));
        match removed {
            Some(entry) if !entry.cancel.is_cancelled() => {
                entry.cancel.cancel();
                true
            }
            _ => false,
        }
    }

    /// Cancel every outstanding playback; returns how many were live
    pub fn reset_all(&self) -> usize {
        let drained = std::mem::take(&mut *locks::lock(&self.inner.queue));
        let mut cancelled = 0;
        for entry in drained.into_values() {
            if !entry.cancel.is_cancelled() {
                entry.cancel.cancel();
                cancelled += 1;
            }
        }
        self.inner.wake.notify_one();
        if cancelled > 0 {
            debug!("Cancelled {} pending playbacks", cancelled);
        }
        cancelled
    }

    /// Live (not yet fired, not cancelled) playbacks
    pub fn pending_count(&self) -> usize {
        locks::lock(&self.inner.queue)
            .values()
            .filter(|entry| !entry.cancel.is_cancelled())
            .count()
    }

    pub fn aligner(&self) -> &Arc<ClockAligner> {
        &self.aligner
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.reset_all();
        self.shutdown.cancel();
    }
}

async fn drive(inner: Arc<Inner>, shutdown: CancellationToken) {
    loop {
        match inner.next_deadline() {
            Some(deadline) => {
                tokio::select! {
                    _ = tokio::time::sleep_until(deadline) => inner.fire_due(),
                    _ = inner.wake.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
            None => {
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = shutdown.cancelled() => break,
                }
            }
        }
    }
    trace!("Playback scheduler driver stopped");
}
