//! Jitter Buffer
//!
//! Bounded store of chunks keyed by sequence id. Chunks may arrive in any order;
//! consumption follows a monotonic cursor.
//!
//! **Capacity:** size never exceeds `capacity` after a mutating call returns.
//! Overflow first evicts every chunk whose target timestamp is older than
//! `max_age` relative to the aligner's current time (oldest first); if that is
//! not enough, the oldest remaining chunks by target timestamp go next.

use std::collections::BTreeMap;
use std::sync::Arc;

use audiosync_common::{AudioFormat, Chunk};
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::ClockAligner;

/// Default capacity in chunks
pub const DEFAULT_CAPACITY: usize = 100;

/// Capacity floor enforced by [`JitterBuffer::set_capacity`]
pub const MIN_CAPACITY: usize = 10;

/// Default age threshold for overflow eviction (seconds)
pub const DEFAULT_MAX_AGE_SECS: f64 = 10.0;

/// What [`JitterBuffer::insert`] did with a chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// New sequence id stored
    Stored,
    /// Same sequence id already held; last write wins
    Replaced,
    /// Sequence id already consumed; not stored
    Stale,
}

/// Snapshot for observability and backpressure decisions
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BufferHealth {
    pub size: usize,
    pub capacity: usize,
    pub cursor: u64,
    pub buffered_duration_secs: f64,
    pub oldest_timestamp: Option<f64>,
    pub newest_timestamp: Option<f64>,
    pub evicted_total: u64,
    pub gaps_total: u64,
}

/// Per-session reorder/jitter store
pub struct JitterBuffer {
    chunks: BTreeMap<u64, Chunk>,
    cursor: u64,
    capacity: usize,
    max_age: f64,
    format: AudioFormat,
    aligner: Arc<ClockAligner>,
    evicted_total: u64,
    gaps_total: u64,
}

impl JitterBuffer {
    pub fn new(aligner: Arc<ClockAligner>) -> Self {
        Self::with_limits(aligner, DEFAULT_CAPACITY, DEFAULT_MAX_AGE_SECS)
    }

    pub fn with_limits(aligner: Arc<ClockAligner>, capacity: usize, max_age_secs: f64) -> Self {
        Self {
            chunks: BTreeMap::new(),
            cursor: 0,
            capacity: capacity.max(MIN_CAPACITY),
            max_age: max_age_secs,
            format: AudioFormat::default(),
            aligner,
            evicted_total: 0,
            gaps_total: 0,
        }
    }

    /// Start a new stream: drop everything and record the sample format
    pub fn init(&mut self, format: AudioFormat) {
        self.clear();
        self.evicted_total = 0;
        self.gaps_total = 0;
        self.format = format;
        debug!(
            "Jitter buffer initialized: {} Hz, {} ch, capacity {}",
            format.sample_rate, format.channels, self.capacity
        );
    }

    /// Store a chunk by sequence id, evicting if over capacity
    pub fn insert(&mut self, chunk: Chunk) -> InsertOutcome {
        let id = chunk.sequence_id();
        if id < self.cursor {
            trace!("Chunk {} is behind cursor {}, not stored", id, self.cursor);
            return InsertOutcome::Stale;
        }

        let outcome = match self.chunks.insert(id, chunk) {
            Some(_) => InsertOutcome::Replaced,
            None => InsertOutcome::Stored,
        };

        if self.chunks.len() > self.capacity {
            self.enforce_capacity();
        }
        outcome
    }

    /// Take the chunk at the cursor, if it has arrived
    ///
    /// Non-blocking: returns `None` without advancing when the cursor's chunk
    /// is missing.
    pub fn consume_next(&mut self) -> Option<Chunk> {
        let chunk = self.chunks.remove(&self.cursor)?;
        self.cursor = self.cursor.saturating_add(1);
        Some(chunk)
    }

    /// Take every held chunk from the cursor through `sequence_id` in order
    ///
    /// The cursor moves past `sequence_id`; ids in that span that never
    /// arrived are counted as gaps.
    pub fn consume_through(&mut self, sequence_id: u64) -> Vec<Chunk> {
        if sequence_id < self.cursor {
            return Vec::new();
        }

        let keys: Vec<u64> = self
            .chunks
            .range(self.cursor..=sequence_id)
            .map(|(id, _)| *id)
            .collect();
        let taken: Vec<Chunk> = keys
            .iter()
            .filter_map(|id| self.chunks.remove(id))
            .collect();

        let span = (sequence_id - self.cursor).saturating_add(1);
        let gaps = span - taken.len() as u64;
        if gaps > 0 {
            debug!(
                "Skipped {} missing chunks before sequence {}",
                gaps, sequence_id
            );
        }
        self.gaps_total = self.gaps_total.saturating_add(gaps);
        self.cursor = sequence_id.saturating_add(1);
        taken
    }

    pub fn health(&self) -> BufferHealth {
        let oldest = self
            .chunks
            .values()
            .map(Chunk::target_timestamp)
            .reduce(f64::min);
        let newest = self
            .chunks
            .values()
            .map(Chunk::target_timestamp)
            .reduce(f64::max);

        BufferHealth {
            size: self.chunks.len(),
            capacity: self.capacity,
            cursor: self.cursor,
            buffered_duration_secs: self.chunks.len() as f64
                * self.format.nominal_chunk_duration(),
            oldest_timestamp: oldest,
            newest_timestamp: newest,
            evicted_total: self.evicted_total,
            gaps_total: self.gaps_total,
        }
    }

    /// Change capacity (floored at [`MIN_CAPACITY`]), evicting immediately if needed
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(MIN_CAPACITY);
        if self.chunks.len() > self.capacity {
            self.enforce_capacity();
        }
    }

    /// Held chunks whose target timestamps fall within `[start, end]`
    pub fn chunks_in_range(&self, start: f64, end: f64) -> Vec<&Chunk> {
        self.chunks
            .values()
            .filter(|c| c.target_timestamp() >= start && c.target_timestamp() <= end)
            .collect()
    }

    /// Remove chunks whose target timestamps are older than `timestamp`
    pub fn evict_older_than(&mut self, timestamp: f64) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|_, c| c.target_timestamp() >= timestamp);
        let removed = before - self.chunks.len();
        self.evicted_total += removed as u64;
        removed
    }

    /// Drop all chunks and rewind the cursor
    pub fn clear(&mut self) {
        self.chunks.clear();
        self.cursor = 0;
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn contains(&self, sequence_id: u64) -> bool {
        self.chunks.contains_key(&sequence_id)
    }

    pub fn cursor(&self) -> u64 {
        self.cursor
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    fn enforce_capacity(&mut self) {
        let threshold = self.aligner.current_time() - self.max_age;

        let mut by_age: Vec<(f64, u64)> = self
            .chunks
            .values()
            .map(|c| (c.target_timestamp(), c.sequence_id()))
            .collect();
        by_age.sort_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

        let mut evicted = 0usize;
        let mut aged = 0usize;
        for (timestamp, id) in &by_age {
            let over = self.chunks.len() > self.capacity;
            let is_aged = *timestamp < threshold;
            if !is_aged && !over {
                break;
            }
            if self.chunks.remove(id).is_some() {
                evicted += 1;
                if is_aged {
                    aged += 1;
                }
            }
        }

        self.evicted_total += evicted as u64;
        debug!(
            "Jitter buffer over capacity: evicted {} chunks ({} aged), size now {}",
            evicted,
            aged,
            self.chunks.len()
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use audiosync_common::ManualClock;

    fn buffer_at(now: f64, capacity: usize) -> JitterBuffer {
        let clock = Arc::new(ManualClock::new(now));
        let aligner = Arc::new(ClockAligner::new(clock));
        JitterBuffer::with_limits(aligner, capacity, DEFAULT_MAX_AGE_SECS)
    }

    fn chunk(id: u64, ts: f64) -> Chunk {
        Chunk::new(id, ts, vec![0.0; 4], false)
    }

    #[test]
    fn test_capacity_floor() {
        let mut buffer = buffer_at(0.0, 3);
        assert_eq!(buffer.capacity(), MIN_CAPACITY);

        buffer.set_capacity(4);
        assert_eq!(buffer.capacity(), MIN_CAPACITY);

        buffer.set_capacity(50);
        assert_eq!(buffer.capacity(), 50);
    }

    #[test]
    fn test_insert_replaces_same_id() {
        let mut buffer = buffer_at(0.0, 10);
        assert_eq!(buffer.insert(chunk(1, 1.0)), InsertOutcome::Stored);
        assert_eq!(buffer.insert(chunk(1, 2.0)), InsertOutcome::Replaced);
        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.chunks_in_range(2.0, 2.0).len(), 1);
    }

    #[test]
    fn test_consume_next_follows_cursor() {
        let mut buffer = buffer_at(0.0, 10);
        buffer.insert(chunk(1, 1.0));

        // Cursor's chunk (0) has not arrived
        assert!(buffer.consume_next().is_none());
        assert_eq!(buffer.cursor(), 0);

        buffer.insert(chunk(0, 0.5));
        assert_eq!(buffer.consume_next().unwrap().sequence_id(), 0);
        assert_eq!(buffer.consume_next().unwrap().sequence_id(), 1);
        assert!(buffer.consume_next().is_none());
        assert_eq!(buffer.cursor(), 2);
    }

    #[test]
    fn test_consumed_id_is_stale() {
        let mut buffer = buffer_at(0.0, 10);
        buffer.insert(chunk(0, 0.0));
        buffer.consume_next();

        assert_eq!(buffer.insert(chunk(0, 0.0)), InsertOutcome::Stale);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_consume_through_counts_gaps() {
        let mut buffer = buffer_at(0.0, 10);
        buffer.insert(chunk(0, 0.0));
        buffer.insert(chunk(2, 0.2));
        buffer.insert(chunk(5, 0.5));

        let taken = buffer.consume_through(3);
        let ids: Vec<u64> = taken.iter().map(Chunk::sequence_id).collect();
        assert_eq!(ids, vec![0, 2]);
        assert_eq!(buffer.cursor(), 4);
        assert_eq!(buffer.health().gaps_total, 2);

        // Already passed
        assert!(buffer.consume_through(1).is_empty());
        assert!(buffer.contains(5));
    }

    #[test]
    fn test_consume_through_last_id_clamps_cursor() {
        let mut buffer = buffer_at(0.0, 10);
        buffer.insert(chunk(u64::MAX, 1.0));

        let taken = buffer.consume_through(u64::MAX);
        assert_eq!(taken.len(), 1);
        assert_eq!(buffer.cursor(), u64::MAX);
        assert_eq!(buffer.health().gaps_total, u64::MAX - 1);
        assert!(buffer.consume_next().is_none());
    }

    #[test]
    fn test_overflow_without_aged_chunks_drops_oldest() {
        let mut buffer = buffer_at(100.0, 10);
        for id in 0..12 {
            buffer.insert(chunk(id, 100.0 + id as f64));
        }
        assert_eq!(buffer.len(), 10);
        assert!(!buffer.contains(0));
        assert!(!buffer.contains(1));
        assert!(buffer.contains(11));
    }

    #[test]
    fn test_shrinking_capacity_evicts_immediately() {
        let mut buffer = buffer_at(100.0, 20);
        for id in 0..20 {
            buffer.insert(chunk(id, 100.0 + id as f64));
        }
        buffer.set_capacity(12);
        assert_eq!(buffer.len(), 12);
        assert!(buffer.contains(19));
        assert!(!buffer.contains(7));
    }

    #[test]
    fn test_evict_older_than_reports_count() {
        let mut buffer = buffer_at(0.0, 10);
        for id in 0..6 {
            buffer.insert(chunk(id, id as f64));
        }
        assert_eq!(buffer.evict_older_than(3.0), 3);
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.health().evicted_total, 3);
    }

    #[test]
    fn test_health_reports_range_and_duration() {
        let mut buffer = buffer_at(0.0, 10);
        buffer.init(AudioFormat::new(44_100, 2));
        buffer.insert(chunk(3, 7.0));
        buffer.insert(chunk(4, 5.0));

        let health = buffer.health();
        assert_eq!(health.size, 2);
        assert_eq!(health.oldest_timestamp, Some(5.0));
        assert_eq!(health.newest_timestamp, Some(7.0));
        let expected = 2.0 * AudioFormat::new(44_100, 2).nominal_chunk_duration();
        assert!((health.buffered_duration_secs - expected).abs() < 1e-12);
    }

    #[test]
    fn test_init_resets_cursor_and_storage() {
        let mut buffer = buffer_at(0.0, 10);
        buffer.insert(chunk(0, 0.0));
        buffer.insert(chunk(1, 0.1));
        buffer.consume_next();

        buffer.init(AudioFormat::new(48_000, 1));
        assert!(buffer.is_empty());
        assert_eq!(buffer.cursor(), 0);
        assert_eq!(buffer.format(), AudioFormat::new(48_000, 1));
    }
}
