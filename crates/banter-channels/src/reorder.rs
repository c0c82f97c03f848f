//! Short reorder buffer for cross-instance arrivals.
//!
//! Bridge fan-out preserves per-publisher order, but an instance that missed
//! frames (broker hiccup, partition heal) can observe a sequence hole. Events
//! above the hole wait here; if the hole fills within the reorder window they
//! drain in order, otherwise the hub backfills the missing range from the
//! shared retention ring.

use std::collections::BTreeMap;
use std::sync::Arc;

use banter_events::Event;

/// An event parked above a sequence hole.
#[derive(Clone, Debug)]
pub struct PendingEvent {
    /// The parsed envelope.
    pub event: Event,
    /// Serialized `ServerFrame::Event`, ready for fan-out.
    pub frame: Arc<String>,
}

/// Outcome of offering an event to the buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Offer {
    /// Parked until the hole below it fills or backfill runs.
    Buffered,
    /// Same sequence already parked; dropped.
    Duplicate,
    /// Buffer at capacity; the highest parked sequence was discarded
    /// (backfill will re-fetch it).
    Evicted,
}

/// Bounded, sequence-keyed holding area for out-of-order arrivals.
#[derive(Debug)]
pub struct ReorderBuffer {
    pending: BTreeMap<u64, PendingEvent>,
    capacity: usize,
}

impl ReorderBuffer {
    /// Buffer holding at most `capacity` parked events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            pending: BTreeMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Park an out-of-order event. When full, the highest sequence is
    /// dropped so the buffer always keeps the events closest to the hole.
    pub fn offer(&mut self, sequence: u64, event: Event, frame: Arc<String>) -> Offer {
        if self.pending.contains_key(&sequence) {
            return Offer::Duplicate;
        }
        let _ = self.pending.insert(sequence, PendingEvent { event, frame });
        if self.pending.len() > self.capacity {
            let _ = self.pending.pop_last();
            return Offer::Evicted;
        }
        Offer::Buffered
    }

    /// Pop the consecutive run starting at `next_expected`, returning the
    /// drained events and the new expectation.
    pub fn take_ready(&mut self, mut next_expected: u64) -> (Vec<PendingEvent>, u64) {
        let mut ready = Vec::new();
        while let Some(pending) = self.pending.remove(&next_expected) {
            ready.push(pending);
            next_expected += 1;
        }
        (ready, next_expected)
    }

    /// Lowest parked sequence, if any.
    #[must_use]
    pub fn first_sequence(&self) -> Option<u64> {
        self.pending.keys().next().copied()
    }

    /// Highest parked sequence, if any.
    #[must_use]
    pub fn last_sequence(&self) -> Option<u64> {
        self.pending.keys().next_back().copied()
    }

    /// Drop parked events below `sequence` (already delivered via backfill).
    pub fn discard_below(&mut self, sequence: u64) {
        self.pending = self.pending.split_off(&sequence);
    }

    /// Number of parked events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// True when nothing is parked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
