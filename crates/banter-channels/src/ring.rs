//! In-memory retention ring, the local mirror of the shared-store ring.
//!
//! Each instance keeps the last `window_size` events it has seen for a
//! channel so reconnect replay can be served without a broker round trip.
//! The shared-store copy remains authoritative for instances that were not
//! watching when the events flowed.

use std::collections::VecDeque;
use std::sync::Arc;

/// One retained event: its sequence and the pre-serialized server frame.
#[derive(Clone, Debug)]
pub struct RetainedEvent {
    /// Sequence number within the channel.
    pub sequence: u64,
    /// Serialized `ServerFrame::Event`, shared across subscribers.
    pub frame: Arc<String>,
}

/// Capacity-bounded ring of the most recent events on one channel.
///
/// Sequences are pushed in strictly increasing order; the oldest entry is
/// dropped once the window is full.
#[derive(Debug)]
pub struct RetentionRing {
    entries: VecDeque<RetainedEvent>,
    capacity: usize,
}

impl RetentionRing {
    /// Ring holding at most `capacity` events (minimum 1).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an event, evicting the oldest once the window is full.
    /// Out-of-order or duplicate sequences are ignored.
    pub fn push(&mut self, sequence: u64, frame: Arc<String>) {
        if let Some(newest) = self.newest() {
            if sequence <= newest {
                return;
            }
        }
        self.entries.push_back(RetainedEvent { sequence, frame });
        while self.entries.len() > self.capacity {
            let _ = self.entries.pop_front();
        }
    }

    /// Oldest retained sequence, if any.
    #[must_use]
    pub fn oldest(&self) -> Option<u64> {
        self.entries.front().map(|e| e.sequence)
    }

    /// Newest retained sequence, if any.
    #[must_use]
    pub fn newest(&self) -> Option<u64> {
        self.entries.back().map(|e| e.sequence)
    }

    /// Whether every event after `last_seen` is still retained, so a resume
    /// from that point can be served entirely from this ring.
    #[must_use]
    pub fn covers_after(&self, last_seen: u64) -> bool {
        match self.oldest() {
            Some(oldest) => oldest <= last_seen.saturating_add(1),
            None => false,
        }
    }

    /// All retained events with sequence greater than `after`, in order.
    #[must_use]
    pub fn collect_after(&self, after: u64) -> Vec<RetainedEvent> {
        self.entries
            .iter()
            .filter(|e| e.sequence > after)
            .cloned()
            .collect()
    }

    /// Number of retained events.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when nothing is retained.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop everything, e.g. when the local view diverged and must be
    /// rebuilt from the shared store.
    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(sequence: u64) -> Arc<String> {
        Arc::new(format!("{{\"sequence\":{sequence}}}"))
    }

    #[test]
    fn keeps_only_the_window() {
        let mut ring = RetentionRing::new(3);
        for seq in 1..=5 {
            ring.push(seq, frame(seq));
        }
        assert_eq!(ring.len(), 3);
        assert_eq!(ring.oldest(), Some(3));
        assert_eq!(ring.newest(), Some(5));
    }

    #[test]
    fn collect_after_returns_ordered_tail() {
        let mut ring = RetentionRing::new(10);
        for seq in 1..=6 {
            ring.push(seq, frame(seq));
        }
        let tail: Vec<u64> = ring.collect_after(3).iter().map(|e| e.sequence).collect();
        assert_eq!(tail, vec![4, 5, 6]);
        assert!(ring.collect_after(6).is_empty());
    }

    #[test]
    fn coverage_tracks_the_oldest_entry() {
        let mut ring = RetentionRing::new(3);
        assert!(!ring.covers_after(0));

        for seq in 4..=6 {
            ring.push(seq, frame(seq));
        }
        // Oldest retained is 4: resumes from 3 (next needed: 4) are fine,
        // resumes from 2 (next needed: 3) are not.
        assert!(ring.covers_after(3));
        assert!(ring.covers_after(5));
        assert!(!ring.covers_after(2));
    }

    #[test]
    fn stale_and_duplicate_pushes_ignored() {
        let mut ring = RetentionRing::new(5);
        ring.push(4, frame(4));
        ring.push(4, frame(4));
        ring.push(2, frame(2));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.newest(), Some(4));
    }

    #[test]
    fn clear_empties_the_ring() {
        let mut ring = RetentionRing::new(3);
        ring.push(1, frame(1));
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.oldest(), None);
    }

    #[test]
    fn zero_capacity_clamps_to_one() {
        let mut ring = RetentionRing::new(0);
        ring.push(1, frame(1));
        ring.push(2, frame(2));
        assert_eq!(ring.len(), 1);
        assert_eq!(ring.newest(), Some(2));
    }
}
