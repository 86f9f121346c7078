//! Logical clock used to sequence change-log and audit entries.
//!
//! Wall-clock timestamps can repeat (or go backwards after a clock
//! adjustment); the counter never does, so it doubles as the entry id and
//! as the tie-break when two entries share a timestamp.

use crate::NodeId;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// A per-node monotonic counter.
///
/// Ordering rules:
/// 1. Higher counter wins
/// 2. If counters equal, lexicographically higher node_id wins
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogicalClock {
    /// Identifier of the local store instance
    pub node_id: NodeId,
    /// Monotonically increasing counter
    pub counter: u64,
}

impl LogicalClock {
    /// Create a new clock for a node, starting at counter 0.
    pub fn new(node_id: impl Into<NodeId>) -> Self {
        Self {
            node_id: node_id.into(),
            counter: 0,
        }
    }

    /// Create a clock with a specific counter value.
    pub fn with_counter(node_id: impl Into<NodeId>, counter: u64) -> Self {
        Self {
            node_id: node_id.into(),
            counter,
        }
    }

    /// Increment the clock and return the new counter.
    pub fn tick(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    /// Move the counter forward to at least `counter`.
    ///
    /// Called after persisted entries are loaded so new ids never collide
    /// with ids already on disk.
    pub fn advance_to(&mut self, counter: u64) {
        self.counter = self.counter.max(counter);
    }
}

impl Ord for LogicalClock {
    fn cmp(&self, other: &Self) -> Ordering {
        match self.counter.cmp(&other.counter) {
            Ordering::Equal => self.node_id.cmp(&other.node_id),
            other => other,
        }
    }
}

impl PartialOrd for LogicalClock {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_clock_starts_at_zero() {
        let clock = LogicalClock::new("till-1");
        assert_eq!(clock.counter, 0);
        assert_eq!(clock.node_id, "till-1");
    }

    #[test]
    fn tick_returns_new_counter() {
        let mut clock = LogicalClock::new("till-1");
        assert_eq!(clock.tick(), 1);
        assert_eq!(clock.tick(), 2);
        assert_eq!(clock.counter, 2);
    }

    #[test]
    fn advance_never_moves_backwards() {
        let mut clock = LogicalClock::with_counter("till-1", 10);
        clock.advance_to(4);
        assert_eq!(clock.counter, 10);
        clock.advance_to(25);
        assert_eq!(clock.counter, 25);
        assert_eq!(clock.tick(), 26);
    }

    #[test]
    fn ordering_by_counter_then_node() {
        let a = LogicalClock::with_counter("till-b", 1);
        let b = LogicalClock::with_counter("till-a", 2);
        assert!(a < b);

        let c = LogicalClock::with_counter("till-a", 5);
        let d = LogicalClock::with_counter("till-b", 5);
        assert!(c < d);
    }

    #[test]
    fn serialization_format() {
        let clock = LogicalClock::with_counter("till-1", 10);
        let json = serde_json::to_string(&clock).unwrap();
        assert!(json.contains("nodeId"));
        let parsed: LogicalClock = serde_json::from_str(&json).unwrap();
        assert_eq!(clock, parsed);
    }
}
