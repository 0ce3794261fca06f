//! Vector clocks for causal ordering of operations
//!
//! Every operation carries a vector-clock snapshot of its dependencies;
//! the document manager compares clocks to decide whether a remote
//! operation is causally deliverable or must be buffered.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::ReplicaId;

/// Causal relationship between two vector clocks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CausalOrder {
    /// Self happened strictly before other
    Before,
    /// Self happened strictly after other
    After,
    /// Neither clock dominates; concurrent edits requiring a
    /// conflict-resolution policy elsewhere
    Concurrent,
    /// Identical clocks
    Equal,
}

/// Per-replica counters used to determine causal ordering
///
/// A replica's own counter increases by exactly 1 per locally generated
/// operation. Absent entries are treated as zero, so a fresh clock is
/// the bottom element of the ordering. All operations are total; there
/// are no error conditions.
///
/// Stored as a `BTreeMap` so serialization and iteration order are
/// deterministic across replicas.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
    entries: BTreeMap<ReplicaId, u64>,
}

impl VectorClock {
    /// Create an empty clock (all counters zero)
    pub fn new() -> Self {
        Self::default()
    }

    /// The counter for a replica, zero if absent
    pub fn get(&self, replica: &ReplicaId) -> u64 {
        self.entries.get(replica).copied().unwrap_or(0)
    }

    /// Returns a new clock with the given replica's counter advanced by 1
    pub fn increment(&self, replica: &ReplicaId) -> Self {
        let mut next = self.clone();
        *next.entries.entry(replica.clone()).or_insert(0) += 1;
        next
    }

    /// Returns the element-wise maximum of two clocks
    ///
    /// Pure: neither input is mutated. Merging is commutative,
    /// associative, and idempotent.
    pub fn merge(&self, other: &Self) -> Self {
        let mut merged = self.clone();
        for (replica, &counter) in &other.entries {
            let entry = merged.entries.entry(replica.clone()).or_insert(0);
            if counter > *entry {
                *entry = counter;
            }
        }
        merged
    }

    /// True iff every entry in `other` is <= the corresponding entry here
    ///
    /// Used to decide causal deliverability: an operation whose
    /// dependency clock is a descendant of the local clock has all its
    /// dependencies applied.
    pub fn is_descendant_of(&self, other: &Self) -> bool {
        other
            .entries
            .iter()
            .all(|(replica, &counter)| self.get(replica) >= counter)
    }

    /// Compare two clocks for causal order
    pub fn compare(&self, other: &Self) -> CausalOrder {
        let self_ge = self.is_descendant_of(other);
        let other_ge = other.is_descendant_of(self);
        match (self_ge, other_ge) {
            (true, true) => CausalOrder::Equal,
            (true, false) => CausalOrder::After,
            (false, true) => CausalOrder::Before,
            (false, false) => CausalOrder::Concurrent,
        }
    }

    /// The first dependency in `deps` not yet covered by this clock
    ///
    /// Returns the `(replica, counter)` of the next operation this clock
    /// is missing, used to key the pending-delivery buffer. Returns
    /// `None` when `deps` is fully covered.
    pub fn first_missing(&self, deps: &Self) -> Option<(ReplicaId, u64)> {
        deps.entries
            .iter()
            .find(|(replica, &counter)| self.get(replica) < counter)
            .map(|(replica, _)| (replica.clone(), self.get(replica) + 1))
    }

    /// Iterate over `(replica, counter)` entries
    pub fn iter(&self) -> impl Iterator<Item = (&ReplicaId, u64)> {
        self.entries.iter().map(|(r, &c)| (r, c))
    }

    /// Whether the clock has no nonzero entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Display for VectorClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{")?;
        for (i, (replica, counter)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}:{}", replica, counter)?;
        }
        write!(f, "}}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replica(s: &str) -> ReplicaId {
        ReplicaId::new(s)
    }

    #[test]
    fn test_new_clock_is_empty() {
        let clock = VectorClock::new();
        assert!(clock.is_empty());
        assert_eq!(clock.get(&replica("a")), 0);
    }

    #[test]
    fn test_increment_advances_by_one() {
        let clock = VectorClock::new();
        let clock = clock.increment(&replica("a"));
        assert_eq!(clock.get(&replica("a")), 1);
        let clock = clock.increment(&replica("a"));
        assert_eq!(clock.get(&replica("a")), 2);
        // Other replicas untouched
        assert_eq!(clock.get(&replica("b")), 0);
    }

    #[test]
    fn test_increment_is_pure() {
        let clock = VectorClock::new();
        let _ = clock.increment(&replica("a"));
        assert_eq!(clock.get(&replica("a")), 0);
    }

    #[test]
    fn test_merge_takes_elementwise_max() {
        let a = VectorClock::new()
            .increment(&replica("a"))
            .increment(&replica("a"));
        let b = VectorClock::new()
            .increment(&replica("a"))
            .increment(&replica("b"));

        let merged = a.merge(&b);
        assert_eq!(merged.get(&replica("a")), 2);
        assert_eq!(merged.get(&replica("b")), 1);
    }

    #[test]
    fn test_merge_is_commutative() {
        let a = VectorClock::new().increment(&replica("a"));
        let b = VectorClock::new().increment(&replica("b"));
        assert_eq!(a.merge(&b), b.merge(&a));
    }

    #[test]
    fn test_merge_is_idempotent() {
        let a = VectorClock::new().increment(&replica("a"));
        assert_eq!(a.merge(&a), a);
    }

    #[test]
    fn test_is_descendant_of() {
        let empty = VectorClock::new();
        let a1 = empty.increment(&replica("a"));
        let a2 = a1.increment(&replica("a"));

        assert!(a2.is_descendant_of(&a1));
        assert!(a2.is_descendant_of(&empty));
        assert!(a1.is_descendant_of(&a1));
        assert!(!a1.is_descendant_of(&a2));
    }

    #[test]
    fn test_compare_orders() {
        let empty = VectorClock::new();
        let a1 = empty.increment(&replica("a"));
        let b1 = empty.increment(&replica("b"));

        assert_eq!(a1.compare(&a1), CausalOrder::Equal);
        assert_eq!(a1.compare(&empty), CausalOrder::After);
        assert_eq!(empty.compare(&a1), CausalOrder::Before);
        assert_eq!(a1.compare(&b1), CausalOrder::Concurrent);
    }

    #[test]
    fn test_first_missing() {
        let deps = VectorClock::new()
            .increment(&replica("a"))
            .increment(&replica("a"))
            .increment(&replica("b"));

        let local = VectorClock::new().increment(&replica("a"));
        // Local has a:1, deps need a:2 -> next missing is a:2
        assert_eq!(local.first_missing(&deps), Some((replica("a"), 2)));

        let caught_up = local.increment(&replica("a")).increment(&replica("b"));
        assert_eq!(caught_up.first_missing(&deps), None);
    }

    #[test]
    fn test_display() {
        let clock = VectorClock::new()
            .increment(&replica("a"))
            .increment(&replica("b"));
        assert_eq!(format!("{}", clock), "{a:1, b:1}");
    }
}
