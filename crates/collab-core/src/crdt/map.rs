//! Per-key last-writer-wins register set for metadata fields
//!
//! Each key holds a value stamped with a per-key Lamport counter plus
//! the writing replica id. A local write advances the counter past the
//! current winner, so a causally-later overwrite always carries the
//! larger stamp; genuinely concurrent writes tie-break on the
//! lexicographically larger `(stamp, replica)` pair, deterministically
//! on every replica. Deletion writes a tombstone value through the same
//! LWW order, preventing resurrection races.

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::{MergeOutcome, OpKind};
use crate::types::{OpId, Value};

/// A key's current register state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    /// Current value (possibly a tombstone)
    pub value: Value,
    /// Id of the operation that wrote the value
    pub writer: OpId,
    /// Per-key Lamport stamp of the winning write
    pub stamp: u64,
}

impl MapEntry {
    /// The total-order key deciding which write wins
    fn order_key(&self) -> (u64, &str) {
        (self.stamp, self.writer.replica.as_str())
    }
}

/// Map CRDT: one last-writer-wins register per key
///
/// # Example
///
/// ```
/// use collab_core::crdt::CrdtMap;
/// use collab_core::{OpId, ReplicaId, Value};
///
/// let mut map = CrdtMap::new();
/// map.local_set("title", Value::Text("Draft".into()), OpId::new(ReplicaId::new("a"), 1));
/// assert_eq!(map.get("title"), Some(&Value::Text("Draft".into())));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtMap {
    entries: HashMap<String, MapEntry>,
}

impl CrdtMap {
    /// Create an empty map field
    pub fn new() -> Self {
        Self::default()
    }

    /// Write a key locally and return the Lamport stamp the operation
    /// must carry
    ///
    /// The stamp is one past the current winner's, so this write
    /// supersedes everything the replica has already merged for the key.
    pub fn local_set(&mut self, key: impl Into<String>, value: Value, writer: OpId) -> u64 {
        let key = key.into();
        let stamp = self.entries.get(&key).map(|e| e.stamp + 1).unwrap_or(1);
        self.entries.insert(key, MapEntry { value, writer, stamp });
        stamp
    }

    /// Remove a key locally
    ///
    /// Implemented as a tombstone write so deletion participates in the
    /// same LWW ordering as any other write.
    pub fn local_delete(&mut self, key: impl Into<String>, writer: OpId) -> u64 {
        self.local_set(key, Value::Tombstone, writer)
    }

    /// Merge a remote write
    ///
    /// The higher `(stamp, replica)` pair wins; a causally-later
    /// overwrite carries a stamp past every write it supersedes, so it
    /// wins regardless of the writers' per-replica op counters. The same
    /// writing operation delivered twice is a no-op. A losing write from
    /// an operation that had not seen the current winner is reported as
    /// a conflict for observability — resolution is already automatic.
    pub fn merge(&mut self, id: &OpId, kind: &OpKind, saw_current: impl Fn(&OpId) -> bool) -> MergeOutcome {
        let (key, value, stamp) = match kind {
            OpKind::Set { key, value, stamp } => (key, value, *stamp),
            _ => return MergeOutcome::Malformed("non-set operation applied to map field".into()),
        };

        match self.entries.get(key) {
            None => {
                self.entries.insert(
                    key.clone(),
                    MapEntry {
                        value: value.clone(),
                        writer: id.clone(),
                        stamp,
                    },
                );
                MergeOutcome::Applied
            }
            Some(current) => {
                if current.writer == *id {
                    // Duplicate delivery of the same operation
                    return MergeOutcome::NoOp;
                }
                let concurrent = !saw_current(&current.writer);
                let wins = (stamp, id.replica.as_str()) > current.order_key();
                let other = current.writer.clone();
                if wins {
                    self.entries.insert(
                        key.clone(),
                        MapEntry {
                            value: value.clone(),
                            writer: id.clone(),
                            stamp,
                        },
                    );
                }
                match (wins, concurrent) {
                    (true, false) => MergeOutcome::Applied,
                    (false, false) => MergeOutcome::NoOp,
                    (changed, true) => MergeOutcome::Conflict { other, changed },
                }
            }
        }
    }

    /// The visible value for a key (`None` for absent or tombstoned)
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries
            .get(key)
            .map(|e| &e.value)
            .filter(|v| !v.is_tombstone())
    }

    /// The full register entry for a key, tombstones included
    pub fn entry(&self, key: &str) -> Option<&MapEntry> {
        self.entries.get(key)
    }

    /// Deterministic key-value view with tombstones filtered
    pub fn view(&self) -> BTreeMap<&str, &Value> {
        self.entries
            .iter()
            .filter(|(_, e)| !e.value.is_tombstone())
            .map(|(k, e)| (k.as_str(), &e.value))
            .collect()
    }

    /// Number of visible (non-tombstoned) keys
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.value.is_tombstone()).count()
    }

    /// Whether the map has no visible keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
