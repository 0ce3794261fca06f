//! Conflict-free replicated data types for document fields
//!
//! Two field shapes are supported:
//!
//! - [`CrdtText`]: an ordered sequence of elements with fractional
//!   position identifiers and tombstone deletes
//! - [`CrdtMap`]: a set of per-key last-writer-wins registers
//!
//! Both converge under any causally-valid delivery order because their
//! merge functions are commutative, associative, and idempotent. Causal
//! readiness (buffering operations whose dependencies are missing) is the
//! document manager's job, not the CRDTs'.

mod map;
mod position;
mod text;

pub use map::{CrdtMap, MapEntry};
pub use position::Position;
pub use text::{CrdtText, ElementKey, TextElement};

use serde::{Deserialize, Serialize};

use crate::clock::VectorClock;
use crate::types::{DocId, FieldId, OpId, Value};

/// The effect an operation has on its target field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OpKind {
    /// Insert a text element at an already-allocated position
    Insert {
        /// Fractional position the creating replica allocated
        position: Position,
        /// Element content
        content: String,
    },
    /// Tombstone the text element created by `target`
    Delete {
        /// Id of the element's creating operation
        target: OpId,
    },
    /// Last-writer-wins write to a map key; a tombstone value deletes it
    Set {
        /// Key to write
        key: String,
        /// New value
        value: Value,
        /// Per-key Lamport stamp; one past the winner the writer saw
        stamp: u64,
    },
}

/// An immutable, uniquely-identified edit to one document field
///
/// Created locally on user intent or received from a peer; never mutated
/// afterwards. The `(replica, counter)` id makes duplicate delivery
/// detectable and every apply idempotent. `deps` is the creating
/// replica's vector clock *before* the operation, so an operation is
/// deliverable exactly when the local clock has covered `deps`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Globally unique operation id
    pub id: OpId,
    /// Document this operation belongs to
    pub doc_id: DocId,
    /// Field this operation targets
    pub field_id: FieldId,
    /// What the operation does
    pub kind: OpKind,
    /// Vector clock snapshot at creation (dependencies)
    pub deps: VectorClock,
}

impl Operation {
    /// The clock this operation advances the merging replica to
    ///
    /// Dependencies plus the operation's own `(replica, counter)` entry.
    pub fn advance_clock(&self, local: &VectorClock) -> VectorClock {
        let merged = local.merge(&self.deps);
        // The op itself is now applied; its own counter may exceed deps
        if merged.get(&self.id.replica) < self.id.counter {
            let mut bumped = merged;
            while bumped.get(&self.id.replica) < self.id.counter {
                bumped = bumped.increment(&self.id.replica);
            }
            bumped
        } else {
            merged
        }
    }
}

/// Result of merging a remote operation into a CRDT field
#[derive(Debug, Clone, PartialEq)]
pub enum MergeOutcome {
    /// The operation changed field state
    Applied,
    /// Duplicate delivery or an LWW loss; no observable change
    NoOp,
    /// The operation was concurrent with an existing write to the same
    /// key/region; callers record this in the conflict log. Resolution
    /// was automatic; `changed` says whether the incoming write won.
    Conflict {
        /// The previously-applied operation it raced with
        other: OpId,
        /// Whether the incoming operation changed visible state
        changed: bool,
    },
    /// The operation references state that cannot exist even after
    /// causal delivery; rejected and logged, never applied
    Malformed(String),
}
