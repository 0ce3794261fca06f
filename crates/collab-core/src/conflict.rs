//! Append-only log of detected concurrent writes
//!
//! Conflicts are not errors: CRDT merge resolves them automatically and
//! deterministically. The log exists so the application can observe that
//! two users raced on the same key or text region.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CollabError;
use crate::types::{DocId, FieldId, OpId};

/// Where in a field the concurrent writes collided
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictSite {
    /// Two writes to the same map key
    MapKey(String),
    /// Two inserts resolving to the same text position
    TextRegion,
}

/// One detected concurrent write
///
/// Records the pair of operations whose vector clocks were incomparable.
/// Entries are immutable once appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictEntry {
    /// Document where the conflict occurred
    pub doc_id: DocId,
    /// Field where the conflict occurred
    pub field_id: FieldId,
    /// Key or region that both operations touched
    pub site: ConflictSite,
    /// The operation that was being applied
    pub incoming: OpId,
    /// The previously-applied operation it raced with
    pub existing: OpId,
    /// Wall-clock detection time (unix millis)
    pub detected_at: i64,
}

impl ConflictEntry {
    /// Record a conflict detected now
    pub fn new(
        doc_id: DocId,
        field_id: FieldId,
        site: ConflictSite,
        incoming: OpId,
        existing: OpId,
    ) -> Self {
        Self {
            doc_id,
            field_id,
            site,
            incoming,
            existing,
            detected_at: Utc::now().timestamp_millis(),
        }
    }
}

/// Append-only conflict log for one document
#[derive(Debug, Clone, Default)]
pub struct ConflictLog {
    entries: Vec<ConflictEntry>,
}

impl ConflictLog {
    /// Create an empty log
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an entry; entries are never mutated or removed
    pub fn append(&mut self, entry: ConflictEntry) {
        self.entries.push(entry);
    }

    /// Iterate entries in detection order
    pub fn iter(&self) -> impl Iterator<Item = &ConflictEntry> {
        self.entries.iter()
    }

    /// Number of recorded conflicts
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether any conflicts have been recorded
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Export the log as JSON for diagnostics and support tooling
    pub fn to_json(&self) -> Result<String, CollabError> {
        serde_json::to_string_pretty(&self.entries)
            .map_err(|e| CollabError::Serialization(e.to_string()))
    }
}
