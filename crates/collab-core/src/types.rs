//! Core identifier and intent types for the collaboration engine

use rand::RngCore;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Unique identifier for a shared document
///
/// A document is the unit of collaboration: it owns a set of named
/// CRDT fields and is synchronized as a whole between replicas.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocId(pub [u8; 32]);

impl DocId {
    /// Create a new random DocId
    pub fn new() -> Self {
        let mut bytes = [0u8; 32];
        rand::rng().fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Create a DocId from raw bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the raw bytes of the DocId
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Convert to base58 string for display/storage keys
    pub fn to_base58(&self) -> String {
        bs58::encode(&self.0).into_string()
    }

    /// Parse from base58 string
    pub fn from_base58(s: &str) -> Result<Self, bs58::decode::Error> {
        let bytes = bs58::decode(s).into_vec()?;
        if bytes.len() != 32 {
            return Err(bs58::decode::Error::BufferTooSmall);
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

impl Default for DocId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for DocId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "doc_{}", bs58::encode(&self.0[..8]).into_string())
    }
}

/// Identifier of a replica (one editing process/device)
///
/// Replica ids participate in last-writer-wins tie-breaks, so they must
/// compare deterministically: the lexicographic `Ord` on the inner string
/// is part of the convergence contract.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    /// Create a ReplicaId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh random ReplicaId (ULID, lexicographically sortable)
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    /// The replica id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a user participating in a session
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Create a UserId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The user id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Name of a CRDT field within a document (e.g. "body", "metadata")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FieldId(String);

impl FieldId {
    /// Create a FieldId from an existing string
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The field id as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for FieldId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier of an operation: `(replica, counter)`
///
/// Counters are assigned by each replica's own monotonically increasing
/// operation counter, so the pair is globally unique. The `Ord`
/// implementation compares `(counter, replica)` and is the deterministic
/// tie-break for text elements sharing a fractional position. Map
/// registers order writes by their own Lamport stamps, not by op id,
/// since per-replica counters are not comparable across causality.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OpId {
    /// The replica that created the operation
    pub replica: ReplicaId,
    /// That replica's operation counter at creation time
    pub counter: u64,
}

impl OpId {
    /// Create an OpId from a replica and counter
    pub fn new(replica: ReplicaId, counter: u64) -> Self {
        Self { replica, counter }
    }
}

impl PartialOrd for OpId {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OpId {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        (self.counter, &self.replica).cmp(&(other.counter, &other.replica))
    }
}

impl std::fmt::Display for OpId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.replica, self.counter)
    }
}

/// A value held by a map field
///
/// Modeled as a tagged union over the kinds the engine understands, with
/// an opaque-bytes variant for application-specific payloads so unknown
/// data survives round-trips without breaking exhaustive matching.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// UTF-8 text value
    Text(String),
    /// Numeric value
    Number(f64),
    /// Boolean value
    Bool(bool),
    /// Application-defined payload, passed through untouched
    Opaque(Vec<u8>),
    /// Deletion marker; participates in LWW ordering like any write
    Tombstone,
}

impl Value {
    /// Whether this value is a deletion marker
    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone)
    }
}

/// Reference to an insertion point in a text field
///
/// Local inserts name either a sentinel (start/end of the sequence) or a
/// currently-visible element by the id of the operation that created it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionRef {
    /// Before the first visible element
    Start,
    /// After the last visible element
    End,
    /// Immediately after the visible element created by this operation
    After(OpId),
}

/// A local editing intent, as produced by the application layer
///
/// Intents are validated against current document state and lowered to
/// [`Operation`](crate::crdt::Operation)s by the document manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Intent {
    /// Insert text into a text field at the referenced position
    Insert {
        /// Target text field
        field: FieldId,
        /// Where to insert
        position: PositionRef,
        /// Content to insert (one element per intent)
        content: String,
    },
    /// Tombstone the text element created by `target`
    Delete {
        /// Target text field
        field: FieldId,
        /// Id of the element's creating operation
        target: OpId,
    },
    /// Last-writer-wins write to a map field key
    Set {
        /// Target map field
        field: FieldId,
        /// Key to write
        key: String,
        /// New value
        value: Value,
    },
    /// Remove a map key; lowered to `Set` with a tombstone value so
    /// deletion participates in the same LWW order as writes
    Unset {
        /// Target map field
        field: FieldId,
        /// Key to remove
        key: String,
    },
}

impl Intent {
    /// The field this intent targets
    pub fn field(&self) -> &FieldId {
        match self {
            Intent::Insert { field, .. } => field,
            Intent::Delete { field, .. } => field,
            Intent::Set { field, .. } => field,
            Intent::Unset { field, .. } => field,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_id_new() {
        let doc1 = DocId::new();
        let doc2 = DocId::new();
        assert_ne!(doc1, doc2);
    }

    #[test]
    fn test_doc_id_display() {
        let doc = DocId::new();
        let display = format!("{}", doc);
        assert!(display.starts_with("doc_"));
    }

    #[test]
    fn test_doc_id_base58_roundtrip() {
        let doc = DocId::new();
        let encoded = doc.to_base58();
        let decoded = DocId::from_base58(&encoded).expect("Failed to decode");
        assert_eq!(doc, decoded);
    }

    #[test]
    fn test_replica_id_ordering_is_lexicographic() {
        let a = ReplicaId::new("alpha");
        let b = ReplicaId::new("beta");
        assert!(a < b);
    }

    #[test]
    fn test_op_id_orders_by_counter_then_replica() {
        let a1 = OpId::new(ReplicaId::new("a"), 1);
        let b1 = OpId::new(ReplicaId::new("b"), 1);
        let a2 = OpId::new(ReplicaId::new("a"), 2);

        // Higher counter wins regardless of replica
        assert!(a2 > b1);
        // Equal counters: lexicographically larger replica wins
        assert!(b1 > a1);
    }

    #[test]
    fn test_op_id_display() {
        let id = OpId::new(ReplicaId::new("r1"), 7);
        assert_eq!(format!("{}", id), "r1@7");
    }

    #[test]
    fn test_value_tombstone() {
        assert!(Value::Tombstone.is_tombstone());
        assert!(!Value::Text("x".into()).is_tombstone());
    }

    #[test]
    fn test_intent_field_accessor() {
        let intent = Intent::Set {
            field: FieldId::new("meta"),
            key: "title".into(),
            value: Value::Text("Draft".into()),
        };
        assert_eq!(intent.field().as_str(), "meta");
    }
}
