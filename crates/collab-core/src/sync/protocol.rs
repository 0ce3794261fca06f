//! Wire protocol for operation and awareness broadcast
//!
//! Messages are serialized with postcard and published per-document.
//! The transport guarantees nothing about delivery order; correctness
//! never depends on it — operations carry their causal dependencies and
//! the document manager buffers what is not yet deliverable, while
//! awareness messages are wall-clock LWW and tolerate reordering.

use serde::{Deserialize, Serialize};

use crate::awareness::AwarenessState;
use crate::crdt::Operation;
use crate::error::CollabError;
use crate::types::{DocId, UserId};

/// Current wire protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Messages exchanged between replicas for one document
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TransportMessage {
    /// A document operation to merge
    Op {
        /// The document the operation belongs to
        doc_id: DocId,
        /// The operation itself (carries id, kind, dependencies)
        operation: Operation,
    },
    /// An ephemeral presence update
    Awareness {
        /// The document the user is present in
        doc_id: DocId,
        /// The user whose presence changed
        user_id: UserId,
        /// Presence state to apply (LWW by `timestamp`)
        state: AwarenessState,
        /// Wall-clock stamp of the update (unix millis)
        timestamp: i64,
    },
}

impl TransportMessage {
    /// The document this message relates to
    pub fn doc_id(&self) -> &DocId {
        match self {
            TransportMessage::Op { doc_id, .. } => doc_id,
            TransportMessage::Awareness { doc_id, .. } => doc_id,
        }
    }

    /// Check if this is an operation message
    pub fn is_op(&self) -> bool {
        matches!(self, TransportMessage::Op { .. })
    }

    /// Check if this is an awareness message
    pub fn is_awareness(&self) -> bool {
        matches!(self, TransportMessage::Awareness { .. })
    }
}

/// Versioned wrapper for wire messages
///
/// Allows protocol evolution while maintaining backward compatibility:
/// new versions are added as variants without breaking existing peers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum WireMessage {
    /// Protocol version 1
    V1(TransportMessage),
}

impl WireMessage {
    /// Wrap a transport message at the current version
    pub fn new(msg: TransportMessage) -> Self {
        WireMessage::V1(msg)
    }

    /// Encode to bytes using postcard
    pub fn encode(&self) -> Result<Vec<u8>, CollabError> {
        postcard::to_allocvec(self).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Decode from bytes using postcard
    pub fn decode(data: &[u8]) -> Result<Self, CollabError> {
        postcard::from_bytes(data).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Unwrap the inner transport message
    pub fn into_inner(self) -> TransportMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get a reference to the inner transport message
    pub fn as_inner(&self) -> &TransportMessage {
        match self {
            WireMessage::V1(msg) => msg,
        }
    }

    /// Get the protocol version
    pub fn version(&self) -> u8 {
        match self {
            WireMessage::V1(_) => 1,
        }
    }
}
