//! Event and status types emitted by the collaboration service
//!
//! Change notifications flow through a bounded broadcast channel rather
//! than callbacks, so backpressure (receiver lag) and cancellation
//! (dropping the receiver) are explicit.

use std::fmt;

use crate::conflict::ConflictEntry;
use crate::types::{DocId, FieldId, OpId, UserId};

/// Connectivity state of a document's sync pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// Operations are transmitted as they are created
    Online,
    /// Operations queue locally; nothing is transmitted
    Offline,
    /// Queued operations are being replayed after reconnect
    Reconciling,
}

impl Default for SyncState {
    fn default() -> Self {
        SyncState::Offline
    }
}

impl fmt::Display for SyncState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncState::Online => write!(f, "Online"),
            SyncState::Offline => write!(f, "Offline"),
            SyncState::Reconciling => write!(f, "Reconciling"),
        }
    }
}

/// Whether a change originated here or arrived from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOrigin {
    /// Applied optimistically from a local intent
    Local,
    /// Merged from a remote operation
    Remote,
}

/// Events broadcast to application-layer subscribers
#[derive(Debug, Clone)]
pub enum CollabEvent {
    /// A field of a document changed
    DocumentChanged {
        /// The document that changed
        doc_id: DocId,
        /// The field that changed
        field_id: FieldId,
        /// The operation that caused the change
        op_id: OpId,
        /// Local or remote origin
        origin: ChangeOrigin,
    },
    /// A user's presence state changed
    AwarenessChanged {
        /// The document the user is present in
        doc_id: DocId,
        /// The user whose presence changed
        user_id: UserId,
    },
    /// A user's presence entry expired or was removed
    AwarenessRemoved {
        /// The document the user left
        doc_id: DocId,
        /// The user whose entry was removed
        user_id: UserId,
    },
    /// Concurrent writes were detected (resolution was automatic)
    ConflictDetected {
        /// The document where the conflict occurred
        doc_id: DocId,
        /// The recorded conflict
        entry: ConflictEntry,
    },
    /// The sync pipeline changed connectivity state
    SyncStateChanged {
        /// The document whose pipeline changed
        doc_id: DocId,
        /// The new state
        state: SyncState,
    },
    /// Sync is degraded (transport failures, retrying with backoff);
    /// local editing is unaffected
    SyncDegraded {
        /// The affected document
        doc_id: DocId,
        /// Human-readable reason
        message: String,
    },
    /// The local offline queue hit its capacity; editing continues but
    /// the application must prompt for reconnection
    QuotaExceeded {
        /// The affected document
        doc_id: DocId,
        /// Operations currently queued
        queued: usize,
        /// Configured capacity
        capacity: usize,
    },
    /// Persistence failed beyond the bounded retry budget; the session
    /// must be re-opened
    SessionFailed {
        /// The affected document
        doc_id: DocId,
        /// Human-readable reason
        message: String,
    },
}

impl CollabEvent {
    /// The document this event relates to
    pub fn doc_id(&self) -> &DocId {
        match self {
            CollabEvent::DocumentChanged { doc_id, .. } => doc_id,
            CollabEvent::AwarenessChanged { doc_id, .. } => doc_id,
            CollabEvent::AwarenessRemoved { doc_id, .. } => doc_id,
            CollabEvent::ConflictDetected { doc_id, .. } => doc_id,
            CollabEvent::SyncStateChanged { doc_id, .. } => doc_id,
            CollabEvent::SyncDegraded { doc_id, .. } => doc_id,
            CollabEvent::QuotaExceeded { doc_id, .. } => doc_id,
            CollabEvent::SessionFailed { doc_id, .. } => doc_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaId;

    #[test]
    fn test_sync_state_default_is_offline() {
        let state: SyncState = Default::default();
        assert_eq!(state, SyncState::Offline);
    }

    #[test]
    fn test_sync_state_display() {
        assert_eq!(format!("{}", SyncState::Online), "Online");
        assert_eq!(format!("{}", SyncState::Offline), "Offline");
        assert_eq!(format!("{}", SyncState::Reconciling), "Reconciling");
    }

    #[test]
    fn test_event_doc_id_accessor() {
        let doc_id = DocId::new();
        let event = CollabEvent::DocumentChanged {
            doc_id: doc_id.clone(),
            field_id: FieldId::new("body"),
            op_id: OpId::new(ReplicaId::new("a"), 1),
            origin: ChangeOrigin::Local,
        };
        assert_eq!(event.doc_id(), &doc_id);
    }
}
