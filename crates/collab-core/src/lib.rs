//! Real-Time Collaboration Core Library
//!
//! Local-first collaborative editing built on CRDTs: text and map fields
//! merge without coordination, presence is ephemeral, and offline edits
//! replay on reconnect.
//!
//! ## Overview
//!
//! Every replica applies edits optimistically to its own CRDT state,
//! stamps them with a vector clock, logs them durably, and broadcasts
//! them. Remote operations buffer until causally deliverable, then merge
//! commutatively, so all replicas converge on the same document in any
//! delivery order.
//!
//! ## Core Principles
//!
//! - **Local-first**: editing works fully offline; sync when connected
//! - **Convergent**: merge is commutative, associative, and idempotent
//! - **No silent loss**: conflicts are resolved automatically and logged,
//!   never dropped
//!
//! ## Quick Start
//!
//! ```ignore
//! use collab_core::{
//!     CollaborationService, DocId, FieldId, Intent, LoopbackTransport,
//!     PositionRef, ReplicaId, SessionConfig, Storage, UserId,
//! };
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = Arc::new(LoopbackTransport::new());
//!     let storage = Arc::new(Storage::new("~/.collab/data.redb")?);
//!     let service = CollaborationService::new(
//!         ReplicaId::generate(),
//!         transport,
//!         storage,
//!         SessionConfig::default(),
//!     );
//!
//!     let doc_id = DocId::new();
//!     service.join(&doc_id, &UserId::new("alice")).await?;
//!     service
//!         .submit_intent(&doc_id, Intent::Insert {
//!             field: FieldId::new("body"),
//!             position: PositionRef::End,
//!             content: "hello".into(),
//!         })
//!         .await?;
//!
//!     println!("{}", service.materialize(&doc_id, FieldId::new("body")).await?);
//!     Ok(())
//! }
//! ```

pub mod awareness;
pub mod clock;
pub mod conflict;
pub mod crdt;
pub mod document;
pub mod error;
pub mod session;
pub mod storage;
pub mod sync;
pub mod types;

// Re-exports
pub use awareness::{AwarenessConfig, AwarenessManager, AwarenessState, Cursor, Selection};
pub use clock::{CausalOrder, VectorClock};
pub use conflict::{ConflictEntry, ConflictLog, ConflictSite};
pub use crdt::{CrdtMap, CrdtText, MergeOutcome, OpKind, Operation, Position};
pub use document::{DocState, DocumentManager, DocumentSnapshot, Field, RemoteApply};
pub use error::{CollabError, CollabResult};
pub use session::{CollaborationService, LoopbackTransport, SessionConfig, Transport};
pub use storage::{AppendAck, Persistence, Storage};
pub use sync::{
    ChangeOrigin, CollabEvent, OfflineSyncManager, SyncConfig, SyncQueueItem, SyncState,
};
pub use types::{DocId, FieldId, Intent, OpId, PositionRef, ReplicaId, UserId, Value};
