//! Document manager: owns a document's CRDT fields and applies operations
//!
//! One manager instance exists per open document and is driven by a
//! single execution context (the session actor), so no locking happens
//! inside CRDT structures. Local intents apply optimistically and come
//! back as stamped operations for broadcast and logging; remote
//! operations are checked for causal readiness, buffered if a dependency
//! is missing, and merged commutatively otherwise.
//!
//! ## State machine
//!
//! ```text
//! Loading -> Ready -> (Syncing <-> Ready) -> Closed
//! ```

use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::clock::VectorClock;
use crate::conflict::{ConflictEntry, ConflictLog, ConflictSite};
use crate::crdt::{CrdtMap, CrdtText, MergeOutcome, OpKind, Operation};
use crate::error::{CollabError, CollabResult};
use crate::sync::{ChangeOrigin, CollabEvent};
use crate::types::{DocId, FieldId, Intent, OpId, PositionRef, ReplicaId, Value};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Lifecycle state of an open document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocState {
    /// Rebuilding state from snapshot and durable log
    Loading,
    /// Accepting local and remote operations
    Ready,
    /// Ready, with an active reconciliation pass in flight
    Syncing,
    /// No further operations accepted; re-open to resume
    Closed,
}

/// One named CRDT field of a document
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    /// Ordered text sequence
    Text(CrdtText),
    /// Key-value LWW register set
    Map(CrdtMap),
}

/// Serialized full state of a document: CRDT fields plus vector clock
///
/// Produced periodically and before close; persisted through the
/// [`Persistence`](crate::storage::Persistence) boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// The document this snapshot captures
    pub doc_id: DocId,
    /// Clock summarizing all operations merged so far
    pub clock: VectorClock,
    /// Full field state, tombstones included
    pub fields: BTreeMap<FieldId, Field>,
    /// Document-level tombstone; archived documents reject local edits
    pub archived: bool,
}

impl DocumentSnapshot {
    /// Encode to bytes using postcard
    pub fn encode(&self) -> CollabResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| CollabError::Serialization(e.to_string()))
    }

    /// Decode from bytes using postcard
    pub fn decode(data: &[u8]) -> CollabResult<Self> {
        postcard::from_bytes(data).map_err(|e| CollabError::Serialization(e.to_string()))
    }
}

/// What happened to a remote operation handed to [`DocumentManager::apply_remote`]
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteApply {
    /// Causally delivered and merged
    Applied {
        /// Whether visible state changed (false for an LWW loss)
        changed: bool,
        /// The operation it raced with, if a conflict was recorded
        conflict: Option<OpId>,
    },
    /// A dependency is missing; held until it arrives
    Buffered,
    /// Already applied (duplicate delivery); no-op
    Duplicate,
    /// Malformed; rejected and logged, never applied
    Rejected(String),
}

/// Owns a document's CRDT structures, applies and merges operations,
/// and emits change events
///
/// # Example
///
/// ```
/// use collab_core::document::DocumentManager;
/// use collab_core::{DocId, FieldId, Intent, PositionRef, ReplicaId};
///
/// let mut doc = DocumentManager::new(DocId::new(), ReplicaId::new("a"));
/// let op = doc
///     .apply_local(Intent::Insert {
///         field: FieldId::new("body"),
///         position: PositionRef::End,
///         content: "hello".into(),
///     })
///     .unwrap();
/// assert_eq!(op.id.counter, 1);
/// assert_eq!(doc.materialize(&FieldId::new("body")).unwrap(), "hello");
/// ```
pub struct DocumentManager {
    doc_id: DocId,
    replica: ReplicaId,
    state: DocState,
    /// Named CRDT fields
    fields: BTreeMap<FieldId, Field>,
    /// Clock over all operations merged so far
    clock: VectorClock,
    /// Local operation counter; advances by exactly 1 per local op
    counter: u64,
    /// Causally-unready remote operations, keyed by the first missing
    /// dependency `(replica, counter)`
    pending: HashMap<(ReplicaId, u64), Vec<Operation>>,
    /// Append-only record of detected concurrent writes
    conflicts: ConflictLog,
    archived: bool,
    events: broadcast::Sender<CollabEvent>,
}

impl DocumentManager {
    /// Create a manager for a fresh, empty document in `Ready` state
    pub fn new(doc_id: DocId, replica: ReplicaId) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self::with_events(doc_id, replica, events)
    }

    /// Create a manager that emits on an existing event channel
    pub fn with_events(
        doc_id: DocId,
        replica: ReplicaId,
        events: broadcast::Sender<CollabEvent>,
    ) -> Self {
        Self {
            doc_id,
            replica,
            state: DocState::Ready,
            fields: BTreeMap::new(),
            clock: VectorClock::new(),
            counter: 0,
            pending: HashMap::new(),
            conflicts: ConflictLog::new(),
            archived: false,
            events,
        }
    }

    /// Rebuild a document from its latest snapshot plus un-replayed
    /// operations from the durable log
    ///
    /// Replay is dependency-driven, not wall-clock ordered: operations
    /// out of causal order are buffered and flushed exactly as if they
    /// had arrived from a peer. Change events are suppressed while
    /// `Loading`.
    ///
    /// # Errors
    ///
    /// Returns `CollabError::Serialization` if the snapshot belongs to a
    /// different document.
    pub fn open(
        doc_id: DocId,
        replica: ReplicaId,
        snapshot: Option<DocumentSnapshot>,
        log: Vec<Operation>,
        events: broadcast::Sender<CollabEvent>,
    ) -> CollabResult<Self> {
        let mut mgr = Self::with_events(doc_id.clone(), replica.clone(), events);
        mgr.state = DocState::Loading;

        if let Some(snapshot) = snapshot {
            if snapshot.doc_id != doc_id {
                return Err(CollabError::Serialization(format!(
                    "snapshot for {} loaded for {}",
                    snapshot.doc_id, doc_id
                )));
            }
            mgr.fields = snapshot.fields;
            mgr.clock = snapshot.clock;
            mgr.archived = snapshot.archived;
        }

        let replayed = log.len();
        for op in log {
            let _ = mgr.apply_remote(op)?;
        }
        if !mgr.pending.is_empty() {
            warn!(
                %doc_id,
                buffered = mgr.pending.values().map(Vec::len).sum::<usize>(),
                "Durable log replay left causal gaps"
            );
        }
        mgr.counter = mgr.clock.get(&replica);
        mgr.state = DocState::Ready;
        debug!(%doc_id, replayed, clock = %mgr.clock, "Document opened");
        Ok(mgr)
    }

    /// Validate a local intent, apply it optimistically, and return the
    /// stamped operation for broadcast and logging
    ///
    /// # Errors
    ///
    /// Returns `CollabError::InvalidState` if the document is closed or
    /// archived, `CollabError::FieldNotFound`/`MalformedOperation` if
    /// the intent does not fit current document state.
    pub fn apply_local(&mut self, intent: Intent) -> CollabResult<Operation> {
        if self.state == DocState::Closed {
            return Err(CollabError::InvalidState("document is closed".into()));
        }
        if self.archived {
            return Err(CollabError::InvalidState("document is archived".into()));
        }

        let next = self.counter + 1;
        let id = OpId::new(self.replica.clone(), next);
        let field_id = intent.field().clone();
        let deps = self.clock.clone();
        let kind = self.lower_intent(intent, &id)?;

        self.counter = next;
        self.clock = self.clock.increment(&self.replica);

        let op = Operation {
            id: id.clone(),
            doc_id: self.doc_id.clone(),
            field_id: field_id.clone(),
            kind,
            deps,
        };
        self.emit(CollabEvent::DocumentChanged {
            doc_id: self.doc_id.clone(),
            field_id,
            op_id: id,
            origin: ChangeOrigin::Local,
        });
        Ok(op)
    }

    /// Merge a remote operation, buffering it if not yet causally deliverable
    ///
    /// Duplicates (identified by `(replica, counter)`) are no-ops. After
    /// a successful apply the operation's dependencies merge into the
    /// local clock and any buffered operations that became deliverable
    /// are flushed in dependency order. A malformed operation is
    /// rejected and logged without blocking independent operations.
    ///
    /// # Errors
    ///
    /// Returns `CollabError::InvalidState` if the document is closed.
    pub fn apply_remote(&mut self, op: Operation) -> CollabResult<RemoteApply> {
        if self.state == DocState::Closed {
            return Err(CollabError::InvalidState("document is closed".into()));
        }
        if op.doc_id != self.doc_id {
            warn!(%op.doc_id, local = %self.doc_id, "Dropping operation for wrong document");
            return Ok(RemoteApply::Rejected("operation for a different document".into()));
        }

        let outcome = self.deliver(op);
        match outcome {
            RemoteApply::Applied { .. } | RemoteApply::Rejected(_) => {
                // Clock advanced either way; dependents may be ready now
                self.flush_pending();
            }
            RemoteApply::Buffered | RemoteApply::Duplicate => {}
        }
        Ok(outcome)
    }

    /// Serialize full CRDT state plus vector clock for persistence
    pub fn snapshot(&self) -> DocumentSnapshot {
        DocumentSnapshot {
            doc_id: self.doc_id.clone(),
            clock: self.clock.clone(),
            fields: self.fields.clone(),
            archived: self.archived,
        }
    }

    /// Take a final snapshot and transition to `Closed`
    pub fn close(&mut self) -> DocumentSnapshot {
        let snapshot = self.snapshot();
        self.state = DocState::Closed;
        snapshot
    }

    /// Tombstone the document; local edits are rejected from now on
    ///
    /// Remote operations still merge so history stays complete.
    pub fn archive(&mut self) {
        self.archived = true;
    }

    /// Mark an active reconciliation pass (Ready -> Syncing)
    pub fn begin_sync(&mut self) {
        if self.state == DocState::Ready {
            self.state = DocState::Syncing;
        }
    }

    /// End a reconciliation pass (Syncing -> Ready)
    pub fn end_sync(&mut self) {
        if self.state == DocState::Syncing {
            self.state = DocState::Ready;
        }
    }

    /// Subscribe to change events for this document
    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.events.subscribe()
    }

    /// The visible text of a text field
    ///
    /// # Errors
    ///
    /// Returns `CollabError::FieldNotFound` for an unknown field and
    /// `CollabError::MalformedOperation` for a map field.
    pub fn materialize(&self, field: &FieldId) -> CollabResult<String> {
        match self.fields.get(field) {
            Some(Field::Text(text)) => Ok(text.materialize()),
            Some(Field::Map(_)) => Err(CollabError::MalformedOperation(format!(
                "field {field} is not a text field"
            ))),
            None => Err(CollabError::FieldNotFound(field.to_string())),
        }
    }

    /// The visible key-value view of a map field
    ///
    /// # Errors
    ///
    /// Returns `CollabError::FieldNotFound` for an unknown field and
    /// `CollabError::MalformedOperation` for a text field.
    pub fn map_view(&self, field: &FieldId) -> CollabResult<BTreeMap<&str, &Value>> {
        match self.fields.get(field) {
            Some(Field::Map(map)) => Ok(map.view()),
            Some(Field::Text(_)) => Err(CollabError::MalformedOperation(format!(
                "field {field} is not a map field"
            ))),
            None => Err(CollabError::FieldNotFound(field.to_string())),
        }
    }

    /// The document id
    pub fn doc_id(&self) -> &DocId {
        &self.doc_id
    }

    /// The local replica id
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Current lifecycle state
    pub fn state(&self) -> DocState {
        self.state
    }

    /// Whether the document is archived
    pub fn is_archived(&self) -> bool {
        self.archived
    }

    /// The local vector clock
    pub fn clock(&self) -> &VectorClock {
        &self.clock
    }

    /// Direct access to a text field
    pub fn text(&self, field: &FieldId) -> Option<&CrdtText> {
        match self.fields.get(field) {
            Some(Field::Text(text)) => Some(text),
            _ => None,
        }
    }

    /// Direct access to a map field
    pub fn map(&self, field: &FieldId) -> Option<&CrdtMap> {
        match self.fields.get(field) {
            Some(Field::Map(map)) => Some(map),
            _ => None,
        }
    }

    /// The conflict log for this document
    pub fn conflicts(&self) -> &ConflictLog {
        &self.conflicts
    }

    /// Number of remote operations buffered awaiting dependencies
    pub fn pending_len(&self) -> usize {
        self.pending.values().map(Vec::len).sum()
    }

    /// Lower an intent to an op kind, applying it to the target field
    fn lower_intent(&mut self, intent: Intent, id: &OpId) -> CollabResult<OpKind> {
        match intent {
            Intent::Insert {
                field,
                position,
                content,
            } => {
                if !self.fields.contains_key(&field) {
                    if matches!(position, PositionRef::After(_)) {
                        return Err(CollabError::MalformedOperation(format!(
                            "insert references an element in unknown field {field}"
                        )));
                    }
                    self.fields.insert(field.clone(), Field::Text(CrdtText::new()));
                }
                match self.fields.get_mut(&field) {
                    Some(Field::Text(text)) => {
                        let position = text.local_insert(&position, &content, id.clone())?;
                        Ok(OpKind::Insert { position, content })
                    }
                    _ => Err(CollabError::MalformedOperation(format!(
                        "field {field} is not a text field"
                    ))),
                }
            }
            Intent::Delete { field, target } => match self.fields.get_mut(&field) {
                Some(Field::Text(text)) => {
                    text.local_delete(&target)?;
                    Ok(OpKind::Delete { target })
                }
                Some(Field::Map(_)) => Err(CollabError::MalformedOperation(format!(
                    "field {field} is not a text field"
                ))),
                None => Err(CollabError::FieldNotFound(field.to_string())),
            },
            Intent::Set { field, key, value } => self.lower_set(field, key, value, id),
            Intent::Unset { field, key } => self.lower_set(field, key, Value::Tombstone, id),
        }
    }

    fn lower_set(
        &mut self,
        field: FieldId,
        key: String,
        value: Value,
        id: &OpId,
    ) -> CollabResult<OpKind> {
        let entry = self
            .fields
            .entry(field.clone())
            .or_insert_with(|| Field::Map(CrdtMap::new()));
        match entry {
            Field::Map(map) => {
                let stamp = map.local_set(key.clone(), value.clone(), id.clone());
                Ok(OpKind::Set { key, value, stamp })
            }
            Field::Text(_) => Err(CollabError::MalformedOperation(format!(
                "field {field} is not a map field"
            ))),
        }
    }

    /// Apply one remote operation if causally ready, else buffer it
    fn deliver(&mut self, op: Operation) -> RemoteApply {
        let seen = self.clock.get(&op.id.replica);
        if op.id.counter <= seen {
            debug!(op = %op.id, "Duplicate delivery ignored");
            return RemoteApply::Duplicate;
        }

        let fifo_ready = op.id.counter == seen + 1;
        if !fifo_ready || !self.clock.is_descendant_of(&op.deps) {
            let key = self
                .clock
                .first_missing(&op.deps)
                .unwrap_or_else(|| (op.id.replica.clone(), seen + 1));
            debug!(op = %op.id, waiting_for = ?key, "Buffering causally-unready operation");
            self.pending.entry(key).or_default().push(op);
            return RemoteApply::Buffered;
        }

        let outcome = self.merge_into_field(&op);
        // Advance the clock even past a rejected operation so later,
        // independent operations from the same replica stay deliverable.
        self.clock = op.advance_clock(&self.clock);
        outcome
    }

    fn merge_into_field(&mut self, op: &Operation) -> RemoteApply {
        if !self.fields.contains_key(&op.field_id) {
            match &op.kind {
                OpKind::Insert { .. } => {
                    self.fields
                        .insert(op.field_id.clone(), Field::Text(CrdtText::new()));
                }
                OpKind::Set { .. } => {
                    self.fields
                        .insert(op.field_id.clone(), Field::Map(CrdtMap::new()));
                }
                OpKind::Delete { .. } => {
                    warn!(op = %op.id, field = %op.field_id, "Rejecting delete for unknown field");
                    return RemoteApply::Rejected(format!("unknown field {}", op.field_id));
                }
            }
        }

        let field = self.fields.get_mut(&op.field_id).expect("field ensured above");
        let outcome = match field {
            Field::Text(text) => text.merge(&op.id, &op.kind),
            Field::Map(map) => {
                let deps = &op.deps;
                map.merge(&op.id, &op.kind, |writer| {
                    deps.get(&writer.replica) >= writer.counter
                })
            }
        };

        match outcome {
            MergeOutcome::Applied => {
                self.emit_changed(op);
                RemoteApply::Applied {
                    changed: true,
                    conflict: None,
                }
            }
            MergeOutcome::NoOp => RemoteApply::Applied {
                changed: false,
                conflict: None,
            },
            MergeOutcome::Conflict { other, changed } => {
                let site = match &op.kind {
                    OpKind::Set { key, .. } => ConflictSite::MapKey(key.clone()),
                    _ => ConflictSite::TextRegion,
                };
                let entry = ConflictEntry::new(
                    self.doc_id.clone(),
                    op.field_id.clone(),
                    site,
                    op.id.clone(),
                    other.clone(),
                );
                debug!(op = %op.id, raced_with = %other, "Concurrent write detected");
                self.conflicts.append(entry.clone());
                self.emit(CollabEvent::ConflictDetected {
                    doc_id: self.doc_id.clone(),
                    entry,
                });
                if changed {
                    self.emit_changed(op);
                }
                RemoteApply::Applied {
                    changed,
                    conflict: Some(other),
                }
            }
            MergeOutcome::Malformed(reason) => {
                warn!(op = %op.id, %reason, "Rejecting malformed operation");
                RemoteApply::Rejected(reason)
            }
        }
    }

    /// Flush buffered operations that became deliverable, recursively
    fn flush_pending(&mut self) {
        loop {
            let ready: Vec<(ReplicaId, u64)> = self
                .pending
                .keys()
                .filter(|(replica, counter)| self.clock.get(replica) >= *counter)
                .cloned()
                .collect();
            if ready.is_empty() {
                break;
            }
            for key in ready {
                if let Some(ops) = self.pending.remove(&key) {
                    for op in ops {
                        // May re-buffer under the next missing dependency
                        let _ = self.deliver(op);
                    }
                }
            }
        }
    }

    fn emit_changed(&self, op: &Operation) {
        self.emit(CollabEvent::DocumentChanged {
            doc_id: self.doc_id.clone(),
            field_id: op.field_id.clone(),
            op_id: op.id.clone(),
            origin: ChangeOrigin::Remote,
        });
    }

    fn emit(&self, event: CollabEvent) {
        if self.state != DocState::Loading {
            let _ = self.events.send(event);
        }
    }
}
