//! Live collaboration sessions: one actor per open document
//!
//! [`CollaborationService`] is the application-facing entry point. Each
//! open document is owned by exactly one spawned task that serializes
//! every apply/merge/snapshot on that document, so the CRDT structures
//! need no internal locking; documents never share mutable state and
//! run fully in parallel.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  CollaborationService                                        │
//! │  ├── sessions: HashMap<DocId, DocSession>                    │
//! │  │   └── command channel + cancellation per document actor   │
//! │  └── event_tx: broadcast::Sender<CollabEvent>                │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The actor never blocks on I/O it does not own: transport receive,
//! snapshot timers, awareness expiry, and replay retries all arrive as
//! branches of one `select!` loop.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::awareness::{AwarenessConfig, AwarenessManager, AwarenessState};
use crate::crdt::Operation;
use crate::document::DocumentManager;
use crate::error::{CollabError, CollabResult};
use crate::storage::Persistence;
use crate::sync::{
    CollabEvent, OfflineSyncManager, SyncConfig, SyncState, TransportMessage, WireMessage,
};
use crate::types::{DocId, FieldId, Intent, OpId, ReplicaId, UserId, Value};

/// Default capacity for the event broadcast channel
const EVENT_CHANNEL_CAPACITY: usize = 256;
/// Capacity of each actor's command channel
const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Message transport boundary
///
/// Publish is fire-and-forget per document; delivery order is not
/// guaranteed and correctness never depends on it. Implementations must
/// deliver a published payload to every subscriber of the same document,
/// the publisher included (sessions drop their own echoes by replica id).
pub trait Transport: Send + Sync {
    /// Publish an encoded wire message to a document's channel
    fn publish(&self, doc_id: &DocId, payload: Bytes) -> CollabResult<()>;

    /// Subscribe to a document's channel
    fn subscribe(&self, doc_id: &DocId) -> broadcast::Receiver<Bytes>;
}

/// In-process transport connecting sessions through broadcast channels
///
/// Used by tests and single-process setups. Failure injection makes
/// replay and degradation paths testable without a network.
#[derive(Clone, Default)]
pub struct LoopbackTransport {
    channels: Arc<parking_lot::RwLock<HashMap<DocId, broadcast::Sender<Bytes>>>>,
    failing: Arc<std::sync::atomic::AtomicBool>,
}

impl LoopbackTransport {
    /// Create a transport with no channels yet
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every publish fail until cleared
    pub fn set_failing(&self, failing: bool) {
        self.failing
            .store(failing, std::sync::atomic::Ordering::SeqCst);
    }

    fn channel(&self, doc_id: &DocId) -> broadcast::Sender<Bytes> {
        let mut channels = self.channels.write();
        channels
            .entry(doc_id.clone())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }
}

impl Transport for LoopbackTransport {
    fn publish(&self, doc_id: &DocId, payload: Bytes) -> CollabResult<()> {
        if self.failing.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(CollabError::Transport("transport unavailable".into()));
        }
        // No subscribers is not an error; the message just goes nowhere
        let _ = self.channel(doc_id).send(payload);
        Ok(())
    }

    fn subscribe(&self, doc_id: &DocId) -> broadcast::Receiver<Bytes> {
        self.channel(doc_id).subscribe()
    }
}

/// Tuning knobs for a collaboration session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Offline queue and replay settings
    pub sync: SyncConfig,
    /// Presence TTL settings
    pub awareness: AwarenessConfig,
    /// Interval between periodic snapshots
    pub snapshot_interval: Duration,
    /// Interval between awareness expiry sweeps
    pub awareness_tick: Duration,
    /// Persistence attempts before the session is declared failed
    pub persistence_attempts: u32,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            sync: SyncConfig::default(),
            awareness: AwarenessConfig::default(),
            snapshot_interval: Duration::from_secs(30),
            awareness_tick: Duration::from_secs(5),
            persistence_attempts: 3,
        }
    }
}

enum SessionCommand {
    Submit {
        intent: Intent,
        reply: oneshot::Sender<CollabResult<OpId>>,
    },
    UpdateAwareness {
        state: AwarenessState,
        reply: oneshot::Sender<CollabResult<()>>,
    },
    RemoveAwareness {
        user_id: UserId,
        reply: oneshot::Sender<()>,
    },
    Materialize {
        field: FieldId,
        reply: oneshot::Sender<CollabResult<String>>,
    },
    MapView {
        field: FieldId,
        reply: oneshot::Sender<CollabResult<BTreeMap<String, Value>>>,
    },
    SetConnectivity {
        online: bool,
        reply: oneshot::Sender<()>,
    },
    SyncState {
        reply: oneshot::Sender<SyncState>,
    },
    Snapshot {
        reply: oneshot::Sender<CollabResult<()>>,
    },
    Archive {
        reply: oneshot::Sender<()>,
    },
}

/// Handle to one document's actor
struct DocSession {
    cmd_tx: mpsc::Sender<SessionCommand>,
    users: HashSet<UserId>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Application-facing orchestrator for live collaboration
///
/// Opens one session per document on first [`join`](Self::join), routes
/// intents and presence updates to the owning actor, and broadcasts
/// [`CollabEvent`]s to subscribers.
pub struct CollaborationService {
    replica: ReplicaId,
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    sessions: Arc<RwLock<HashMap<DocId, DocSession>>>,
    event_tx: broadcast::Sender<CollabEvent>,
}

impl CollaborationService {
    /// Create a service for one local replica
    pub fn new(
        replica: ReplicaId,
        transport: Arc<dyn Transport>,
        persistence: Arc<dyn Persistence>,
        config: SessionConfig,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            replica,
            config,
            transport,
            persistence,
            sessions: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
        }
    }

    /// Subscribe to events from every session of this service
    pub fn subscribe(&self) -> broadcast::Receiver<CollabEvent> {
        self.event_tx.subscribe()
    }

    /// The local replica id
    pub fn replica(&self) -> &ReplicaId {
        &self.replica
    }

    /// Join a document session, opening it if this is the first user
    ///
    /// Opening loads the latest snapshot and replays the durable
    /// operation log, restores any persisted offline queue, then spawns
    /// the document actor.
    ///
    /// # Errors
    ///
    /// Returns persistence errors from loading document state.
    pub async fn join(&self, doc_id: &DocId, user_id: &UserId) -> CollabResult<()> {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(doc_id) {
            session.users.insert(user_id.clone());
            return Ok(());
        }

        let snapshot = self.persistence.load_snapshot(doc_id)?;
        let log = self.persistence.load_operations(doc_id)?;
        let queue = self.persistence.load_queue(doc_id)?;

        let doc = DocumentManager::open(
            doc_id.clone(),
            self.replica.clone(),
            snapshot,
            log,
            self.event_tx.clone(),
        )?;
        let sync = OfflineSyncManager::restore(
            doc_id.clone(),
            self.config.sync.clone(),
            queue,
            self.event_tx.clone(),
        );
        let awareness = AwarenessManager::new(self.config.awareness.clone());

        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let actor = SessionActor {
            doc_id: doc_id.clone(),
            replica: self.replica.clone(),
            config: self.config.clone(),
            doc,
            sync,
            awareness,
            transport: self.transport.clone(),
            persistence: self.persistence.clone(),
            event_tx: self.event_tx.clone(),
            cmd_rx,
            cancel: cancel.clone(),
        };
        let task = tokio::spawn(actor.run());

        info!(%doc_id, user_id = %user_id, "Session opened");
        let mut users = HashSet::new();
        users.insert(user_id.clone());
        sessions.insert(
            doc_id.clone(),
            DocSession {
                cmd_tx,
                users,
                cancel,
                task,
            },
        );
        Ok(())
    }

    /// Leave a document session
    ///
    /// Removes the user's awareness entry; the last user leaving closes
    /// the session after a final snapshot.
    ///
    /// # Errors
    ///
    /// Returns `CollabError::DocumentNotFound` if no session is open.
    pub async fn leave(&self, doc_id: &DocId, user_id: &UserId) -> CollabResult<()> {
        let mut sessions = self.sessions.write().await;
        let session = sessions
            .get_mut(doc_id)
            .ok_or_else(|| CollabError::DocumentNotFound(doc_id.to_string()))?;

        session.users.remove(user_id);
        let (reply, rx) = oneshot::channel();
        let _ = session
            .cmd_tx
            .send(SessionCommand::RemoveAwareness {
                user_id: user_id.clone(),
                reply,
            })
            .await;
        let _ = rx.await;

        if session.users.is_empty() {
            let session = sessions.remove(doc_id).expect("present above");
            session.cancel.cancel();
            // The actor takes a final snapshot on its way out
            let _ = session.task.await;
            info!(%doc_id, "Session closed");
        }
        Ok(())
    }

    /// Apply a local intent to an open document
    ///
    /// The edit applies optimistically, lands in the durable log, and is
    /// either transmitted immediately (online) or queued (offline).
    ///
    /// # Errors
    ///
    /// Returns `CollabError::DocumentNotFound` if no session is open,
    /// or whatever applying the intent produced.
    pub async fn submit_intent(&self, doc_id: &DocId, intent: Intent) -> CollabResult<OpId> {
        self.command(doc_id, |reply| SessionCommand::Submit { intent, reply })
            .await?
    }

    /// Publish a local user's presence update
    pub async fn update_awareness(
        &self,
        doc_id: &DocId,
        state: AwarenessState,
    ) -> CollabResult<()> {
        self.command(doc_id, |reply| SessionCommand::UpdateAwareness { state, reply })
            .await?
    }

    /// The visible text of a text field
    pub async fn materialize(&self, doc_id: &DocId, field: FieldId) -> CollabResult<String> {
        self.command(doc_id, |reply| SessionCommand::Materialize { field, reply })
            .await?
    }

    /// The visible key-value view of a map field
    pub async fn map_view(
        &self,
        doc_id: &DocId,
        field: FieldId,
    ) -> CollabResult<BTreeMap<String, Value>> {
        self.command(doc_id, |reply| SessionCommand::MapView { field, reply })
            .await?
    }

    /// Report connectivity; `true` starts reconciliation of queued edits
    pub async fn set_online(&self, doc_id: &DocId, online: bool) -> CollabResult<()> {
        self.command(doc_id, |reply| SessionCommand::SetConnectivity { online, reply })
            .await
    }

    /// Current sync state of a document's pipeline
    pub async fn sync_state(&self, doc_id: &DocId) -> CollabResult<SyncState> {
        self.command(doc_id, |reply| SessionCommand::SyncState { reply })
            .await
    }

    /// Force a snapshot write now
    pub async fn snapshot(&self, doc_id: &DocId) -> CollabResult<()> {
        self.command(doc_id, |reply| SessionCommand::Snapshot { reply })
            .await?
    }

    /// Tombstone a document; local edits are rejected from now on
    pub async fn archive(&self, doc_id: &DocId) -> CollabResult<()> {
        self.command(doc_id, |reply| SessionCommand::Archive { reply })
            .await
    }

    async fn command<T>(
        &self,
        doc_id: &DocId,
        make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand,
    ) -> CollabResult<T> {
        let cmd_tx = {
            let sessions = self.sessions.read().await;
            sessions
                .get(doc_id)
                .ok_or_else(|| CollabError::DocumentNotFound(doc_id.to_string()))?
                .cmd_tx
                .clone()
        };
        let (reply, rx) = oneshot::channel();
        cmd_tx
            .send(make(reply))
            .await
            .map_err(|_| CollabError::SessionFailed("session actor stopped".into()))?;
        rx.await
            .map_err(|_| CollabError::SessionFailed("session actor stopped".into()))
    }
}

/// The per-document actor: owns the CRDT state and serializes all access
struct SessionActor {
    doc_id: DocId,
    replica: ReplicaId,
    config: SessionConfig,
    doc: DocumentManager,
    sync: OfflineSyncManager,
    awareness: AwarenessManager,
    transport: Arc<dyn Transport>,
    persistence: Arc<dyn Persistence>,
    event_tx: broadcast::Sender<CollabEvent>,
    cmd_rx: mpsc::Receiver<SessionCommand>,
    cancel: CancellationToken,
}

impl SessionActor {
    async fn run(mut self) {
        let mut transport_rx = self.transport.subscribe(&self.doc_id);
        let mut snapshot_tick = tokio::time::interval(self.config.snapshot_interval);
        snapshot_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut awareness_tick = tokio::time::interval(self.config.awareness_tick);
        awareness_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // First tick of an interval fires immediately; swallow both
        snapshot_tick.tick().await;
        awareness_tick.tick().await;

        // Armed while a replay batch waits out its backoff delay
        let mut retry_at: Option<tokio::time::Instant> = None;

        loop {
            let retry_deadline = retry_at;
            tokio::select! {
                _ = self.cancel.cancelled() => break,

                Some(cmd) = self.cmd_rx.recv() => {
                    self.handle_command(cmd, &mut retry_at);
                }

                msg = transport_rx.recv() => {
                    match msg {
                        Ok(payload) => self.handle_transport(payload),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // Missed messages surface later as causal gaps and
                            // get re-fetched through reconciliation
                            warn!(doc_id = %self.doc_id, skipped, "Transport receiver lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            self.sync.go_offline();
                            transport_rx = self.transport.subscribe(&self.doc_id);
                        }
                    }
                }

                _ = snapshot_tick.tick() => {
                    if let Err(e) = self.write_snapshot() {
                        warn!(doc_id = %self.doc_id, error = %e, "Periodic snapshot failed");
                    }
                }

                _ = awareness_tick.tick() => {
                    self.expire_awareness();
                }

                _ = async move {
                    tokio::time::sleep_until(retry_deadline.unwrap_or_else(tokio::time::Instant::now)).await
                }, if retry_deadline.is_some() => {
                    retry_at = None;
                    self.drive_replay(&mut retry_at);
                }
            }
        }

        // Final snapshot on the way out; the queue is already durable
        if let Err(e) = self.write_snapshot() {
            warn!(doc_id = %self.doc_id, error = %e, "Final snapshot failed");
        }
        debug!(doc_id = %self.doc_id, "Session actor stopped");
    }

    fn handle_command(&mut self, cmd: SessionCommand, retry_at: &mut Option<tokio::time::Instant>) {
        match cmd {
            SessionCommand::Submit { intent, reply } => {
                let _ = reply.send(self.submit(intent));
            }
            SessionCommand::UpdateAwareness { state, reply } => {
                let _ = reply.send(self.update_awareness(state));
            }
            SessionCommand::RemoveAwareness { user_id, reply } => {
                if self.awareness.remove(&user_id) {
                    let _ = self.event_tx.send(CollabEvent::AwarenessRemoved {
                        doc_id: self.doc_id.clone(),
                        user_id,
                    });
                }
                let _ = reply.send(());
            }
            SessionCommand::Materialize { field, reply } => {
                let _ = reply.send(self.doc.materialize(&field));
            }
            SessionCommand::MapView { field, reply } => {
                let view = self.doc.map_view(&field).map(|view| {
                    view.into_iter()
                        .map(|(k, v)| (k.to_string(), v.clone()))
                        .collect()
                });
                let _ = reply.send(view);
            }
            SessionCommand::SetConnectivity { online, reply } => {
                if online {
                    self.doc.begin_sync();
                    self.sync.begin_reconcile();
                    self.drive_replay(retry_at);
                } else {
                    *retry_at = None;
                    self.sync.pause();
                    self.sync.go_offline();
                    self.doc.end_sync();
                }
                let _ = reply.send(());
            }
            SessionCommand::SyncState { reply } => {
                let _ = reply.send(self.sync.state());
            }
            SessionCommand::Snapshot { reply } => {
                let _ = reply.send(self.write_snapshot());
            }
            SessionCommand::Archive { reply } => {
                self.doc.archive();
                let _ = reply.send(());
            }
        }
    }

    /// Apply a local intent: optimistic CRDT apply, durable log append,
    /// then transmit or queue depending on connectivity
    fn submit(&mut self, intent: Intent) -> CollabResult<OpId> {
        let op = self.doc.apply_local(intent)?;
        self.persist_ops(std::slice::from_ref(&op))?;

        if self.sync.is_online() {
            let msg = WireMessage::new(TransportMessage::Op {
                doc_id: self.doc_id.clone(),
                operation: op.clone(),
            });
            match msg
                .encode()
                .and_then(|bytes| self.transport.publish(&self.doc_id, Bytes::from(bytes)))
            {
                Ok(()) => {}
                Err(e) => {
                    warn!(doc_id = %self.doc_id, error = %e, "Publish failed; going offline");
                    self.sync.go_offline();
                    self.queue_op(op.clone())?;
                }
            }
        } else {
            self.queue_op(op.clone())?;
        }
        Ok(op.id)
    }

    fn queue_op(&mut self, op: Operation) -> CollabResult<()> {
        self.sync.enqueue(op)?;
        self.persist_queue();
        Ok(())
    }

    fn update_awareness(&mut self, state: AwarenessState) -> CollabResult<()> {
        let now = chrono::Utc::now().timestamp_millis();
        let state = self.awareness.update_local(state, now);
        let user_id = state.user_id.clone();

        let msg = WireMessage::new(TransportMessage::Awareness {
            doc_id: self.doc_id.clone(),
            user_id: user_id.clone(),
            state,
            timestamp: now,
        });
        // Presence is ephemeral: a lost update is repaired by the next one
        if let Err(e) = msg
            .encode()
            .and_then(|bytes| self.transport.publish(&self.doc_id, Bytes::from(bytes)))
        {
            debug!(doc_id = %self.doc_id, error = %e, "Awareness publish dropped");
        }
        let _ = self.event_tx.send(CollabEvent::AwarenessChanged {
            doc_id: self.doc_id.clone(),
            user_id,
        });
        Ok(())
    }

    fn handle_transport(&mut self, payload: Bytes) {
        let msg = match WireMessage::decode(&payload) {
            Ok(msg) => msg.into_inner(),
            Err(e) => {
                warn!(doc_id = %self.doc_id, error = %e, "Dropping undecodable message");
                return;
            }
        };
        match msg {
            TransportMessage::Op { operation, .. } => {
                if operation.id.replica == self.replica {
                    return; // our own echo
                }
                let ops = std::slice::from_ref(&operation);
                match self.doc.apply_remote(operation.clone()) {
                    Ok(outcome) => {
                        debug!(doc_id = %self.doc_id, op = %operation.id, ?outcome, "Remote operation handled");
                        // Retain for replay/audit; idempotent by op id
                        if let Err(e) = self.persist_ops(ops) {
                            warn!(doc_id = %self.doc_id, error = %e, "Failed to log remote operation");
                        }
                    }
                    Err(e) => {
                        warn!(doc_id = %self.doc_id, error = %e, "Remote apply failed");
                    }
                }
            }
            TransportMessage::Awareness { user_id, state, .. } => {
                if self.awareness.on_remote_update(state) {
                    let _ = self.event_tx.send(CollabEvent::AwarenessChanged {
                        doc_id: self.doc_id.clone(),
                        user_id,
                    });
                }
            }
        }
    }

    /// Replay queued operations, batch by batch, until drained or a
    /// transport failure arms the retry timer
    fn drive_replay(&mut self, retry_at: &mut Option<tokio::time::Instant>) {
        while let Some(batch) = self.sync.next_batch() {
            if self.cancel.is_cancelled() {
                self.sync.pause();
                return;
            }
            match self.send_batch(&batch) {
                Ok(()) => {
                    self.sync.ack_batch(batch.len());
                    self.persist_queue();
                }
                Err(e) => {
                    let delay = self.sync.batch_failed(&e.to_string());
                    self.persist_queue();
                    *retry_at = Some(tokio::time::Instant::now() + delay);
                    return;
                }
            }
        }

        if self.sync.state() == SyncState::Reconciling {
            // Queue drained: the snapshot round-trip gates Online
            let ok = self.snapshot_roundtrip();
            self.sync.finish_reconcile(ok);
            self.doc.end_sync();
        }
    }

    fn send_batch(&self, batch: &[Operation]) -> CollabResult<()> {
        for op in batch {
            let msg = WireMessage::new(TransportMessage::Op {
                doc_id: self.doc_id.clone(),
                operation: op.clone(),
            });
            let bytes = msg.encode()?;
            self.transport.publish(&self.doc_id, Bytes::from(bytes))?;
        }
        Ok(())
    }

    fn snapshot_roundtrip(&self) -> bool {
        let snapshot = self.doc.snapshot();
        match self
            .persistence
            .save_snapshot(&snapshot)
            .and_then(|()| self.persistence.load_snapshot(&self.doc_id))
        {
            Ok(Some(stored)) if stored.clock == snapshot.clock => true,
            Ok(_) => {
                warn!(doc_id = %self.doc_id, "Snapshot round-trip returned stale state");
                false
            }
            Err(e) => {
                warn!(doc_id = %self.doc_id, error = %e, "Snapshot round-trip failed");
                false
            }
        }
    }

    fn expire_awareness(&mut self) {
        let now = chrono::Utc::now().timestamp_millis();
        for user_id in self.awareness.expire_stale(now) {
            let _ = self.event_tx.send(CollabEvent::AwarenessRemoved {
                doc_id: self.doc_id.clone(),
                user_id,
            });
        }
    }

    /// Append operations with a bounded retry budget; exhausting it
    /// fails the session
    fn persist_ops(&mut self, ops: &[Operation]) -> CollabResult<()> {
        let mut last_err = None;
        for attempt in 1..=self.config.persistence_attempts {
            match self.persistence.append_operations(&self.doc_id, ops) {
                Ok(_) => return Ok(()),
                Err(e) => {
                    warn!(doc_id = %self.doc_id, attempt, error = %e, "Operation log append failed");
                    last_err = Some(e);
                }
            }
        }
        let message = last_err
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown persistence failure".into());
        let _ = self.event_tx.send(CollabEvent::SessionFailed {
            doc_id: self.doc_id.clone(),
            message: message.clone(),
        });
        Err(CollabError::SessionFailed(message))
    }

    fn persist_queue(&self) {
        let items: Vec<_> = self.sync.queue_items().cloned().collect();
        if let Err(e) = self.persistence.save_queue(&self.doc_id, &items) {
            warn!(doc_id = %self.doc_id, error = %e, "Failed to persist offline queue");
        }
    }

    fn write_snapshot(&self) -> CollabResult<()> {
        self.persistence.save_snapshot(&self.doc.snapshot())
    }
}
