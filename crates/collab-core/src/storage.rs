//! Durable persistence using redb
//!
//! Three tables per database file:
//! - `snapshots`: latest full CRDT state per document
//! - `operations`: append-only operation log, keyed so a per-document
//!   range scan returns every logged operation
//! - `sync_queue`: offline queue contents, persisted across restarts
//!
//! Writes are at-least-once safe: operation log keys derive from the
//! operation's `(replica, counter)` id, so a duplicate append overwrites
//! the identical entry, and replay dedups by id anyway.

use std::path::Path;
use std::sync::Arc;

use parking_lot::RwLock;
use redb::{Database, TableDefinition};
use tracing::debug;

use crate::crdt::Operation;
use crate::document::DocumentSnapshot;
use crate::error::{CollabError, CollabResult};
use crate::sync::SyncQueueItem;
use crate::types::DocId;

const SNAPSHOTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("snapshots");
const OPERATIONS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("operations");
const SYNC_QUEUE_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("sync_queue");

/// Acknowledgment for an operation-log append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendAck {
    /// Operations written in this append
    pub appended: usize,
}

/// Persistence boundary for snapshots, the operation log, and the
/// offline queue
///
/// At-least-once semantics: every write is idempotent by document id or
/// operation id, so a retried call after an ambiguous failure is safe.
pub trait Persistence: Send + Sync {
    /// Load the latest snapshot for a document, if any
    fn load_snapshot(&self, doc_id: &DocId) -> CollabResult<Option<DocumentSnapshot>>;

    /// Write a snapshot, replacing any previous one
    fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> CollabResult<()>;

    /// Append operations to the document's durable log
    fn append_operations(&self, doc_id: &DocId, ops: &[Operation]) -> CollabResult<AppendAck>;

    /// Load every logged operation for a document
    ///
    /// No ordering guarantee beyond per-replica key order; replay is
    /// dependency-driven and duplicates already covered by a snapshot
    /// clock merge as no-ops.
    fn load_operations(&self, doc_id: &DocId) -> CollabResult<Vec<Operation>>;

    /// Replace the persisted offline queue for a document
    fn save_queue(&self, doc_id: &DocId, items: &[SyncQueueItem]) -> CollabResult<()>;

    /// Load the persisted offline queue for a document
    fn load_queue(&self, doc_id: &DocId) -> CollabResult<Vec<SyncQueueItem>>;
}

/// redb-backed [`Persistence`] implementation
#[derive(Clone)]
pub struct Storage {
    db: Arc<RwLock<Database>>,
}

impl Storage {
    /// Create or open a database at the given path
    ///
    /// Creates the parent directory and all tables if missing.
    pub fn new(path: impl AsRef<Path>) -> CollabResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(path)?;
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let _ = write_txn.open_table(OPERATIONS_TABLE)?;
            let _ = write_txn.open_table(SYNC_QUEUE_TABLE)?;
        }
        write_txn.commit()?;

        Ok(Self {
            db: Arc::new(RwLock::new(db)),
        })
    }

    /// Log key for one operation: `<doc>/<replica>/<zero-padded counter>`
    fn op_key(doc_id: &DocId, op: &Operation) -> String {
        format!(
            "{}/{}/{:020}",
            doc_id.to_base58(),
            op.id.replica.as_str(),
            op.id.counter
        )
    }

    /// Range bounds for a per-document prefix scan
    ///
    /// '0' is the first ASCII character after '/', so `<doc>/` ..
    /// `<doc>0` covers exactly the keys under the document's prefix.
    fn op_range(doc_id: &DocId) -> (String, String) {
        let base = doc_id.to_base58();
        (format!("{base}/"), format!("{base}0"))
    }
}

impl Persistence for Storage {
    fn load_snapshot(&self, doc_id: &DocId) -> CollabResult<Option<DocumentSnapshot>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SNAPSHOTS_TABLE)?;
        let key = doc_id.to_base58();

        match table.get(key.as_str())? {
            Some(v) => Ok(Some(DocumentSnapshot::decode(v.value())?)),
            None => Ok(None),
        }
    }

    fn save_snapshot(&self, snapshot: &DocumentSnapshot) -> CollabResult<()> {
        let data = snapshot.encode()?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SNAPSHOTS_TABLE)?;
            let key = snapshot.doc_id.to_base58();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        debug!(doc_id = %snapshot.doc_id, "Snapshot saved");
        Ok(())
    }

    fn append_operations(&self, doc_id: &DocId, ops: &[Operation]) -> CollabResult<AppendAck> {
        if ops.is_empty() {
            return Ok(AppendAck { appended: 0 });
        }

        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(OPERATIONS_TABLE)?;
            for op in ops {
                let data = postcard::to_allocvec(op)
                    .map_err(|e| CollabError::Serialization(e.to_string()))?;
                let key = Self::op_key(doc_id, op);
                table.insert(key.as_str(), data.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(AppendAck { appended: ops.len() })
    }

    fn load_operations(&self, doc_id: &DocId) -> CollabResult<Vec<Operation>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(OPERATIONS_TABLE)?;
        let (start, end) = Self::op_range(doc_id);

        let mut ops = Vec::new();
        for entry in table.range(start.as_str()..end.as_str())? {
            let (_, value) = entry?;
            let op: Operation = postcard::from_bytes(value.value())
                .map_err(|e| CollabError::Serialization(e.to_string()))?;
            ops.push(op);
        }
        Ok(ops)
    }

    fn save_queue(&self, doc_id: &DocId, items: &[SyncQueueItem]) -> CollabResult<()> {
        let data =
            postcard::to_allocvec(items).map_err(|e| CollabError::Serialization(e.to_string()))?;
        let db = self.db.read();
        let write_txn = db.begin_write()?;
        {
            let mut table = write_txn.open_table(SYNC_QUEUE_TABLE)?;
            let key = doc_id.to_base58();
            table.insert(key.as_str(), data.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    fn load_queue(&self, doc_id: &DocId) -> CollabResult<Vec<SyncQueueItem>> {
        let db = self.db.read();
        let read_txn = db.begin_read()?;
        let table = read_txn.open_table(SYNC_QUEUE_TABLE)?;
        let key = doc_id.to_base58();

        match table.get(key.as_str())? {
            Some(v) => postcard::from_bytes(v.value())
                .map_err(|e| CollabError::Serialization(e.to_string())),
            None => Ok(Vec::new()),
        }
    }
}
