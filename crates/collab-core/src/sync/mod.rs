//! Synchronization layer: wire protocol, events, and offline reconciliation

mod events;
mod offline;
mod protocol;

pub use events::{ChangeOrigin, CollabEvent, SyncState};
pub use offline::{Backoff, OfflineSyncManager, SyncConfig, SyncQueueItem};
pub use protocol::{TransportMessage, WireMessage, PROTOCOL_VERSION};
