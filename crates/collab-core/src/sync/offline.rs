//! Offline-first operation queue and reconciliation engine
//!
//! Sits in front of the live session: while `Offline`, locally created
//! operations append to a durable queue instead of being transmitted.
//! On reconnect the queue replays in causal order, one batch at a time,
//! with exponential backoff on transport failure. The API is stepwise
//! (`next_batch` / `ack_batch` / `batch_failed`) so the owning actor can
//! interleave replay with new local edits and cancel between batches —
//! never mid-batch, which would leave acknowledgment ambiguous.

use std::collections::VecDeque;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::crdt::Operation;
use crate::error::{CollabError, CollabResult};
use crate::sync::events::{CollabEvent, SyncState};
use crate::types::DocId;

/// Tuning knobs for the offline queue and replay loop
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Maximum operations held in the offline queue
    pub queue_capacity: usize,
    /// Operations replayed per batch during reconciliation
    pub batch_size: usize,
    /// Initial retry delay after a transport failure
    pub backoff_base: Duration,
    /// Retry delay ceiling
    pub backoff_cap: Duration,
    /// Jitter applied to each delay, as a fraction (0.2 = +/-20%)
    pub backoff_jitter: f64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4096,
            batch_size: 32,
            backoff_base: Duration::from_millis(500),
            backoff_cap: Duration::from_secs(30),
            backoff_jitter: 0.2,
        }
    }
}

/// One queued operation awaiting server acknowledgment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncQueueItem {
    /// The operation to replay
    pub operation: Operation,
    /// Unix millis when the operation was queued
    pub enqueued_at: i64,
    /// Transmission attempts so far
    pub attempt_count: u32,
}

/// Exponential backoff with jitter for transport retries
#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    jitter: f64,
    attempt: u32,
}

impl Backoff {
    /// Create a backoff schedule
    pub fn new(base: Duration, cap: Duration, jitter: f64) -> Self {
        Self {
            base,
            cap,
            jitter,
            attempt: 0,
        }
    }

    /// The delay before the next retry, advancing the schedule
    ///
    /// Doubles per attempt up to the cap, with multiplicative jitter so
    /// reconnecting replicas do not retry in lockstep.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt.min(31)));
        let capped = exp.min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let spread = rand::rng().random_range(-self.jitter..=self.jitter);
        capped.mul_f64((1.0 + spread).max(0.0))
    }

    /// Completed attempts since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Reset after a successful transmission
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Local-first operation queue plus the `Online -> Offline -> Reconciling`
/// state machine
///
/// The owning actor drives replay:
///
/// ```text
/// begin_reconcile();
/// loop {
///     let Some(batch) = next_batch() else { break };
///     match transport.send(batch).await {
///         Ok(_) => ack_batch(n),
///         Err(_) => sleep(batch_failed(reason)).await,
///     }
/// }
/// finish_reconcile(snapshot_ok);
/// ```
pub struct OfflineSyncManager {
    doc_id: DocId,
    config: SyncConfig,
    state: SyncState,
    queue: VecDeque<SyncQueueItem>,
    backoff: Backoff,
    events: broadcast::Sender<CollabEvent>,
}

impl OfflineSyncManager {
    /// Create a manager starting in `Offline` with an empty queue
    pub fn new(doc_id: DocId, config: SyncConfig, events: broadcast::Sender<CollabEvent>) -> Self {
        let backoff = Backoff::new(
            config.backoff_base,
            config.backoff_cap,
            config.backoff_jitter,
        );
        Self {
            doc_id,
            config,
            state: SyncState::Offline,
            queue: VecDeque::new(),
            backoff,
            events,
        }
    }

    /// Restore a manager from queue items persisted across restarts
    pub fn restore(
        doc_id: DocId,
        config: SyncConfig,
        items: Vec<SyncQueueItem>,
        events: broadcast::Sender<CollabEvent>,
    ) -> Self {
        let mut mgr = Self::new(doc_id, config, events);
        mgr.queue = items.into();
        mgr
    }

    /// Current connectivity state
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Whether operations should be transmitted immediately
    pub fn is_online(&self) -> bool {
        self.state == SyncState::Online
    }

    /// Operations currently queued
    pub fn queue_len(&self) -> usize {
        self.queue.len()
    }

    /// Whether the queue is empty
    pub fn queue_is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Snapshot of the queue for persistence
    pub fn queue_items(&self) -> impl Iterator<Item = &SyncQueueItem> {
        self.queue.iter()
    }

    /// Append a locally created operation to the queue
    ///
    /// Queued in local-counter order because the caller creates
    /// operations in that order. A full queue rejects the operation so
    /// the application learns about the capacity limit before anything
    /// is lost silently; local CRDT state already holds the edit.
    ///
    /// # Errors
    ///
    /// Returns `CollabError::QuotaExceeded` when the queue is at
    /// capacity. A `CollabEvent::QuotaExceeded` is emitted as well.
    pub fn enqueue(&mut self, operation: Operation) -> CollabResult<()> {
        if self.queue.len() >= self.config.queue_capacity {
            let queued = self.queue.len();
            let capacity = self.config.queue_capacity;
            warn!(doc_id = %self.doc_id, queued, capacity, "Offline queue at capacity");
            let _ = self.events.send(CollabEvent::QuotaExceeded {
                doc_id: self.doc_id.clone(),
                queued,
                capacity,
            });
            return Err(CollabError::QuotaExceeded { queued, capacity });
        }

        self.queue.push_back(SyncQueueItem {
            operation,
            enqueued_at: chrono::Utc::now().timestamp_millis(),
            attempt_count: 0,
        });
        Ok(())
    }

    /// Drop connectivity; operations queue from now on
    pub fn go_offline(&mut self) {
        self.set_state(SyncState::Offline);
    }

    /// Connectivity returned; start replaying the queue
    ///
    /// Skips straight to `Online` when nothing is queued.
    pub fn begin_reconcile(&mut self) {
        self.backoff.reset();
        if self.queue.is_empty() {
            self.set_state(SyncState::Online);
        } else {
            info!(doc_id = %self.doc_id, queued = self.queue.len(), "Reconciling offline queue");
            self.set_state(SyncState::Reconciling);
        }
    }

    /// The next batch to transmit, in causal order
    ///
    /// Returns `None` when the queue has drained or replay is not
    /// active. Items stay queued until [`ack_batch`](Self::ack_batch).
    pub fn next_batch(&self) -> Option<Vec<Operation>> {
        if self.state != SyncState::Reconciling || self.queue.is_empty() {
            return None;
        }
        Some(
            self.queue
                .iter()
                .take(self.config.batch_size)
                .map(|item| item.operation.clone())
                .collect(),
        )
    }

    /// The server acknowledged `count` operations; remove them
    pub fn ack_batch(&mut self, count: usize) {
        let count = count.min(self.queue.len());
        self.queue.drain(..count);
        self.backoff.reset();
        debug!(doc_id = %self.doc_id, acked = count, remaining = self.queue.len(), "Batch acknowledged");
    }

    /// A batch transmission failed; returns the delay before retrying
    ///
    /// Queued items stay put and their attempt counts advance. New local
    /// edits keep queueing behind them.
    pub fn batch_failed(&mut self, reason: &str) -> Duration {
        for item in self.queue.iter_mut().take(self.config.batch_size) {
            item.attempt_count = item.attempt_count.saturating_add(1);
        }
        let delay = self.backoff.next_delay();
        warn!(
            doc_id = %self.doc_id,
            attempt = self.backoff.attempt(),
            delay_ms = delay.as_millis() as u64,
            %reason,
            "Replay batch failed; backing off"
        );
        let _ = self.events.send(CollabEvent::SyncDegraded {
            doc_id: self.doc_id.clone(),
            message: reason.to_string(),
        });
        delay
    }

    /// Interrupt replay between batches; state returns to `Offline`
    pub fn pause(&mut self) {
        if self.state == SyncState::Reconciling {
            self.set_state(SyncState::Offline);
        }
    }

    /// Finish reconciliation after the queue drained
    ///
    /// Goes `Online` only when the queue is empty *and* the fresh
    /// snapshot round-trip succeeded; any failure lands in `Offline` so
    /// sync state is never silently wrong.
    pub fn finish_reconcile(&mut self, snapshot_ok: bool) {
        if snapshot_ok && self.queue.is_empty() && self.state == SyncState::Reconciling {
            self.set_state(SyncState::Online);
        } else {
            self.set_state(SyncState::Offline);
        }
    }

    fn set_state(&mut self, state: SyncState) {
        if self.state != state {
            info!(doc_id = %self.doc_id, from = %self.state, to = %state, "Sync state changed");
            self.state = state;
            let _ = self.events.send(CollabEvent::SyncStateChanged {
                doc_id: self.doc_id.clone(),
                state,
            });
        }
    }
}
