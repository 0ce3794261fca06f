//! Ephemeral per-user presence state for a document
//!
//! Awareness is deliberately simpler than the document CRDTs: it is not
//! vector-clocked, not persisted, and tolerates staleness. Last write by
//! wall-clock timestamp wins, and entries expire after an idle TTL. Full
//! state is reconstructible by re-broadcast, so a process or connection
//! restart simply clears it.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{FieldId, UserId};

/// Default idle window after which a user's presence entry is dropped
pub const DEFAULT_AWARENESS_TTL: Duration = Duration::from_secs(30);

/// Cursor location inside a text field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    /// Field the cursor is in
    pub field: FieldId,
    /// Index into the visible sequence
    pub index: usize,
}

/// Selected range inside a text field
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    /// Field the selection is in
    pub field: FieldId,
    /// Start index into the visible sequence (inclusive)
    pub start: usize,
    /// End index into the visible sequence (exclusive)
    pub end: usize,
}

/// One user's ephemeral presence record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AwarenessState {
    /// The user this state belongs to
    pub user_id: UserId,
    /// Current cursor, if any
    pub cursor: Option<Cursor>,
    /// Current selection, if any
    pub selection: Option<Selection>,
    /// Wall-clock timestamp of the last update (unix millis)
    pub last_seen: i64,
    /// Free-form client metadata (display name, color, ...)
    pub client_metadata: BTreeMap<String, String>,
}

impl AwarenessState {
    /// Create a presence record for a user with no cursor yet
    pub fn new(user_id: UserId, last_seen: i64) -> Self {
        Self {
            user_id,
            cursor: None,
            selection: None,
            last_seen,
            client_metadata: BTreeMap::new(),
        }
    }
}

/// Awareness configuration
#[derive(Debug, Clone)]
pub struct AwarenessConfig {
    /// Idle window before an entry is expired
    pub ttl: Duration,
}

impl Default for AwarenessConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_AWARENESS_TTL,
        }
    }
}

/// Pure expiry rule: which entries have idled past the TTL at `now`
///
/// Exposed separately from the manager so the rule is testable without
/// any timer mechanism; the host drives it from a periodic tick.
pub fn expired_users<'a>(
    now_ms: i64,
    ttl: Duration,
    states: impl Iterator<Item = &'a AwarenessState>,
) -> Vec<UserId> {
    let ttl_ms = ttl.as_millis() as i64;
    states
        .filter(|s| now_ms - s.last_seen > ttl_ms)
        .map(|s| s.user_id.clone())
        .collect()
}

/// Low-latency, non-durable presence tracking for one document
///
/// Local updates are stamped and handed back for immediate broadcast;
/// remote updates replace stored state only if newer by wall clock.
#[derive(Debug, Default)]
pub struct AwarenessManager {
    states: HashMap<UserId, AwarenessState>,
    config: AwarenessConfig,
}

impl AwarenessManager {
    /// Create a manager with the given config
    pub fn new(config: AwarenessConfig) -> Self {
        Self {
            states: HashMap::new(),
            config,
        }
    }

    /// Record a local presence update, stamped at `now_ms`
    ///
    /// Returns the stamped state for immediate broadcast; no causal
    /// ordering is needed for presence.
    pub fn update_local(&mut self, mut state: AwarenessState, now_ms: i64) -> AwarenessState {
        state.last_seen = now_ms;
        self.states.insert(state.user_id.clone(), state.clone());
        state
    }

    /// Apply a remote presence update
    ///
    /// Replaces the stored state only if the incoming timestamp is newer
    /// than what we hold for that user. Returns whether anything changed.
    pub fn on_remote_update(&mut self, state: AwarenessState) -> bool {
        match self.states.get(&state.user_id) {
            Some(current) if current.last_seen >= state.last_seen => false,
            _ => {
                self.states.insert(state.user_id.clone(), state);
                true
            }
        }
    }

    /// Drop entries idle past the TTL; returns the removed users
    ///
    /// Driven by a periodic tick owned by the collaboration service.
    pub fn expire_stale(&mut self, now_ms: i64) -> Vec<UserId> {
        let expired = expired_users(now_ms, self.config.ttl, self.states.values());
        for user in &expired {
            debug!(%user, "Expiring stale awareness entry");
            self.states.remove(user);
        }
        expired
    }

    /// Remove a user's entry (on leave)
    pub fn remove(&mut self, user_id: &UserId) -> bool {
        self.states.remove(user_id).is_some()
    }

    /// The current state for a user
    pub fn get(&self, user_id: &UserId) -> Option<&AwarenessState> {
        self.states.get(user_id)
    }

    /// Iterate all present users
    pub fn iter(&self) -> impl Iterator<Item = &AwarenessState> {
        self.states.values()
    }

    /// Number of present users
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Whether nobody is present
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
