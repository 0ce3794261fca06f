//! Sequence CRDT for collaborative text fields
//!
//! Elements live in an arena keyed by `(position, creating op id)`. The
//! fractional position gives the intended order; the op id forces a
//! deterministic total order when concurrent inserts allocate identical
//! positions. Deletes tombstone elements instead of removing them, so
//! concurrent inserts anchored on a deleted element still resolve.

use std::cmp::Ordering;
use std::collections::{BTreeMap, HashMap};

use serde::{Deserialize, Serialize};

use super::position::Position;
use super::{MergeOutcome, OpKind};
use crate::error::{CollabError, CollabResult};
use crate::types::{OpId, PositionRef};

/// Total-order key for a text element: fractional position, then the
/// creating operation's `(replica, counter)` as tie-break
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElementKey {
    /// Allocated fractional position
    pub position: Position,
    /// Id of the operation that created the element
    pub id: OpId,
}

impl PartialOrd for ElementKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ElementKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.position
            .cmp(&other.position)
            .then_with(|| (&self.id.replica, self.id.counter).cmp(&(&other.id.replica, other.id.counter)))
    }
}

/// One element of a text sequence
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TextElement {
    /// Id of the operation that created the element
    pub id: OpId,
    /// Allocated fractional position
    pub position: Position,
    /// Element content (character or grapheme cluster)
    pub content: String,
    /// Whether the element has been deleted
    pub tombstone: bool,
}

/// Sequence CRDT supporting concurrent insert/delete with deterministic
/// convergence
///
/// # Example
///
/// ```
/// use collab_core::crdt::CrdtText;
/// use collab_core::{OpId, PositionRef, ReplicaId};
///
/// let mut text = CrdtText::new();
/// let a = ReplicaId::new("a");
/// text.local_insert(&PositionRef::End, "h", OpId::new(a.clone(), 1)).unwrap();
/// text.local_insert(&PositionRef::End, "i", OpId::new(a, 2)).unwrap();
/// assert_eq!(text.materialize(), "hi");
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CrdtText {
    /// Arena of elements in converged order
    elements: BTreeMap<ElementKey, TextElement>,
    /// Element lookup by creating operation id
    index: HashMap<OpId, ElementKey>,
}

impl CrdtText {
    /// Create an empty text field
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a position and insert locally
    ///
    /// `reference` must name a currently-visible element or a sentinel.
    /// Returns the allocated position, which the caller embeds in the
    /// broadcast [`Operation`](super::Operation).
    ///
    /// # Errors
    ///
    /// Returns `CollabError::MalformedOperation` if the reference names
    /// an unknown or tombstoned element.
    pub fn local_insert(
        &mut self,
        reference: &PositionRef,
        content: &str,
        id: OpId,
    ) -> CollabResult<Position> {
        let (left, right) = self.resolve_reference(reference)?;
        let position = Position::between(left, right);
        self.insert_element(id, position, content.to_string());
        Ok(position)
    }

    /// Tombstone the element created by `target`
    ///
    /// Idempotent: deleting an already-tombstoned element returns
    /// `Ok(false)` rather than an error, for duplicate-delivery safety.
    ///
    /// # Errors
    ///
    /// Returns `CollabError::MalformedOperation` if no element with that
    /// id exists.
    pub fn local_delete(&mut self, target: &OpId) -> CollabResult<bool> {
        let key = self
            .index
            .get(target)
            .cloned()
            .ok_or_else(|| CollabError::MalformedOperation(format!("unknown element {target}")))?;
        let element = self
            .elements
            .get_mut(&key)
            .ok_or_else(|| CollabError::MalformedOperation(format!("unknown element {target}")))?;
        if element.tombstone {
            return Ok(false);
        }
        element.tombstone = true;
        Ok(true)
    }

    /// Merge a remote insert or delete
    ///
    /// Commutative and idempotent: duplicates are no-ops, and delivery
    /// order across peers never changes the converged sequence. Causal
    /// readiness is the document manager's responsibility; a delete for
    /// an element that was never inserted is malformed here because the
    /// manager only delivers it after its dependencies.
    pub fn merge(&mut self, id: &OpId, kind: &OpKind) -> MergeOutcome {
        match kind {
            OpKind::Insert { position, content } => {
                if self.index.contains_key(id) {
                    return MergeOutcome::NoOp;
                }
                // A concurrent insert that allocated the identical
                // fractional value still orders deterministically via
                // the op-id tie-break; surface it for the conflict log.
                let collision = self
                    .elements
                    .range(
                        ElementKey {
                            position: *position,
                            id: OpId::new(crate::types::ReplicaId::new(""), 0),
                        }..,
                    )
                    .take_while(|(k, _)| k.position == *position)
                    .map(|(k, _)| k.id.clone())
                    .next();
                self.insert_element(id.clone(), *position, content.clone());
                match collision {
                    Some(other) => MergeOutcome::Conflict {
                        other,
                        changed: true,
                    },
                    None => MergeOutcome::Applied,
                }
            }
            OpKind::Delete { target } => match self.index.get(target).cloned() {
                Some(key) => {
                    let element = self.elements.get_mut(&key).expect("index entry has element");
                    if element.tombstone {
                        MergeOutcome::NoOp
                    } else {
                        element.tombstone = true;
                        MergeOutcome::Applied
                    }
                }
                None => MergeOutcome::Malformed(format!("delete of unknown element {target}")),
            },
            OpKind::Set { .. } => MergeOutcome::Malformed("set applied to text field".into()),
        }
    }

    /// Produce the visible sequence, tombstones filtered
    ///
    /// O(n) over live plus tombstoned elements. Callers needing repeated
    /// reads should cache and invalidate on merge/local edits.
    pub fn materialize(&self) -> String {
        self.iter_visible().map(|e| e.content.as_str()).collect()
    }

    /// Iterate visible elements in converged order
    pub fn iter_visible(&self) -> impl Iterator<Item = &TextElement> {
        self.elements.values().filter(|e| !e.tombstone)
    }

    /// Number of visible elements
    pub fn visible_len(&self) -> usize {
        self.iter_visible().count()
    }

    /// Total number of elements, tombstones included
    pub fn len(&self) -> usize {
        self.elements.len()
    }

    /// Whether the field has no elements at all
    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    /// Look up an element by the id of its creating operation
    pub fn element(&self, id: &OpId) -> Option<&TextElement> {
        self.index.get(id).and_then(|key| self.elements.get(key))
    }

    fn insert_element(&mut self, id: OpId, position: Position, content: String) {
        let key = ElementKey {
            position,
            id: id.clone(),
        };
        self.index.insert(id.clone(), key.clone());
        self.elements.insert(
            key,
            TextElement {
                id,
                position,
                content,
                tombstone: false,
            },
        );
    }

    /// Resolve an insertion reference to `(left, right)` neighbour
    /// positions for fractional allocation
    fn resolve_reference(
        &self,
        reference: &PositionRef,
    ) -> CollabResult<(Option<Position>, Option<Position>)> {
        match reference {
            PositionRef::Start => {
                let right = self.elements.keys().next().map(|k| k.position);
                Ok((None, right))
            }
            PositionRef::End => {
                let left = self.elements.keys().next_back().map(|k| k.position);
                Ok((left, None))
            }
            PositionRef::After(id) => {
                let key = self.index.get(id).ok_or_else(|| {
                    CollabError::MalformedOperation(format!("insert after unknown element {id}"))
                })?;
                let element = self.elements.get(key).expect("index entry has element");
                if element.tombstone {
                    return Err(CollabError::MalformedOperation(format!(
                        "insert after tombstoned element {id}"
                    )));
                }
                let left = Some(key.position);
                let right = self
                    .elements
                    .range((std::ops::Bound::Excluded(key.clone()), std::ops::Bound::Unbounded))
                    .next()
                    .map(|(k, _)| k.position);
                Ok((left, right))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ReplicaId;

    fn op(replica: &str, counter: u64) -> OpId {
        OpId::new(ReplicaId::new(replica), counter)
    }

    #[test]
    fn test_empty_text_materializes_empty() {
        let text = CrdtText::new();
        assert_eq!(text.materialize(), "");
        assert_eq!(text.visible_len(), 0);
    }

    #[test]
    fn test_sequential_inserts_at_end() {
        let mut text = CrdtText::new();
        text.local_insert(&PositionRef::End, "a", op("r", 1)).unwrap();
        text.local_insert(&PositionRef::End, "b", op("r", 2)).unwrap();
        text.local_insert(&PositionRef::End, "c", op("r", 3)).unwrap();
        assert_eq!(text.materialize(), "abc");
    }

    #[test]
    fn test_insert_at_start() {
        let mut text = CrdtText::new();
        text.local_insert(&PositionRef::End, "b", op("r", 1)).unwrap();
        text.local_insert(&PositionRef::Start, "a", op("r", 2)).unwrap();
        assert_eq!(text.materialize(), "ab");
    }

    #[test]
    fn test_insert_after_element() {
        let mut text = CrdtText::new();
        let first = op("r", 1);
        text.local_insert(&PositionRef::End, "a", first.clone()).unwrap();
        text.local_insert(&PositionRef::End, "c", op("r", 2)).unwrap();
        text.local_insert(&PositionRef::After(first), "b", op("r", 3)).unwrap();
        assert_eq!(text.materialize(), "abc");
    }

    #[test]
    fn test_insert_after_unknown_element_is_malformed() {
        let mut text = CrdtText::new();
        let result = text.local_insert(&PositionRef::After(op("x", 9)), "a", op("r", 1));
        assert!(matches!(result, Err(CollabError::MalformedOperation(_))));
    }

    #[test]
    fn test_insert_after_tombstone_is_malformed() {
        let mut text = CrdtText::new();
        let first = op("r", 1);
        text.local_insert(&PositionRef::End, "a", first.clone()).unwrap();
        text.local_delete(&first).unwrap();
        let result = text.local_insert(&PositionRef::After(first), "b", op("r", 2));
        assert!(matches!(result, Err(CollabError::MalformedOperation(_))));
    }

    #[test]
    fn test_delete_is_idempotent() {
        let mut text = CrdtText::new();
        let id = op("r", 1);
        text.local_insert(&PositionRef::End, "a", id.clone()).unwrap();

        assert!(text.local_delete(&id).unwrap());
        assert!(!text.local_delete(&id).unwrap());
        assert_eq!(text.materialize(), "");
        // Tombstoned element still occupies the arena
        assert_eq!(text.len(), 1);
    }

    #[test]
    fn test_merge_duplicate_insert_is_noop() {
        let mut text = CrdtText::new();
        let id = op("r", 1);
        let position = text
            .local_insert(&PositionRef::End, "a", id.clone())
            .unwrap();

        let outcome = text.merge(
            &id,
            &OpKind::Insert {
                position,
                content: "a".into(),
            },
        );
        assert_eq!(outcome, MergeOutcome::NoOp);
        assert_eq!(text.materialize(), "a");
    }

    #[test]
    fn test_merge_delete_of_unknown_element_is_malformed() {
        let mut text = CrdtText::new();
        let outcome = text.merge(&op("r", 2), &OpKind::Delete { target: op("x", 1) });
        assert!(matches!(outcome, MergeOutcome::Malformed(_)));
    }

    #[test]
    fn test_concurrent_inserts_converge_in_any_order() {
        // Replica A and replica B both insert at the start before
        // seeing each other's op.
        let mut a = CrdtText::new();
        let mut b = CrdtText::new();

        let a_id = op("a", 1);
        let b_id = op("b", 1);
        let a_pos = a.local_insert(&PositionRef::Start, "cat", a_id.clone()).unwrap();
        let b_pos = b.local_insert(&PositionRef::Start, "dog", b_id.clone()).unwrap();

        a.merge(
            &b_id,
            &OpKind::Insert {
                position: b_pos,
                content: "dog".into(),
            },
        );
        b.merge(
            &a_id,
            &OpKind::Insert {
                position: a_pos,
                content: "cat".into(),
            },
        );

        // Both replicas converge on the same order, whichever it is.
        assert_eq!(a.materialize(), b.materialize());
        assert_eq!(a.visible_len(), 2);
    }

    #[test]
    fn test_identical_position_tie_break_is_deterministic() {
        // Force the collision case: both ops claim the exact same
        // fractional position.
        let position = Position::between(None, None);
        let a_id = op("a", 1);
        let b_id = op("b", 1);

        let mut one = CrdtText::new();
        one.merge(&a_id, &OpKind::Insert { position, content: "x".into() });
        let outcome = one.merge(&b_id, &OpKind::Insert { position, content: "y".into() });
        assert!(matches!(outcome, MergeOutcome::Conflict { .. }));

        let mut two = CrdtText::new();
        two.merge(&b_id, &OpKind::Insert { position, content: "y".into() });
        two.merge(&a_id, &OpKind::Insert { position, content: "x".into() });

        assert_eq!(one.materialize(), two.materialize());
    }

    #[test]
    fn test_tombstone_anchors_survive_for_ordering() {
        let mut text = CrdtText::new();
        let first = op("r", 1);
        text.local_insert(&PositionRef::End, "a", first.clone()).unwrap();
        text.local_insert(&PositionRef::End, "b", op("r", 2)).unwrap();
        text.local_delete(&first).unwrap();

        // Start-insert lands before the tombstone, still first visibly.
        text.local_insert(&PositionRef::Start, "z", op("r", 3)).unwrap();
        assert_eq!(text.materialize(), "zb");
    }
}
