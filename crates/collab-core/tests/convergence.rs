//! Multi-replica convergence scenarios
//!
//! Exercises the document manager across replicas: concurrent inserts at
//! the same reference point, LWW map races, deletes arriving before
//! their inserts, and conflict logging.

use collab_core::{
    DocId, DocumentManager, FieldId, Intent, PositionRef, RemoteApply, ReplicaId, Value,
};

fn body() -> FieldId {
    FieldId::new("body")
}

fn meta() -> FieldId {
    FieldId::new("meta")
}

fn pair() -> (DocumentManager, DocumentManager) {
    let doc_id = DocId::from_bytes([11u8; 32]);
    (
        DocumentManager::new(doc_id.clone(), ReplicaId::new("a")),
        DocumentManager::new(doc_id, ReplicaId::new("b")),
    )
}

fn insert(position: PositionRef, content: &str) -> Intent {
    Intent::Insert {
        field: body(),
        position,
        content: content.into(),
    }
}

fn set(key: &str, value: &str) -> Intent {
    Intent::Set {
        field: meta(),
        key: key.into(),
        value: Value::Text(value.into()),
    }
}

#[test]
fn concurrent_inserts_at_same_reference_agree_on_order() {
    let (mut a, mut b) = pair();

    // Both insert at the very start before seeing each other
    let op_a = a.apply_local(insert(PositionRef::Start, "cat")).unwrap();
    let op_b = b.apply_local(insert(PositionRef::Start, "dog")).unwrap();

    a.apply_remote(op_b).unwrap();
    b.apply_remote(op_a).unwrap();

    let text_a = a.materialize(&body()).unwrap();
    let text_b = b.materialize(&body()).unwrap();
    assert_eq!(text_a, text_b);
    assert!(text_a == "catdog" || text_a == "dogcat", "got {text_a:?}");
}

#[test]
fn concurrent_map_writes_pick_lexicographically_larger_replica() {
    let (mut a, mut b) = pair();

    let op_a = a.apply_local(set("title", "Draft")).unwrap();
    let op_b = b.apply_local(set("title", "Final")).unwrap();

    a.apply_remote(op_b).unwrap();
    b.apply_remote(op_a).unwrap();

    let winner = Value::Text("Final".into());
    assert_eq!(a.map_view(&meta()).unwrap().get("title"), Some(&&winner));
    assert_eq!(b.map_view(&meta()).unwrap().get("title"), Some(&&winner));
}

#[test]
fn delete_arriving_before_insert_never_shows_the_element() {
    let (mut a, mut b) = pair();

    let insert_op = a.apply_local(insert(PositionRef::End, "x")).unwrap();
    let delete_op = a
        .apply_local(Intent::Delete {
            field: body(),
            target: insert_op.id.clone(),
        })
        .unwrap();

    assert_eq!(b.apply_remote(delete_op).unwrap(), RemoteApply::Buffered);
    // Nothing visible yet
    assert!(b.materialize(&body()).is_err());

    b.apply_remote(insert_op).unwrap();
    // The element appears already tombstoned
    assert_eq!(b.materialize(&body()).unwrap(), "");
}

#[test]
fn conflicts_are_logged_on_both_replicas() {
    let (mut a, mut b) = pair();

    let op_a = a.apply_local(set("status", "open")).unwrap();
    let op_b = b.apply_local(set("status", "done")).unwrap();

    a.apply_remote(op_b).unwrap();
    b.apply_remote(op_a).unwrap();

    assert_eq!(a.conflicts().len(), 1);
    assert_eq!(b.conflicts().len(), 1);
    // Converged despite the race
    assert_eq!(
        a.map_view(&meta()).unwrap().get("status"),
        b.map_view(&meta()).unwrap().get("status")
    );
}

#[test]
fn causally_chained_edits_apply_in_order_across_replicas() {
    let (mut a, mut b) = pair();

    let first = a.apply_local(insert(PositionRef::End, "h")).unwrap();
    let second = a
        .apply_local(insert(PositionRef::After(first.id.clone()), "i"))
        .unwrap();
    let third = a
        .apply_local(insert(PositionRef::After(second.id.clone()), "!"))
        .unwrap();

    // Worst-case delivery order: fully reversed
    assert_eq!(b.apply_remote(third).unwrap(), RemoteApply::Buffered);
    assert_eq!(b.apply_remote(second).unwrap(), RemoteApply::Buffered);
    assert!(matches!(
        b.apply_remote(first).unwrap(),
        RemoteApply::Applied { .. }
    ));

    assert_eq!(b.pending_len(), 0);
    assert_eq!(b.materialize(&body()).unwrap(), "hi!");
}

#[test]
fn interleaved_text_and_map_edits_converge() {
    let (mut a, mut b) = pair();

    let mut ops_a = Vec::new();
    ops_a.push(a.apply_local(insert(PositionRef::End, "one")).unwrap());
    ops_a.push(a.apply_local(set("title", "Notes")).unwrap());
    ops_a.push(a.apply_local(insert(PositionRef::End, "two")).unwrap());

    let mut ops_b = Vec::new();
    ops_b.push(b.apply_local(set("title", "Scratch")).unwrap());
    ops_b.push(b.apply_local(insert(PositionRef::Start, "zero")).unwrap());

    for op in ops_b {
        a.apply_remote(op).unwrap();
    }
    for op in ops_a {
        b.apply_remote(op).unwrap();
    }

    assert_eq!(a.materialize(&body()).unwrap(), b.materialize(&body()).unwrap());
    assert_eq!(
        a.map_view(&meta()).unwrap().get("title"),
        b.map_view(&meta()).unwrap().get("title")
    );
}

#[test]
fn three_replicas_converge_pairwise() {
    let doc_id = DocId::from_bytes([12u8; 32]);
    let mut replicas = vec![
        DocumentManager::new(doc_id.clone(), ReplicaId::new("a")),
        DocumentManager::new(doc_id.clone(), ReplicaId::new("b")),
        DocumentManager::new(doc_id, ReplicaId::new("c")),
    ];

    let mut all_ops = Vec::new();
    for (i, doc) in replicas.iter_mut().enumerate() {
        let op = doc
            .apply_local(insert(PositionRef::Start, &format!("r{i}")))
            .unwrap();
        all_ops.push(op);
    }

    for (i, doc) in replicas.iter_mut().enumerate() {
        for (j, op) in all_ops.iter().enumerate() {
            if i != j {
                doc.apply_remote(op.clone()).unwrap();
            }
        }
    }

    let first = replicas[0].materialize(&body()).unwrap();
    for doc in &replicas[1..] {
        assert_eq!(doc.materialize(&body()).unwrap(), first);
    }
}
