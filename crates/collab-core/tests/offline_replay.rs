//! Offline editing and reconnect reconciliation, end to end
//!
//! Runs full [`CollaborationService`] instances over the loopback
//! transport with redb persistence, using a paused tokio clock so
//! backoff delays elapse deterministically.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use collab_core::{
    CollabError, CollaborationService, DocId, FieldId, Intent, LoopbackTransport, Persistence,
    PositionRef, ReplicaId, SessionConfig, Storage, SyncState, UserId,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn service_with_storage(
    replica: &str,
    transport: &LoopbackTransport,
) -> (CollaborationService, Storage, TempDir) {
    let temp_dir = TempDir::new().unwrap();
    let storage = Storage::new(temp_dir.path().join("collab.redb")).unwrap();
    let service = CollaborationService::new(
        ReplicaId::new(replica),
        Arc::new(transport.clone()),
        Arc::new(storage.clone()),
        SessionConfig::default(),
    );
    (service, storage, temp_dir)
}

fn insert_end(content: &str) -> Intent {
    Intent::Insert {
        field: FieldId::new("body"),
        position: PositionRef::End,
        content: content.into(),
    }
}

/// Let spawned session actors drain their channels
async fn settle() {
    for _ in 0..50 {
        tokio::task::yield_now().await;
    }
}

#[tokio::test(start_paused = true)]
async fn queued_operations_replay_and_match_online_control() {
    init_tracing();
    let transport = LoopbackTransport::new();
    let (alpha, alpha_storage, _t1) = service_with_storage("alpha", &transport);
    let (beta, _s2, _t2) = service_with_storage("beta", &transport);
    let doc_id = DocId::new();

    alpha.join(&doc_id, &UserId::new("u1")).await.unwrap();
    beta.join(&doc_id, &UserId::new("u2")).await.unwrap();
    beta.set_online(&doc_id, true).await.unwrap();

    // A control pair that stays online throughout
    let control_transport = LoopbackTransport::new();
    let (ctl_writer, _s3, _t3) = service_with_storage("alpha", &control_transport);
    let (ctl_reader, _s4, _t4) = service_with_storage("beta", &control_transport);
    let ctl_doc = DocId::new();
    ctl_writer.join(&ctl_doc, &UserId::new("u1")).await.unwrap();
    ctl_reader.join(&ctl_doc, &UserId::new("u2")).await.unwrap();
    ctl_writer.set_online(&ctl_doc, true).await.unwrap();
    ctl_reader.set_online(&ctl_doc, true).await.unwrap();

    // Three edits while alpha is offline; same three online for control
    for content in ["a", "b", "c"] {
        alpha.submit_intent(&doc_id, insert_end(content)).await.unwrap();
        ctl_writer.submit_intent(&ctl_doc, insert_end(content)).await.unwrap();
    }
    settle().await;

    // Nothing reached beta yet; the queue is durable
    assert!(beta.materialize(&doc_id, FieldId::new("body")).await.is_err());
    assert_eq!(alpha_storage.load_queue(&doc_id).unwrap().len(), 3);

    // Reconnect: all three replay, are acknowledged, and leave the queue
    alpha.set_online(&doc_id, true).await.unwrap();
    settle().await;

    assert_eq!(alpha.sync_state(&doc_id).await.unwrap(), SyncState::Online);
    assert!(alpha_storage.load_queue(&doc_id).unwrap().is_empty());

    let replayed = beta.materialize(&doc_id, FieldId::new("body")).await.unwrap();
    let control = ctl_reader.materialize(&ctl_doc, FieldId::new("body")).await.unwrap();
    assert_eq!(replayed, control);
    assert_eq!(replayed, "abc");
}

#[tokio::test(start_paused = true)]
async fn transport_failure_backs_off_then_recovers() {
    init_tracing();
    let transport = LoopbackTransport::new();
    let (alpha, _s1, _t1) = service_with_storage("alpha", &transport);
    let (beta, _s2, _t2) = service_with_storage("beta", &transport);
    let doc_id = DocId::new();

    alpha.join(&doc_id, &UserId::new("u1")).await.unwrap();
    beta.join(&doc_id, &UserId::new("u2")).await.unwrap();
    beta.set_online(&doc_id, true).await.unwrap();

    let mut events = alpha.subscribe();
    alpha.submit_intent(&doc_id, insert_end("x")).await.unwrap();

    // Reconnect against a broken transport: replay degrades, state
    // stays off Online, and editing keeps working
    transport.set_failing(true);
    alpha.set_online(&doc_id, true).await.unwrap();
    settle().await;
    assert_ne!(alpha.sync_state(&doc_id).await.unwrap(), SyncState::Online);
    alpha.submit_intent(&doc_id, insert_end("y")).await.unwrap();

    let mut degraded = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, collab_core::CollabEvent::SyncDegraded { .. }) {
            degraded = true;
        }
    }
    assert!(degraded);

    // Transport heals; the armed retry fires after its backoff delay
    transport.set_failing(false);
    tokio::time::sleep(Duration::from_secs(60)).await;
    settle().await;

    assert_eq!(alpha.sync_state(&doc_id).await.unwrap(), SyncState::Online);
    assert_eq!(
        beta.materialize(&doc_id, FieldId::new("body")).await.unwrap(),
        "xy"
    );
}

#[tokio::test(start_paused = true)]
async fn offline_queue_survives_restart() {
    init_tracing();
    let transport = LoopbackTransport::new();
    let temp_dir = TempDir::new().unwrap();
    let storage = Storage::new(temp_dir.path().join("collab.redb")).unwrap();
    let doc_id = DocId::new();
    let user = UserId::new("u1");

    {
        let service = CollaborationService::new(
            ReplicaId::new("alpha"),
            Arc::new(transport.clone()),
            Arc::new(storage.clone()),
            SessionConfig::default(),
        );
        service.join(&doc_id, &user).await.unwrap();
        service.submit_intent(&doc_id, insert_end("saved")).await.unwrap();
        service.leave(&doc_id, &user).await.unwrap();
    }

    assert_eq!(storage.load_queue(&doc_id).unwrap().len(), 1);

    // A fresh process restores both the document and the queue
    let service = CollaborationService::new(
        ReplicaId::new("alpha"),
        Arc::new(transport.clone()),
        Arc::new(storage.clone()),
        SessionConfig::default(),
    );
    let (beta, _s2, _t2) = service_with_storage("beta", &transport);

    service.join(&doc_id, &user).await.unwrap();
    beta.join(&doc_id, &UserId::new("u2")).await.unwrap();
    beta.set_online(&doc_id, true).await.unwrap();

    assert_eq!(
        service.materialize(&doc_id, FieldId::new("body")).await.unwrap(),
        "saved"
    );

    service.set_online(&doc_id, true).await.unwrap();
    settle().await;

    assert!(storage.load_queue(&doc_id).unwrap().is_empty());
    assert_eq!(
        beta.materialize(&doc_id, FieldId::new("body")).await.unwrap(),
        "saved"
    );
}

#[tokio::test(start_paused = true)]
async fn quota_exceeded_surfaces_without_blocking_edits() {
    init_tracing();
    let transport = LoopbackTransport::new();
    let temp_dir = TempDir::new().unwrap();
    let storage = Storage::new(temp_dir.path().join("collab.redb")).unwrap();
    let config = SessionConfig {
        sync: collab_core::SyncConfig {
            queue_capacity: 2,
            ..Default::default()
        },
        ..Default::default()
    };
    let service = CollaborationService::new(
        ReplicaId::new("alpha"),
        Arc::new(transport),
        Arc::new(storage),
        config,
    );
    let doc_id = DocId::new();
    service.join(&doc_id, &UserId::new("u1")).await.unwrap();

    service.submit_intent(&doc_id, insert_end("a")).await.unwrap();
    service.submit_intent(&doc_id, insert_end("b")).await.unwrap();

    // The third edit overflows the queue; the submit reports it but the
    // optimistic local apply already happened
    let result = service.submit_intent(&doc_id, insert_end("c")).await;
    assert!(matches!(result, Err(CollabError::QuotaExceeded { .. })));
    assert_eq!(
        service.materialize(&doc_id, FieldId::new("body")).await.unwrap(),
        "abc"
    );
}

#[tokio::test(start_paused = true)]
async fn reconcile_pauses_when_connectivity_drops_again() {
    init_tracing();
    let transport = LoopbackTransport::new();
    let (alpha, alpha_storage, _t1) = service_with_storage("alpha", &transport);
    let doc_id = DocId::new();
    alpha.join(&doc_id, &UserId::new("u1")).await.unwrap();

    alpha.submit_intent(&doc_id, insert_end("q")).await.unwrap();

    // Replay stalls against a failing transport, then connectivity is
    // reported lost before the retry fires
    transport.set_failing(true);
    alpha.set_online(&doc_id, true).await.unwrap();
    settle().await;
    alpha.set_online(&doc_id, false).await.unwrap();

    assert_eq!(alpha.sync_state(&doc_id).await.unwrap(), SyncState::Offline);
    // The unacknowledged item is still queued for the next attempt
    assert_eq!(alpha_storage.load_queue(&doc_id).unwrap().len(), 1);
}
