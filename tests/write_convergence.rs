mod support;

use std::time::Duration;

use firestore_offline_sync::firestore::model::{
    FieldMask, FieldPath, MutableDocument, Mutation, MutationResult, Timestamp,
};
use firestore_offline_sync::firestore::remote::{TargetChangeState, WriteResponse};
use firestore_offline_sync::firestore::value::MapValue;
use firestore_offline_sync::firestore::{FirestoreClient, FirestoreErrorCode, ListenOptions};
use support::*;

fn acknowledge(count: usize, version: i64) -> WriteResponse {
    WriteResponse {
        stream_token: b"token-2".to_vec(),
        commit_version: Timestamp::new(version, 0),
        write_results: (0..count)
            .map(|_| MutationResult {
                version: Timestamp::new(version, 0),
                transform_results: Vec::new(),
            })
            .collect(),
    }
}

/// Polls the cache until the document at `path` holds `expected`.
async fn wait_for_cached(client: &FirestoreClient, path: &str, expected: &MapValue) -> MutableDocument {
    within(async {
        loop {
            if let Ok(Some(document)) = client.get_document_from_cache(key(path)).await {
                if document.data() == expected {
                    return document;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
}

#[tokio::test]
async fn acknowledged_write_converges_with_watch() {
    let backend = FakeBackend::new();
    let client = FirestoreClient::new(backend.config()).await.unwrap();
    let options = ListenOptions {
        include_metadata_changes: true,
        ..ListenOptions::default()
    };
    let mut registration = client.listen(rooms(), options).await.unwrap();

    let watch = backend.next_listen_stream().await;
    let (target_id, query) = watch.expect_add_target().await;
    assert_eq!(query.path(), rooms().path());
    watch
        .send_all(vec![
            target_change(TargetChangeState::Add, vec![target_id]),
            document_change(found("rooms/a", 1, fields(&[("n", 1)])), vec![target_id]),
            current(target_id, b"resume-1"),
            global_snapshot(1),
        ])
        .await;
    let synced = next_matching(&mut registration, |snapshot| !snapshot.from_cache).await;
    assert_eq!(keys_of(&synced), vec!["rooms/a"]);

    let writer = client.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("rooms/b"), fields(&[("n", 2)]))])
            .await
    });
    let latency_compensated =
        next_matching(&mut registration, |snapshot| snapshot.documents.contains(&key("rooms/b"))).await;
    assert!(latency_compensated.has_pending_writes());
    assert_eq!(keys_of(&latency_compensated), vec!["rooms/a", "rooms/b"]);

    let writes = backend.next_write_stream().await;
    writes.complete_handshake(b"token-1").await;
    let request = writes.next_request().await;
    assert_eq!(request.stream_token.as_deref(), Some(&b"token-1"[..]));
    assert_eq!(request.writes.len(), 1);
    writes.send(acknowledge(1, 2)).await;
    within(write).await.unwrap().unwrap();

    watch
        .send_all(vec![
            document_change(found("rooms/b", 2, fields(&[("n", 2)])), vec![target_id]),
            global_snapshot(2),
        ])
        .await;
    let converged = next_matching(&mut registration, |snapshot| {
        !snapshot.from_cache && !snapshot.has_pending_writes() && snapshot.documents.len() == 2
    })
    .await;
    let b = converged.documents.get(&key("rooms/b")).unwrap();
    assert_eq!(b.data(), &fields(&[("n", 2)]));

    let cached = client.get_document_from_cache(key("rooms/b")).await.unwrap().unwrap();
    assert_eq!(cached.version(), Timestamp::new(2, 0));
    assert!(!cached.has_pending_writes());

    client.terminate().await.unwrap();
}

#[tokio::test]
async fn offline_set_then_patch_converges_after_acknowledgement() {
    let backend = FakeBackend::new();
    let client = FirestoreClient::new(backend.config()).await.unwrap();
    client.disable_network().await.unwrap();

    let set_writer = client.clone();
    let set = tokio::spawn(async move {
        set_writer
            .write(vec![Mutation::set(key("rooms/a"), fields(&[("x", 1)]))])
            .await
    });
    wait_for_cached(&client, "rooms/a", &fields(&[("x", 1)])).await;

    let patch_writer = client.clone();
    let patch = tokio::spawn(async move {
        let mask = FieldMask::new([FieldPath::from_dot_separated("y").unwrap()]);
        patch_writer
            .write(vec![Mutation::patch(key("rooms/a"), fields(&[("y", 2)]), mask)])
            .await
    });
    let expected = fields(&[("x", 1), ("y", 2)]);
    let local = wait_for_cached(&client, "rooms/a", &expected).await;
    assert!(local.has_local_mutations());

    let from_cache = client.get_documents_from_cache(rooms()).await.unwrap();
    assert_eq!(keys_of(&from_cache), vec!["rooms/a"]);
    assert!(from_cache.has_pending_writes());

    client.enable_network().await.unwrap();
    let writes = backend.next_write_stream().await;
    writes.complete_handshake(b"token-1").await;
    let mut acknowledged = 0;
    while acknowledged < 2 {
        let request = writes.next_request().await;
        acknowledged += request.writes.len();
        writes.send(acknowledge(request.writes.len(), 7)).await;
    }
    within(set).await.unwrap().unwrap();
    within(patch).await.unwrap().unwrap();

    let committed = client.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert_eq!(committed.data(), &expected);
    assert_eq!(committed.version(), Timestamp::new(7, 0));
    assert!(!committed.has_local_mutations());

    client.terminate().await.unwrap();
}

#[tokio::test]
async fn terminated_client_rejects_new_work() {
    let backend = FakeBackend::new();
    let client = FirestoreClient::new(backend.config()).await.unwrap();
    client.terminate().await.unwrap();
    client.terminate().await.unwrap();

    let err = client
        .write(vec![Mutation::set(key("rooms/a"), fields(&[("x", 1)]))])
        .await
        .unwrap_err();
    assert_eq!(err.code, FirestoreErrorCode::FailedPrecondition);
}
