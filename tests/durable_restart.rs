mod support;

use std::path::PathBuf;

use firestore_offline_sync::firestore::model::Mutation;
use firestore_offline_sync::firestore::{FirestoreClient, PersistenceSettings};
use rand::Rng;
use support::*;

fn scratch_file() -> PathBuf {
    let suffix: u64 = rand::thread_rng().gen();
    std::env::temp_dir().join(format!("offline-sync-{suffix:016x}")).join("store.json")
}

#[tokio::test]
async fn pending_write_survives_restart_and_is_sent_by_next_client() {
    let path = scratch_file();

    let first_backend = FakeBackend::new();
    let mut config = first_backend.config();
    config.persistence = PersistenceSettings::File { path: path.clone() };
    let first = FirestoreClient::new(config).await.unwrap();
    first.disable_network().await.unwrap();

    let writer = first.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("rooms/a"), fields(&[("x", 1)]))])
            .await
    });
    within(async {
        while first.get_document_from_cache(key("rooms/a")).await.ok().flatten().is_none() {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    first.terminate().await.unwrap();
    write.abort();

    let second_backend = FakeBackend::new();
    let mut config = second_backend.config();
    config.persistence = PersistenceSettings::File { path: path.clone() };
    let second = FirestoreClient::new(config).await.unwrap();
    assert!(second.is_primary());

    let cached = second.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert_eq!(cached.data(), &fields(&[("x", 1)]));
    assert!(cached.has_local_mutations());

    let writes = second_backend.next_write_stream().await;
    writes.complete_handshake(b"token-1").await;
    let request = writes.next_request().await;
    assert_eq!(request.writes.len(), 1);
    assert_eq!(request.writes[0].key, key("rooms/a"));

    second.terminate().await.unwrap();
    if let Some(directory) = path.parent() {
        let _ = std::fs::remove_dir_all(directory);
    }
}
