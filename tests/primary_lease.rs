mod support;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use firestore_offline_sync::firestore::local::{
    LeaseManager, LeaseSettings, ManualClock, MemoryPersistence, SharedClientChannel,
};
use firestore_offline_sync::firestore::model::{DatabaseId, Mutation, MutationResult, Timestamp};
use firestore_offline_sync::firestore::remote::datastore::StreamingFuture;
use firestore_offline_sync::firestore::remote::{StreamCredentials, StreamHandle, StreamingDatastore, WriteResponse};
use firestore_offline_sync::firestore::{ClientConfig, FirestoreClient, FirestoreResult, ListenOptions, PersistenceSettings};
use firestore_offline_sync::util::TimerId;
use futures::FutureExt;
use support::*;

const START_MS: i64 = 1_700_000_000_000;

fn attached(
    backend: &FakeBackend,
    persistence: MemoryPersistence,
    channel: &SharedClientChannel,
    clock: Arc<ManualClock>,
) -> ClientConfig {
    let mut config = backend.config();
    config.persistence = PersistenceSettings::Shared(Arc::new(persistence));
    config.shared_channel = channel.clone();
    config.clock = clock;
    config
}

/// Records, every time a stream is closed, which context holds the owner
/// row at that moment.
struct OwnerAtClose {
    inner: Arc<dyn StreamingDatastore>,
    observer: Arc<LeaseManager>,
    owners: Arc<Mutex<Vec<Option<String>>>>,
}

impl OwnerAtClose {
    fn wrap(&self, handle: Arc<dyn StreamHandle>) -> Arc<dyn StreamHandle> {
        Arc::new(RecordingHandle {
            inner: handle,
            observer: Arc::clone(&self.observer),
            owners: Arc::clone(&self.owners),
        })
    }
}

impl StreamingDatastore for OwnerAtClose {
    fn database_id(&self) -> &DatabaseId {
        self.inner.database_id()
    }

    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        async move {
            let handle = self.inner.open_listen_stream(credentials).await?;
            Ok(self.wrap(handle))
        }
        .boxed()
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        async move {
            let handle = self.inner.open_write_stream(credentials).await?;
            Ok(self.wrap(handle))
        }
        .boxed()
    }
}

struct RecordingHandle {
    inner: Arc<dyn StreamHandle>,
    observer: Arc<LeaseManager>,
    owners: Arc<Mutex<Vec<Option<String>>>>,
}

impl StreamHandle for RecordingHandle {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        self.inner.send(payload)
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        self.inner.next()
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let owner = self.observer.current_owner().unwrap();
        self.owners.lock().unwrap().push(owner);
        self.inner.close()
    }
}

#[tokio::test]
async fn demoted_primary_closes_streams_before_giving_up_lease() {
    let store = MemoryPersistence::new("context-a");
    let channel = SharedClientChannel::new();
    let clock = Arc::new(ManualClock::new(START_MS));
    let observer = Arc::new(LeaseManager::new(
        Arc::new(store.attach("observer")),
        clock.clone(),
        LeaseSettings::default(),
    ));
    let owners = Arc::new(Mutex::new(Vec::new()));

    let backend_a = FakeBackend::new();
    let mut config_a = attached(&backend_a, store.clone(), &channel, clock.clone());
    config_a.datastore = Arc::new(OwnerAtClose {
        inner: Arc::clone(&config_a.datastore),
        observer: Arc::clone(&observer),
        owners: Arc::clone(&owners),
    });
    let a = FirestoreClient::new(config_a).await.unwrap();
    let backend_b = FakeBackend::new();
    let b = FirestoreClient::new(attached(&backend_b, store.attach("context-b"), &channel, clock))
        .await
        .unwrap();
    assert!(a.is_primary());

    let _registration = a.listen(rooms(), ListenOptions::default()).await.unwrap();
    let watch = backend_a.next_listen_stream().await;
    watch.expect_add_target().await;

    // A foreground context is waiting, so the background one steps down.
    a.set_in_foreground(false).await.unwrap();
    assert!(!a.is_primary());
    let recorded = owners.lock().unwrap().clone();
    assert!(!recorded.is_empty());
    assert!(recorded.iter().all(|owner| owner.as_deref() == Some("context-a")));
    assert_eq!(observer.current_owner().unwrap(), None);

    b.queue().run_delays_until(TimerId::ClientMetadataRefresh).await.unwrap();
    assert!(b.is_primary());

    b.terminate().await.unwrap();
    a.terminate().await.unwrap();
}

#[tokio::test]
async fn secondary_takes_over_once_primary_lease_expires() {
    let store = MemoryPersistence::new("context-a");
    let channel = SharedClientChannel::new();

    // Context A never refreshes on its own and its clock stands still, so
    // once B's clock moves on A looks like a context that died.
    let backend_a = FakeBackend::new();
    let mut config_a = attached(&backend_a, store.clone(), &channel, Arc::new(ManualClock::new(START_MS)));
    config_a.lease = LeaseSettings {
        refresh_interval: Duration::from_secs(3600),
        ..LeaseSettings::default()
    };
    let a = FirestoreClient::new(config_a).await.unwrap();
    assert!(a.is_primary());

    let clock_b = Arc::new(ManualClock::new(START_MS));
    let backend_b = FakeBackend::new();
    let b = FirestoreClient::new(attached(&backend_b, store.attach("context-b"), &channel, clock_b.clone()))
        .await
        .unwrap();
    assert!(!b.is_primary());

    let _registration = b.listen(rooms(), ListenOptions::default()).await.unwrap();
    assert!(backend_b.try_next_listen_stream(Duration::from_millis(200)).await.is_none());

    drop(a);
    clock_b.advance(LeaseSettings::default().max_age + Duration::from_secs(1));
    b.queue().run_delays_until(TimerId::ClientMetadataRefresh).await.unwrap();
    assert!(b.is_primary());

    let watch = backend_b.next_listen_stream().await;
    let (_, query) = watch.expect_add_target().await;
    assert_eq!(query.path(), rooms().path());

    // Staying primary must not restart the network.
    clock_b.advance(Duration::from_secs(1));
    b.queue().run_delays_until(TimerId::ClientMetadataRefresh).await.unwrap();
    assert!(b.is_primary());
    assert!(backend_b.try_next_listen_stream(Duration::from_millis(200)).await.is_none());

    b.terminate().await.unwrap();
}

#[tokio::test]
async fn secondary_write_is_sent_by_primary() {
    let store = MemoryPersistence::new("context-a");
    let channel = SharedClientChannel::new();
    let clock = Arc::new(ManualClock::new(START_MS));

    let backend_a = FakeBackend::new();
    let a = FirestoreClient::new(attached(&backend_a, store.clone(), &channel, clock.clone()))
        .await
        .unwrap();
    let backend_b = FakeBackend::new();
    let b = FirestoreClient::new(attached(&backend_b, store.attach("context-b"), &channel, clock))
        .await
        .unwrap();
    assert!(a.is_primary());
    assert!(!b.is_primary());

    let writer = b.clone();
    let write = tokio::spawn(async move {
        writer
            .write(vec![Mutation::set(key("rooms/a"), fields(&[("x", 1)]))])
            .await
    });

    let writes = backend_a.next_write_stream().await;
    writes.complete_handshake(b"token-1").await;
    let request = writes.next_request().await;
    assert_eq!(request.writes.len(), 1);
    assert_eq!(request.writes[0].key, key("rooms/a"));
    writes
        .send(WriteResponse {
            stream_token: b"token-2".to_vec(),
            commit_version: Timestamp::new(3, 0),
            write_results: vec![MutationResult {
                version: Timestamp::new(3, 0),
                transform_results: Vec::new(),
            }],
        })
        .await;

    // The secondary learns about the acknowledgement through the shared
    // channel and resolves its own caller.
    within(write).await.unwrap().unwrap();
    let committed = b.get_document_from_cache(key("rooms/a")).await.unwrap().unwrap();
    assert_eq!(committed.version(), Timestamp::new(3, 0));

    b.terminate().await.unwrap();
    a.terminate().await.unwrap();
}
