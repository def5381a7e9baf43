use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use crate::firestore::error::{invalid_argument, FirestoreError, FirestoreResult};
use crate::firestore::local::target_data::TargetData;
use crate::firestore::model::Timestamp;
use crate::firestore::remote::network::{NetworkLayer, StreamKind};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, StreamDelegate};
use crate::firestore::remote::watch_change::{decode_watch_change, WatchChange};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffConfig;

/// Receives decoded listen stream events on the async queue.
#[async_trait]
pub trait WatchStreamListener: Send + Sync + 'static {
    async fn on_watch_open(&self) -> FirestoreResult<()>;

    /// `snapshot_version` is non-MIN only for a global target change that
    /// marks a consistent snapshot.
    async fn on_watch_change(&self, change: WatchChange, snapshot_version: Timestamp) -> FirestoreResult<()>;

    async fn on_watch_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

/// The listen RPC: adds and removes targets and streams back their changes.
#[derive(Clone)]
pub struct WatchStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
}

struct WatchStreamAdapter {
    serializer: JsonProtoSerializer,
    listener: Arc<dyn WatchStreamListener>,
}

impl WatchStream {
    pub fn new(
        queue: AsyncQueue,
        network: NetworkLayer,
        serializer: JsonProtoSerializer,
        listener: Arc<dyn WatchStreamListener>,
        backoff: BackoffConfig,
    ) -> Self {
        let adapter = Arc::new(WatchStreamAdapter {
            serializer: serializer.clone(),
            listener,
        });
        Self {
            stream: PersistentStream::new(StreamKind::Listen, queue, network, adapter, backoff),
            serializer,
        }
    }

    pub fn start(&self) {
        self.stream.start();
    }

    pub async fn stop(&self) -> FirestoreResult<()> {
        self.stream.stop().await
    }

    pub fn is_started(&self) -> bool {
        self.stream.is_started()
    }

    pub fn is_open(&self) -> bool {
        self.stream.is_open()
    }

    pub fn mark_idle(&self) {
        self.stream.mark_idle();
    }

    pub fn inhibit_backoff(&self) {
        self.stream.inhibit_backoff();
    }

    /// Registers a target; the backend answers with an `ADD` target change.
    pub async fn watch(&self, target_data: &TargetData) -> FirestoreResult<()> {
        let request = self.serializer.encode_listen_request(target_data);
        log::debug!("watch target {}", target_data.target_id);
        self.stream.send(encode_frame(&request)?).await
    }

    pub async fn unwatch(&self, target_id: i32) -> FirestoreResult<()> {
        let request = self.serializer.encode_unwatch_request(target_id);
        log::debug!("unwatch target {target_id}");
        self.stream.send(encode_frame(&request)?).await
    }
}

pub(crate) fn encode_frame(value: &JsonValue) -> FirestoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|err| invalid_argument(format!("Failed to encode request: {err}")))
}

pub(crate) fn decode_frame(payload: &[u8]) -> FirestoreResult<JsonValue> {
    serde_json::from_slice(payload).map_err(|err| invalid_argument(format!("Malformed stream payload: {err}")))
}

/// The global snapshot version carried by a target change for all targets.
fn version_from_listen_response(serializer: &JsonProtoSerializer, response: &JsonValue) -> FirestoreResult<Timestamp> {
    let Some(target_change) = response.get("targetChange") else {
        return Ok(Timestamp::MIN);
    };
    let has_targets = target_change
        .get("targetIds")
        .and_then(JsonValue::as_array)
        .is_some_and(|ids| !ids.is_empty());
    if has_targets {
        return Ok(Timestamp::MIN);
    }
    match target_change.get("readTime") {
        Some(read_time) => serializer.decode_timestamp(read_time),
        None => Ok(Timestamp::MIN),
    }
}

#[async_trait]
impl StreamDelegate for WatchStreamAdapter {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_watch_open().await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response = decode_frame(&payload)?;
        let Some(change) = decode_watch_change(&self.serializer, &response)? else {
            log::debug!("ignoring unknown listen response");
            return Ok(());
        };
        let snapshot_version = version_from_listen_response(&self.serializer, &response)?;
        self.listener.on_watch_change(change, snapshot_version).await
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_watch_close(error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::core::query::Query;
    use crate::firestore::local::target_data::TargetPurpose;
    use crate::firestore::model::{DatabaseId, ResourcePath, User};
    use crate::firestore::remote::datastore::{StreamingDatastore, StreamingDatastoreImpl};
    use crate::firestore::remote::network::{CredentialsProvider, StaticCredentialsProvider};
    use crate::firestore::remote::serializer::ListenRequest;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::remote::watch_change::{encode_watch_change, TargetChangeState, WatchTargetChange};
    use async_channel::Sender;

    struct Recorder {
        events: Sender<(WatchChange, Timestamp)>,
        opened: Sender<()>,
    }

    #[async_trait]
    impl WatchStreamListener for Recorder {
        async fn on_watch_open(&self) -> FirestoreResult<()> {
            let _ = self.opened.send(()).await;
            Ok(())
        }

        async fn on_watch_change(&self, change: WatchChange, snapshot_version: Timestamp) -> FirestoreResult<()> {
            let _ = self.events.send((change, snapshot_version)).await;
            Ok(())
        }

        async fn on_watch_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn sends_targets_and_reports_global_snapshots() {
        let database_id = DatabaseId::default("demo");
        let serializer = JsonProtoSerializer::new(database_id.clone());
        let (left, right) = InMemoryTransport::pair();
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(
            database_id,
            Arc::new(MultiplexedConnection::new(left)),
        ));
        let credentials: Arc<dyn CredentialsProvider> =
            Arc::new(StaticCredentialsProvider::new(User::unauthenticated(), None));
        let network = NetworkLayer::builder(datastore, credentials).build();
        let server = MultiplexedConnection::new(right);

        let queue = AsyncQueue::new();
        let (events_tx, events_rx) = async_channel::unbounded();
        let (opened_tx, opened_rx) = async_channel::unbounded();
        let stream = WatchStream::new(
            queue.clone(),
            network,
            serializer.clone(),
            Arc::new(Recorder {
                events: events_tx,
                opened: opened_tx,
            }),
            BackoffConfig::default(),
        );

        let starter = stream.clone();
        queue
            .enqueue(move || async move {
                starter.start();
                Ok(())
            })
            .await
            .unwrap();
        let (_, peer) = server.accept().await.unwrap();
        opened_rx.recv().await.unwrap();

        let query = Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap();
        let target_data = TargetData::new(query.to_target(), 2, TargetPurpose::Listen, 1);
        let watcher = stream.clone();
        queue
            .enqueue(move || async move { watcher.watch(&target_data).await })
            .await
            .unwrap();
        let request = decode_frame(&peer.next().await.unwrap().unwrap()).unwrap();
        match serializer.decode_listen_request(&request).unwrap() {
            ListenRequest::AddTarget { target_id, .. } => assert_eq!(target_id, 2),
            other => panic!("unexpected request {other:?}"),
        }

        let global = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(Timestamp::new(7, 0)),
        );
        peer.send(encode_frame(&encode_watch_change(&serializer, &global)).unwrap())
            .await
            .unwrap();
        let (change, version) = events_rx.recv().await.unwrap();
        assert_eq!(change, global);
        assert_eq!(version, Timestamp::new(7, 0));

        let scoped = WatchChange::TargetChange(
            WatchTargetChange::new(TargetChangeState::Current, vec![2]).with_read_time(Timestamp::new(8, 0)),
        );
        peer.send(encode_frame(&encode_watch_change(&serializer, &scoped)).unwrap())
            .await
            .unwrap();
        let (_, version) = events_rx.recv().await.unwrap();
        assert!(version.is_min());
    }
}
