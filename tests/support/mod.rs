#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use firestore_offline_sync::firestore::core::{ListenerRegistration, ViewSnapshot};
use firestore_offline_sync::firestore::model::{
    DatabaseId, DocumentKey, FieldPath, MutableDocument, ResourcePath, Timestamp,
};
use firestore_offline_sync::firestore::remote::watch_change::encode_watch_change;
use firestore_offline_sync::firestore::remote::{
    DocumentWatchChange, InMemoryTransport, JsonProtoSerializer, ListenRequest, MultiplexedConnection,
    MultiplexedStream, StreamingDatastore, StreamingDatastoreImpl, TargetChangeState, WatchChange,
    WatchTargetChange, WriteRequest, WriteResponse,
};
use firestore_offline_sync::firestore::value::{FirestoreValue, MapValue};
use firestore_offline_sync::firestore::{ClientConfig, Query};
use futures::StreamExt;

pub const TIMEOUT: Duration = Duration::from_secs(5);

pub fn database_id() -> DatabaseId {
    DatabaseId::default("offline-sync-test")
}

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).unwrap()
}

pub fn rooms() -> Query {
    Query::collection(ResourcePath::from_string("rooms").unwrap()).unwrap()
}

pub fn fields(entries: &[(&str, i64)]) -> MapValue {
    let mut data = MapValue::empty();
    for (field, value) in entries {
        data.set(&FieldPath::from_dot_separated(field).unwrap(), FirestoreValue::from_integer(*value));
    }
    data
}

pub fn found(path: &str, version: i64, data: MapValue) -> MutableDocument {
    MutableDocument::new_found_document(key(path), Timestamp::new(version, 0), data)
}

pub fn target_change(state: TargetChangeState, target_ids: Vec<i32>) -> WatchChange {
    WatchChange::TargetChange(WatchTargetChange::new(state, target_ids))
}

pub fn current(target_id: i32, resume_token: &[u8]) -> WatchChange {
    WatchChange::TargetChange(
        WatchTargetChange::new(TargetChangeState::Current, vec![target_id]).with_resume_token(resume_token.to_vec()),
    )
}

/// Closes a consistent snapshot at `version` across every target.
pub fn global_snapshot(version: i64) -> WatchChange {
    WatchChange::TargetChange(
        WatchTargetChange::new(TargetChangeState::NoChange, Vec::new()).with_read_time(Timestamp::new(version, 0)),
    )
}

pub fn document_change(document: MutableDocument, target_ids: Vec<i32>) -> WatchChange {
    WatchChange::Document(DocumentWatchChange {
        updated_target_ids: target_ids,
        removed_target_ids: Vec::new(),
        key: document.key().clone(),
        document: Some(document),
    })
}

pub fn keys_of(snapshot: &ViewSnapshot) -> Vec<String> {
    snapshot.documents.keys().map(|key| key.to_string()).collect()
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("timed out waiting for the client")
}

/// Pulls snapshots until one satisfies `predicate`.
pub async fn next_matching<P>(registration: &mut ListenerRegistration, predicate: P) -> ViewSnapshot
where
    P: Fn(&ViewSnapshot) -> bool,
{
    within(async {
        loop {
            let snapshot = registration
                .next()
                .await
                .expect("listener closed")
                .expect("listener failed");
            if predicate(&snapshot) {
                return snapshot;
            }
        }
    })
    .await
}

/// In-process backend peer. Every stream the client opens is handed out
/// in order through [`FakeBackend::next_listen_stream`] or
/// [`FakeBackend::next_write_stream`].
pub struct FakeBackend {
    serializer: JsonProtoSerializer,
    listen_streams: async_channel::Receiver<MultiplexedStream>,
    write_streams: async_channel::Receiver<MultiplexedStream>,
    datastore: Arc<dyn StreamingDatastore>,
}

impl FakeBackend {
    pub fn new() -> Self {
        let (client_side, server_side) = InMemoryTransport::pair();
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(
            database_id(),
            Arc::new(MultiplexedConnection::new(client_side)),
        ));
        let server = MultiplexedConnection::new(server_side);
        let (listen_tx, listen_rx) = async_channel::unbounded();
        let (write_tx, write_rx) = async_channel::unbounded();
        tokio::spawn(async move {
            while let Some((metadata, stream)) = server.accept().await {
                let sender = if metadata.method == "Listen" { &listen_tx } else { &write_tx };
                if sender.send(stream).await.is_err() {
                    break;
                }
            }
        });
        Self {
            serializer: JsonProtoSerializer::new(database_id()),
            listen_streams: listen_rx,
            write_streams: write_rx,
            datastore,
        }
    }

    pub fn config(&self) -> ClientConfig {
        ClientConfig::new(database_id(), Arc::clone(&self.datastore))
    }

    pub async fn next_listen_stream(&self) -> ListenPeer {
        let stream = within(self.listen_streams.recv()).await.unwrap();
        ListenPeer {
            serializer: self.serializer.clone(),
            stream,
        }
    }

    pub async fn next_write_stream(&self) -> WritePeer {
        let stream = within(self.write_streams.recv()).await.unwrap();
        WritePeer {
            serializer: self.serializer.clone(),
            stream,
        }
    }

    /// A listen stream opened within `wait`, if any.
    pub async fn try_next_listen_stream(&self, wait: Duration) -> Option<ListenPeer> {
        let stream = tokio::time::timeout(wait, self.listen_streams.recv()).await.ok()?.ok()?;
        Some(ListenPeer {
            serializer: self.serializer.clone(),
            stream,
        })
    }
}

pub struct ListenPeer {
    serializer: JsonProtoSerializer,
    stream: MultiplexedStream,
}

impl ListenPeer {
    pub async fn next_request(&self) -> ListenRequest {
        let payload = within(self.stream.next()).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        self.serializer.decode_listen_request(&value).unwrap()
    }

    /// Reads the next request and returns the id of the target it adds.
    pub async fn expect_add_target(&self) -> (i32, Query) {
        match self.next_request().await {
            ListenRequest::AddTarget { target_id, query, .. } => (target_id, query),
            other => panic!("expected an added target, got {other:?}"),
        }
    }

    pub async fn send(&self, change: WatchChange) {
        let payload = serde_json::to_vec(&encode_watch_change(&self.serializer, &change)).unwrap();
        self.stream.send(payload).await.unwrap();
    }

    pub async fn send_all(&self, changes: Vec<WatchChange>) {
        for change in changes {
            self.send(change).await;
        }
    }
}

pub struct WritePeer {
    serializer: JsonProtoSerializer,
    stream: MultiplexedStream,
}

impl WritePeer {
    pub async fn next_request(&self) -> WriteRequest {
        let payload = within(self.stream.next()).await.unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&payload).unwrap();
        self.serializer.decode_write_request(&value).unwrap()
    }

    pub async fn send(&self, response: WriteResponse) {
        let payload = serde_json::to_vec(&self.serializer.encode_write_response(&response)).unwrap();
        self.stream.send(payload).await.unwrap();
    }

    /// Answers the handshake with `stream_token`.
    pub async fn complete_handshake(&self, stream_token: &[u8]) {
        let handshake = self.next_request().await;
        assert!(handshake.writes.is_empty(), "handshake must not carry writes");
        self.send(WriteResponse {
            stream_token: stream_token.to_vec(),
            commit_version: Timestamp::MIN,
            write_results: Vec::new(),
        })
        .await;
    }
}
