use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{Mutation, MutationResult, Timestamp};
use crate::firestore::remote::network::{NetworkLayer, StreamKind};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::firestore::remote::stream::{PersistentStream, StreamDelegate};
use crate::firestore::remote::streams::listen::{decode_frame, encode_frame};
use crate::util::async_queue::AsyncQueue;
use crate::util::backoff::BackoffConfig;

/// Receives write stream events on the async queue.
#[async_trait]
pub trait WriteStreamListener: Send + Sync + 'static {
    /// The stream connected; the handshake has not been sent yet.
    async fn on_write_open(&self) -> FirestoreResult<()>;

    /// The backend accepted the handshake; mutations may be written now.
    async fn on_handshake_complete(&self) -> FirestoreResult<()>;

    async fn on_mutation_result(&self, commit_version: Timestamp, results: Vec<MutationResult>) -> FirestoreResult<()>;

    async fn on_write_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

#[derive(Default)]
struct WriteState {
    handshake_complete: bool,
    last_stream_token: Vec<u8>,
}

/// The write RPC. Every request and response carries a stream token; the
/// first exchange is a handshake that establishes it.
#[derive(Clone)]
pub struct WriteStream {
    stream: PersistentStream,
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteState>>,
}

struct WriteStreamAdapter {
    serializer: JsonProtoSerializer,
    state: Arc<Mutex<WriteState>>,
    listener: Arc<dyn WriteStreamListener>,
}

fn lock_state(state: &Mutex<WriteState>) -> FirestoreResult<MutexGuard<'_, WriteState>> {
    state
        .lock()
        .map_err(|_| internal_error("write stream state lock poisoned"))
}

impl WriteStream {
    pub fn new(
        queue: AsyncQueue,
        network: NetworkLayer,
        serializer: JsonProtoSerializer,
        listener: Arc<dyn WriteStreamListener>,
        backoff: BackoffConfig,
    ) -> Self {
        let state = Arc::new(Mutex::new(WriteState::default()));
        let adapter = Arc::new(WriteStreamAdapter {
            serializer: serializer.clone(),
            state: Arc::clone(&state),
            listener,
        });
        Self {
            stream: PersistentStream::new(StreamKind::Write, queue, network, adapter, backoff),
            serializer,
            state,
        }
    }

    /// Starting a new RPC forgets the previous handshake and token.
    pub fn start(&self) {
        if let Ok(mut state) = lock_state(&self.state) {
            state.handshake_complete = false;
            state.last_stream_token.clear();
        }
        self.stream.start();
    }

    /// Sends an empty write first when the handshake completed, so the
    /// backend can release the stream token.
    pub async fn stop(&self) -> FirestoreResult<()> {
        if self.stream.is_open() && self.handshake_complete() {
            if let Err(err) = self.write_mutations(&[]).await {
                log::debug!("final empty write failed: {err}");
            }
        }
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

    pub fn handshake_complete(&self) -> bool {
        lock_state(&self.state)
            .map(|state| state.handshake_complete)
            .unwrap_or(false)
    }

    pub fn last_stream_token(&self) -> Vec<u8> {
        lock_state(&self.state)
            .map(|state| state.last_stream_token.clone())
            .unwrap_or_default()
    }

    pub fn set_last_stream_token(&self, token: Vec<u8>) {
        if let Ok(mut state) = lock_state(&self.state) {
            state.last_stream_token = token;
        }
    }

    /// The first request on a fresh stream. It carries only the database name.
    pub async fn write_handshake(&self) -> FirestoreResult<()> {
        if self.handshake_complete() {
            return Err(failed_precondition("Handshake already completed"));
        }
        log::debug!("sending write stream handshake");
        self.stream
            .send(encode_frame(&self.serializer.encode_handshake())?)
            .await
    }

    pub async fn write_mutations(&self, mutations: &[Mutation]) -> FirestoreResult<()> {
        let token = {
            let state = lock_state(&self.state)?;
            if !state.handshake_complete {
                return Err(failed_precondition("Handshake must be complete before writing mutations"));
            }
            state.last_stream_token.clone()
        };
        let request = self.serializer.encode_write_request(&token, mutations);
        self.stream.send(encode_frame(&request)?).await
    }
}

#[async_trait]
impl StreamDelegate for WriteStreamAdapter {
    async fn on_open(&self) -> FirestoreResult<()> {
        self.listener.on_write_open().await
    }

    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let response = self.serializer.decode_write_response(&decode_frame(&payload)?)?;
        let was_handshake = {
            let mut state = lock_state(&self.state)?;
            state.last_stream_token = response.stream_token;
            let was_handshake = !state.handshake_complete;
            state.handshake_complete = true;
            was_handshake
        };
        if was_handshake {
            if !response.write_results.is_empty() {
                return Err(internal_error("Got mutation results for the handshake"));
            }
            self.listener.on_handshake_complete().await
        } else {
            self.listener
                .on_mutation_result(response.commit_version, response.write_results)
                .await
        }
    }

    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
        self.listener.on_write_close(error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::model::{DatabaseId, DocumentKey, FieldPath, User};
    use crate::firestore::remote::datastore::{StreamingDatastore, StreamingDatastoreImpl};
    use crate::firestore::remote::network::{CredentialsProvider, StaticCredentialsProvider};
    use crate::firestore::remote::serializer::WriteResponse;
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use crate::firestore::value::{FirestoreValue, MapValue};
    use async_channel::Sender;

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Handshake,
        Results(Timestamp, usize),
    }

    struct Recorder {
        events: Sender<Event>,
    }

    #[async_trait]
    impl WriteStreamListener for Recorder {
        async fn on_write_open(&self) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Open).await;
            Ok(())
        }

        async fn on_handshake_complete(&self) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Handshake).await;
            Ok(())
        }

        async fn on_mutation_result(&self, commit_version: Timestamp, results: Vec<MutationResult>) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Results(commit_version, results.len())).await;
            Ok(())
        }

        async fn on_write_close(&self, _error: Option<FirestoreError>) -> FirestoreResult<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn handshake_then_writes_carry_the_latest_token() {
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
        let (events_tx, events) = async_channel::unbounded();
        let stream = WriteStream::new(
            queue.clone(),
            network,
            serializer.clone(),
            Arc::new(Recorder { events: events_tx }),
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
        let (metadata, peer) = server.accept().await.unwrap();
        assert_eq!(metadata.method, "Write");
        assert_eq!(events.recv().await.unwrap(), Event::Open);

        let early = stream.clone();
        let rejected = queue
            .enqueue(move || async move { early.write_mutations(&[]).await })
            .await;
        assert!(rejected.is_err());

        let shaker = stream.clone();
        queue
            .enqueue(move || async move { shaker.write_handshake().await })
            .await
            .unwrap();
        let handshake = decode_frame(&peer.next().await.unwrap().unwrap()).unwrap();
        assert_eq!(handshake["database"], "projects/demo/databases/(default)");

        let reply = WriteResponse {
            stream_token: b"t1".to_vec(),
            commit_version: Timestamp::MIN,
            write_results: Vec::new(),
        };
        peer.send(encode_frame(&serializer.encode_write_response(&reply)).unwrap())
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Handshake);
        assert_eq!(stream.last_stream_token(), b"t1".to_vec());

        let mut data = MapValue::empty();
        data.set(&FieldPath::from_dot_separated("n").unwrap(), FirestoreValue::from_integer(1));
        let mutation = Mutation::set(DocumentKey::from_string("rooms/a").unwrap(), data);
        let writer = stream.clone();
        queue
            .enqueue(move || async move { writer.write_mutations(&[mutation]).await })
            .await
            .unwrap();
        let request = serializer
            .decode_write_request(&decode_frame(&peer.next().await.unwrap().unwrap()).unwrap())
            .unwrap();
        assert_eq!(request.stream_token, Some(b"t1".to_vec()));
        assert_eq!(request.writes.len(), 1);

        let ack = WriteResponse {
            stream_token: b"t2".to_vec(),
            commit_version: Timestamp::new(10, 0),
            write_results: vec![MutationResult {
                version: Timestamp::new(10, 0),
                transform_results: Vec::new(),
            }],
        };
        peer.send(encode_frame(&serializer.encode_write_response(&ack)).unwrap())
            .await
            .unwrap();
        assert_eq!(events.recv().await.unwrap(), Event::Results(Timestamp::new(10, 0), 1));
        assert_eq!(stream.last_stream_token(), b"t2".to_vec());
    }
}
