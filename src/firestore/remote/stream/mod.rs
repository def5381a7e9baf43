use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_channel::{Receiver, Sender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::firestore::error::{internal_error, unavailable, FirestoreError, FirestoreResult};
use crate::platform::runtime;

pub mod persistent;

pub use persistent::{PersistentStream, StreamDelegate, StreamKind, StreamState, IDLE_TIMEOUT};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct StreamId(u32);

impl StreamId {
    pub fn value(&self) -> u32 {
        self.0
    }
}

/// Sent with the open frame so the peer can route the stream.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    /// `"Listen"` or `"Write"`.
    pub method: String,
    pub database: String,
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

#[derive(Clone, Debug)]
pub enum FrameKind {
    Open(StreamMetadata),
    Data(Vec<u8>),
    Close,
    Error(FirestoreError),
}

#[derive(Clone, Debug)]
pub struct TransportFrame {
    stream_id: StreamId,
    kind: FrameKind,
}

impl TransportFrame {
    pub fn new(stream_id: StreamId, kind: FrameKind) -> Self {
        Self { stream_id, kind }
    }

    pub fn stream_id(&self) -> StreamId {
        self.stream_id
    }

    pub fn kind(&self) -> &FrameKind {
        &self.kind
    }
}

/// Bidirectional frame pipe underneath all streams of one client.
#[async_trait]
pub trait StreamTransport: Send + Sync + 'static {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()>;
    async fn next(&self) -> FirestoreResult<TransportFrame>;
}

type StreamTable = Arc<Mutex<HashMap<StreamId, Sender<FrameKind>>>>;

/// Multiplexes logical streams over one [`StreamTransport`]. Streams opened by
/// the peer are handed out through [`MultiplexedConnection::accept`].
pub struct MultiplexedConnection {
    next_stream_id: AtomicU32,
    outbound_tx: Sender<TransportFrame>,
    streams: StreamTable,
    accepted: Receiver<(StreamMetadata, MultiplexedStream)>,
}

impl MultiplexedConnection {
    pub fn new(transport: Arc<dyn StreamTransport>) -> Self {
        let (outbound_tx, outbound_rx) = async_channel::unbounded();
        let (accept_tx, accept_rx) = async_channel::unbounded();
        let streams: StreamTable = Arc::new(Mutex::new(HashMap::new()));

        Self::start_outbound_loop(Arc::clone(&transport), outbound_rx);
        Self::start_inbound_loop(transport, Arc::clone(&streams), outbound_tx.clone(), accept_tx);

        Self {
            next_stream_id: AtomicU32::new(1),
            outbound_tx,
            streams,
            accepted: accept_rx,
        }
    }

    fn start_outbound_loop(transport: Arc<dyn StreamTransport>, outbound_rx: Receiver<TransportFrame>) {
        runtime::spawn_detached(async move {
            while let Ok(frame) = outbound_rx.recv().await {
                if let Err(err) = transport.send(frame).await {
                    log::warn!("multiplexed outbound loop terminated: {err}");
                    break;
                }
            }
        });
    }

    fn start_inbound_loop(
        transport: Arc<dyn StreamTransport>,
        streams: StreamTable,
        outbound_tx: Sender<TransportFrame>,
        accept_tx: Sender<(StreamMetadata, MultiplexedStream)>,
    ) {
        runtime::spawn_detached(async move {
            loop {
                let frame = match transport.next().await {
                    Ok(frame) => frame,
                    Err(err) => {
                        log::debug!("multiplexed inbound loop terminated: {err}");
                        break;
                    }
                };
                let stream_id = frame.stream_id();
                if let FrameKind::Open(metadata) = frame.kind() {
                    let (inbound_tx, inbound_rx) = async_channel::unbounded();
                    if let Ok(mut table) = streams.lock() {
                        table.insert(stream_id, inbound_tx);
                    }
                    let stream = MultiplexedStream {
                        id: stream_id,
                        outbound: outbound_tx.clone(),
                        inbound: inbound_rx,
                        streams: Arc::clone(&streams),
                    };
                    if accept_tx.send((metadata.clone(), stream)).await.is_err() {
                        log::debug!("no acceptor for stream {}", stream_id.value());
                    }
                    continue;
                }

                let sender = streams
                    .lock()
                    .ok()
                    .and_then(|table| table.get(&stream_id).cloned());
                let Some(sender) = sender else {
                    log::debug!("dropping frame for unknown stream {}", stream_id.value());
                    continue;
                };
                let terminal = matches!(frame.kind(), FrameKind::Close | FrameKind::Error(_));
                if sender.send(frame.kind().clone()).await.is_err() {
                    log::debug!("dropping inbound frame for closed stream {}", stream_id.value());
                }
                if terminal {
                    if let Ok(mut table) = streams.lock() {
                        table.remove(&stream_id);
                    }
                }
            }
            // The peer is gone; every open stream sees an error.
            let senders: Vec<Sender<FrameKind>> = streams
                .lock()
                .map(|mut table| table.drain().map(|(_, sender)| sender).collect())
                .unwrap_or_default();
            for sender in senders {
                let _ = sender
                    .send(FrameKind::Error(unavailable("connection to backend lost")))
                    .await;
            }
        });
    }

    pub async fn open_stream(&self, metadata: StreamMetadata) -> FirestoreResult<MultiplexedStream> {
        let stream_id = StreamId(self.next_stream_id.fetch_add(1, Ordering::SeqCst));
        let (inbound_tx, inbound_rx) = async_channel::unbounded();
        self.streams
            .lock()
            .map_err(|_| internal_error("stream table lock poisoned"))?
            .insert(stream_id, inbound_tx);
        self.outbound_tx
            .send(TransportFrame::new(stream_id, FrameKind::Open(metadata)))
            .await
            .map_err(|err| unavailable(format!("failed to queue open frame: {err}")))?;
        Ok(MultiplexedStream {
            id: stream_id,
            outbound: self.outbound_tx.clone(),
            inbound: inbound_rx,
            streams: Arc::clone(&self.streams),
        })
    }

    /// Next stream opened by the peer.
    pub async fn accept(&self) -> Option<(StreamMetadata, MultiplexedStream)> {
        self.accepted.recv().await.ok()
    }
}

pub struct MultiplexedStream {
    id: StreamId,
    outbound: Sender<TransportFrame>,
    inbound: Receiver<FrameKind>,
    streams: StreamTable,
}

impl MultiplexedStream {
    pub fn id(&self) -> StreamId {
        self.id
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Data(payload)))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue stream frame: {err}")))
    }

    /// Next payload; `None` once the peer closed the stream.
    pub async fn next(&self) -> Option<FirestoreResult<Vec<u8>>> {
        while let Ok(event) = self.inbound.recv().await {
            match event {
                FrameKind::Data(payload) => return Some(Ok(payload)),
                FrameKind::Close => return None,
                FrameKind::Error(err) => return Some(Err(err)),
                FrameKind::Open(_) => continue,
            }
        }
        None
    }

    pub async fn close(&self) -> FirestoreResult<()> {
        self.detach();
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Close))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue close frame: {err}")))
    }

    /// Fails the stream on the peer side with `error`.
    pub async fn fail(&self, error: FirestoreError) -> FirestoreResult<()> {
        self.detach();
        self.outbound
            .send(TransportFrame::new(self.id, FrameKind::Error(error)))
            .await
            .map_err(|err| unavailable(format!("failed to enqueue error frame: {err}")))
    }

    fn detach(&self) {
        if let Ok(mut table) = self.streams.lock() {
            table.remove(&self.id);
        }
        self.inbound.close();
    }
}

impl Drop for MultiplexedStream {
    fn drop(&mut self) {
        let attached = self
            .streams
            .lock()
            .map(|mut table| table.remove(&self.id).is_some())
            .unwrap_or(false);
        if attached {
            let _ = self
                .outbound
                .try_send(TransportFrame::new(self.id, FrameKind::Close));
        }
    }
}

/// Loopback transport pair used to connect a client to an in-process peer.
pub struct InMemoryTransport {
    inbound: Receiver<TransportFrame>,
    outbound: Sender<TransportFrame>,
}

impl InMemoryTransport {
    pub fn pair() -> (Arc<Self>, Arc<Self>) {
        let (left_tx, left_rx) = async_channel::unbounded();
        let (right_tx, right_rx) = async_channel::unbounded();

        let left = Arc::new(Self {
            inbound: left_rx,
            outbound: right_tx,
        });
        let right = Arc::new(Self {
            inbound: right_rx,
            outbound: left_tx,
        });
        (left, right)
    }

    /// Severs the pair. Both sides fail their pending reads.
    pub fn disconnect(&self) {
        self.inbound.close();
        self.outbound.close();
    }
}

#[async_trait]
impl StreamTransport for InMemoryTransport {
    async fn send(&self, frame: TransportFrame) -> FirestoreResult<()> {
        self.outbound
            .send(frame)
            .await
            .map_err(|err| unavailable(format!("loopback transport send failed: {err}")))
    }

    async fn next(&self) -> FirestoreResult<TransportFrame> {
        self.inbound
            .recv()
            .await
            .map_err(|err| unavailable(format!("loopback transport recv failed: {err}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata(method: &str) -> StreamMetadata {
        StreamMetadata {
            method: method.to_string(),
            database: "projects/p/databases/(default)".to_string(),
            auth_token: None,
            app_check_token: None,
        }
    }

    #[tokio::test]
    async fn accepted_stream_exchanges_payloads() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(left_transport);
        let server = MultiplexedConnection::new(right_transport);

        let client_stream = client.open_stream(metadata("Listen")).await.unwrap();
        let (meta, server_stream) = server.accept().await.unwrap();
        assert_eq!(meta.method, "Listen");

        client_stream.send(b"hello".to_vec()).await.unwrap();
        assert_eq!(server_stream.next().await.unwrap().unwrap(), b"hello");

        server_stream.send(b"world".to_vec()).await.unwrap();
        assert_eq!(client_stream.next().await.unwrap().unwrap(), b"world");
    }

    #[tokio::test]
    async fn closing_and_failing_streams_reach_the_peer() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let client = MultiplexedConnection::new(left_transport);
        let server = MultiplexedConnection::new(right_transport);

        let first = client.open_stream(metadata("Write")).await.unwrap();
        let (_, first_peer) = server.accept().await.unwrap();
        first.close().await.unwrap();
        assert!(first_peer.next().await.is_none());

        let second = client.open_stream(metadata("Write")).await.unwrap();
        let (_, second_peer) = server.accept().await.unwrap();
        second_peer.fail(unavailable("backend restarting")).await.unwrap();
        let err = second.next().await.unwrap().unwrap_err();
        assert_eq!(err.code, crate::firestore::error::FirestoreErrorCode::Unavailable);
    }
}
