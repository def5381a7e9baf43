use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use async_trait::async_trait;

use crate::firestore::error::{
    failed_precondition, internal_error, FirestoreError, FirestoreErrorCode, FirestoreResult,
};
use crate::firestore::remote::datastore::StreamHandle;
use crate::firestore::remote::network::NetworkLayer;
pub use crate::firestore::remote::network::StreamKind;
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::{BackoffConfig, ExponentialBackoff};

/// How long an open stream with nothing to do stays connected.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// ```text
/// Initial --start--> Starting --open--> Open
///    ^                   |               |
///    |                   +---error-------+--> Error --start--> Backoff --timer--> Initial
///    +-------stop / idle timeout---------+
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    Initial,
    /// Fetching credentials and opening the RPC.
    Starting,
    Open,
    /// Closed by a failure; the next start goes through backoff.
    Error,
    /// Waiting for the backoff timer before reconnecting.
    Backoff,
}

/// Receives the events of a [`PersistentStream`]. Every callback runs on the
/// async queue.
#[async_trait]
pub trait StreamDelegate: Send + Sync + 'static {
    async fn on_open(&self) -> FirestoreResult<()>;
    async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()>;
    /// `error` is `None` when the stream was stopped deliberately.
    async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()>;
}

struct StreamCore {
    state: StreamState,
    /// Bumped on every close; events tagged with an older value are stale.
    close_count: u64,
    handle: Option<Arc<dyn StreamHandle>>,
    idle_timer: Option<DelayedOperation>,
    backoff: ExponentialBackoff,
    messages_since_open: usize,
}

struct StreamInner {
    kind: StreamKind,
    queue: AsyncQueue,
    network: NetworkLayer,
    delegate: Arc<dyn StreamDelegate>,
    core: Mutex<StreamCore>,
}

/// A reconnecting RPC stream with backoff and an idle timeout.
///
/// All methods must be called from operations running on the async queue.
#[derive(Clone)]
pub struct PersistentStream {
    inner: Arc<StreamInner>,
}

impl PersistentStream {
    pub fn new(
        kind: StreamKind,
        queue: AsyncQueue,
        network: NetworkLayer,
        delegate: Arc<dyn StreamDelegate>,
        backoff_config: BackoffConfig,
    ) -> Self {
        let backoff_timer = match kind {
            StreamKind::Listen => TimerId::ListenStreamConnectionBackoff,
            StreamKind::Write => TimerId::WriteStreamConnectionBackoff,
        };
        let backoff = ExponentialBackoff::with_config(queue.clone(), backoff_timer, backoff_config);
        Self {
            inner: Arc::new(StreamInner {
                kind,
                queue,
                network,
                delegate,
                core: Mutex::new(StreamCore {
                    state: StreamState::Initial,
                    close_count: 0,
                    handle: None,
                    idle_timer: None,
                    backoff,
                    messages_since_open: 0,
                }),
            }),
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.inner.kind
    }

    pub fn state(&self) -> StreamState {
        self.inner
            .lock()
            .map(|core| core.state)
            .unwrap_or(StreamState::Error)
    }

    /// True from `start` until the stream is closed, including while backing
    /// off.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state(),
            StreamState::Starting | StreamState::Backoff | StreamState::Open
        )
    }

    pub fn is_open(&self) -> bool {
        self.state() == StreamState::Open
    }

    /// Connects. After a failure the connection attempt waits for the backoff
    /// timer.
    pub fn start(&self) {
        let close_count = {
            let Ok(mut core) = self.inner.lock() else {
                return;
            };
            match core.state {
                StreamState::Error => {
                    StreamInner::perform_backoff(&self.inner, &mut core);
                    return;
                }
                StreamState::Initial => {}
                other => {
                    log::debug!("{} stream already started ({other:?})", self.inner.kind.label());
                    return;
                }
            }
            core.state = StreamState::Starting;
            core.close_count
        };

        let inner = Arc::clone(&self.inner);
        runtime::spawn_detached(async move {
            let opened = match inner.network.fetch_credentials().await {
                Ok(credentials) => inner.network.open(inner.kind, credentials).await,
                Err(err) => Err(FirestoreError::new(
                    FirestoreErrorCode::Unknown,
                    format!("Fetching auth token failed: {}", err.message()),
                )),
            };
            let queue = inner.queue.clone();
            queue.enqueue_and_forget(move || async move {
                StreamInner::on_stream_opened(&inner, close_count, opened).await
            });
        });
    }

    /// Closes the stream without error. The next start connects immediately.
    pub async fn stop(&self) -> FirestoreResult<()> {
        if self.is_started() {
            self.inner.close(StreamState::Initial, None).await?;
        }
        Ok(())
    }

    /// Skips the backoff delay of the next start. Only valid while stopped.
    pub fn inhibit_backoff(&self) {
        if let Ok(mut core) = self.inner.lock() {
            if matches!(core.state, StreamState::Initial | StreamState::Error) {
                core.state = StreamState::Initial;
                core.backoff.reset();
            }
        }
    }

    /// Arms the idle timer; the stream closes if nothing is sent before it
    /// fires.
    pub fn mark_idle(&self) {
        let Ok(mut core) = self.inner.lock() else {
            return;
        };
        if core.state != StreamState::Open || core.idle_timer.is_some() {
            return;
        }
        let idle_timer = match self.inner.kind {
            StreamKind::Listen => TimerId::ListenStreamIdle,
            StreamKind::Write => TimerId::WriteStreamIdle,
        };
        let weak = Arc::downgrade(&self.inner);
        core.idle_timer = Some(self.inner.queue.enqueue_after_delay(
            idle_timer,
            IDLE_TIMEOUT,
            move || async move {
                match weak.upgrade() {
                    Some(inner) => inner.handle_idle_close_timer().await,
                    None => Ok(()),
                }
            },
        ));
    }

    pub async fn send(&self, payload: Vec<u8>) -> FirestoreResult<()> {
        let handle = {
            let mut core = self.inner.lock()?;
            if let Some(timer) = core.idle_timer.take() {
                timer.cancel();
            }
            core.handle.clone()
        };
        match handle {
            Some(handle) => handle.send(payload).await,
            None => Err(failed_precondition(format!(
                "{} stream is not open",
                self.inner.kind.label()
            ))),
        }
    }
}

impl StreamInner {
    fn lock(&self) -> FirestoreResult<MutexGuard<'_, StreamCore>> {
        self.core
            .lock()
            .map_err(|_| internal_error("stream state lock poisoned"))
    }

    fn perform_backoff(inner: &Arc<StreamInner>, core: &mut StreamCore) {
        core.state = StreamState::Backoff;
        let weak: Weak<StreamInner> = Arc::downgrade(inner);
        core.backoff.backoff_and_run(move || async move {
            let Some(inner) = weak.upgrade() else {
                return Ok(());
            };
            {
                let mut core = inner.lock()?;
                if core.state != StreamState::Backoff {
                    return Ok(());
                }
                core.state = StreamState::Initial;
            }
            PersistentStream { inner }.start();
            Ok(())
        });
    }

    async fn on_stream_opened(
        inner: &Arc<StreamInner>,
        close_count: u64,
        opened: FirestoreResult<Arc<dyn StreamHandle>>,
    ) -> FirestoreResult<()> {
        let current = inner.lock()?.close_count == close_count;
        if !current {
            if let Ok(handle) = opened {
                // Stopped while connecting.
                let _ = handle.close().await;
            }
            return Ok(());
        }

        let handle = match opened {
            Ok(handle) => handle,
            Err(err) => return inner.close(StreamState::Error, Some(err)).await,
        };
        {
            let mut core = inner.lock()?;
            core.handle = Some(Arc::clone(&handle));
            core.state = StreamState::Open;
            core.messages_since_open = 0;
        }
        log::debug!("{} stream open", inner.kind.label());
        Self::spawn_reader(inner, handle, close_count);

        if let Err(err) = inner.delegate.on_open().await {
            log::debug!("{} stream open handler failed: {err}", inner.kind.label());
            return inner.close(StreamState::Error, Some(err)).await;
        }
        Ok(())
    }

    fn spawn_reader(inner: &Arc<StreamInner>, handle: Arc<dyn StreamHandle>, close_count: u64) {
        let weak = Arc::downgrade(inner);
        runtime::spawn_detached(async move {
            loop {
                let event = handle.next().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let terminal = !matches!(event, Some(Ok(_)));
                let queue = inner.queue.clone();
                let dispatched = queue
                    .enqueue(move || async move { inner.dispatch(close_count, event).await })
                    .await;
                if dispatched.is_err() || terminal {
                    break;
                }
            }
        });
    }

    async fn dispatch(
        &self,
        close_count: u64,
        event: Option<FirestoreResult<Vec<u8>>>,
    ) -> FirestoreResult<()> {
        {
            let mut core = self.lock()?;
            if core.close_count != close_count {
                return Ok(());
            }
            if matches!(event, Some(Ok(_))) {
                // A write stream's handshake reply does not prove the
                // connection healthy yet.
                if self.kind == StreamKind::Listen || core.messages_since_open > 0 {
                    core.backoff.reset();
                }
                core.messages_since_open += 1;
            }
        }
        match event {
            Some(Ok(payload)) => match self.delegate.on_message(payload).await {
                Ok(()) => Ok(()),
                Err(err) => {
                    log::debug!("{} stream message handler failed: {err}", self.kind.label());
                    self.close(StreamState::Error, Some(err)).await
                }
            },
            Some(Err(err)) => self.close(StreamState::Error, Some(err)).await,
            // A clean close from the backend still goes through backoff.
            None => self.close(StreamState::Error, None).await,
        }
    }

    async fn handle_idle_close_timer(&self) -> FirestoreResult<()> {
        {
            let mut core = self.lock()?;
            core.idle_timer = None;
            if core.state != StreamState::Open {
                return Ok(());
            }
        }
        log::debug!("closing idle {} stream", self.kind.label());
        self.close(StreamState::Initial, None).await
    }

    async fn close(&self, final_state: StreamState, error: Option<FirestoreError>) -> FirestoreResult<()> {
        let (handle, invalidate) = {
            let mut core = self.lock()?;
            if let Some(timer) = core.idle_timer.take() {
                timer.cancel();
            }
            core.backoff.cancel();
            core.close_count += 1;

            let mut invalidate = false;
            if final_state != StreamState::Error {
                core.backoff.reset();
            } else if let Some(err) = &error {
                if err.code == FirestoreErrorCode::ResourceExhausted {
                    log::warn!("{err}");
                    log::warn!("using maximum backoff delay to prevent overloading the backend");
                    core.backoff.reset_to_max();
                } else if err.code == FirestoreErrorCode::Unauthenticated && core.state != StreamState::Open {
                    invalidate = true;
                }
            }
            core.state = final_state;
            (core.handle.take(), invalidate)
        };

        if invalidate {
            self.network.invalidate_credentials();
        }
        if let Some(handle) = handle {
            log::debug!("closing {} stream", self.kind.label());
            if let Err(err) = handle.close().await {
                log::debug!("{} stream close failed: {err}", self.kind.label());
            }
        }
        self.delegate.on_close(error).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::{resource_exhausted, unavailable};
    use crate::firestore::model::{DatabaseId, User};
    use crate::firestore::remote::datastore::{StreamingDatastore, StreamingDatastoreImpl};
    use crate::firestore::remote::network::{CredentialsProvider, StaticCredentialsProvider};
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use async_channel::{Receiver, Sender};

    #[derive(Debug, PartialEq)]
    enum Event {
        Open,
        Message(Vec<u8>),
        Close(Option<FirestoreErrorCode>),
    }

    struct RecordingDelegate {
        events: Sender<Event>,
    }

    #[async_trait]
    impl StreamDelegate for RecordingDelegate {
        async fn on_open(&self) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Open).await;
            Ok(())
        }

        async fn on_message(&self, payload: Vec<u8>) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Message(payload)).await;
            Ok(())
        }

        async fn on_close(&self, error: Option<FirestoreError>) -> FirestoreResult<()> {
            let _ = self.events.send(Event::Close(error.map(|err| err.code))).await;
            Ok(())
        }
    }

    struct Fixture {
        queue: AsyncQueue,
        stream: PersistentStream,
        events: Receiver<Event>,
        server: MultiplexedConnection,
        credentials: Arc<StaticCredentialsProvider>,
    }

    fn fixture(kind: StreamKind) -> Fixture {
        let (left, right) = InMemoryTransport::pair();
        let datastore: Arc<dyn StreamingDatastore> = Arc::new(StreamingDatastoreImpl::new(
            DatabaseId::default("demo"),
            Arc::new(MultiplexedConnection::new(left)),
        ));
        let credentials = Arc::new(StaticCredentialsProvider::new(User::new("u"), Some("tok".into())));
        let network =
            NetworkLayer::builder(datastore, Arc::clone(&credentials) as Arc<dyn CredentialsProvider>).build();
        let queue = AsyncQueue::new();
        let (tx, rx) = async_channel::unbounded();
        let stream = PersistentStream::new(
            kind,
            queue.clone(),
            network,
            Arc::new(RecordingDelegate { events: tx }),
            BackoffConfig::default(),
        );
        Fixture {
            queue,
            stream,
            events: rx,
            server: MultiplexedConnection::new(right),
            credentials,
        }
    }

    async fn on_queue<F>(queue: &AsyncQueue, stream: &PersistentStream, op: F)
    where
        F: FnOnce(PersistentStream) + Send + 'static,
    {
        let stream = stream.clone();
        queue
            .enqueue(move || async move {
                op(stream);
                Ok(())
            })
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn opens_delivers_messages_and_stops() {
        let fx = fixture(StreamKind::Listen);
        on_queue(&fx.queue, &fx.stream, |stream| stream.start()).await;

        let (metadata, peer) = fx.server.accept().await.unwrap();
        assert_eq!(metadata.method, "Listen");
        assert_eq!(metadata.auth_token.as_deref(), Some("tok"));
        assert_eq!(fx.events.recv().await.unwrap(), Event::Open);
        assert!(fx.stream.is_open());

        peer.send(b"change".to_vec()).await.unwrap();
        assert_eq!(fx.events.recv().await.unwrap(), Event::Message(b"change".to_vec()));

        let stream = fx.stream.clone();
        fx.queue
            .enqueue(move || async move { stream.stop().await })
            .await
            .unwrap();
        assert_eq!(fx.events.recv().await.unwrap(), Event::Close(None));
        assert_eq!(fx.stream.state(), StreamState::Initial);
        assert!(peer.next().await.is_none());
    }

    #[tokio::test]
    async fn failure_moves_to_error_and_restart_backs_off() {
        let fx = fixture(StreamKind::Write);
        on_queue(&fx.queue, &fx.stream, |stream| stream.start()).await;
        let (_, peer) = fx.server.accept().await.unwrap();
        assert_eq!(fx.events.recv().await.unwrap(), Event::Open);

        peer.fail(unavailable("going away")).await.unwrap();
        assert_eq!(
            fx.events.recv().await.unwrap(),
            Event::Close(Some(FirestoreErrorCode::Unavailable))
        );
        assert_eq!(fx.stream.state(), StreamState::Error);

        // The first retry after a healthy period has no delay; fast-forward
        // in case the timer has not fired yet.
        on_queue(&fx.queue, &fx.stream, |stream| stream.start()).await;
        fx.queue
            .run_delays_until(TimerId::WriteStreamConnectionBackoff)
            .await
            .unwrap();
        let (metadata, _peer) = fx.server.accept().await.unwrap();
        assert_eq!(metadata.method, "Write");
        assert_eq!(fx.events.recv().await.unwrap(), Event::Open);
    }

    #[tokio::test]
    async fn resource_exhausted_does_not_invalidate_credentials() {
        let fx = fixture(StreamKind::Listen);
        on_queue(&fx.queue, &fx.stream, |stream| stream.start()).await;
        let (_, peer) = fx.server.accept().await.unwrap();
        assert_eq!(fx.events.recv().await.unwrap(), Event::Open);

        peer.fail(resource_exhausted("quota")).await.unwrap();
        assert_eq!(
            fx.events.recv().await.unwrap(),
            Event::Close(Some(FirestoreErrorCode::ResourceExhausted))
        );
        assert_eq!(fx.credentials.invalidation_count(), 0);
    }

    #[tokio::test]
    async fn idle_timer_closes_open_stream() {
        let fx = fixture(StreamKind::Listen);
        on_queue(&fx.queue, &fx.stream, |stream| stream.start()).await;
        let (_, _peer) = fx.server.accept().await.unwrap();
        assert_eq!(fx.events.recv().await.unwrap(), Event::Open);

        on_queue(&fx.queue, &fx.stream, |stream| stream.mark_idle()).await;
        assert!(fx.queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        fx.queue.run_delays_until(TimerId::ListenStreamIdle).await.unwrap();

        assert_eq!(fx.events.recv().await.unwrap(), Event::Close(None));
        assert_eq!(fx.stream.state(), StreamState::Initial);
    }
}
