//! Entry point that wires the local store, the sync engine and the network
//! together for one execution context.
//!
//! Every call is funnelled through the client's [`AsyncQueue`], so the
//! components below never observe concurrent operations. Several clients may
//! share one persistence; they elect a primary through the lease and keep
//! each other informed over a [`SharedClientChannel`].

use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};

use futures::stream::{BoxStream, Stream, StreamExt};
use rand::distributions::Alphanumeric;
use rand::Rng;

use crate::firestore::core::event_manager::{EventManager, ListenOptions, QueryListener};
use crate::firestore::core::query::Query;
use crate::firestore::core::sync_engine::{SyncEngine, DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS};
use crate::firestore::core::view::View;
use crate::firestore::core::view_snapshot::{DocumentSet, ViewSnapshot};
use crate::firestore::error::{cancelled, internal_error, unavailable, FirestoreResult};
use crate::firestore::local::file_persistence::FilePersistence;
use crate::firestore::local::index_backfiller::{
    IndexBackfiller, IndexBackfillerScheduler, DEFAULT_MAX_DOCUMENTS_TO_PROCESS,
};
use crate::firestore::local::lease::{Clock, LeaseManager, LeaseSettings, SystemClock};
use crate::firestore::local::local_store::{LocalStore, LocalStoreSettings};
use crate::firestore::local::lru_garbage_collector::{LruGarbageCollector, LruParams, LruScheduler};
use crate::firestore::local::memory_persistence::MemoryPersistence;
use crate::firestore::local::persistence::Persistence;
use crate::firestore::local::query_engine::IndexAutoCreationSettings;
use crate::firestore::local::shared_client_state::{SharedClientChannel, SharedClientEnvelope, SharedClientState};
use crate::firestore::model::{DatabaseId, DocumentKey, MutableDocument, Mutation, User};
use crate::firestore::remote::datastore::StreamingDatastore;
use crate::firestore::remote::network::{CredentialsProvider, EmptyCredentialsProvider, NetworkLayer};
use crate::firestore::remote::serializer::JsonProtoSerializer;
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};
use crate::util::backoff::BackoffConfig;

/// Where the client keeps its cache.
#[derive(Clone)]
pub enum PersistenceSettings {
    Memory,
    /// Durable store at `path`. Falls back to memory when the file cannot be
    /// opened.
    File { path: PathBuf },
    /// A store handle prepared by the caller, typically from
    /// [`MemoryPersistence::attach`] or [`FilePersistence::attach`] to share
    /// it with another client. Its client id wins over
    /// [`ClientConfig::client_id`].
    Shared(Arc<dyn Persistence>),
}

#[derive(Clone)]
pub struct ClientConfig {
    pub database_id: DatabaseId,
    pub datastore: Arc<dyn StreamingDatastore>,
    pub credentials: Arc<dyn CredentialsProvider>,
    pub persistence: PersistenceSettings,
    /// Generated when unset.
    pub client_id: Option<String>,
    pub lru_params: LruParams,
    pub lease: LeaseSettings,
    pub clock: Arc<dyn Clock>,
    pub backoff: BackoffConfig,
    pub max_concurrent_limbo_resolutions: usize,
    pub index_auto_creation: IndexAutoCreationSettings,
    /// Channel shared with the other clients attached to the same store.
    pub shared_channel: SharedClientChannel,
}

impl ClientConfig {
    pub fn new(database_id: DatabaseId, datastore: Arc<dyn StreamingDatastore>) -> Self {
        Self {
            database_id,
            datastore,
            credentials: Arc::new(EmptyCredentialsProvider::default()),
            persistence: PersistenceSettings::Memory,
            client_id: None,
            lru_params: LruParams::default(),
            lease: LeaseSettings::default(),
            clock: Arc::new(SystemClock),
            backoff: BackoffConfig::default(),
            max_concurrent_limbo_resolutions: DEFAULT_MAX_CONCURRENT_LIMBO_RESOLUTIONS,
            index_auto_creation: IndexAutoCreationSettings::default(),
            shared_channel: SharedClientChannel::new(),
        }
    }
}

fn generate_client_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect()
}

fn open_persistence(settings: &PersistenceSettings, client_id: String) -> Arc<dyn Persistence> {
    match settings {
        PersistenceSettings::Memory => Arc::new(MemoryPersistence::new(client_id)),
        PersistenceSettings::File { path } => match FilePersistence::open(path.clone(), client_id.clone()) {
            Ok(persistence) => Arc::new(persistence),
            Err(err) => {
                log::warn!(
                    "Error enabling offline persistence at {}. Falling back to persistence disabled: {err}",
                    path.display()
                );
                Arc::new(MemoryPersistence::new(client_id))
            }
        },
        PersistenceSettings::Shared(persistence) => Arc::clone(persistence),
    }
}

struct ClientInner {
    queue: AsyncQueue,
    local_store: Arc<LocalStore>,
    sync_engine: Arc<SyncEngine>,
    event_manager: Arc<EventManager>,
    lease: LeaseManager,
    lru_scheduler: LruScheduler,
    backfill_scheduler: IndexBackfillerScheduler,
    credentials: Arc<dyn CredentialsProvider>,
    lease_refresh: Mutex<Option<DelayedOperation>>,
    terminated: AtomicBool,
}

impl ClientInner {
    /// Renews the lease and switches the sync engine to the resulting mode.
    async fn refresh_lease(&self) -> FirestoreResult<()> {
        let is_primary = match self.lease.update_client_metadata_and_try_become_primary() {
            Ok(is_primary) => is_primary,
            Err(err) => {
                log::debug!("lease refresh failed: {err}");
                false
            }
        };
        self.apply_lease_decision(is_primary).await
    }

    /// Streams are stopped before the owner row is given up.
    async fn apply_lease_decision(&self, is_primary: bool) -> FirestoreResult<()> {
        self.apply_primary_state(is_primary).await?;
        if !is_primary {
            self.lease.release_primary_lease()?;
        }
        Ok(())
    }

    async fn apply_primary_state(&self, is_primary: bool) -> FirestoreResult<()> {
        self.sync_engine.apply_primary_state(is_primary).await?;
        if is_primary {
            self.lru_scheduler.start();
            self.backfill_scheduler.start();
            if let Err(err) = self.lease.remove_stale_client_metadata() {
                log::debug!("failed to remove stale client metadata: {err}");
            }
        } else {
            self.lru_scheduler.stop();
            self.backfill_scheduler.stop();
        }
        Ok(())
    }

    fn schedule_lease_refresh(inner: &Arc<ClientInner>) {
        if inner.terminated.load(Ordering::SeqCst) {
            return;
        }
        let weak = Arc::downgrade(inner);
        let operation = inner.queue.enqueue_after_delay(
            TimerId::ClientMetadataRefresh,
            inner.lease.settings().refresh_interval,
            move || async move {
                let Some(inner) = weak.upgrade() else {
                    return Ok(());
                };
                let result = inner.refresh_lease().await;
                ClientInner::schedule_lease_refresh(&inner);
                result
            },
        );
        if let Ok(mut slot) = inner.lease_refresh.lock() {
            *slot = Some(operation);
        }
    }
}

/// One execution context of the offline cache.
#[derive(Clone)]
pub struct FirestoreClient {
    inner: Arc<ClientInner>,
}

impl FirestoreClient {
    /// Opens the store, claims the primary lease if it is free and starts
    /// the network when primary.
    pub async fn new(config: ClientConfig) -> FirestoreResult<Self> {
        let ClientConfig {
            database_id,
            datastore,
            credentials,
            persistence,
            client_id,
            lru_params,
            lease,
            clock,
            backoff,
            max_concurrent_limbo_resolutions,
            index_auto_creation,
            shared_channel,
        } = config;

        let queue = AsyncQueue::new();
        let persistence = open_persistence(&persistence, client_id.unwrap_or_else(generate_client_id));
        let client_id = persistence.client_id().to_string();
        log::debug!("starting client {client_id} (durable: {})", persistence.is_durable());

        let (user_sender, user_receiver) = async_channel::unbounded::<User>();
        credentials.set_change_listener(Arc::new(move |user| {
            let _ = user_sender.try_send(user);
        }));
        let initial_user = user_receiver.try_recv().unwrap_or_else(|_| User::unauthenticated());

        let lease = LeaseManager::new(Arc::clone(&persistence), clock, lease);
        let local_store = Arc::new(LocalStore::new(
            Arc::clone(&persistence),
            initial_user.clone(),
            LocalStoreSettings { index_auto_creation },
        ));
        local_store.start()?;

        let shared_client_state = Arc::new(SharedClientState::new(shared_channel, client_id, initial_user));
        let shared_messages = shared_client_state.start()?;

        let network = NetworkLayer::builder(datastore, Arc::clone(&credentials)).build();
        let sync_engine = SyncEngine::new(
            Arc::clone(&local_store),
            network,
            JsonProtoSerializer::new(database_id),
            queue.clone(),
            shared_client_state,
            backoff,
            max_concurrent_limbo_resolutions,
        )?;
        let event_manager = EventManager::new(Arc::clone(&sync_engine));

        let lru_scheduler = LruScheduler::new(
            LruGarbageCollector::new(lru_params),
            Arc::clone(&local_store),
            queue.clone(),
        );
        let backfill_scheduler = IndexBackfillerScheduler::new(
            IndexBackfiller::new(DEFAULT_MAX_DOCUMENTS_TO_PROCESS),
            Arc::clone(&local_store),
            queue.clone(),
        );

        let inner = Arc::new(ClientInner {
            queue: queue.clone(),
            local_store,
            sync_engine,
            event_manager,
            lease,
            lru_scheduler,
            backfill_scheduler,
            credentials,
            lease_refresh: Mutex::new(None),
            terminated: AtomicBool::new(false),
        });

        let startup = Arc::clone(&inner);
        queue
            .enqueue(move || async move {
                let is_primary = startup.lease.update_client_metadata_and_try_become_primary()?;
                startup.apply_lease_decision(is_primary).await?;
                startup.sync_engine.remote_store().start().await
            })
            .await?;
        ClientInner::schedule_lease_refresh(&inner);
        Self::forward_shared_messages(&inner, shared_messages);
        Self::forward_user_changes(&inner, user_receiver);
        Ok(Self { inner })
    }

    fn forward_shared_messages(inner: &Arc<ClientInner>, messages: async_channel::Receiver<SharedClientEnvelope>) {
        let queue = inner.queue.clone();
        let sync_engine: Weak<SyncEngine> = Arc::downgrade(&inner.sync_engine);
        runtime::spawn_detached(async move {
            while let Ok(envelope) = messages.recv().await {
                let sync_engine = sync_engine.clone();
                queue.enqueue_and_forget(move || async move {
                    match sync_engine.upgrade() {
                        Some(sync_engine) => sync_engine.handle_shared_client_message(envelope).await,
                        None => Ok(()),
                    }
                });
            }
        });
    }

    fn forward_user_changes(inner: &Arc<ClientInner>, users: async_channel::Receiver<User>) {
        let queue = inner.queue.clone();
        let sync_engine: Weak<SyncEngine> = Arc::downgrade(&inner.sync_engine);
        runtime::spawn_detached(async move {
            while let Ok(user) = users.recv().await {
                let sync_engine = sync_engine.clone();
                queue.enqueue_and_forget(move || async move {
                    match sync_engine.upgrade() {
                        Some(sync_engine) => sync_engine.remote_store().handle_credential_change(user).await,
                        None => Ok(()),
                    }
                });
            }
        });
    }

    pub fn client_id(&self) -> &str {
        self.inner.lease.client_id()
    }

    pub fn is_primary(&self) -> bool {
        self.inner.sync_engine.is_primary()
    }

    pub fn queue(&self) -> &AsyncQueue {
        &self.inner.queue
    }

    pub fn sync_engine(&self) -> &Arc<SyncEngine> {
        &self.inner.sync_engine
    }

    pub fn local_store(&self) -> &Arc<LocalStore> {
        &self.inner.local_store
    }

    /// Starts listening to `query`. Snapshots arrive on the returned stream
    /// until it is dropped or the query fails.
    pub async fn listen(&self, query: Query, options: ListenOptions) -> FirestoreResult<ListenerRegistration> {
        let (listener, receiver) = QueryListener::new(query.clone(), options);
        let listener_id = listener.id();
        let event_manager = Arc::clone(&self.inner.event_manager);
        self.inner
            .queue
            .enqueue(move || async move { event_manager.listen(listener).await })
            .await?;
        Ok(ListenerRegistration {
            queue: self.inner.queue.clone(),
            event_manager: Arc::downgrade(&self.inner.event_manager),
            query,
            listener_id,
            snapshots: receiver.boxed(),
            detached: false,
        })
    }

    /// Applies `mutations` as one batch and resolves when the backend has
    /// accepted or rejected it. Offline, this waits until the network
    /// returns; the local cache reflects the write immediately.
    pub async fn write(&self, mutations: Vec<Mutation>) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let completion = self
            .inner
            .queue
            .enqueue(move || async move { sync_engine.write(mutations).await })
            .await?;
        completion
            .await
            .map_err(|_| cancelled("The write was cancelled before the backend answered"))?
    }

    /// The cached document at `key`, `None` if the cache knows it is absent.
    pub async fn get_document_from_cache(&self, key: DocumentKey) -> FirestoreResult<Option<MutableDocument>> {
        let local_store = Arc::clone(&self.inner.local_store);
        let document = self
            .inner
            .queue
            .enqueue(move || async move { local_store.read_document(&key) })
            .await?;
        if document.is_found_document() {
            Ok(Some(document))
        } else if document.is_no_document() {
            Ok(None)
        } else {
            Err(unavailable(
                "Failed to get document from cache. (However, this document may exist on the server. \
                 Run again without setting source to cache to attempt to retrieve the document from the server.)",
            ))
        }
    }

    /// Runs `query` against the cache only.
    pub async fn get_documents_from_cache(&self, query: Query) -> FirestoreResult<ViewSnapshot> {
        let local_store = Arc::clone(&self.inner.local_store);
        self.inner
            .queue
            .enqueue(move || async move {
                let query_result = local_store.execute_query(&query, true)?;
                let mut view = View::new(query.clone(), query_result.remote_keys);
                let doc_changes = view.compute_doc_changes(&query_result.documents, None);
                let view_change = view.apply_changes(doc_changes, false, None, false);
                Ok(view_change.snapshot.unwrap_or_else(|| {
                    ViewSnapshot::from_initial_documents(
                        query.clone(),
                        DocumentSet::new(&query),
                        Default::default(),
                        true,
                        false,
                    )
                }))
            })
            .await
    }

    /// Resolves once every write issued before the call has been
    /// acknowledged or rejected.
    pub async fn wait_for_pending_writes(&self) -> FirestoreResult<()> {
        let sync_engine = Arc::clone(&self.inner.sync_engine);
        let completion = self
            .inner
            .queue
            .enqueue(move || async move { sync_engine.register_pending_writes_callback().await })
            .await?;
        completion
            .await
            .map_err(|_| cancelled("Waiting for pending writes was cancelled"))?
    }

    pub async fn enable_network(&self) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(move || async move {
                inner.lease.set_network_enabled(true);
                inner.sync_engine.remote_store().enable_network().await
            })
            .await
    }

    pub async fn disable_network(&self) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(move || async move {
                inner.lease.set_network_enabled(false);
                inner.sync_engine.remote_store().disable_network().await
            })
            .await
    }

    /// Reports whether the embedding application is visible. Foreground
    /// contexts are preferred when the lease changes hands.
    pub async fn set_in_foreground(&self, in_foreground: bool) -> FirestoreResult<()> {
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue(move || async move {
                inner.lease.set_in_foreground(in_foreground);
                inner.refresh_lease().await
            })
            .await
    }

    /// Shuts the client down. Pending writes stay in the store for the next
    /// client; further calls fail with `failed-precondition`.
    pub async fn terminate(&self) -> FirestoreResult<()> {
        if self.inner.terminated.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if let Some(refresh) = self
            .inner
            .lease_refresh
            .lock()
            .map_err(|_| internal_error("lease refresh lock poisoned"))?
            .take()
        {
            refresh.cancel();
        }
        self.inner.queue.enter_restricted_mode();
        let inner = Arc::clone(&self.inner);
        self.inner
            .queue
            .enqueue_even_while_restricted(move || async move {
                inner.lru_scheduler.stop();
                inner.backfill_scheduler.stop();
                inner.credentials.remove_change_listener();
                inner.sync_engine.shutdown().await?;
                inner.lease.mark_zombied()?;
                inner.lease.release()?;
                inner.local_store.shutdown()
            })
            .await
    }
}

/// Live subscription returned by [`FirestoreClient::listen`]. Yields
/// snapshots as a [`Stream`]; dropping it stops the listen.
pub struct ListenerRegistration {
    queue: AsyncQueue,
    event_manager: Weak<EventManager>,
    query: Query,
    listener_id: u64,
    snapshots: BoxStream<'static, FirestoreResult<ViewSnapshot>>,
    detached: bool,
}

impl ListenerRegistration {
    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn detach(mut self) {
        self.remove_listener();
    }

    fn remove_listener(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let event_manager = self.event_manager.clone();
        let query = self.query.clone();
        let listener_id = self.listener_id;
        self.queue.enqueue_and_forget(move || async move {
            match event_manager.upgrade() {
                Some(event_manager) => event_manager.unlisten(&query, listener_id).await,
                None => Ok(()),
            }
        });
    }
}

impl Stream for ListenerRegistration {
    type Item = FirestoreResult<ViewSnapshot>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.snapshots.poll_next_unpin(cx)
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.remove_listener();
    }
}
