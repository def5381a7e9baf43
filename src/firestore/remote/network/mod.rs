use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::{DatabaseId, User};
use crate::firestore::remote::datastore::{
    NoopTokenProvider, StreamCredentials, StreamHandle, StreamingDatastore, TokenProviderArc,
};

/// An auth token and the user it was minted for.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Token {
    pub value: Option<String>,
    pub user: User,
}

pub type CredentialChangeListener = Arc<dyn Fn(User) + Send + Sync>;

/// Supplies auth tokens and reports user changes.
#[async_trait]
pub trait CredentialsProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Token>;

    /// Forces the next [`CredentialsProvider::get_token`] to mint a fresh token.
    fn invalidate_token(&self);

    /// Installs the listener. It is invoked with the current user right away
    /// and again on every change.
    fn set_change_listener(&self, listener: CredentialChangeListener);

    fn remove_change_listener(&self);
}

/// Always unauthenticated.
#[derive(Default)]
pub struct EmptyCredentialsProvider {
    listener: Mutex<Option<CredentialChangeListener>>,
}

#[async_trait]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Token> {
        Ok(Token {
            value: None,
            user: User::unauthenticated(),
        })
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        listener(User::unauthenticated());
        if let Ok(mut slot) = self.listener.lock() {
            *slot = Some(listener);
        }
    }

    fn remove_change_listener(&self) {
        if let Ok(mut slot) = self.listener.lock() {
            slot.take();
        }
    }
}

#[derive(Default)]
struct StaticState {
    token: Token,
    invalidations: usize,
    listener: Option<CredentialChangeListener>,
}

impl Default for Token {
    fn default() -> Self {
        Self {
            value: None,
            user: User::unauthenticated(),
        }
    }
}

/// Provider whose user and token are set by the embedding application.
#[derive(Default)]
pub struct StaticCredentialsProvider {
    state: Mutex<StaticState>,
}

impl StaticCredentialsProvider {
    pub fn new(user: User, token: Option<String>) -> Self {
        Self {
            state: Mutex::new(StaticState {
                token: Token { value: token, user },
                ..StaticState::default()
            }),
        }
    }

    /// Switches the signed-in user and notifies the listener when the user
    /// actually changed.
    pub fn set_user(&self, user: User, token: Option<String>) {
        let notify = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            let changed = state.token.user != user;
            state.token = Token { value: token, user: user.clone() };
            if changed {
                state.listener.clone()
            } else {
                None
            }
        };
        if let Some(listener) = notify {
            listener(user);
        }
    }

    pub fn invalidation_count(&self) -> usize {
        self.state.lock().map(|state| state.invalidations).unwrap_or(0)
    }
}

#[async_trait]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self) -> FirestoreResult<Token> {
        Ok(self
            .state
            .lock()
            .map(|state| state.token.clone())
            .unwrap_or_default())
    }

    fn invalidate_token(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.invalidations += 1;
        }
    }

    fn set_change_listener(&self, listener: CredentialChangeListener) {
        let user = {
            let Ok(mut state) = self.state.lock() else {
                return;
            };
            state.listener = Some(Arc::clone(&listener));
            state.token.user.clone()
        };
        listener(user);
    }

    fn remove_change_listener(&self) {
        if let Ok(mut state) = self.state.lock() {
            state.listener = None;
        }
    }
}

#[derive(Clone)]
struct StreamCredentialProvider {
    auth_provider: Arc<dyn CredentialsProvider>,
    app_check_provider: TokenProviderArc,
}

impl StreamCredentialProvider {
    async fn fetch(&self) -> FirestoreResult<StreamCredentials> {
        let auth = self.auth_provider.get_token().await?;
        let app_check_token = self.app_check_provider.get_token().await?;
        Ok(StreamCredentials {
            auth_token: auth.value,
            app_check_token,
        })
    }

    fn invalidate(&self) {
        self.auth_provider.invalidate_token();
        self.app_check_provider.invalidate_token();
    }
}

/// Which of the two protocol RPCs a stream speaks.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamKind {
    Listen,
    Write,
}

impl StreamKind {
    pub fn label(&self) -> &'static str {
        match self {
            StreamKind::Listen => "listen",
            StreamKind::Write => "write",
        }
    }
}

/// Datastore plus credentials: everything a persistent stream needs to
/// (re)connect.
#[derive(Clone)]
pub struct NetworkLayer {
    datastore: Arc<dyn StreamingDatastore>,
    credentials: StreamCredentialProvider,
}

impl NetworkLayer {
    pub fn builder(
        datastore: Arc<dyn StreamingDatastore>,
        auth_provider: Arc<dyn CredentialsProvider>,
    ) -> NetworkLayerBuilder {
        NetworkLayerBuilder::new(datastore, auth_provider)
    }

    pub fn database_id(&self) -> &DatabaseId {
        self.datastore.database_id()
    }

    pub async fn fetch_credentials(&self) -> FirestoreResult<StreamCredentials> {
        self.credentials.fetch().await
    }

    pub fn invalidate_credentials(&self) {
        self.credentials.invalidate();
    }

    pub async fn open(
        &self,
        kind: StreamKind,
        credentials: StreamCredentials,
    ) -> FirestoreResult<Arc<dyn StreamHandle>> {
        match kind {
            StreamKind::Listen => self.datastore.open_listen_stream(credentials).await,
            StreamKind::Write => self.datastore.open_write_stream(credentials).await,
        }
    }
}

pub struct NetworkLayerBuilder {
    datastore: Arc<dyn StreamingDatastore>,
    auth_provider: Arc<dyn CredentialsProvider>,
    app_check_provider: Option<TokenProviderArc>,
}

impl NetworkLayerBuilder {
    fn new(datastore: Arc<dyn StreamingDatastore>, auth_provider: Arc<dyn CredentialsProvider>) -> Self {
        Self {
            datastore,
            auth_provider,
            app_check_provider: None,
        }
    }

    pub fn with_app_check_provider(mut self, provider: TokenProviderArc) -> Self {
        self.app_check_provider = Some(provider);
        self
    }

    pub fn build(self) -> NetworkLayer {
        let app_check_provider = self
            .app_check_provider
            .unwrap_or_else(|| Arc::new(NoopTokenProvider) as TokenProviderArc);
        NetworkLayer {
            datastore: self.datastore,
            credentials: StreamCredentialProvider {
                auth_provider: self.auth_provider,
                app_check_provider,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::datastore::{StreamingDatastoreImpl, TokenProvider};
    use crate::firestore::remote::stream::{InMemoryTransport, MultiplexedConnection};
    use std::sync::atomic::{AtomicBool, Ordering};

    struct TestAppCheck {
        invalidated: Arc<AtomicBool>,
    }

    #[async_trait]
    impl TokenProvider for TestAppCheck {
        async fn get_token(&self) -> FirestoreResult<Option<String>> {
            Ok(Some("app-check".into()))
        }

        fn invalidate_token(&self) {
            self.invalidated.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn network_layer_attaches_both_tokens() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left_connection = Arc::new(MultiplexedConnection::new(left_transport));
        let right_connection = MultiplexedConnection::new(right_transport);
        let datastore: Arc<dyn StreamingDatastore> =
            Arc::new(StreamingDatastoreImpl::new(DatabaseId::default("demo"), left_connection));

        let auth = Arc::new(StaticCredentialsProvider::new(User::new("alice"), Some("auth".into())));
        let invalidated = Arc::new(AtomicBool::new(false));
        let layer = NetworkLayer::builder(datastore, Arc::clone(&auth) as Arc<dyn CredentialsProvider>)
            .with_app_check_provider(Arc::new(TestAppCheck {
                invalidated: Arc::clone(&invalidated),
            }))
            .build();

        let credentials = layer.fetch_credentials().await.unwrap();
        let _handle = layer.open(StreamKind::Write, credentials).await.unwrap();
        let (metadata, _peer) = right_connection.accept().await.unwrap();
        assert_eq!(metadata.method, "Write");
        assert_eq!(metadata.auth_token.as_deref(), Some("auth"));
        assert_eq!(metadata.app_check_token.as_deref(), Some("app-check"));

        layer.invalidate_credentials();
        assert_eq!(auth.invalidation_count(), 1);
        assert!(invalidated.load(Ordering::SeqCst));
    }

    #[test]
    fn static_provider_notifies_only_on_user_change() {
        let provider = StaticCredentialsProvider::new(User::unauthenticated(), None);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        provider.set_change_listener(Arc::new(move |user| sink.lock().unwrap().push(user)));

        provider.set_user(User::unauthenticated(), Some("t".into()));
        provider.set_user(User::new("bob"), Some("t2".into()));

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, vec![User::unauthenticated(), User::new("bob")]);
    }
}
