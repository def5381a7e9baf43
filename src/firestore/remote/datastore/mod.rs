use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::DatabaseId;

pub mod streaming;

pub use streaming::StreamingDatastoreImpl;

pub type StreamingFuture<'a, T> = BoxFuture<'a, T>;

/// Tokens attached to a stream when it is opened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamCredentials {
    pub auth_token: Option<String>,
    pub app_check_token: Option<String>,
}

/// One open bidirectional RPC.
pub trait StreamHandle: Send + Sync + 'static {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>>;
    /// `None` once the peer closed the stream cleanly.
    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>>;
    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>>;
}

/// Opens the two long-lived RPCs of the sync protocol.
pub trait StreamingDatastore: Send + Sync + 'static {
    fn database_id(&self) -> &DatabaseId;

    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>>;
}

/// Source of an auxiliary token attached to every stream, such as an app
/// attestation token.
#[async_trait]
pub trait TokenProvider: Send + Sync + 'static {
    async fn get_token(&self) -> FirestoreResult<Option<String>>;
    fn invalidate_token(&self);
}

#[derive(Default, Clone)]
pub struct NoopTokenProvider;

#[async_trait]
impl TokenProvider for NoopTokenProvider {
    async fn get_token(&self) -> FirestoreResult<Option<String>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}
}

pub type TokenProviderArc = Arc<dyn TokenProvider>;
