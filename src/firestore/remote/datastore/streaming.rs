use std::sync::Arc;

use futures::FutureExt;

use super::{StreamCredentials, StreamHandle, StreamingDatastore, StreamingFuture};
use crate::firestore::error::FirestoreResult;
use crate::firestore::model::DatabaseId;
use crate::firestore::remote::stream::{MultiplexedConnection, MultiplexedStream, StreamMetadata};

pub(crate) fn box_stream_future<'a, F, T>(future: F) -> StreamingFuture<'a, T>
where
    F: std::future::Future<Output = T> + Send + 'a,
{
    future.boxed()
}

pub const LISTEN_METHOD: &str = "Listen";
pub const WRITE_METHOD: &str = "Write";

/// [`StreamingDatastore`] over a multiplexed connection.
pub struct StreamingDatastoreImpl {
    database_id: DatabaseId,
    connection: Arc<MultiplexedConnection>,
}

impl StreamingDatastoreImpl {
    pub fn new(database_id: DatabaseId, connection: Arc<MultiplexedConnection>) -> Self {
        Self {
            database_id,
            connection,
        }
    }

    fn open(
        &self,
        method: &'static str,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        let connection = Arc::clone(&self.connection);
        let metadata = StreamMetadata {
            method: method.to_string(),
            database: self.database_id.resource_name(),
            auth_token: credentials.auth_token,
            app_check_token: credentials.app_check_token,
        };
        box_stream_future(async move {
            let stream = connection.open_stream(metadata).await?;
            log::debug!("opened {method} stream {}", stream.id().value());
            Ok(Arc::new(StreamingHandleImpl::new(stream)) as Arc<dyn StreamHandle>)
        })
    }
}

impl StreamingDatastore for StreamingDatastoreImpl {
    fn database_id(&self) -> &DatabaseId {
        &self.database_id
    }

    fn open_listen_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(LISTEN_METHOD, credentials)
    }

    fn open_write_stream(
        &self,
        credentials: StreamCredentials,
    ) -> StreamingFuture<'_, FirestoreResult<Arc<dyn StreamHandle>>> {
        self.open(WRITE_METHOD, credentials)
    }
}

pub struct StreamingHandleImpl {
    stream: MultiplexedStream,
}

impl StreamingHandleImpl {
    fn new(stream: MultiplexedStream) -> Self {
        Self { stream }
    }
}

impl StreamHandle for StreamingHandleImpl {
    fn send(&self, payload: Vec<u8>) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.send(payload).await })
    }

    fn next(&self) -> StreamingFuture<'_, Option<FirestoreResult<Vec<u8>>>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.next().await })
    }

    fn close(&self) -> StreamingFuture<'_, FirestoreResult<()>> {
        let stream = &self.stream;
        box_stream_future(async move { stream.close().await })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::remote::stream::InMemoryTransport;

    #[tokio::test]
    async fn listen_stream_carries_route_and_token() {
        let (left_transport, right_transport) = InMemoryTransport::pair();
        let left_connection = Arc::new(MultiplexedConnection::new(left_transport));
        let right_connection = MultiplexedConnection::new(right_transport);

        let datastore = StreamingDatastoreImpl::new(DatabaseId::default("demo"), left_connection);
        let handle = datastore
            .open_listen_stream(StreamCredentials {
                auth_token: Some("token-1".to_string()),
                app_check_token: None,
            })
            .await
            .expect("open listen stream");

        let (metadata, peer) = right_connection.accept().await.expect("accept");
        assert_eq!(metadata.method, LISTEN_METHOD);
        assert_eq!(metadata.database, "projects/demo/databases/(default)");
        assert_eq!(metadata.auth_token.as_deref(), Some("token-1"));

        peer.send(b"hello".to_vec()).await.expect("send payload");
        let payload = handle.next().await.expect("event").expect("payload");
        assert_eq!(payload, b"hello");
        handle.close().await.expect("close stream");
        assert!(peer.next().await.is_none());
    }
}
