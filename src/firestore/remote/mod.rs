pub mod bloom_filter;
pub mod datastore;
pub mod network;
pub mod online_state_tracker;
pub mod remote_event;
pub mod remote_store;
pub mod remote_syncer;
pub mod rpc_error;
pub mod serializer;
pub mod stream;
pub mod streams;
pub mod structured_query;
pub mod watch_change;
pub mod watch_change_aggregator;

pub use bloom_filter::BloomFilter;
pub use datastore::{
    NoopTokenProvider, StreamCredentials, StreamHandle, StreamingDatastore, StreamingDatastoreImpl, TokenProvider,
    TokenProviderArc,
};
pub use network::{
    CredentialsProvider, EmptyCredentialsProvider, NetworkLayer, StaticCredentialsProvider, StreamKind, Token,
};
pub use online_state_tracker::OnlineState;
pub use remote_event::{RemoteEvent, TargetChange};
pub use remote_store::RemoteStore;
pub use remote_syncer::RemoteSyncer;
pub use serializer::{JsonProtoSerializer, ListenRequest, WriteRequest, WriteResponse};
pub use stream::{InMemoryTransport, MultiplexedConnection, MultiplexedStream, StreamMetadata, StreamTransport};
pub use watch_change::{
    DocumentWatchChange, ExistenceFilterChange, TargetChangeState, UnchangedNames, WatchChange, WatchTargetChange,
};
pub use watch_change_aggregator::{TargetMetadataProvider, WatchChangeAggregator};
