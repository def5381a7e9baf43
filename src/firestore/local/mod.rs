pub mod document_overlay_cache;
pub mod file_persistence;
pub mod index_backfiller;
pub mod index_manager;
pub mod lease;
pub mod local_documents_view;
pub mod local_store;
pub mod lru_garbage_collector;
pub mod memory_persistence;
pub mod mutation_queue;
pub mod persistence;
pub mod query_engine;
pub mod reference_set;
pub mod remote_document_cache;
pub mod schema;
pub mod shared_client_state;
pub mod target_cache;
pub mod target_data;

pub use file_persistence::FilePersistence;
pub use lease::{Clock, LeaseManager, LeaseSettings, ManualClock, SystemClock};
pub use local_store::{DocumentMap, LocalStore, LocalStoreSettings};
pub use lru_garbage_collector::LruParams;
pub use memory_persistence::MemoryPersistence;
pub use persistence::Persistence;
pub use shared_client_state::SharedClientChannel;
pub use target_data::{TargetData, TargetPurpose};
