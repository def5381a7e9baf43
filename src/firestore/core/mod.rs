pub mod client;
pub mod event_manager;
pub mod filter;
pub mod query;
pub mod sync_engine;
pub mod target;
pub mod target_id_generator;
pub mod view;
pub mod view_snapshot;

pub use client::{ClientConfig, FirestoreClient, ListenerRegistration, PersistenceSettings};
pub use event_manager::ListenOptions;
pub use query::{LimitType, Query};
pub use sync_engine::SyncEngine;
pub use target::Target;
pub use view_snapshot::{ChangeType, DocumentSet, DocumentViewChange, ViewSnapshot};
