pub mod core;
pub mod error;
pub mod local;
pub mod model;
pub mod remote;
pub mod value;

pub use self::core::{ClientConfig, FirestoreClient, ListenOptions, ListenerRegistration, PersistenceSettings, Query};
pub use error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
