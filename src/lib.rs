//! Offline-first local cache and synchronization engine for a hosted
//! document database.
//!
//! A [`firestore::FirestoreClient`] keeps a durable copy of the documents its
//! queries touch, applies writes optimistically, and reconciles both with the
//! backend over the listen and write streams once it is online. Several
//! clients may share one store; a lease decides which of them talks to the
//! network.
//!
//! The library logs through the [`log`] facade and installs no logger.

pub mod firestore;
pub mod platform;
pub mod util;
