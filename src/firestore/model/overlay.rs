use serde::{Deserialize, Serialize};

use crate::firestore::model::{DocumentKey, Mutation};

/// Cached local view of a document's pending writes, expressed as one mutation
/// on top of the remote document.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Overlay {
    /// Highest batch id folded into this overlay.
    pub largest_batch_id: i32,
    pub mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        &self.mutation.key
    }
}
