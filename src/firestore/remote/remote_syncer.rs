use std::collections::BTreeSet;

use async_trait::async_trait;

use crate::firestore::error::{FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, MutationBatchResult, User};
use crate::firestore::remote::online_state_tracker::OnlineState;
use crate::firestore::remote::remote_event::RemoteEvent;

/// Callbacks from the remote store into the sync engine.
///
/// Every async method is invoked from an operation running on the async
/// queue.
#[async_trait]
pub trait RemoteSyncer: Send + Sync + 'static {
    /// Applies a consistent snapshot of one or more targets.
    async fn apply_remote_event(&self, event: RemoteEvent) -> FirestoreResult<()>;

    /// The backend removed a target with an error.
    async fn reject_listen(&self, target_id: i32, error: FirestoreError) -> FirestoreResult<()>;

    /// The head of the write pipeline was acknowledged.
    async fn apply_successful_write(&self, result: MutationBatchResult) -> FirestoreResult<()>;

    /// The head of the write pipeline failed permanently.
    async fn reject_failed_write(&self, batch_id: i32, error: FirestoreError) -> FirestoreResult<()>;

    /// The signed-in user changed; the streams have already been torn down.
    async fn handle_credential_change(&self, user: User) -> FirestoreResult<()>;

    fn apply_online_state_change(&self, online_state: OnlineState);

    /// Keys the local store currently associates with `target_id`, plus
    /// limbo document keys for limbo resolution targets.
    fn get_remote_keys_for_target(&self, target_id: i32) -> BTreeSet<DocumentKey>;
}
