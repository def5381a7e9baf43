//! In-process channel between client contexts attached to one store.
//!
//! Contexts exchange batch states, query target states, the primary's online
//! state, and the set of targets each context listens to. The channel also
//! remembers the last value of each, so a context that joins later starts
//! from the current picture.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex, MutexGuard};

use async_channel::{Receiver, Sender};

use crate::firestore::error::{internal_error, FirestoreError, FirestoreResult};
use crate::firestore::model::{DocumentKey, User};
use crate::firestore::remote::online_state_tracker::OnlineState;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MutationBatchStatus {
    Pending,
    Acknowledged,
    Rejected,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryTargetStatus {
    NotCurrent,
    Current,
    Rejected,
}

#[derive(Clone, Debug, PartialEq)]
pub struct MutationBatchState {
    pub user: User,
    pub batch_id: i32,
    pub status: MutationBatchStatus,
    pub error: Option<FirestoreError>,
    /// Documents written by the batch, when the sender knows them.
    pub keys: BTreeSet<DocumentKey>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryTargetState {
    pub target_id: i32,
    pub status: QueryTargetStatus,
    pub error: Option<FirestoreError>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClientState {
    pub active_target_ids: BTreeSet<i32>,
}

#[derive(Clone, Debug, PartialEq)]
pub enum SharedClientMessage {
    MutationBatch(MutationBatchState),
    QueryTarget(QueryTargetState),
    OnlineState(OnlineState),
    /// The union of targets listened to by all contexts changed.
    Client {
        state: ClientState,
        added_target_ids: BTreeSet<i32>,
        removed_target_ids: BTreeSet<i32>,
    },
}

#[derive(Clone, Debug, PartialEq)]
pub struct SharedClientEnvelope {
    pub sender: String,
    pub message: SharedClientMessage,
}

#[derive(Default)]
struct ChannelState {
    subscribers: BTreeMap<String, Sender<SharedClientEnvelope>>,
    clients: BTreeMap<String, ClientState>,
    query_states: BTreeMap<i32, QueryTargetStatus>,
    online_state: Option<OnlineState>,
}

impl ChannelState {
    fn active_targets(&self) -> BTreeSet<i32> {
        self.clients
            .values()
            .flat_map(|client| client.active_target_ids.iter().copied())
            .collect()
    }

    fn broadcast(&mut self, sender: &str, message: SharedClientMessage) {
        self.subscribers.retain(|client_id, subscriber| {
            if client_id == sender {
                return true;
            }
            subscriber
                .try_send(SharedClientEnvelope {
                    sender: sender.to_string(),
                    message: message.clone(),
                })
                .is_ok()
        });
    }

    /// Replaces `client_id`'s targets and announces the change of the union.
    fn update_client(&mut self, client_id: &str, state: Option<ClientState>) {
        let before = self.active_targets();
        match &state {
            Some(state) => {
                self.clients.insert(client_id.to_string(), state.clone());
            }
            None => {
                self.clients.remove(client_id);
            }
        }
        let after = self.active_targets();
        let added_target_ids: BTreeSet<i32> = after.difference(&before).copied().collect();
        let removed_target_ids: BTreeSet<i32> = before.difference(&after).copied().collect();
        if added_target_ids.is_empty() && removed_target_ids.is_empty() {
            return;
        }
        self.broadcast(
            client_id,
            SharedClientMessage::Client {
                state: state.unwrap_or_default(),
                added_target_ids,
                removed_target_ids,
            },
        );
    }
}

/// Broadcast medium shared by every context in the process that uses the
/// same store. Clone it into each client's configuration.
#[derive(Clone, Default)]
pub struct SharedClientChannel {
    state: Arc<Mutex<ChannelState>>,
}

impl SharedClientChannel {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> FirestoreResult<MutexGuard<'_, ChannelState>> {
        self.state
            .lock()
            .map_err(|_| internal_error("shared client channel lock poisoned"))
    }
}

/// One context's endpoint on a [`SharedClientChannel`].
pub struct SharedClientState {
    channel: SharedClientChannel,
    client_id: String,
    user: Mutex<User>,
    local_targets: Mutex<BTreeSet<i32>>,
}

impl SharedClientState {
    pub fn new(channel: SharedClientChannel, client_id: impl Into<String>, user: User) -> Self {
        Self {
            channel,
            client_id: client_id.into(),
            user: Mutex::new(user),
            local_targets: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Registers this context and returns the stream of messages sent by the
    /// others.
    pub fn start(&self) -> FirestoreResult<Receiver<SharedClientEnvelope>> {
        let (sender, receiver) = async_channel::unbounded();
        let mut channel = self.channel.lock()?;
        channel.subscribers.insert(self.client_id.clone(), sender);
        channel
            .clients
            .entry(self.client_id.clone())
            .or_default();
        Ok(receiver)
    }

    pub fn shutdown(&self) -> FirestoreResult<()> {
        let mut channel = self.channel.lock()?;
        channel.subscribers.remove(&self.client_id);
        channel.update_client(&self.client_id, None);
        Ok(())
    }

    fn current_user(&self) -> FirestoreResult<User> {
        self.user
            .lock()
            .map(|user| user.clone())
            .map_err(|_| internal_error("shared client user lock poisoned"))
    }

    fn local_targets(&self) -> FirestoreResult<MutexGuard<'_, BTreeSet<i32>>> {
        self.local_targets
            .lock()
            .map_err(|_| internal_error("shared client targets lock poisoned"))
    }

    pub fn add_pending_mutation(&self, batch_id: i32, keys: BTreeSet<DocumentKey>) -> FirestoreResult<()> {
        self.update_mutation_state(batch_id, MutationBatchStatus::Pending, None, keys)
    }

    pub fn update_mutation_state(
        &self,
        batch_id: i32,
        status: MutationBatchStatus,
        error: Option<FirestoreError>,
        keys: BTreeSet<DocumentKey>,
    ) -> FirestoreResult<()> {
        let user = self.current_user()?;
        self.channel.lock()?.broadcast(
            &self.client_id,
            SharedClientMessage::MutationBatch(MutationBatchState {
                user,
                batch_id,
                status,
                error,
                keys,
            }),
        );
        Ok(())
    }

    /// Adds `target_id` to this context's targets when `add_to_active` is
    /// set, and returns the last state any context reported for it.
    pub fn add_local_query_target(&self, target_id: i32, add_to_active: bool) -> FirestoreResult<QueryTargetStatus> {
        let mut channel = self.channel.lock()?;
        let status = if channel.active_targets().contains(&target_id) {
            match channel.query_states.get(&target_id) {
                Some(QueryTargetStatus::Current) => QueryTargetStatus::Current,
                _ => QueryTargetStatus::NotCurrent,
            }
        } else {
            QueryTargetStatus::NotCurrent
        };
        if add_to_active {
            let mut local_targets = self.local_targets()?;
            local_targets.insert(target_id);
            let state = ClientState {
                active_target_ids: local_targets.clone(),
            };
            channel.update_client(&self.client_id, Some(state));
        }
        Ok(status)
    }

    pub fn remove_local_query_target(&self, target_id: i32) -> FirestoreResult<()> {
        let mut channel = self.channel.lock()?;
        let mut local_targets = self.local_targets()?;
        if !local_targets.remove(&target_id) {
            return Ok(());
        }
        let state = ClientState {
            active_target_ids: local_targets.clone(),
        };
        channel.update_client(&self.client_id, Some(state));
        Ok(())
    }

    pub fn is_local_query_target(&self, target_id: i32) -> FirestoreResult<bool> {
        Ok(self.local_targets()?.contains(&target_id))
    }

    /// Whether any context, this one included, listens to `target_id`.
    pub fn is_active_query_target(&self, target_id: i32) -> FirestoreResult<bool> {
        Ok(self.channel.lock()?.active_targets().contains(&target_id))
    }

    pub fn get_all_active_query_targets(&self) -> FirestoreResult<BTreeSet<i32>> {
        Ok(self.channel.lock()?.active_targets())
    }

    pub fn update_query_state(
        &self,
        target_id: i32,
        status: QueryTargetStatus,
        error: Option<FirestoreError>,
    ) -> FirestoreResult<()> {
        let mut channel = self.channel.lock()?;
        channel.query_states.insert(target_id, status);
        channel.broadcast(
            &self.client_id,
            SharedClientMessage::QueryTarget(QueryTargetState {
                target_id,
                status,
                error,
            }),
        );
        Ok(())
    }

    pub fn clear_query_state(&self, target_id: i32) -> FirestoreResult<()> {
        self.channel.lock()?.query_states.remove(&target_id);
        Ok(())
    }

    /// Switches the user whose batches this context reports. Batches queued
    /// for the new user are announced so the primary picks them up.
    pub fn handle_user_change(&self, user: User, added_batch_ids: &[i32]) -> FirestoreResult<()> {
        *self
            .user
            .lock()
            .map_err(|_| internal_error("shared client user lock poisoned"))? = user;
        for batch_id in added_batch_ids {
            self.add_pending_mutation(*batch_id, BTreeSet::new())?;
        }
        Ok(())
    }

    pub fn set_online_state(&self, online_state: OnlineState) -> FirestoreResult<()> {
        let mut channel = self.channel.lock()?;
        channel.online_state = Some(online_state);
        channel.broadcast(&self.client_id, SharedClientMessage::OnlineState(online_state));
        Ok(())
    }

    /// Online state last reported by a primary, if any.
    pub fn online_state(&self) -> FirestoreResult<Option<OnlineState>> {
        Ok(self.channel.lock()?.online_state)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(channel: &SharedClientChannel, id: &str) -> (SharedClientState, Receiver<SharedClientEnvelope>) {
        let state = SharedClientState::new(channel.clone(), id, User::unauthenticated());
        let receiver = state.start().unwrap();
        (state, receiver)
    }

    #[test]
    fn target_union_changes_are_broadcast_to_others() {
        let channel = SharedClientChannel::new();
        let (primary, primary_rx) = endpoint(&channel, "primary");
        let (secondary, secondary_rx) = endpoint(&channel, "secondary");

        secondary.add_local_query_target(2, true).unwrap();
        let envelope = primary_rx.try_recv().unwrap();
        assert_eq!(envelope.sender, "secondary");
        match envelope.message {
            SharedClientMessage::Client { added_target_ids, .. } => {
                assert_eq!(added_target_ids, BTreeSet::from([2]))
            }
            other => panic!("unexpected message {other:?}"),
        }
        assert!(secondary_rx.try_recv().is_err());

        // Already in the union: nothing to announce.
        primary.add_local_query_target(2, true).unwrap();
        assert!(secondary_rx.try_recv().is_err());
        assert!(primary.is_active_query_target(2).unwrap());

        secondary.remove_local_query_target(2).unwrap();
        assert!(primary_rx.try_recv().is_err());
        primary.remove_local_query_target(2).unwrap();
        match secondary_rx.try_recv().unwrap().message {
            SharedClientMessage::Client { removed_target_ids, .. } => {
                assert_eq!(removed_target_ids, BTreeSet::from([2]))
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn joining_context_sees_current_query_state() {
        let channel = SharedClientChannel::new();
        let (primary, _primary_rx) = endpoint(&channel, "primary");
        primary.add_local_query_target(4, true).unwrap();
        primary.update_query_state(4, QueryTargetStatus::Current, None).unwrap();

        let (secondary, _secondary_rx) = endpoint(&channel, "secondary");
        assert_eq!(secondary.add_local_query_target(4, true).unwrap(), QueryTargetStatus::Current);
        assert_eq!(secondary.add_local_query_target(6, true).unwrap(), QueryTargetStatus::NotCurrent);
    }

    #[test]
    fn shutdown_removes_targets_from_union() {
        let channel = SharedClientChannel::new();
        let (primary, primary_rx) = endpoint(&channel, "primary");
        let (secondary, _secondary_rx) = endpoint(&channel, "secondary");
        secondary.add_local_query_target(8, true).unwrap();
        let _ = primary_rx.try_recv().unwrap();
        secondary.shutdown().unwrap();
        assert!(!primary.is_active_query_target(8).unwrap());
        assert!(matches!(
            primary_rx.try_recv().unwrap().message,
            SharedClientMessage::Client { .. }
        ));
    }
}
