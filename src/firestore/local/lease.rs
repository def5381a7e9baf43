//! Primary lease shared by every execution context attached to one store.
//!
//! Exactly one context holds the owner row at a time. The holder refreshes the
//! row every [`LeaseSettings::refresh_interval`]; a row older than
//! [`LeaseSettings::max_age`] is treated as abandoned and may be claimed by any
//! context with the network enabled.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::firestore::error::{failed_precondition, FirestoreResult};
use crate::firestore::local::persistence::{Persistence, PersistenceTransaction, TransactionMode};
use crate::firestore::local::schema::{tables, SchemaTables};

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerRecord {
    pub owner_id: String,
    pub lease_timestamp_ms: i64,
    pub allow_tab_synchronization: bool,
}

/// Liveness row written by every context on each refresh.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMetadata {
    pub client_id: String,
    pub update_time_ms: i64,
    pub in_foreground: bool,
    pub network_enabled: bool,
}

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 {
        chrono::Utc::now().timestamp_millis()
    }
}

/// Clock advanced by hand, for deterministic lease expiry.
#[derive(Debug, Default)]
pub struct ManualClock {
    millis: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self {
        Self {
            millis: AtomicI64::new(start_ms),
        }
    }

    pub fn advance(&self, by: Duration) {
        self.millis
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    pub fn set(&self, millis: i64) {
        self.millis.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.millis.load(Ordering::SeqCst)
    }
}

#[derive(Clone, Debug)]
pub struct LeaseSettings {
    pub refresh_interval: Duration,
    pub max_age: Duration,
    /// Metadata rows older than this are deleted by the primary.
    pub client_metadata_max_age: Duration,
    /// When false, a second context attaching to a store owned by a live
    /// primary fails instead of running as a secondary.
    pub allow_tab_synchronization: bool,
}

impl Default for LeaseSettings {
    fn default() -> Self {
        Self {
            refresh_interval: Duration::from_secs(4),
            max_age: Duration::from_secs(5),
            client_metadata_max_age: Duration::from_secs(30 * 60),
            allow_tab_synchronization: true,
        }
    }
}

pub struct LeaseManager {
    persistence: Arc<dyn Persistence>,
    client_id: String,
    clock: Arc<dyn Clock>,
    settings: LeaseSettings,
    in_foreground: AtomicBool,
    network_enabled: AtomicBool,
    is_primary: AtomicBool,
}

impl LeaseManager {
    pub fn new(persistence: Arc<dyn Persistence>, clock: Arc<dyn Clock>, settings: LeaseSettings) -> Self {
        let client_id = persistence.client_id().to_string();
        Self {
            persistence,
            client_id,
            clock,
            settings,
            in_foreground: AtomicBool::new(true),
            network_enabled: AtomicBool::new(true),
            is_primary: AtomicBool::new(false),
        }
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn settings(&self) -> &LeaseSettings {
        &self.settings
    }

    pub fn is_primary(&self) -> bool {
        self.is_primary.load(Ordering::SeqCst)
    }

    pub fn set_in_foreground(&self, in_foreground: bool) {
        self.in_foreground.store(in_foreground, Ordering::SeqCst);
    }

    pub fn set_network_enabled(&self, enabled: bool) {
        self.network_enabled.store(enabled, Ordering::SeqCst);
    }

    fn network_enabled(&self) -> bool {
        self.network_enabled.load(Ordering::SeqCst)
    }

    fn in_foreground(&self) -> bool {
        self.in_foreground.load(Ordering::SeqCst)
    }

    fn is_within_age(&self, timestamp_ms: i64, max_age: Duration, now_ms: i64) -> bool {
        let max_age_ms = max_age.as_millis() as i64;
        if timestamp_ms > now_ms + max_age_ms {
            log::warn!(
                "detected a lease timestamp {}ms in the future for client {}",
                timestamp_ms - now_ms,
                self.client_id
            );
            return false;
        }
        timestamp_ms >= now_ms - max_age_ms
    }

    /// Writes this context's liveness row, then claims or extends the lease.
    /// Returns whether this context is primary afterwards.
    ///
    /// A context that is no longer entitled to the lease keeps the owner row
    /// until [`LeaseManager::release_primary_lease`], so nobody else can
    /// claim it while its streams are still open.
    pub fn update_client_metadata_and_try_become_primary(&self) -> FirestoreResult<bool> {
        let now_ms = self.clock.now_ms();
        let primary = self.persistence.run_transaction(
            "update client metadata and try become primary",
            TransactionMode::ReadWrite,
            |txn| {
                let metadata = ClientMetadata {
                    client_id: self.client_id.clone(),
                    update_time_ms: now_ms,
                    in_foreground: self.in_foreground(),
                    network_enabled: self.network_enabled(),
                };
                txn.put(tables::client_metadata, self.client_id.clone(), metadata)?;
                txn.delete(tables::zombied_clients, &self.client_id)?;
                if self.can_act_as_primary(txn, now_ms)? {
                    let owner = OwnerRecord {
                        owner_id: self.client_id.clone(),
                        lease_timestamp_ms: now_ms,
                        allow_tab_synchronization: self.settings.allow_tab_synchronization,
                    };
                    txn.replace(tables::owner, Some(owner))?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            },
        )?;
        let was_primary = self.is_primary.swap(primary, Ordering::SeqCst);
        if was_primary != primary {
            log::debug!(
                "client {} {} the primary lease",
                self.client_id,
                if primary { "acquired" } else { "lost" }
            );
        }
        Ok(primary)
    }

    /// Deletes the owner row if this context still holds it. Call once the
    /// network of a context that lost the lease has stopped.
    pub fn release_primary_lease(&self) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("release primary lease", TransactionMode::ReadWrite, |txn| {
                self.release_lease_if_held(txn)
            })?;
        self.is_primary.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Id of the context currently holding the owner row.
    pub fn current_owner(&self) -> FirestoreResult<Option<String>> {
        self.persistence
            .run_transaction("read primary lease", TransactionMode::ReadOnly, |txn| {
                Ok(txn.tables().owner.as_ref().map(|owner| owner.owner_id.clone()))
            })
    }

    /// Flags this context as shut down so the others stop trusting its rows
    /// before they age out. Cleared by [`LeaseManager::release`] or by the
    /// next refresh of a context with the same id.
    pub fn mark_zombied(&self) -> FirestoreResult<()> {
        let now_ms = self.clock.now_ms();
        self.persistence
            .run_transaction("mark client zombied", TransactionMode::ReadWrite, |txn| {
                txn.put(tables::zombied_clients, self.client_id.clone(), now_ms)
            })
    }

    fn is_zombied(tables: &SchemaTables, client_id: &str) -> bool {
        tables.zombied_clients.contains_key(client_id)
    }

    fn can_act_as_primary(&self, txn: &PersistenceTransaction<'_>, now_ms: i64) -> FirestoreResult<bool> {
        let tables = txn.tables();
        let network_enabled = self.network_enabled();
        let in_foreground = self.in_foreground();
        if let Some(owner) = tables.owner.as_ref() {
            let owner_alive = self.is_within_age(owner.lease_timestamp_ms, self.settings.max_age, now_ms)
                && !Self::is_zombied(tables, &owner.owner_id);
            if owner_alive {
                if owner.owner_id == self.client_id {
                    if network_enabled && !self.has_better_candidate(txn, now_ms) {
                        return Ok(true);
                    }
                } else {
                    if !owner.allow_tab_synchronization {
                        return Err(failed_precondition(
                            "Another client holds an exclusive primary lease on this store",
                        ));
                    }
                    return Ok(false);
                }
            }
        }

        if network_enabled && in_foreground {
            return Ok(true);
        }
        Ok(!self.has_better_candidate(txn, now_ms))
    }

    /// Another live context with a better network or visibility state.
    fn has_better_candidate(&self, txn: &PersistenceTransaction<'_>, now_ms: i64) -> bool {
        let network_enabled = self.network_enabled();
        let in_foreground = self.in_foreground();
        let tables = txn.tables();
        tables
            .client_metadata
            .values()
            .filter(|other| other.client_id != self.client_id)
            .filter(|other| !Self::is_zombied(tables, &other.client_id))
            .filter(|other| self.is_within_age(other.update_time_ms, self.settings.max_age, now_ms))
            .any(|other| {
                let better_network = !network_enabled && other.network_enabled;
                let better_visibility = !in_foreground && other.in_foreground;
                let same_network = network_enabled == other.network_enabled;
                better_network || (better_visibility && same_network)
            })
    }

    fn release_lease_if_held(&self, txn: &mut PersistenceTransaction<'_>) -> FirestoreResult<()> {
        let held = txn
            .tables()
            .owner
            .as_ref()
            .is_some_and(|owner| owner.owner_id == self.client_id);
        if held {
            txn.replace(tables::owner, None)?;
        }
        Ok(())
    }

    /// Gives up the lease and removes this context's rows.
    pub fn release(&self) -> FirestoreResult<()> {
        self.persistence
            .run_transaction("release client", TransactionMode::ReadWrite, |txn| {
                self.release_lease_if_held(txn)?;
                txn.delete(tables::client_metadata, &self.client_id)?;
                txn.delete(tables::zombied_clients, &self.client_id)
            })?;
        self.is_primary.store(false, Ordering::SeqCst);
        Ok(())
    }

    /// Contexts whose metadata was refreshed recently enough to be alive.
    pub fn active_clients(&self) -> FirestoreResult<Vec<ClientMetadata>> {
        let now_ms = self.clock.now_ms();
        self.persistence
            .run_transaction("get active clients", TransactionMode::ReadOnly, |txn| {
                let tables = txn.tables();
                Ok(tables
                    .client_metadata
                    .values()
                    .filter(|client| !Self::is_zombied(tables, &client.client_id))
                    .filter(|client| {
                        self.is_within_age(client.update_time_ms, self.settings.client_metadata_max_age, now_ms)
                    })
                    .cloned()
                    .collect())
            })
    }

    /// Deletes metadata rows of contexts that stopped refreshing.
    pub fn remove_stale_client_metadata(&self) -> FirestoreResult<usize> {
        let now_ms = self.clock.now_ms();
        self.persistence.run_transaction(
            "remove stale client metadata",
            TransactionMode::ReadWritePrimary,
            |txn| {
                let stale: Vec<String> = txn
                    .tables()
                    .client_metadata
                    .values()
                    .filter(|client| {
                        !self.is_within_age(client.update_time_ms, self.settings.client_metadata_max_age, now_ms)
                    })
                    .map(|client| client.client_id.clone())
                    .collect();
                for client_id in &stale {
                    txn.delete(tables::client_metadata, client_id)?;
                    txn.delete(tables::zombied_clients, client_id)?;
                }
                Ok(stale.len())
            },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::local::memory_persistence::MemoryPersistence;

    fn manager(persistence: MemoryPersistence, clock: &Arc<ManualClock>) -> LeaseManager {
        LeaseManager::new(Arc::new(persistence), clock.clone(), LeaseSettings::default())
    }

    #[test]
    fn first_foreground_client_becomes_primary() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = MemoryPersistence::new("first");
        let second = first.attach("second");
        let first = manager(first, &clock);
        let second = manager(second, &clock);

        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!second.update_client_metadata_and_try_become_primary().unwrap());
        clock.advance(Duration::from_secs(4));
        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!second.update_client_metadata_and_try_become_primary().unwrap());
    }

    #[test]
    fn expired_lease_can_be_claimed() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = MemoryPersistence::new("first");
        let second = first.attach("second");
        let first = manager(first, &clock);
        let second = manager(second, &clock);

        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        clock.advance(Duration::from_secs(6));
        assert!(second.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!first.update_client_metadata_and_try_become_primary().unwrap());
    }

    #[test]
    fn background_primary_yields_to_foreground_client() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = MemoryPersistence::new("first");
        let second = first.attach("second");
        let first = manager(first, &clock);
        let second = manager(second, &clock);

        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        first.set_in_foreground(false);
        assert!(!second.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!first.update_client_metadata_and_try_become_primary().unwrap());

        // The row stays with `first` until it has stopped its network.
        assert!(!second.update_client_metadata_and_try_become_primary().unwrap());
        first.release_primary_lease().unwrap();
        assert!(second.update_client_metadata_and_try_become_primary().unwrap());
    }

    #[test]
    fn zombied_owner_is_skipped_before_lease_expires() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = MemoryPersistence::new("first");
        let second = first.attach("second");
        let first = manager(first, &clock);
        let second = manager(second, &clock);

        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!second.update_client_metadata_and_try_become_primary().unwrap());
        first.mark_zombied().unwrap();
        assert!(second.update_client_metadata_and_try_become_primary().unwrap());
        let active: Vec<String> = second
            .active_clients()
            .unwrap()
            .into_iter()
            .map(|client| client.client_id)
            .collect();
        assert_eq!(active, vec!["second".to_string()]);
    }

    #[test]
    fn refresh_clears_own_zombie_marker() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = MemoryPersistence::new("first");
        let second = first.attach("second");
        let first = manager(first, &clock);
        let second = manager(second, &clock);

        first.mark_zombied().unwrap();
        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        assert!(!second.update_client_metadata_and_try_become_primary().unwrap());
    }

    #[test]
    fn exclusive_lease_rejects_second_client() {
        let clock = Arc::new(ManualClock::new(1_000_000));
        let first = MemoryPersistence::new("first");
        let second = first.attach("second");
        let settings = LeaseSettings {
            allow_tab_synchronization: false,
            ..LeaseSettings::default()
        };
        let first = LeaseManager::new(Arc::new(first), clock.clone(), settings.clone());
        let second = LeaseManager::new(Arc::new(second), clock.clone(), settings);

        assert!(first.update_client_metadata_and_try_become_primary().unwrap());
        assert!(second.update_client_metadata_and_try_become_primary().is_err());
    }
}
