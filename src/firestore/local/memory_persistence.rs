use std::sync::Arc;

use crate::firestore::error::FirestoreResult;
use crate::firestore::local::persistence::{Persistence, TableStore, TransactionBody, TransactionMode};
use crate::firestore::local::schema::SchemaTables;

/// Non-durable persistence. Contexts created through [`MemoryPersistence::attach`]
/// share the same tables, which is how several clients in one process
/// coordinate without a file.
#[derive(Clone)]
pub struct MemoryPersistence {
    store: Arc<TableStore>,
    client_id: String,
}

impl MemoryPersistence {
    pub fn new(client_id: impl Into<String>) -> Self {
        Self {
            store: Arc::new(TableStore::new(SchemaTables::default())),
            client_id: client_id.into(),
        }
    }

    /// A handle for another context backed by the same tables.
    pub fn attach(&self, client_id: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            client_id: client_id.into(),
        }
    }
}

impl Persistence for MemoryPersistence {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_durable(&self) -> bool {
        false
    }

    fn run_transaction_dyn(
        &self,
        label: &'static str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()> {
        self.store
            .run(&self.client_id, label, mode, body, |_| Ok(()))
    }

    fn approximate_byte_size(&self) -> FirestoreResult<u64> {
        self.store.with_tables(|tables| tables.approximate_byte_size())
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        Ok(())
    }
}
