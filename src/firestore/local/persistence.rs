use std::collections::BTreeMap;
use std::sync::Mutex;

use crate::firestore::error::{internal_error, primary_lease_lost, FirestoreResult};
use crate::firestore::local::schema::{tables, SchemaTables};
use crate::firestore::model::ListenSequenceNumber;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, and fails with a lease-lost error unless this client owns the primary lease.
    ReadWritePrimary,
}

impl TransactionMode {
    pub fn is_writable(&self) -> bool {
        !matches!(self, TransactionMode::ReadOnly)
    }
}

pub(crate) type Table<K, V> = fn(&mut SchemaTables) -> &mut BTreeMap<K, V>;
type UndoAction = Box<dyn FnOnce(&mut SchemaTables) + Send>;

/// An atomic unit of work against the local store. Every write records an undo
/// step; a body that returns an error has all of its writes rolled back.
pub struct PersistenceTransaction<'a> {
    tables: &'a mut SchemaTables,
    undo: Vec<UndoAction>,
    label: &'static str,
    mode: TransactionMode,
    sequence_number: Option<ListenSequenceNumber>,
}

impl<'a> PersistenceTransaction<'a> {
    fn new(tables: &'a mut SchemaTables, label: &'static str, mode: TransactionMode) -> Self {
        Self {
            tables,
            undo: Vec::new(),
            label,
            mode,
            sequence_number: None,
        }
    }

    pub fn label(&self) -> &'static str {
        self.label
    }

    pub fn mode(&self) -> TransactionMode {
        self.mode
    }

    pub(crate) fn tables(&self) -> &SchemaTables {
        self.tables
    }

    pub(crate) fn has_writes(&self) -> bool {
        !self.undo.is_empty()
    }

    /// Sequence number stamped on everything this transaction touches.
    /// Allocated on first use.
    pub fn current_sequence_number(&mut self) -> FirestoreResult<ListenSequenceNumber> {
        if let Some(sequence_number) = self.sequence_number {
            return Ok(sequence_number);
        }
        let mut globals = self.tables.target_globals.clone();
        globals.highest_listen_sequence_number += 1;
        let next = globals.highest_listen_sequence_number;
        self.replace(tables::target_globals, globals)?;
        self.sequence_number = Some(next);
        Ok(next)
    }

    fn ensure_writable(&self) -> FirestoreResult<()> {
        if self.mode.is_writable() {
            Ok(())
        } else {
            Err(internal_error(format!(
                "Write attempted in read-only transaction '{}'",
                self.label
            )))
        }
    }

    pub(crate) fn put<K, V>(&mut self, table: Table<K, V>, key: K, value: V) -> FirestoreResult<()>
    where
        K: Ord + Clone + Send + 'static,
        V: Send + 'static,
    {
        self.ensure_writable()?;
        let previous = table(self.tables).insert(key.clone(), value);
        self.undo.push(Box::new(move |tables| {
            match previous {
                Some(previous) => {
                    table(tables).insert(key, previous);
                }
                None => {
                    table(tables).remove(&key);
                }
            };
        }));
        Ok(())
    }

    pub(crate) fn delete<K, V>(&mut self, table: Table<K, V>, key: &K) -> FirestoreResult<()>
    where
        K: Ord + Clone + Send + 'static,
        V: Send + 'static,
    {
        self.ensure_writable()?;
        if let Some(previous) = table(self.tables).remove(key) {
            let key = key.clone();
            self.undo.push(Box::new(move |tables| {
                table(tables).insert(key, previous);
            }));
        }
        Ok(())
    }

    pub(crate) fn replace<T>(&mut self, field: fn(&mut SchemaTables) -> &mut T, value: T) -> FirestoreResult<()>
    where
        T: Send + 'static,
    {
        self.ensure_writable()?;
        let previous = std::mem::replace(field(self.tables), value);
        self.undo.push(Box::new(move |tables| {
            *field(tables) = previous;
        }));
        Ok(())
    }

    fn rollback(mut self) {
        while let Some(step) = self.undo.pop() {
            step(self.tables);
        }
    }
}

pub type TransactionBody<'b> = dyn FnMut(&mut PersistenceTransaction<'_>) -> FirestoreResult<()> + 'b;

/// Storage capability shared by the memory and file backends.
pub trait Persistence: Send + Sync {
    /// Identity of the execution context that owns this handle.
    fn client_id(&self) -> &str;

    /// True when data outlives the process.
    fn is_durable(&self) -> bool;

    fn run_transaction_dyn(
        &self,
        label: &'static str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()>;

    fn approximate_byte_size(&self) -> FirestoreResult<u64>;

    fn shutdown(&self) -> FirestoreResult<()>;
}

impl dyn Persistence + '_ {
    pub fn run_transaction<T, F>(&self, label: &'static str, mode: TransactionMode, body: F) -> FirestoreResult<T>
    where
        F: FnOnce(&mut PersistenceTransaction<'_>) -> FirestoreResult<T>,
    {
        let mut body = Some(body);
        let mut output = None;
        self.run_transaction_dyn(label, mode, &mut |txn| {
            let body = body
                .take()
                .ok_or_else(|| internal_error("transaction body invoked twice"))?;
            output = Some(body(txn)?);
            Ok(())
        })?;
        output.ok_or_else(|| internal_error(format!("transaction '{label}' produced no result")))
    }
}

/// Lock-protected tables plus the commit protocol shared by both backends.
pub(crate) struct TableStore {
    tables: Mutex<SchemaTables>,
}

impl TableStore {
    pub(crate) fn new(tables: SchemaTables) -> Self {
        Self {
            tables: Mutex::new(tables),
        }
    }

    pub(crate) fn with_tables<R>(&self, f: impl FnOnce(&mut SchemaTables) -> R) -> FirestoreResult<R> {
        let mut guard = self
            .tables
            .lock()
            .map_err(|_| internal_error("persistence lock poisoned"))?;
        Ok(f(&mut guard))
    }

    /// Runs `body` and then `commit`. A failure in either restores the tables.
    pub(crate) fn run(
        &self,
        client_id: &str,
        label: &'static str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
        commit: impl FnOnce(&SchemaTables) -> FirestoreResult<()>,
    ) -> FirestoreResult<()> {
        let mut guard = self
            .tables
            .lock()
            .map_err(|_| internal_error("persistence lock poisoned"))?;
        if mode == TransactionMode::ReadWritePrimary
            && guard.owner.as_ref().map(|owner| owner.owner_id.as_str()) != Some(client_id)
        {
            log::debug!("transaction '{label}' rejected: primary lease not held by {client_id}");
            return Err(primary_lease_lost());
        }
        let mut txn = PersistenceTransaction::new(&mut guard, label, mode);
        match body(&mut txn) {
            Ok(()) => {
                if !txn.has_writes() {
                    return Ok(());
                }
                let PersistenceTransaction { tables, undo, .. } = txn;
                match commit(tables) {
                    Ok(()) => Ok(()),
                    Err(err) => {
                        for step in undo.into_iter().rev() {
                            step(tables);
                        }
                        Err(err)
                    }
                }
            }
            Err(err) => {
                log::debug!("transaction '{label}' failed, rolling back: {err}");
                txn.rollback();
                Err(err)
            }
        }
    }
}
