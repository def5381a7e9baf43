use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

use crate::firestore::error::{aborted, failed_precondition, internal_error, FirestoreResult};
use crate::firestore::local::persistence::{Persistence, TableStore, TransactionBody, TransactionMode};
use crate::firestore::local::schema::{SchemaTables, SCHEMA_VERSION};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    modified: SystemTime,
    len: u64,
}

fn stamp_of(path: &Path) -> Option<FileStamp> {
    let metadata = fs::metadata(path).ok()?;
    Some(FileStamp {
        modified: metadata.modified().ok()?,
        len: metadata.len(),
    })
}

struct FileState {
    path: PathBuf,
    /// Stamp of the file contents currently loaded into the table store.
    loaded: Mutex<Option<FileStamp>>,
}

/// Durable persistence backed by a single JSON snapshot file.
///
/// Every committed transaction rewrites the snapshot through a temporary file
/// and an atomic rename. Before each transaction the file is reloaded if
/// another process replaced it; a commit that finds the file changed under it
/// fails with `aborted` and leaves the newer file untouched.
#[derive(Clone)]
pub struct FilePersistence {
    store: Arc<TableStore>,
    state: Arc<FileState>,
    client_id: String,
}

impl FilePersistence {
    pub fn open(path: impl Into<PathBuf>, client_id: impl Into<String>) -> FirestoreResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    internal_error(format!(
                        "Failed to create persistence directory '{}': {}",
                        parent.display(),
                        err
                    ))
                })?;
            }
        }
        let (tables, stamp) = match stamp_of(&path) {
            Some(stamp) => (read_tables(&path)?, Some(stamp)),
            None => (SchemaTables::default(), None),
        };
        Ok(Self {
            store: Arc::new(TableStore::new(tables)),
            state: Arc::new(FileState {
                path,
                loaded: Mutex::new(stamp),
            }),
            client_id: client_id.into(),
        })
    }

    /// A handle for another context in this process sharing the loaded tables.
    pub fn attach(&self, client_id: impl Into<String>) -> Self {
        Self {
            store: Arc::clone(&self.store),
            state: Arc::clone(&self.state),
            client_id: client_id.into(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.state.path
    }

    fn reload_if_changed(&self) -> FirestoreResult<()> {
        // The stamp lock is never held while taking the table lock; commits
        // take them in the opposite order.
        let loaded = *self
            .state
            .loaded
            .lock()
            .map_err(|_| internal_error("persistence file lock poisoned"))?;
        let current = stamp_of(&self.state.path);
        if current.is_none() || current == loaded {
            return Ok(());
        }
        log::debug!(
            "reloading persistence file '{}' after an external change",
            self.state.path.display()
        );
        let tables = read_tables(&self.state.path)?;
        self.store.with_tables(|current_tables| *current_tables = tables)?;
        *self
            .state
            .loaded
            .lock()
            .map_err(|_| internal_error("persistence file lock poisoned"))? = current;
        Ok(())
    }

    fn write_snapshot(&self, tables: &SchemaTables) -> FirestoreResult<()> {
        let mut loaded = self
            .state
            .loaded
            .lock()
            .map_err(|_| internal_error("persistence file lock poisoned"))?;
        let path = &self.state.path;
        if stamp_of(path) != *loaded {
            return Err(aborted(format!(
                "Persistence file '{}' was modified by another process",
                path.display()
            )));
        }
        let bytes = serde_json::to_vec(tables).map_err(|err| {
            internal_error(format!(
                "Failed to serialize persistence file '{}': {}",
                path.display(),
                err
            ))
        })?;
        let temp = path.with_extension("tmp");
        write_synced(&temp, &bytes).map_err(|err| {
            internal_error(format!(
                "Failed to write persistence file '{}': {}",
                temp.display(),
                err
            ))
        })?;
        fs::rename(&temp, path).map_err(|err| {
            internal_error(format!(
                "Failed to replace persistence file '{}': {}",
                path.display(),
                err
            ))
        })?;
        sync_parent_directory(path);
        *loaded = stamp_of(path);
        Ok(())
    }
}

/// Writes `bytes` and flushes them to the device before returning.
fn write_synced(path: &Path, bytes: &[u8]) -> std::io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(bytes)?;
    file.sync_all()
}

/// Makes the rename itself durable. Not every platform can open a directory
/// for syncing, so failures are only logged.
fn sync_parent_directory(path: &Path) {
    let Some(directory) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) else {
        return;
    };
    if let Err(err) = fs::File::open(directory).and_then(|dir| dir.sync_all()) {
        log::debug!("could not sync directory '{}': {err}", directory.display());
    }
}

fn read_tables(path: &Path) -> FirestoreResult<SchemaTables> {
    let bytes = fs::read(path).map_err(|err| {
        internal_error(format!(
            "Failed to read persistence file '{}': {}",
            path.display(),
            err
        ))
    })?;
    let tables: SchemaTables = serde_json::from_slice(&bytes).map_err(|err| {
        failed_precondition(format!(
            "Failed to parse persistence file '{}': {}",
            path.display(),
            err
        ))
    })?;
    if tables.schema_version > SCHEMA_VERSION {
        return Err(failed_precondition(format!(
            "Persistence file '{}' has schema version {} but this client supports {}",
            path.display(),
            tables.schema_version,
            SCHEMA_VERSION
        )));
    }
    Ok(tables)
}

impl Persistence for FilePersistence {
    fn client_id(&self) -> &str {
        &self.client_id
    }

    fn is_durable(&self) -> bool {
        true
    }

    fn run_transaction_dyn(
        &self,
        label: &'static str,
        mode: TransactionMode,
        body: &mut TransactionBody<'_>,
    ) -> FirestoreResult<()> {
        self.reload_if_changed()?;
        self.store.run(&self.client_id, label, mode, body, |tables| {
            self.write_snapshot(tables)
        })
    }

    fn approximate_byte_size(&self) -> FirestoreResult<u64> {
        match fs::metadata(&self.state.path) {
            Ok(metadata) => Ok(metadata.len()),
            Err(_) => self.store.with_tables(|tables| tables.approximate_byte_size()),
        }
    }

    fn shutdown(&self) -> FirestoreResult<()> {
        let temp = self.state.path.with_extension("tmp");
        if temp.exists() {
            if let Err(err) = fs::remove_file(&temp) {
                log::debug!("could not remove '{}': {err}", temp.display());
            }
        }
        Ok(())
    }
}
