use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use docsync_core::{BufferProvider, DocumentId, LocalBuffer, ReplicaRank, StoreError, Value};
use redb::{Database, Durability, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::{debug, info, instrument, warn};

// Key: document key, Value: JSON-encoded value
const DOCUMENT: TableDefinition<&str, &[u8]> = TableDefinition::new("document");

fn db_err(e: impl std::fmt::Display) -> StoreError {
    StoreError::Io(e.to_string())
}

/// Local buffer stored in a single redb file.
///
/// Writes commit with eventual durability; [`LocalBuffer::flush`] forces an
/// immediate-durability commit so everything written before it survives a
/// crash.
pub struct RedbBuffer {
    path: PathBuf,
    db: RwLock<Option<Database>>,
}

impl std::fmt::Debug for RedbBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbBuffer")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RedbBuffer {
    /// Open or create the buffer file at `path`.
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let db = Database::create(&path).map_err(|e| {
            StoreError::Io(format!("Failed to open buffer {}: {}", path.display(), e))
        })?;

        // Create the table so readers never see it missing
        let write_txn = db.begin_write().map_err(db_err)?;
        write_txn.open_table(DOCUMENT).map_err(db_err)?;
        write_txn.commit().map_err(db_err)?;

        debug!("Opened buffer {}", path.display());
        Ok(Self {
            path,
            db: RwLock::new(Some(db)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn with_db<T>(
        &self,
        f: impl FnOnce(&Database) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let guard = self
            .db
            .read()
            .map_err(|_| StoreError::Internal("buffer handle lock poisoned".to_string()))?;
        match guard.as_ref() {
            Some(db) => f(db),
            None => Err(StoreError::Closed(format!(
                "buffer {} is closed",
                self.path.display()
            ))),
        }
    }

    fn write(
        &self,
        durability: Durability,
        f: impl FnOnce(&mut redb::Table<'_, &'static str, &'static [u8]>) -> Result<(), StoreError>,
    ) -> Result<(), StoreError> {
        self.with_db(|db| {
            let mut write_txn = db.begin_write().map_err(db_err)?;
            write_txn.set_durability(durability);
            {
                let mut table = write_txn.open_table(DOCUMENT).map_err(db_err)?;
                f(&mut table)?;
            }
            write_txn.commit().map_err(db_err)
        })
    }
}

impl LocalBuffer for RedbBuffer {
    fn get(&self, key: &str) -> Result<Option<Value>, StoreError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(db_err)?;
            let table = read_txn.open_table(DOCUMENT).map_err(db_err)?;
            match table.get(key).map_err(db_err)? {
                Some(raw) => Ok(Some(serde_json::from_slice(raw.value())?)),
                None => Ok(None),
            }
        })
    }

    fn set(&self, key: &str, value: &Value) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(value)?;
        self.write(Durability::Eventual, |table| {
            table.insert(key, encoded.as_slice()).map_err(db_err)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let mut removed = false;
        self.write(Durability::Eventual, |table| {
            removed = table.remove(key).map_err(db_err)?.is_some();
            Ok(())
        })?;
        Ok(removed)
    }

    fn keys(&self) -> Result<Vec<String>, StoreError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(db_err)?;
            let table = read_txn.open_table(DOCUMENT).map_err(db_err)?;
            let mut keys = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, _) = entry.map_err(db_err)?;
                keys.push(key.value().to_string());
            }
            Ok(keys)
        })
    }

    fn len(&self) -> Result<usize, StoreError> {
        self.with_db(|db| {
            let read_txn = db.begin_read().map_err(db_err)?;
            let table = read_txn.open_table(DOCUMENT).map_err(db_err)?;
            Ok(table.len().map_err(db_err)? as usize)
        })
    }

    fn clear(&self) -> Result<(), StoreError> {
        let keys = self.keys()?;
        self.write(Durability::Eventual, |table| {
            for key in &keys {
                table.remove(key.as_str()).map_err(db_err)?;
            }
            Ok(())
        })
    }

    fn flush(&self) -> Result<(), StoreError> {
        self.write(Durability::Immediate, |_| Ok(()))
    }

    fn close(&self) -> Result<(), StoreError> {
        let mut guard = self
            .db
            .write()
            .map_err(|_| StoreError::Internal("buffer handle lock poisoned".to_string()))?;
        if guard.take().is_some() {
            debug!("Closed buffer {}", self.path.display());
        }
        Ok(())
    }
}

/// Provider of redb-backed buffers.
///
/// Buffer files are stored at:
/// `{base_dir}/{document_id}.{rank}.redb`
///
/// Operators should treat these files as opaque and leave them alone while a
/// document is open.
#[derive(Debug, Clone)]
pub struct RedbBufferProvider {
    base_dir: PathBuf,
}

impl RedbBufferProvider {
    /// Create a new provider storing buffers under `base_dir`.
    pub fn new(base_dir: impl AsRef<Path>) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
        }
    }

    /// Get the path to a buffer file.
    pub fn buffer_path(&self, id: &DocumentId, rank: ReplicaRank) -> PathBuf {
        self.base_dir.join(format!("{}.{}.redb", id, rank))
    }
}

impl BufferProvider for RedbBufferProvider {
    fn provider_name(&self) -> &'static str {
        "redb"
    }

    fn open(
        &self,
        id: &DocumentId,
        rank: ReplicaRank,
    ) -> Result<Arc<dyn LocalBuffer>, StoreError> {
        let path = self.buffer_path(id, rank);
        let existed = path.exists();
        let buffer = RedbBuffer::open(&path)?;
        if !existed {
            info!("Created buffer {}", path.display());
        }
        Ok(Arc::new(buffer))
    }

    fn exists(&self, id: &DocumentId, rank: ReplicaRank) -> bool {
        self.buffer_path(id, rank).exists()
    }

    #[instrument(skip(self), level = "debug")]
    fn destroy(&self, id: &DocumentId, rank: ReplicaRank) -> Result<bool, StoreError> {
        let path = self.buffer_path(id, rank);
        match std::fs::remove_file(&path) {
            Ok(()) => {
                debug!("Deleted buffer {}", path.display());
                Ok(true)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => {
                warn!("Failed to delete buffer {}: {}", path.display(), e);
                Err(StoreError::Io(format!(
                    "Failed to delete {}: {}",
                    path.display(),
                    e
                )))
            }
        }
    }

    fn location(&self, id: &DocumentId, rank: ReplicaRank) -> String {
        self.buffer_path(id, rank).display().to_string()
    }
}
