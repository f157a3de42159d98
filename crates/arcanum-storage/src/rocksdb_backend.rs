//! `RocksDB` storage backend.
//!
//! Wraps the `rocksdb` crate behind the [`StorageBackend`] trait. All
//! operations are dispatched to a blocking thread via
//! [`tokio::task::spawn_blocking`] since `RocksDB` is a synchronous C++ library.
//!
//! Writes are serialized through a process-local write lock so that
//! [`StorageBackend::transact`] can check its preconditions and commit a
//! `WriteBatch` without another writer slipping in between.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use rocksdb::{DBWithThreadMode, MultiThreaded, Options, WriteBatch};

use crate::{Mutation, StorageBackend, StorageError};

type Db = DBWithThreadMode<MultiThreaded>;

/// A storage backend backed by `RocksDB`.
///
/// Thread-safe (`Arc<DB>` internally) and safe to share across async tasks.
/// All blocking `RocksDB` calls are offloaded to the Tokio blocking thread pool.
///
/// # Examples
///
/// ```no_run
/// # use arcanum_storage::RocksDbBackend;
/// let backend = RocksDbBackend::open("/var/lib/arcanum/data").unwrap();
/// ```
#[derive(Clone)]
pub struct RocksDbBackend {
    db: Arc<Db>,
    write_lock: Arc<Mutex<()>>,
    path: PathBuf,
}

impl std::fmt::Debug for RocksDbBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RocksDbBackend")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl RocksDbBackend {
    /// Open a `RocksDB` database at the given path.
    ///
    /// Creates the database directory if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if `RocksDB` fails to open or create the
    /// database at the specified path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StorageError> {
        let path = path.as_ref();
        let mut opts = Options::default();
        opts.create_if_missing(true);

        let db = Db::open(&opts, path).map_err(|e| StorageError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(Self {
            db: Arc::new(db),
            write_lock: Arc::new(Mutex::new(())),
            path: path.to_path_buf(),
        })
    }

    /// Return the filesystem path of this database.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply a batch under the write lock, checking preconditions first.
    fn apply_locked(
        db: &Db,
        lock: &Mutex<()>,
        mutations: &[Mutation],
    ) -> Result<bool, StorageError> {
        let _guard = lock.lock().map_err(|e| StorageError::Transaction {
            reason: format!("write lock poisoned: {e}"),
        })?;

        for m in mutations {
            let current = db.get(m.key.as_bytes()).map_err(|e| StorageError::Read {
                key: m.key.clone(),
                reason: e.to_string(),
            })?;
            if !m.precondition.holds(current.as_deref()) {
                tracing::debug!(key = %m.key, "precondition failed, batch aborted");
                return Ok(false);
            }
        }

        let mut batch = WriteBatch::default();
        for m in mutations {
            match &m.value {
                Some(value) => batch.put(m.key.as_bytes(), value),
                None => batch.delete(m.key.as_bytes()),
            }
        }
        db.write(batch).map_err(|e| StorageError::Transaction {
            reason: e.to_string(),
        })?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl StorageBackend for RocksDbBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let db = Arc::clone(&self.db);
        let key = key.to_owned();
        tokio::task::spawn_blocking(move || {
            db.get(key.as_bytes()).map_err(|e| StorageError::Read {
                key,
                reason: e.to_string(),
            })
        })
        .await?
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mutation = Mutation::put(key, crate::Precondition::None, value.to_vec());
        self.transact(std::slice::from_ref(&mutation)).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mutation = Mutation::delete(key, crate::Precondition::None);
        self.transact(std::slice::from_ref(&mutation)).await?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let db = Arc::clone(&self.db);
        let prefix = prefix.to_owned();
        tokio::task::spawn_blocking(move || {
            let iter = db.iterator(rocksdb::IteratorMode::From(
                prefix.as_bytes(),
                rocksdb::Direction::Forward,
            ));

            let mut keys = Vec::new();
            for item in iter {
                let (k, _) = item.map_err(|e| StorageError::List {
                    prefix: prefix.clone(),
                    reason: e.to_string(),
                })?;
                let key_str =
                    String::from_utf8(k.to_vec()).map_err(|e| StorageError::InvalidKey {
                        reason: e.to_string(),
                    })?;
                if !key_str.starts_with(&prefix) {
                    break;
                }
                keys.push(key_str);
            }
            Ok(keys)
        })
        .await?
    }

    async fn transact(&self, mutations: &[Mutation]) -> Result<bool, StorageError> {
        let db = Arc::clone(&self.db);
        let lock = Arc::clone(&self.write_lock);
        let mutations = mutations.to_vec();
        tokio::task::spawn_blocking(move || Self::apply_locked(&db, &lock, &mutations))
            .await?
    }
}
