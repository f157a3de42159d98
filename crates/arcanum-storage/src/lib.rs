//! Storage backend abstraction for `Arcanum`.
//!
//! This crate defines the [`StorageBackend`] trait — a pure key-value storage
//! interface that knows nothing about secrets, encryption, or engines. The
//! encryption barrier in `arcanum-core` wraps a storage backend to ensure all
//! engine data is encrypted before it reaches this layer.
//!
//! Besides plain reads and writes, every backend provides [`transact`]: an
//! atomic batch of puts and deletes guarded by per-key preconditions. Engines
//! build version assignment, key rotation and CRL numbering on top of it, so
//! two concurrent writers can never both claim the same next version.
//!
//! Four implementations are provided:
//!
//! - [`RedbBackend`] — pure-Rust default, backed by redb (feature `redb-backend`)
//! - [`RocksDbBackend`] — backed by `RocksDB` (feature `rocksdb-backend`)
//! - [`PostgresBackend`] — backed by PostgreSQL (feature `postgres-backend`)
//! - [`MemoryBackend`] — in-memory, for testing and embedding
//!
//! [`transact`]: StorageBackend::transact

mod error;
mod memory;
#[cfg(feature = "postgres-backend")]
mod postgres_backend;
#[cfg(feature = "redb-backend")]
mod redb_backend;
#[cfg(feature = "rocksdb-backend")]
mod rocksdb_backend;

pub use error::StorageError;
pub use memory::MemoryBackend;
#[cfg(feature = "postgres-backend")]
pub use postgres_backend::PostgresBackend;
#[cfg(feature = "redb-backend")]
pub use redb_backend::RedbBackend;
#[cfg(feature = "rocksdb-backend")]
pub use rocksdb_backend::RocksDbBackend;

/// Condition a key must satisfy for a [`Mutation`] to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Precondition {
    /// No condition; the mutation applies unconditionally.
    None,
    /// The key must not exist.
    Absent,
    /// The key must exist and hold exactly these bytes.
    Matches(Vec<u8>),
}

impl Precondition {
    /// Check the precondition against the current stored value.
    #[must_use]
    pub fn holds(&self, current: Option<&[u8]>) -> bool {
        match (self, current) {
            (Self::None, _) | (Self::Absent, None) => true,
            (Self::Matches(expected), Some(actual)) => expected.as_slice() == actual,
            _ => false,
        }
    }
}

/// One guarded write inside a [`StorageBackend::transact`] batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mutation {
    /// Storage key.
    pub key: String,
    /// Condition checked before anything in the batch is written.
    pub precondition: Precondition,
    /// New value, or `None` to delete the key.
    pub value: Option<Vec<u8>>,
}

impl Mutation {
    /// A guarded put.
    #[must_use]
    pub fn put(key: impl Into<String>, precondition: Precondition, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            precondition,
            value: Some(value),
        }
    }

    /// A guarded delete.
    #[must_use]
    pub fn delete(key: impl Into<String>, precondition: Precondition) -> Self {
        Self {
            key: key.into(),
            precondition,
            value: None,
        }
    }
}

/// A pluggable key-value storage backend.
///
/// Keys are UTF-8 strings using `/` as a separator (e.g. `sys/seal/config`,
/// `kv/data/myapp/password`). Values are opaque byte arrays — the barrier
/// encrypts engine records before they reach storage.
///
/// Implementations must be safe to share across async tasks (`Send + Sync`).
#[async_trait::async_trait]
pub trait StorageBackend: Send + Sync + 'static {
    /// Retrieve a value by key.
    ///
    /// Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Store a key-value pair, overwriting any existing value.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the underlying backend fails.
    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Delete a key. This is idempotent — deleting a non-existent key is not
    /// an error.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Delete`] if the underlying backend fails.
    async fn delete(&self, key: &str) -> Result<(), StorageError>;

    /// List all keys that start with the given prefix, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::List`] if the underlying backend fails.
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError>;

    /// Atomically apply a batch of guarded mutations.
    ///
    /// Every precondition is checked first. If all hold, every mutation is
    /// applied as one unit and `Ok(true)` is returned. If any fails, nothing
    /// is written and `Ok(false)` is returned.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Transaction`] if the backend cannot complete
    /// the batch.
    async fn transact(&self, mutations: &[Mutation]) -> Result<bool, StorageError>;

    /// Conditionally replace a single key.
    ///
    /// `expected = None` means the key must not exist yet.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Transaction`] if the backend cannot complete
    /// the write.
    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&[u8]>,
        value: &[u8],
    ) -> Result<bool, StorageError> {
        let precondition = match expected {
            Some(bytes) => Precondition::Matches(bytes.to_vec()),
            None => Precondition::Absent,
        };
        self.transact(&[Mutation::put(key, precondition, value.to_vec())])
            .await
    }

    /// Check whether a key exists in storage.
    ///
    /// The default implementation calls [`get`](StorageBackend::get) and checks
    /// for `Some`. Backends may override this with a more efficient check.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the underlying backend fails.
    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        Ok(self.get(key).await?.is_some())
    }
}
