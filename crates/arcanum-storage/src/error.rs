//! Storage error types.

/// Errors returned by a [`StorageBackend`](crate::StorageBackend).
///
/// A failed precondition in [`transact`](crate::StorageBackend::transact) is
/// not an error; it is reported as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// The database could not be opened or created.
    #[error("cannot open storage at '{path}': {reason}")]
    Open { path: String, reason: String },

    #[error("read of '{key}' failed: {reason}")]
    Read { key: String, reason: String },

    #[error("write of '{key}' failed: {reason}")]
    Write { key: String, reason: String },

    #[error("delete of '{key}' failed: {reason}")]
    Delete { key: String, reason: String },

    #[error("listing prefix '{prefix}' failed: {reason}")]
    List { prefix: String, reason: String },

    /// A table or column family the backend creates on open is gone.
    #[error("storage table '{name}' is missing")]
    MissingTable { name: String },

    /// A transaction could not begin, commit or abort.
    #[error("storage transaction failed: {reason}")]
    Transaction { reason: String },

    /// A stored key is not valid UTF-8.
    #[error("stored key is not valid UTF-8: {reason}")]
    InvalidKey { reason: String },

    /// A blocking backend call was cancelled or panicked on the worker pool.
    #[error("blocking storage task failed: {0}")]
    Blocking(#[from] tokio::task::JoinError),
}
