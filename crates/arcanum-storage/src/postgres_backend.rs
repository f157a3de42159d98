//! PostgreSQL storage backend.
//!
//! Stores all key-value data in a single `kv_store` table. Keys are UTF-8
//! strings, values are opaque bytes. Feature-gated behind `postgres-backend`.
//!
//! Guarded batches run inside one SQL transaction. Each precondition is
//! checked with `SELECT ... FOR UPDATE`, which row-locks existing keys; a
//! racing insert of a missing key surfaces as a unique violation and is
//! reported as a failed precondition.

use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use crate::{Mutation, StorageBackend, StorageError};

/// SQLSTATE for `unique_violation`.
const UNIQUE_VIOLATION: &str = "23505";

/// A storage backend backed by PostgreSQL.
///
/// Thread-safe via `PgPool` (connection pool). All operations are fully async.
///
/// # Examples
///
/// ```no_run
/// # use arcanum_storage::PostgresBackend;
/// # #[tokio::main]
/// # async fn main() {
/// let backend = PostgresBackend::connect("postgres://localhost/arcanum").await.unwrap();
/// # }
/// ```
#[derive(Clone)]
pub struct PostgresBackend {
    pool: PgPool,
}

impl std::fmt::Debug for PostgresBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgresBackend")
            .field("pool", &"[PgPool]")
            .finish_non_exhaustive()
    }
}

fn tx_error(e: &sqlx::Error) -> StorageError {
    StorageError::Transaction {
        reason: e.to_string(),
    }
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.code())
        .is_some_and(|code| code == UNIQUE_VIOLATION)
}

impl PostgresBackend {
    /// Connect to PostgreSQL and create the `kv_store` table if needed.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Open`] if the connection or migration fails.
    pub async fn connect(database_url: &str) -> Result<Self, StorageError> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StorageError::Open {
                path: database_url.to_owned(),
                reason: e.to_string(),
            })?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS kv_store (\
                key   TEXT  PRIMARY KEY, \
                value BYTEA NOT NULL\
            )",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: database_url.to_owned(),
            reason: format!("migration failed: {e}"),
        })?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_kv_store_key_prefix \
             ON kv_store (key text_pattern_ops)",
        )
        .execute(&pool)
        .await
        .map_err(|e| StorageError::Open {
            path: database_url.to_owned(),
            reason: format!("index creation failed: {e}"),
        })?;

        Ok(Self { pool })
    }

    /// Return a reference to the underlying connection pool.
    #[must_use]
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn apply_in(
        tx: &mut Transaction<'_, Postgres>,
        mutations: &[Mutation],
    ) -> Result<bool, sqlx::Error> {
        for m in mutations {
            let row: Option<(Vec<u8>,)> =
                sqlx::query_as("SELECT value FROM kv_store WHERE key = $1 FOR UPDATE")
                    .bind(&m.key)
                    .fetch_optional(&mut **tx)
                    .await?;
            if !m.precondition.holds(row.as_ref().map(|(v,)| v.as_slice())) {
                return Ok(false);
            }
        }

        for m in mutations {
            match &m.value {
                Some(value) => {
                    sqlx::query(
                        "INSERT INTO kv_store (key, value) VALUES ($1, $2) \
                         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
                    )
                    .bind(&m.key)
                    .bind(value)
                    .execute(&mut **tx)
                    .await?;
                }
                None => {
                    sqlx::query("DELETE FROM kv_store WHERE key = $1")
                        .bind(&m.key)
                        .execute(&mut **tx)
                        .await?;
                }
            }
        }
        Ok(true)
    }
}

#[async_trait::async_trait]
impl StorageBackend for PostgresBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let row: Option<(Vec<u8>,)> = sqlx::query_as("SELECT value FROM kv_store WHERE key = $1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StorageError::Read {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(row.map(|(v,)| v))
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO kv_store (key, value) VALUES ($1, $2) \
             ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| StorageError::Write {
            key: key.to_owned(),
            reason: e.to_string(),
        })?;

        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        sqlx::query("DELETE FROM kv_store WHERE key = $1")
            .bind(key)
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Delete {
                key: key.to_owned(),
                reason: e.to_string(),
            })?;

        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let escaped = prefix
            .replace('\\', "\\\\")
            .replace('%', "\\%")
            .replace('_', "\\_");
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT key FROM kv_store WHERE key LIKE $1 ORDER BY key")
                .bind(format!("{escaped}%"))
                .fetch_all(&self.pool)
                .await
                .map_err(|e| StorageError::List {
                    prefix: prefix.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(rows.into_iter().map(|(k,)| k).collect())
    }

    async fn transact(&self, mutations: &[Mutation]) -> Result<bool, StorageError> {
        let mut tx = self.pool.begin().await.map_err(|e| tx_error(&e))?;

        match Self::apply_in(&mut tx, mutations).await {
            Ok(true) => match tx.commit().await {
                Ok(()) => Ok(true),
                Err(e) if is_unique_violation(&e) => Ok(false),
                Err(e) => Err(tx_error(&e)),
            },
            Ok(false) => {
                tx.rollback().await.map_err(|e| tx_error(&e))?;
                Ok(false)
            }
            Err(e) if is_unique_violation(&e) => {
                tracing::debug!("concurrent insert lost precondition race");
                tx.rollback().await.map_err(|e| tx_error(&e))?;
                Ok(false)
            }
            Err(e) => {
                // Dropping the transaction rolls it back.
                Err(tx_error(&e))
            }
        }
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT EXISTS(SELECT 1 FROM kv_store WHERE key = $1)")
                .bind(key)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| StorageError::Read {
                    key: key.to_owned(),
                    reason: e.to_string(),
                })?;

        Ok(row.is_some_and(|(e,)| e))
    }
}
