//! In-memory storage backend for testing.
//!
//! This backend stores all data in a `BTreeMap` behind a `RwLock`. It is not
//! persistent — all data is lost when the process exits. Use this for unit
//! tests and integration tests where you need a real storage backend without
//! touching disk.

use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::{Mutation, StorageBackend, StorageError};

/// An in-memory storage backend backed by a `BTreeMap`.
///
/// Thread-safe and async-compatible. Data is sorted by key, which makes
/// prefix listing efficient via `BTreeMap::range`. Transactions hold the
/// write lock for the whole batch, so they are serializable.
///
/// # Examples
///
/// ```
/// # use arcanum_storage::{MemoryBackend, StorageBackend};
/// # #[tokio::main]
/// # async fn main() {
/// let backend = MemoryBackend::new();
/// backend.put("sys/config", b"data").await.unwrap();
/// let val = backend.get("sys/config").await.unwrap();
/// assert_eq!(val, Some(b"data".to_vec()));
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct MemoryBackend {
    data: Arc<RwLock<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryBackend {
    /// Create a new empty in-memory backend.
    #[must_use]
    pub fn new() -> Self {
        Self {
            data: Arc::new(RwLock::new(BTreeMap::new())),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl StorageBackend for MemoryBackend {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let data = self.data.read().await;
        Ok(data.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.insert(key.to_owned(), value.to_vec());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StorageError> {
        let mut data = self.data.write().await;
        data.remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>, StorageError> {
        let data = self.data.read().await;
        let keys = data
            .range(prefix.to_owned()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect();
        Ok(keys)
    }

    async fn transact(&self, mutations: &[Mutation]) -> Result<bool, StorageError> {
        let mut data = self.data.write().await;

        let all_hold = mutations.iter().all(|m| {
            m.precondition
                .holds(data.get(&m.key).map(Vec::as_slice))
        });
        if !all_hold {
            return Ok(false);
        }

        for m in mutations {
            match &m.value {
                Some(value) => {
                    data.insert(m.key.clone(), value.clone());
                }
                None => {
                    data.remove(&m.key);
                }
            }
        }
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        let data = self.data.read().await;
        Ok(data.contains_key(key))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::Precondition;

    #[tokio::test]
    async fn get_nonexistent_returns_none() {
        let backend = MemoryBackend::new();
        let result = backend.get("does/not/exist").await.unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn put_and_get_roundtrip() {
        let backend = MemoryBackend::new();
        backend.put("sys/config", b"hello").await.unwrap();
        let val = backend.get("sys/config").await.unwrap();
        assert_eq!(val, Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn delete_nonexistent_is_noop() {
        let backend = MemoryBackend::new();
        backend.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn list_with_prefix() {
        let backend = MemoryBackend::new();
        backend.put("kv/data/a", b"1").await.unwrap();
        backend.put("kv/data/b", b"2").await.unwrap();
        backend.put("kv/metadata/a", b"3").await.unwrap();
        backend.put("sys/config", b"4").await.unwrap();

        let keys = backend.list("kv/data/").await.unwrap();
        assert_eq!(keys, vec!["kv/data/a", "kv/data/b"]);
    }

    #[tokio::test]
    async fn cas_create_only_succeeds_once() {
        let backend = MemoryBackend::new();
        assert!(backend.compare_and_swap("k", None, b"v1").await.unwrap());
        assert!(!backend.compare_and_swap("k", None, b"v2").await.unwrap());
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v1".to_vec()));
    }

    #[tokio::test]
    async fn cas_with_stale_expectation_fails() {
        let backend = MemoryBackend::new();
        backend.put("k", b"v1").await.unwrap();
        assert!(
            backend
                .compare_and_swap("k", Some(b"v1"), b"v2")
                .await
                .unwrap()
        );
        assert!(
            !backend
                .compare_and_swap("k", Some(b"v1"), b"v3")
                .await
                .unwrap()
        );
        assert_eq!(backend.get("k").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn transact_is_all_or_nothing() {
        let backend = MemoryBackend::new();
        backend.put("taken", b"x").await.unwrap();

        let applied = backend
            .transact(&[
                Mutation::put("fresh", Precondition::Absent, b"a".to_vec()),
                Mutation::put("taken", Precondition::Absent, b"b".to_vec()),
            ])
            .await
            .unwrap();

        assert!(!applied);
        assert!(!backend.exists("fresh").await.unwrap());
        assert_eq!(backend.get("taken").await.unwrap(), Some(b"x".to_vec()));
    }

    #[tokio::test]
    async fn transact_applies_puts_and_deletes() {
        let backend = MemoryBackend::new();
        backend.put("old", b"x").await.unwrap();

        let applied = backend
            .transact(&[
                Mutation::put("new", Precondition::None, b"a".to_vec()),
                Mutation::delete("old", Precondition::Matches(b"x".to_vec())),
            ])
            .await
            .unwrap();

        assert!(applied);
        assert_eq!(backend.get("new").await.unwrap(), Some(b"a".to_vec()));
        assert!(!backend.exists("old").await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_cas_has_single_winner() {
        let backend = MemoryBackend::new();
        let mut handles = Vec::new();
        for i in 0..16u8 {
            let b = backend.clone();
            handles.push(tokio::spawn(async move {
                b.compare_and_swap("counter", None, &[i]).await.unwrap()
            }));
        }
        let mut winners = 0;
        for h in handles {
            if h.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn clone_shares_state() {
        let backend = MemoryBackend::new();
        let clone = backend.clone();
        backend.put("key", b"val").await.unwrap();
        let val = clone.get("key").await.unwrap();
        assert_eq!(val, Some(b"val".to_vec()));
    }
}
