//! Encryption barrier for `Arcanum`.
//!
//! Every engine record passes through the barrier's encrypt/decrypt. The
//! storage layer only ever sees ciphertext. The barrier holds no key of its
//! own: it borrows the master key from the [`SealManager`] for the duration
//! of each call, so sealing the vault takes effect immediately.
//!
//! When the vault is sealed, every call fails with [`BarrierError::Sealed`].
//!
//! # Security model
//!
//! - All values are encrypted with AES-256-GCM (fresh nonce per write).
//! - Keys (storage paths) are stored in plaintext to support prefix listing.
//! - Individual fields (key material, payloads) can additionally be sealed
//!   under a per-purpose HKDF subkey via [`Barrier::seal_field`].

use std::fmt;
use std::sync::Arc;

use arcanum_storage::{Mutation, Precondition, StorageBackend};

use crate::crypto::{self, EncryptionKey};
use crate::error::BarrierError;
use crate::seal::SealManager;

/// Opaque marker for the stored form of a record.
///
/// Two reads return the same revision only if nothing was written in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Revision(Vec<u8>);

/// A decrypted record together with the revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned {
    /// Decrypted value.
    pub value: Vec<u8>,
    /// Revision to pass back in [`Expect::Unchanged`].
    pub revision: Revision,
}

/// Condition a key must satisfy for a [`Change`] to be applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Expect {
    /// No condition.
    Anything,
    /// The key must not exist.
    Absent,
    /// The key must still hold the record read at this revision.
    Unchanged(Revision),
}

/// One guarded write in a [`Barrier::apply`] batch.
#[derive(Debug, Clone)]
pub struct Change {
    key: String,
    expect: Expect,
    value: Option<Vec<u8>>,
}

impl Change {
    /// Put a plaintext value under a condition.
    #[must_use]
    pub fn put(key: impl Into<String>, expect: Expect, value: Vec<u8>) -> Self {
        Self {
            key: key.into(),
            expect,
            value: Some(value),
        }
    }

    /// Delete a key under a condition.
    #[must_use]
    pub fn delete(key: impl Into<String>, expect: Expect) -> Self {
        Self {
            key: key.into(),
            expect,
            value: None,
        }
    }
}

/// Guard a change by the revision it was read at, or by absence if the
/// record did not exist.
#[must_use]
pub fn expect_from(current: Option<&Versioned>) -> Expect {
    current.map_or(Expect::Absent, |v| Expect::Unchanged(v.revision.clone()))
}

/// The encryption barrier wrapping a storage backend.
pub struct Barrier {
    storage: Arc<dyn StorageBackend>,
    seal: Arc<SealManager>,
}

impl Barrier {
    /// Create a barrier over the given storage, keyed by the seal manager.
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, seal: Arc<SealManager>) -> Self {
        Self { storage, seal }
    }

    /// Borrow the master key for one operation.
    async fn master_key(&self) -> Result<EncryptionKey, BarrierError> {
        self.seal.master_key().await.ok_or(BarrierError::Sealed)
    }

    /// Read and decrypt a value. Returns `Ok(None)` if the key does not exist.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if decryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        Ok(self.read(key).await?.map(|v| v.value))
    }

    /// Read and decrypt a value along with its revision.
    ///
    /// # Errors
    ///
    /// Same as [`get`](Self::get).
    pub async fn read(&self, key: &str) -> Result<Option<Versioned>, BarrierError> {
        let master = self.master_key().await?;
        match self.storage.get(key).await? {
            None => Ok(None),
            Some(ciphertext) => {
                let value = crypto::decrypt(&master, &ciphertext)?;
                Ok(Some(Versioned {
                    value,
                    revision: Revision(ciphertext),
                }))
            }
        }
    }

    /// Encrypt and write a value unconditionally.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        let master = self.master_key().await?;
        let ciphertext = crypto::encrypt(&master, value)?;
        self.storage.put(key, &ciphertext).await?;
        Ok(())
    }

    /// Delete a key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        let _master = self.master_key().await?;
        self.storage.delete(key).await?;
        Ok(())
    }

    /// List keys with the given prefix.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let _master = self.master_key().await?;
        Ok(self.storage.list(prefix).await?)
    }

    /// Atomically apply a batch of guarded changes.
    ///
    /// Returns `Ok(false)` without writing anything if any expectation no
    /// longer holds; the caller re-reads and retries.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if encryption fails.
    /// - [`BarrierError::Storage`] if the storage backend fails.
    pub async fn apply(&self, changes: Vec<Change>) -> Result<bool, BarrierError> {
        let master = self.master_key().await?;

        let mut mutations = Vec::with_capacity(changes.len());
        for change in changes {
            let precondition = match change.expect {
                Expect::Anything => Precondition::None,
                Expect::Absent => Precondition::Absent,
                Expect::Unchanged(Revision(bytes)) => Precondition::Matches(bytes),
            };
            let value = match change.value {
                Some(plaintext) => Some(crypto::encrypt(&master, &plaintext)?),
                None => None,
            };
            mutations.push(Mutation {
                key: change.key,
                precondition,
                value,
            });
        }

        Ok(self.storage.transact(&mutations).await?)
    }

    /// Encrypt a field under the per-purpose subkey of the master key.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if derivation or encryption fails.
    pub async fn seal_field(&self, purpose: &str, plaintext: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let subkey = self.subkey(purpose).await?;
        Ok(crypto::encrypt(&subkey, plaintext)?)
    }

    /// Decrypt a field sealed with [`seal_field`](Self::seal_field) for the
    /// same purpose.
    ///
    /// # Errors
    ///
    /// - [`BarrierError::Sealed`] if the vault is sealed.
    /// - [`BarrierError::Crypto`] if derivation or decryption fails.
    pub async fn open_field(&self, purpose: &str, sealed: &[u8]) -> Result<Vec<u8>, BarrierError> {
        let subkey = self.subkey(purpose).await?;
        Ok(crypto::decrypt(&subkey, sealed)?)
    }

    async fn subkey(&self, purpose: &str) -> Result<EncryptionKey, BarrierError> {
        let master = self.master_key().await?;
        let info = format!("arcanum-field-{purpose}-v1");
        Ok(crypto::derive_key(&master, None, info.as_bytes())?)
    }
}

impl fmt::Debug for Barrier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Barrier").finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use arcanum_storage::MemoryBackend;

    use super::*;
    use crate::audit::AuditManager;
    use crate::kek::StaticKek;

    /// An unsealed barrier over fresh memory storage, plus its pieces.
    pub(crate) struct Harness {
        pub storage: Arc<MemoryBackend>,
        pub seal: Arc<SealManager>,
        pub barrier: Arc<Barrier>,
        pub shares: Vec<String>,
    }

    pub(crate) async fn unsealed_with_audit(audit: Arc<AuditManager>) -> Harness {
        let storage = Arc::new(MemoryBackend::new());
        let kek = Arc::new(StaticKek::new(EncryptionKey::generate()));
        let seal = Arc::new(SealManager::new(storage.clone(), kek, audit));
        let shares = seal.init(3, 2).await.unwrap().shares;
        seal.unseal(&shares[0]).await.unwrap();
        seal.unseal(&shares[1]).await.unwrap();
        let barrier = Arc::new(Barrier::new(storage.clone(), seal.clone()));
        Harness {
            storage,
            seal,
            barrier,
            shares,
        }
    }

    pub(crate) async fn unsealed() -> Harness {
        unsealed_with_audit(Arc::new(AuditManager::new())).await
    }

    #[tokio::test]
    async fn put_get_roundtrip_stores_ciphertext() {
        let h = unsealed().await;
        h.barrier.put("kv/data/app", b"hello").await.unwrap();

        assert_eq!(
            h.barrier.get("kv/data/app").await.unwrap(),
            Some(b"hello".to_vec())
        );
        let raw = h.storage.get("kv/data/app").await.unwrap().unwrap();
        assert_ne!(raw, b"hello".to_vec());
    }

    #[tokio::test]
    async fn sealed_barrier_rejects_everything() {
        let h = unsealed().await;
        h.barrier.put("k", b"v").await.unwrap();
        h.seal.seal().await.unwrap();

        assert!(matches!(h.barrier.get("k").await, Err(BarrierError::Sealed)));
        assert!(matches!(h.barrier.put("k", b"v").await, Err(BarrierError::Sealed)));
        assert!(matches!(h.barrier.list("").await, Err(BarrierError::Sealed)));
        assert!(matches!(
            h.barrier.seal_field("pki", b"x").await,
            Err(BarrierError::Sealed)
        ));
    }

    #[tokio::test]
    async fn apply_with_stale_revision_is_rejected() {
        let h = unsealed().await;
        h.barrier.put("rec", b"v1").await.unwrap();
        let first = h.barrier.read("rec").await.unwrap().unwrap();

        h.barrier.put("rec", b"v2").await.unwrap();

        let applied = h
            .barrier
            .apply(vec![Change::put(
                "rec",
                Expect::Unchanged(first.revision),
                b"v3".to_vec(),
            )])
            .await
            .unwrap();
        assert!(!applied);
        assert_eq!(h.barrier.get("rec").await.unwrap(), Some(b"v2".to_vec()));
    }

    #[tokio::test]
    async fn apply_absent_then_unchanged() {
        let h = unsealed().await;
        assert!(
            h.barrier
                .apply(vec![Change::put("rec", expect_from(None), b"a".to_vec())])
                .await
                .unwrap()
        );
        let current = h.barrier.read("rec").await.unwrap().unwrap();
        assert!(
            h.barrier
                .apply(vec![
                    Change::put("rec", expect_from(Some(&current)), b"b".to_vec()),
                    Change::put("idx", Expect::Absent, b"1".to_vec()),
                ])
                .await
                .unwrap()
        );
        assert_eq!(h.barrier.get("idx").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn fields_are_bound_to_purpose() {
        let h = unsealed().await;
        let sealed = h.barrier.seal_field("transit", b"key material").await.unwrap();
        assert_eq!(
            h.barrier.open_field("transit", &sealed).await.unwrap(),
            b"key material"
        );
        assert!(h.barrier.open_field("pki", &sealed).await.is_err());
    }

    #[tokio::test]
    async fn data_survives_seal_cycle() {
        let h = unsealed().await;
        h.barrier.put("k", b"persist").await.unwrap();
        h.seal.seal().await.unwrap();
        h.seal.unseal(&h.shares[1]).await.unwrap();
        h.seal.unseal(&h.shares[2]).await.unwrap();
        assert_eq!(h.barrier.get("k").await.unwrap(), Some(b"persist".to_vec()));
    }
}
