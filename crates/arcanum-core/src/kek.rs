//! Key-encryption key provisioning.
//!
//! The seal manager never stores the master key in plaintext. Instead it
//! wraps the master key with a key-encryption key (KEK) that lives outside
//! the storage backend. Where that KEK comes from (an environment variable,
//! a KMS, an HSM) is the provider's business.

use crate::crypto::EncryptionKey;
use crate::error::SealError;

/// Supplies the key-encryption key used to wrap the persisted master key.
#[async_trait::async_trait]
pub trait KekProvider: Send + Sync {
    /// Return the current key-encryption key.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Kek`] if the key cannot be obtained.
    async fn key_encryption_key(&self) -> Result<EncryptionKey, SealError>;
}

/// A KEK held in process memory, typically loaded from configuration.
#[derive(Clone)]
pub struct StaticKek {
    key: EncryptionKey,
}

impl StaticKek {
    /// Wrap an existing key.
    #[must_use]
    pub fn new(key: EncryptionKey) -> Self {
        Self { key }
    }

    /// Parse a KEK from 64 hex characters.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Kek`] if the input is not valid hex or does not
    /// decode to exactly 32 bytes.
    pub fn from_hex(encoded: &str) -> Result<Self, SealError> {
        let bytes = zeroize::Zeroizing::new(hex::decode(encoded.trim()).map_err(|e| {
            SealError::Kek {
                reason: format!("invalid hex: {e}"),
            }
        })?);
        let key = EncryptionKey::from_slice(&bytes).ok_or_else(|| SealError::Kek {
            reason: format!("expected 32 bytes, got {}", bytes.len()),
        })?;
        Ok(Self { key })
    }
}

impl std::fmt::Debug for StaticKek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticKek")
            .field("key", &"[REDACTED]")
            .finish()
    }
}

#[async_trait::async_trait]
impl KekProvider for StaticKek {
    async fn key_encryption_key(&self) -> Result<EncryptionKey, SealError> {
        Ok(self.key.clone())
    }
}
