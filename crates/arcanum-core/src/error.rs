//! Error types for `arcanum-core`.
//!
//! Each error variant carries enough context to diagnose the problem without
//! a debugger. Crypto errors never include key material, only key names,
//! versions or operation descriptions.
//!
//! Every engine error has an explicit `Sealed` variant. The barrier's
//! [`BarrierError::Sealed`] is translated into it rather than wrapped, so
//! callers can match on sealed state without digging through sources.

use arcanum_storage::StorageError;

/// Errors from cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// AEAD encryption failed.
    #[error("encryption failed: {reason}")]
    Encryption { reason: String },

    /// AEAD decryption failed (wrong key, corrupted ciphertext, or tampered tag).
    #[error("decryption failed: {reason}")]
    Decryption { reason: String },

    /// HKDF key derivation failed.
    #[error("key derivation failed for context '{context}': {reason}")]
    KeyDerivation { context: String, reason: String },

    /// Ciphertext is too short to contain a valid nonce + tag.
    #[error("ciphertext too short: expected at least {expected} bytes, got {actual}")]
    CiphertextTooShort { expected: usize, actual: usize },
}

/// Errors from the encryption barrier.
#[derive(Debug, thiserror::Error)]
pub enum BarrierError {
    /// The vault is sealed. No operations are possible until unseal.
    #[error("vault is sealed")]
    Sealed,

    /// A cryptographic operation within the barrier failed.
    #[error("barrier crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("barrier storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Errors from audit operations.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// All audit backends failed to write. The operation must not succeed.
    #[error("all audit backends failed (fail-closed)")]
    AllBackendsFailed,

    /// A specific audit backend failed.
    #[error("audit backend '{name}' failed: {reason}")]
    BackendFailure { name: String, reason: String },

    /// Serialization of the audit event failed.
    #[error("audit serialization failed: {reason}")]
    Serialization { reason: String },
}

/// Errors from seal/unseal operations.
#[derive(Debug, thiserror::Error)]
pub enum SealError {
    /// The vault has already been initialized.
    #[error("vault is already initialized")]
    AlreadyInitialized,

    /// The vault has not been initialized yet.
    #[error("vault is not initialized")]
    NotInitialized,

    /// The vault is already unsealed.
    #[error("vault is already unsealed")]
    AlreadyUnsealed,

    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// Invalid Shamir configuration parameters.
    #[error("invalid seal config: {reason}")]
    InvalidConfig { reason: String },

    /// A submitted unseal share was invalid or corrupted.
    #[error("invalid unseal share: {reason}")]
    InvalidShare { reason: String },

    /// The reconstructed master key did not match the persisted blob.
    /// All accumulated shares have been discarded.
    #[error("unseal verification failed: {reason}")]
    UnsealVerificationFailed { reason: String },

    /// The key-encryption key could not be obtained.
    #[error("key-encryption key unavailable: {reason}")]
    Kek { reason: String },

    /// The persisted seal record could not be encoded or decoded.
    #[error("seal record serialization failed: {reason}")]
    Serialization { reason: String },

    /// A cryptographic operation failed during seal/unseal.
    #[error("seal crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The underlying storage backend returned an error.
    #[error("seal storage error: {0}")]
    Storage(#[from] StorageError),

    /// The operation could not be audited.
    #[error("seal audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the transit engine.
#[derive(Debug, thiserror::Error)]
pub enum TransitError {
    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// The requested key was not found.
    #[error("transit key not found: {name}")]
    KeyNotFound { name: String },

    /// A key with this name already exists.
    #[error("transit key already exists: {name}")]
    KeyExists { name: String },

    /// The operation does not match the key type.
    #[error("key type '{key_type}' does not support {operation}")]
    UnsupportedCapability { key_type: String, operation: String },

    /// The requested version is out of range or below the configured minimum.
    #[error("invalid version {version} for key '{name}': {reason}")]
    InvalidVersion {
        name: String,
        version: u32,
        reason: String,
    },

    /// The ciphertext, signature or HMAC string is malformed.
    #[error("malformed input: {reason}")]
    Malformed { reason: String },

    /// The key is derived and no context was supplied, or the key is not
    /// derived and a context was supplied.
    #[error("invalid derivation context for key '{name}': {reason}")]
    Context { name: String, reason: String },

    /// Deletion is not enabled for this key.
    #[error("deletion is not allowed for key '{name}'")]
    DeletionNotAllowed { name: String },

    /// The key is not exportable.
    #[error("key '{name}' is not exportable")]
    NotExportable { name: String },

    /// Invalid request parameters.
    #[error("invalid transit request: {reason}")]
    InvalidRequest { reason: String },

    /// Concurrent writers kept winning the update race.
    #[error("transit key '{name}' was modified concurrently, retry limit reached")]
    Conflict { name: String },

    /// A cryptographic operation failed.
    #[error("transit crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The key record could not be encoded or decoded.
    #[error("transit serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("transit barrier error: {0}")]
    Barrier(BarrierError),

    /// The operation could not be audited.
    #[error("transit audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the versioned KV store.
#[derive(Debug, thiserror::Error)]
pub enum KvError {
    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// No secret exists at the path.
    #[error("secret not found at path '{path}'")]
    NotFound { path: String },

    /// The requested version does not exist.
    #[error("version {version} not found at path '{path}'")]
    VersionNotFound { path: String, version: u64 },

    /// The requested version is soft-deleted.
    #[error("version {version} at path '{path}' is deleted")]
    Deleted { path: String, version: u64 },

    /// The requested version was destroyed and can never be read again.
    #[error("version {version} at path '{path}' is destroyed")]
    Destroyed { path: String, version: u64 },

    /// The path requires check-and-set but no expected version was given.
    #[error("check-and-set is required for path '{path}'")]
    CasRequired { path: String },

    /// The expected version does not match the current version.
    #[error("check-and-set mismatch at path '{path}': expected {expected}, current {current}")]
    CasMismatch {
        path: String,
        expected: u64,
        current: u64,
    },

    /// A create-only write (`cas = 0`) found existing versions.
    #[error("secret already exists at path '{path}'")]
    AlreadyExists { path: String },

    /// The path is empty or contains invalid segments.
    #[error("invalid path: {reason}")]
    InvalidPath { reason: String },

    /// Metadata values are out of bounds.
    #[error("invalid metadata: {reason}")]
    InvalidMetadata { reason: String },

    /// Concurrent writers kept winning the update race.
    #[error("path '{path}' was modified concurrently, retry limit reached")]
    Conflict { path: String },

    /// The secret record could not be encoded or decoded.
    #[error("kv serialization failed: {reason}")]
    Serialization { reason: String },

    /// The barrier returned an error.
    #[error("kv barrier error: {0}")]
    Barrier(BarrierError),

    /// The operation could not be audited.
    #[error("kv audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the PKI engine.
#[derive(Debug, thiserror::Error)]
pub enum PkiError {
    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// The CA was not found.
    #[error("certificate authority not found: {name}")]
    CaNotFound { name: String },

    /// A CA with this name already exists.
    #[error("certificate authority already exists: {name}")]
    CaExists { name: String },

    /// The CA is revoked and cannot sign anything.
    #[error("certificate authority '{name}' is revoked")]
    RevokedCa { name: String },

    /// The CA still has intermediate children.
    #[error("certificate authority '{name}' still has {children} child CA(s)")]
    HasChildren { name: String, children: usize },

    /// The PKI role was not found.
    #[error("PKI role not found: {name}")]
    RoleNotFound { name: String },

    /// A role with this name already exists.
    #[error("PKI role already exists: {name}")]
    RoleExists { name: String },

    /// The certificate was not found in the ledger.
    #[error("certificate not found: {serial}")]
    CertificateNotFound { serial: String },

    /// The certificate is already revoked.
    #[error("certificate already revoked: {serial}")]
    AlreadyRevoked { serial: String },

    /// The requested name, SAN or TTL falls outside the role's rules.
    #[error("role '{role}' does not allow this request: {reason}")]
    RoleConstraintViolation { role: String, reason: String },

    /// The CA hierarchy would be violated (path length, sub-CA permission).
    #[error("invalid CA hierarchy: {reason}")]
    Hierarchy { reason: String },

    /// Invalid request parameters.
    #[error("invalid PKI request: {reason}")]
    InvalidRequest { reason: String },

    /// The certificate signing request could not be parsed or verified.
    #[error("invalid certificate signing request: {reason}")]
    InvalidCsr { reason: String },

    /// Certificate or CRL generation failed.
    #[error("certificate generation failed: {reason}")]
    CertGeneration { reason: String },

    /// Concurrent writers kept winning the update race.
    #[error("PKI state for '{name}' was modified concurrently, retry limit reached")]
    Conflict { name: String },

    /// A PKI record could not be encoded or decoded.
    #[error("PKI serialization failed: {reason}")]
    Serialization { reason: String },

    /// A cryptographic operation failed.
    #[error("PKI crypto error: {0}")]
    Crypto(#[from] CryptoError),

    /// The barrier returned an error.
    #[error("PKI barrier error: {0}")]
    Barrier(BarrierError),

    /// The operation could not be audited.
    #[error("PKI audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from policy parsing, storage and evaluation.
#[derive(Debug, thiserror::Error)]
pub enum PolicyError {
    /// The policy document failed validation.
    #[error("malformed policy: {reason}")]
    Malformed { reason: String },

    /// The requested policy was not found.
    #[error("policy not found: {name}")]
    NotFound { name: String },

    /// Built-in policies cannot be written or deleted.
    #[error("cannot modify built-in policy: {name}")]
    BuiltIn { name: String },

    /// The requested action does not map to a capability.
    #[error("unknown action: {action}")]
    UnknownAction { action: String },

    /// The identity collaborator failed.
    #[error("identity resolution failed for '{identity}': {reason}")]
    Identity { identity: String, reason: String },

    /// The underlying storage backend returned an error.
    #[error("policy storage error: {0}")]
    Storage(#[from] StorageError),

    /// A policy change could not be recorded.
    #[error("policy audit error: {0}")]
    Audit(#[from] AuditError),
}

/// Errors from the [`Vault`](crate::vault::Vault) request gate.
#[derive(Debug, thiserror::Error)]
pub enum VaultError {
    /// The vault is sealed.
    #[error("vault is sealed")]
    Sealed,

    /// The policy evaluator refused the request.
    #[error("permission denied: '{identity}' may not {action} '{resource}'")]
    Denied {
        identity: String,
        action: String,
        resource: String,
    },

    /// Policy evaluation failed.
    #[error(transparent)]
    Policy(#[from] PolicyError),
}

macro_rules! sealed_from_barrier {
    ($($engine:ident),+) => {
        $(
            impl From<BarrierError> for $engine {
                fn from(e: BarrierError) -> Self {
                    match e {
                        BarrierError::Sealed => Self::Sealed,
                        other => Self::Barrier(other),
                    }
                }
            }
        )+
    };
}

sealed_from_barrier!(TransitError, KvError, PkiError);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn barrier_sealed_maps_to_engine_sealed() {
        assert!(matches!(
            TransitError::from(BarrierError::Sealed),
            TransitError::Sealed
        ));
        assert!(matches!(KvError::from(BarrierError::Sealed), KvError::Sealed));
        assert!(matches!(PkiError::from(BarrierError::Sealed), PkiError::Sealed));
    }

    #[test]
    fn other_barrier_errors_are_wrapped() {
        let err = KvError::from(BarrierError::Crypto(CryptoError::Decryption {
            reason: "tag mismatch".to_owned(),
        }));
        assert!(matches!(err, KvError::Barrier(BarrierError::Crypto(_))));
        assert!(err.to_string().contains("tag mismatch"));
    }
}
