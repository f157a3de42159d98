//! Transit crypto engine for `Arcanum`.
//!
//! Provides encryption-as-a-service: callers send plaintext, get back
//! ciphertext (and vice versa), without ever seeing the key. Keys are named,
//! versioned, and stored through the barrier with their material sealed a
//! second time under the transit field key.
//!
//! Supported key types:
//! - `aes256-gcm96` and `chacha20-poly1305`: encrypt, decrypt, rewrap,
//!   data keys, optional context derivation
//! - `ed25519`: sign and verify
//! - `hmac`: HMAC only
//!
//! Every version of every key also carries an independent HMAC key.
//!
//! # Versioning
//!
//! - Ciphertexts are `vault:v{version}:{base64}`. Signatures and HMACs are
//!   `vault:v{version}:{algorithm}:{base64}`, where the algorithm is the
//!   prehash (`none` for a plain Ed25519 signature) or the HMAC digest, so
//!   decrypt and verify need no side-channel metadata.
//! - Rotation appends a version and advances `min_encryption_version` to it.
//!   Older versions stay decryptable down to `min_decryption_version`.
//! - Rotations and config updates are guarded read-modify-writes, so two
//!   concurrent rotations can never claim the same version number.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use subtle::ConstantTimeEq;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditManager};
use crate::barrier::{Barrier, Change, Expect};
use crate::config::EngineConfig;
use crate::crypto::{self, Cipher, EncryptionKey};
use crate::error::TransitError;

/// Storage prefix for transit key records.
const KEYS_PREFIX: &str = "transit/keys/";

/// Field-sealing purpose for key material.
const FIELD_PURPOSE: &str = "transit";

/// HKDF info for context-derived subkeys.
const DERIVATION_INFO: &[u8] = b"arcanum-transit-derived-v1";

/// Prefix of every ciphertext, signature and HMAC.
const WIRE_PREFIX: &str = "vault";

/// Algorithm label of a signature over the raw input.
const NO_PREHASH: &str = "none";

// ── Key types ────────────────────────────────────────────────────────

/// The kind of material a transit key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyType {
    #[serde(rename = "aes256-gcm96")]
    Aes256Gcm96,
    #[serde(rename = "chacha20-poly1305")]
    ChaCha20Poly1305,
    #[serde(rename = "ed25519")]
    Ed25519,
    #[serde(rename = "hmac")]
    Hmac,
}

impl KeyType {
    /// Canonical name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aes256Gcm96 => "aes256-gcm96",
            Self::ChaCha20Poly1305 => "chacha20-poly1305",
            Self::Ed25519 => "ed25519",
            Self::Hmac => "hmac",
        }
    }

    fn cipher(self) -> Option<Cipher> {
        match self {
            Self::Aes256Gcm96 => Some(Cipher::Aes256Gcm),
            Self::ChaCha20Poly1305 => Some(Cipher::ChaCha20Poly1305),
            Self::Ed25519 | Self::Hmac => None,
        }
    }

    /// Whether encrypt/decrypt/rewrap/data keys are available.
    #[must_use]
    pub fn supports_encryption(self) -> bool {
        self.cipher().is_some()
    }

    /// Whether sign/verify are available.
    #[must_use]
    pub fn supports_signing(self) -> bool {
        self == Self::Ed25519
    }

    /// Whether keys of this type may be created with context derivation.
    #[must_use]
    pub fn supports_derivation(self) -> bool {
        self.supports_encryption()
    }
}

impl fmt::Display for KeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KeyType {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes256-gcm96" => Ok(Self::Aes256Gcm96),
            "chacha20-poly1305" => Ok(Self::ChaCha20Poly1305),
            "ed25519" => Ok(Self::Ed25519),
            "hmac" => Ok(Self::Hmac),
            other => Err(TransitError::InvalidRequest {
                reason: format!("unknown key type '{other}'"),
            }),
        }
    }
}

/// Hash algorithm for HMACs and signature pre-hashing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HashAlgorithm {
    #[default]
    #[serde(rename = "sha2-256")]
    Sha2_256,
    #[serde(rename = "sha2-384")]
    Sha2_384,
    #[serde(rename = "sha2-512")]
    Sha2_512,
}

impl HashAlgorithm {
    /// Canonical name, as carried in signature and HMAC tags.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sha2_256 => "sha2-256",
            Self::Sha2_384 => "sha2-384",
            Self::Sha2_512 => "sha2-512",
        }
    }

    fn output_len(self) -> usize {
        match self {
            Self::Sha2_256 => 32,
            Self::Sha2_384 => 48,
            Self::Sha2_512 => 64,
        }
    }

    fn digest(self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Sha2_256 => Sha256::digest(input).to_vec(),
            Self::Sha2_384 => Sha384::digest(input).to_vec(),
            Self::Sha2_512 => Sha512::digest(input).to_vec(),
        }
    }

    fn hmac(self, key: &[u8], input: &[u8]) -> Result<Vec<u8>, TransitError> {
        fn run<M: Mac + hmac::digest::KeyInit>(
            key: &[u8],
            input: &[u8],
        ) -> Result<Vec<u8>, TransitError> {
            let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key).map_err(|e| {
                TransitError::InvalidRequest {
                    reason: format!("invalid HMAC key: {e}"),
                }
            })?;
            mac.update(input);
            Ok(mac.finalize().into_bytes().to_vec())
        }
        match self {
            Self::Sha2_256 => run::<Hmac<Sha256>>(key, input),
            Self::Sha2_384 => run::<Hmac<Sha384>>(key, input),
            Self::Sha2_512 => run::<Hmac<Sha512>>(key, input),
        }
    }
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HashAlgorithm {
    type Err = TransitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sha2-256" => Ok(Self::Sha2_256),
            "sha2-384" => Ok(Self::Sha2_384),
            "sha2-512" => Ok(Self::Sha2_512),
            other => Err(TransitError::InvalidRequest {
                reason: format!("unknown hash algorithm '{other}'"),
            }),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────

/// One version of a transit key as persisted.
#[derive(Clone, Serialize, Deserialize)]
struct KeyVersion {
    created_at: DateTime<Utc>,
    /// Field-sealed key material, base64. Absent for `hmac` keys.
    material: Option<String>,
    /// Field-sealed HMAC key, base64.
    hmac_key: String,
    /// Ed25519 public key, base64.
    public_key: Option<String>,
}

/// A named transit key with version history, as persisted.
#[derive(Clone, Serialize, Deserialize)]
struct KeyRecord {
    name: String,
    key_type: KeyType,
    derived: bool,
    exportable: bool,
    deletion_allowed: bool,
    latest_version: u32,
    min_encryption_version: u32,
    min_decryption_version: u32,
    versions: BTreeMap<u32, KeyVersion>,
    created_at: DateTime<Utc>,
}

impl KeyRecord {
    fn version(&self, version: u32) -> Result<&KeyVersion, TransitError> {
        self.versions
            .get(&version)
            .ok_or_else(|| TransitError::InvalidVersion {
                name: self.name.clone(),
                version,
                reason: "version does not exist".to_owned(),
            })
    }

    /// Resolve the version to encrypt or sign with.
    fn encryption_version(&self, requested: Option<u32>) -> Result<u32, TransitError> {
        let version = requested.unwrap_or(self.latest_version);
        if version > self.latest_version {
            return Err(TransitError::InvalidVersion {
                name: self.name.clone(),
                version,
                reason: format!("latest version is {}", self.latest_version),
            });
        }
        if version < self.min_encryption_version {
            return Err(TransitError::InvalidVersion {
                name: self.name.clone(),
                version,
                reason: format!(
                    "below minimum encryption version {}",
                    self.min_encryption_version
                ),
            });
        }
        Ok(version)
    }

    /// Check a version parsed from a ciphertext, signature or HMAC.
    fn decryption_version(&self, version: u32) -> Result<&KeyVersion, TransitError> {
        if version < self.min_decryption_version {
            return Err(TransitError::InvalidVersion {
                name: self.name.clone(),
                version,
                reason: format!(
                    "below minimum decryption version {}",
                    self.min_decryption_version
                ),
            });
        }
        self.version(version)
    }

    fn require(&self, supported: bool, operation: &str) -> Result<(), TransitError> {
        if supported {
            Ok(())
        } else {
            Err(TransitError::UnsupportedCapability {
                key_type: self.key_type.to_string(),
                operation: operation.to_owned(),
            })
        }
    }

    fn check_context(&self, context: Option<&[u8]>) -> Result<(), TransitError> {
        match (self.derived, context) {
            (true, None) => Err(TransitError::Context {
                name: self.name.clone(),
                reason: "key is derived, a context is required".to_owned(),
            }),
            (false, Some(_)) => Err(TransitError::Context {
                name: self.name.clone(),
                reason: "key is not derived, context is not allowed".to_owned(),
            }),
            _ => Ok(()),
        }
    }

    fn info(&self) -> KeyInfo {
        KeyInfo {
            name: self.name.clone(),
            key_type: self.key_type,
            derived: self.derived,
            exportable: self.exportable,
            deletion_allowed: self.deletion_allowed,
            latest_version: self.latest_version,
            min_encryption_version: self.min_encryption_version,
            min_decryption_version: self.min_decryption_version,
            supports_encryption: self.key_type.supports_encryption(),
            supports_signing: self.key_type.supports_signing(),
            versions: self
                .versions
                .iter()
                .map(|(v, kv)| {
                    (
                        *v,
                        VersionInfo {
                            created_at: kv.created_at,
                            public_key: kv.public_key.clone(),
                        },
                    )
                })
                .collect(),
            created_at: self.created_at,
        }
    }
}

// ── Public request/response types ────────────────────────────────────

/// Options for [`TransitEngine::create_key`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct KeyOptions {
    /// Key type.
    pub key_type: KeyType,
    /// Require a context on every encrypt/decrypt and derive a subkey from it.
    #[serde(default)]
    pub derived: bool,
    /// Allow [`TransitEngine::export_key`]. Cannot be turned off later.
    #[serde(default)]
    pub exportable: bool,
}

impl Default for KeyOptions {
    fn default() -> Self {
        Self {
            key_type: KeyType::Aes256Gcm96,
            derived: false,
            exportable: false,
        }
    }
}

/// Changes accepted by [`TransitEngine::update_key_config`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KeyConfigUpdate {
    pub min_encryption_version: Option<u32>,
    pub min_decryption_version: Option<u32>,
    pub deletion_allowed: Option<bool>,
    pub exportable: Option<bool>,
}

/// Per-version metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub created_at: DateTime<Utc>,
    /// Base64 Ed25519 public key, for signing keys.
    pub public_key: Option<String>,
}

/// Public metadata about a transit key (no secret material).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyInfo {
    pub name: String,
    pub key_type: KeyType,
    pub derived: bool,
    pub exportable: bool,
    pub deletion_allowed: bool,
    pub latest_version: u32,
    pub min_encryption_version: u32,
    pub min_decryption_version: u32,
    pub supports_encryption: bool,
    pub supports_signing: bool,
    pub versions: BTreeMap<u32, VersionInfo>,
    pub created_at: DateTime<Utc>,
}

/// Response from [`TransitEngine::generate_data_key`].
#[derive(Serialize)]
pub struct DataKey {
    /// Base64 plaintext data key.
    pub plaintext: String,
    /// The data key encrypted by the named transit key (`vault:v{n}:...`).
    pub ciphertext: String,
}

impl fmt::Debug for DataKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataKey")
            .field("plaintext", &"[REDACTED]")
            .field("ciphertext", &self.ciphertext)
            .finish()
    }
}

/// Raw key material released by [`TransitEngine::export_key`].
#[derive(Serialize)]
pub struct ExportedKey {
    pub name: String,
    pub key_type: KeyType,
    /// Base64 key material per version. For `hmac` keys this is the HMAC key.
    pub keys: BTreeMap<u32, String>,
}

impl fmt::Debug for ExportedKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExportedKey")
            .field("name", &self.name)
            .field("key_type", &self.key_type)
            .field("keys", &"[REDACTED]")
            .finish()
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Transit engine: encryption, signing and HMAC as a service.
pub struct TransitEngine {
    barrier: Arc<Barrier>,
    audit: Arc<AuditManager>,
    retry_limit: u32,
}

impl TransitEngine {
    /// Create a transit engine over the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, audit: Arc<AuditManager>, config: &EngineConfig) -> Self {
        Self {
            barrier,
            audit,
            retry_limit: config.write_retry_limit.max(1),
        }
    }

    /// Create a new named key with version 1.
    ///
    /// # Errors
    ///
    /// - [`TransitError::KeyExists`] if the name is taken.
    /// - [`TransitError::InvalidRequest`] for a bad name or unsupported
    ///   derivation.
    /// - [`TransitError::Sealed`] if the vault is sealed.
    pub async fn create_key(
        &self,
        actor: &str,
        name: &str,
        options: KeyOptions,
    ) -> Result<KeyInfo, TransitError> {
        let event = AuditEvent::new("transit/create", actor, name)
            .with_detail(options.key_type.as_str());
        let info = self
            .audit
            .guard(event, self.create_key_inner(name, options))
            .await?;
        info!(key = name, key_type = %options.key_type, "transit key created");
        Ok(info)
    }

    async fn create_key_inner(
        &self,
        name: &str,
        options: KeyOptions,
    ) -> Result<KeyInfo, TransitError> {
        validate_name(name)?;
        if options.derived && !options.key_type.supports_derivation() {
            return Err(TransitError::InvalidRequest {
                reason: format!("key type '{}' does not support derivation", options.key_type),
            });
        }

        let now = Utc::now();
        let record = KeyRecord {
            name: name.to_owned(),
            key_type: options.key_type,
            derived: options.derived,
            exportable: options.exportable,
            deletion_allowed: false,
            latest_version: 1,
            min_encryption_version: 1,
            min_decryption_version: 1,
            versions: BTreeMap::from([(1, self.generate_version(options.key_type).await?)]),
            created_at: now,
        };

        let created = self
            .barrier
            .apply(vec![Change::put(
                key_path(name),
                Expect::Absent,
                encode(&record)?,
            )])
            .await?;
        if !created {
            return Err(TransitError::KeyExists {
                name: name.to_owned(),
            });
        }
        Ok(record.info())
    }

    /// Append a new key version and make it the only one used for new
    /// encryptions. Returns the new version number.
    ///
    /// # Errors
    ///
    /// - [`TransitError::KeyNotFound`] if the key doesn't exist.
    /// - [`TransitError::Conflict`] if concurrent writers exhaust the retries.
    /// - [`TransitError::Sealed`] if the vault is sealed.
    pub async fn rotate_key(&self, actor: &str, name: &str) -> Result<u32, TransitError> {
        let event = AuditEvent::new("transit/rotate", actor, name);
        let version = self
            .audit
            .guard_with(event, self.rotate_key_inner(name), |v| {
                Some(format!("version={v}"))
            })
            .await?;
        info!(key = name, version, "transit key rotated");
        Ok(version)
    }

    async fn rotate_key_inner(&self, name: &str) -> Result<u32, TransitError> {
        let key_type = self.load(name).await?.key_type;
        let fresh = self.generate_version(key_type).await?;

        let record = self
            .modify(name, |record| {
                let next = record.latest_version.checked_add(1).ok_or_else(|| {
                    TransitError::InvalidRequest {
                        reason: "version counter exhausted".to_owned(),
                    }
                })?;
                record.versions.insert(next, fresh.clone());
                record.latest_version = next;
                record.min_encryption_version = next;
                Ok(())
            })
            .await?;
        Ok(record.latest_version)
    }

    /// Update version floors and the deletion/export flags.
    ///
    /// # Errors
    ///
    /// - [`TransitError::InvalidRequest`] if a floor is out of range, the
    ///   encryption floor would drop below the decryption floor, or
    ///   `exportable` would be switched off.
    /// - [`TransitError::KeyNotFound`] if the key doesn't exist.
    pub async fn update_key_config(
        &self,
        actor: &str,
        name: &str,
        update: KeyConfigUpdate,
    ) -> Result<KeyInfo, TransitError> {
        let event = AuditEvent::new("transit/config", actor, name);
        let update_config = async {
            self.modify(name, |record| apply_config(record, &update))
                .await
                .map(|r| r.info())
        };
        self.audit.guard(event, update_config).await
    }

    /// Delete a key and every version. Requires `deletion_allowed`.
    ///
    /// # Errors
    ///
    /// - [`TransitError::DeletionNotAllowed`] unless enabled via config.
    /// - [`TransitError::KeyNotFound`] if the key doesn't exist.
    pub async fn delete_key(&self, actor: &str, name: &str) -> Result<(), TransitError> {
        let event = AuditEvent::new("transit/delete", actor, name);
        self.audit.guard(event, self.delete_key_inner(name)).await?;
        info!(key = name, "transit key deleted");
        Ok(())
    }

    async fn delete_key_inner(&self, name: &str) -> Result<(), TransitError> {
        let path = key_path(name);
        for _ in 0..self.retry_limit {
            let current = self
                .barrier
                .read(&path)
                .await?
                .ok_or_else(|| not_found(name))?;
            let record: KeyRecord = decode(&current.value)?;
            if !record.deletion_allowed {
                return Err(TransitError::DeletionNotAllowed {
                    name: name.to_owned(),
                });
            }
            if self
                .barrier
                .apply(vec![Change::delete(
                    path.clone(),
                    Expect::Unchanged(current.revision),
                )])
                .await?
            {
                return Ok(());
            }
            debug!(key = name, "transit key changed during delete, retrying");
        }
        Err(TransitError::Conflict {
            name: name.to_owned(),
        })
    }

    /// Release raw key material. Requires `exportable`.
    ///
    /// `version = None` exports every version.
    ///
    /// # Errors
    ///
    /// - [`TransitError::NotExportable`] unless the key is exportable.
    /// - [`TransitError::InvalidVersion`] if the version doesn't exist.
    pub async fn export_key(
        &self,
        actor: &str,
        name: &str,
        version: Option<u32>,
    ) -> Result<ExportedKey, TransitError> {
        let result = self.export_key_inner(name, version).await;
        let event = AuditEvent::new("transit/export", actor, name)
            .with_detail(version.map_or_else(|| "all".to_owned(), |v| format!("version={v}")));
        self.audit.observe(event, result).await
    }

    async fn export_key_inner(
        &self,
        name: &str,
        version: Option<u32>,
    ) -> Result<ExportedKey, TransitError> {
        let record = self.load(name).await?;
        if !record.exportable {
            return Err(TransitError::NotExportable {
                name: name.to_owned(),
            });
        }

        let selected: Vec<u32> = match version {
            Some(v) => {
                record.version(v)?;
                vec![v]
            }
            None => record.versions.keys().copied().collect(),
        };

        let mut keys = BTreeMap::new();
        for v in selected {
            let kv = record.version(v)?;
            let secret = match &kv.material {
                Some(_) => self.open_material(kv).await?,
                None => self.open_hmac_key(kv).await?,
            };
            keys.insert(v, BASE64.encode(secret.as_bytes()));
        }

        Ok(ExportedKey {
            name: record.name,
            key_type: record.key_type,
            keys,
        })
    }

    /// Metadata for a key, including public keys for signing keys.
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::KeyNotFound`] if the key doesn't exist.
    pub async fn read_key(&self, name: &str) -> Result<KeyInfo, TransitError> {
        Ok(self.load(name).await?.info())
    }

    /// List all key names.
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::Sealed`] or a barrier error.
    pub async fn list_keys(&self) -> Result<Vec<String>, TransitError> {
        let keys = self.barrier.list(KEYS_PREFIX).await?;
        Ok(keys
            .iter()
            .filter_map(|k| k.strip_prefix(KEYS_PREFIX).map(String::from))
            .collect())
    }

    /// Encrypt plaintext. Returns `vault:v{version}:{base64}`.
    ///
    /// `version = None` uses the latest version.
    ///
    /// # Errors
    ///
    /// - [`TransitError::UnsupportedCapability`] for non-encryption keys.
    /// - [`TransitError::Context`] if the context doesn't match the key's
    ///   derivation setting.
    /// - [`TransitError::InvalidVersion`] if the version is outside
    ///   `min_encryption_version..=latest_version`.
    pub async fn encrypt(
        &self,
        name: &str,
        plaintext: &[u8],
        context: Option<&[u8]>,
        version: Option<u32>,
    ) -> Result<String, TransitError> {
        let record = self.load(name).await?;
        self.encrypt_with_record(&record, plaintext, context, version)
            .await
    }

    async fn encrypt_with_record(
        &self,
        record: &KeyRecord,
        plaintext: &[u8],
        context: Option<&[u8]>,
        version: Option<u32>,
    ) -> Result<String, TransitError> {
        let cipher = record.key_type.cipher();
        record.require(cipher.is_some(), "encryption")?;
        record.check_context(context)?;
        let version = record.encryption_version(version)?;

        let key = self
            .encryption_key(record.version(version)?, context)
            .await?;
        let cipher = cipher.unwrap_or(Cipher::Aes256Gcm);
        let ciphertext = crypto::encrypt_with(cipher, &key, plaintext)?;
        Ok(format_tagged(version, &ciphertext))
    }

    /// Decrypt a `vault:v{N}:...` ciphertext.
    ///
    /// # Errors
    ///
    /// - [`TransitError::Malformed`] if the ciphertext cannot be parsed.
    /// - [`TransitError::InvalidVersion`] if `N` is below
    ///   `min_decryption_version` or does not exist.
    /// - [`TransitError::Crypto`] if authentication fails (wrong context,
    ///   tampering).
    /// - [`TransitError::Audit`] if the plaintext release could not be
    ///   recorded.
    pub async fn decrypt(
        &self,
        actor: &str,
        name: &str,
        ciphertext: &str,
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, TransitError> {
        let result = async {
            let record = self.load(name).await?;
            self.decrypt_with_record(&record, ciphertext, context).await
        }
        .await;
        let mut event = AuditEvent::new("transit/decrypt", actor, name);
        if let Ok((version, _)) = split_version(ciphertext) {
            event = event.with_detail(format!("version={version}"));
        }
        self.audit.observe(event, result).await
    }

    async fn decrypt_with_record(
        &self,
        record: &KeyRecord,
        ciphertext: &str,
        context: Option<&[u8]>,
    ) -> Result<Vec<u8>, TransitError> {
        let cipher = record.key_type.cipher();
        record.require(cipher.is_some(), "decryption")?;
        record.check_context(context)?;

        let (version, raw) = parse_tagged(ciphertext)?;
        let key = self
            .encryption_key(record.decryption_version(version)?, context)
            .await?;
        let cipher = cipher.unwrap_or(Cipher::Aes256Gcm);
        Ok(crypto::decrypt_with(cipher, &key, &raw)?)
    }

    /// Re-encrypt a ciphertext under the latest version without returning
    /// the plaintext.
    ///
    /// # Errors
    ///
    /// Same as [`decrypt`](Self::decrypt) and [`encrypt`](Self::encrypt).
    pub async fn rewrap(
        &self,
        name: &str,
        ciphertext: &str,
        context: Option<&[u8]>,
    ) -> Result<String, TransitError> {
        let record = self.load(name).await?;
        let plaintext = Zeroizing::new(
            self.decrypt_with_record(&record, ciphertext, context)
                .await?,
        );
        self.encrypt_with_record(&record, &plaintext, context, None)
            .await
    }

    /// Generate a fresh 256-bit data key, returned in plaintext and wrapped
    /// by the named key.
    ///
    /// # Errors
    ///
    /// Same as [`encrypt`](Self::encrypt).
    pub async fn generate_data_key(
        &self,
        name: &str,
        context: Option<&[u8]>,
    ) -> Result<DataKey, TransitError> {
        let data_key = EncryptionKey::generate();
        let ciphertext = self
            .encrypt(name, data_key.as_bytes(), context, None)
            .await?;
        Ok(DataKey {
            plaintext: BASE64.encode(data_key.as_bytes()),
            ciphertext,
        })
    }

    /// Sign `input` with an Ed25519 key. With `prehash`, the digest of the
    /// input is signed instead of the input itself.
    ///
    /// Returns `vault:v{N}:{prehash}:{base64}` with `none` as the prehash
    /// label when the input is signed as-is.
    ///
    /// # Errors
    ///
    /// - [`TransitError::UnsupportedCapability`] for non-signing keys.
    /// - [`TransitError::InvalidVersion`] if the version is out of range.
    pub async fn sign(
        &self,
        name: &str,
        input: &[u8],
        prehash: Option<HashAlgorithm>,
        version: Option<u32>,
    ) -> Result<String, TransitError> {
        let record = self.load(name).await?;
        record.require(record.key_type.supports_signing(), "signing")?;
        let version = record.encryption_version(version)?;

        let seed = self.open_material(record.version(version)?).await?;
        let signing_key = SigningKey::from_bytes(seed.as_bytes());
        let message = prehash.map_or_else(|| input.to_vec(), |alg| alg.digest(input));
        let signature = signing_key.sign(&message);
        let label = prehash.map_or(NO_PREHASH, HashAlgorithm::as_str);
        Ok(format_labelled(version, label, &signature.to_bytes()))
    }

    /// Verify a `vault:v{N}:{prehash}:...` signature produced by
    /// [`sign`](Self::sign). The prehash is taken from the tag.
    ///
    /// # Errors
    ///
    /// - [`TransitError::UnsupportedCapability`] for non-signing keys.
    /// - [`TransitError::Malformed`] if the signature cannot be parsed or
    ///   names an unknown prehash.
    /// - [`TransitError::InvalidVersion`] if `N` is out of range.
    pub async fn verify(
        &self,
        name: &str,
        input: &[u8],
        signature: &str,
    ) -> Result<bool, TransitError> {
        let record = self.load(name).await?;
        record.require(record.key_type.supports_signing(), "verification")?;

        let (version, label, raw) = parse_labelled(signature)?;
        let prehash = match label {
            NO_PREHASH => None,
            other => Some(parse_algorithm(other)?),
        };
        let kv = record.decryption_version(version)?;
        let public = kv
            .public_key
            .as_deref()
            .ok_or_else(|| TransitError::InvalidVersion {
                name: name.to_owned(),
                version,
                reason: "version has no public key".to_owned(),
            })?;
        let public: [u8; 32] = BASE64
            .decode(public)
            .ok()
            .and_then(|b| b.try_into().ok())
            .ok_or_else(|| TransitError::Serialization {
                reason: "stored public key is not 32 bytes of base64".to_owned(),
            })?;
        let verifying_key =
            VerifyingKey::from_bytes(&public).map_err(|e| TransitError::Serialization {
                reason: format!("stored public key is invalid: {e}"),
            })?;
        let signature = Signature::from_slice(&raw).map_err(|e| TransitError::Malformed {
            reason: format!("invalid signature bytes: {e}"),
        })?;

        let message = prehash.map_or_else(|| input.to_vec(), |alg| alg.digest(input));
        Ok(verifying_key.verify(&message, &signature).is_ok())
    }

    /// HMAC `input` with the version's HMAC key. Available for every key type.
    ///
    /// Returns `vault:v{N}:{algorithm}:{base64}`.
    ///
    /// # Errors
    ///
    /// Returns [`TransitError::InvalidVersion`] if the version is out of range.
    pub async fn generate_hmac(
        &self,
        name: &str,
        input: &[u8],
        algorithm: HashAlgorithm,
        version: Option<u32>,
    ) -> Result<String, TransitError> {
        let record = self.load(name).await?;
        let version = record.encryption_version(version)?;
        let key = self.open_hmac_key(record.version(version)?).await?;
        let tag = algorithm.hmac(key.as_bytes(), input)?;
        Ok(format_labelled(version, algorithm.as_str(), &tag))
    }

    /// Verify a `vault:v{N}:{algorithm}:...` HMAC in constant time. The
    /// digest algorithm is taken from the tag.
    ///
    /// # Errors
    ///
    /// - [`TransitError::Malformed`] if the HMAC cannot be parsed, names an
    ///   unknown algorithm or has the wrong length for it.
    /// - [`TransitError::InvalidVersion`] if `N` is out of range.
    pub async fn verify_hmac(
        &self,
        name: &str,
        input: &[u8],
        hmac: &str,
    ) -> Result<bool, TransitError> {
        let record = self.load(name).await?;
        let (version, label, raw) = parse_labelled(hmac)?;
        let algorithm = parse_algorithm(label)?;
        if raw.len() != algorithm.output_len() {
            return Err(TransitError::Malformed {
                reason: format!(
                    "{algorithm} HMAC must be {} bytes, got {}",
                    algorithm.output_len(),
                    raw.len()
                ),
            });
        }
        let key = self
            .open_hmac_key(record.decryption_version(version)?)
            .await?;
        let expected = algorithm.hmac(key.as_bytes(), input)?;
        Ok(bool::from(expected.ct_eq(&raw)))
    }

    // ── Internal helpers ─────────────────────────────────────────────

    async fn load(&self, name: &str) -> Result<KeyRecord, TransitError> {
        let data = self
            .barrier
            .get(&key_path(name))
            .await?
            .ok_or_else(|| not_found(name))?;
        decode(&data)
    }

    /// Guarded read-modify-write of a key record.
    async fn modify<F>(&self, name: &str, mut op: F) -> Result<KeyRecord, TransitError>
    where
        F: FnMut(&mut KeyRecord) -> Result<(), TransitError>,
    {
        let path = key_path(name);
        for _ in 0..self.retry_limit {
            let current = self
                .barrier
                .read(&path)
                .await?
                .ok_or_else(|| not_found(name))?;
            let mut record: KeyRecord = decode(&current.value)?;
            op(&mut record)?;

            let applied = self
                .barrier
                .apply(vec![Change::put(
                    path.clone(),
                    Expect::Unchanged(current.revision),
                    encode(&record)?,
                )])
                .await?;
            if applied {
                return Ok(record);
            }
            debug!(key = name, "transit key changed concurrently, retrying");
        }
        Err(TransitError::Conflict {
            name: name.to_owned(),
        })
    }

    async fn generate_version(&self, key_type: KeyType) -> Result<KeyVersion, TransitError> {
        let hmac_key = EncryptionKey::generate();
        let (material, public_key) = match key_type {
            KeyType::Hmac => (None, None),
            KeyType::Aes256Gcm96 | KeyType::ChaCha20Poly1305 => {
                (Some(EncryptionKey::generate()), None)
            }
            KeyType::Ed25519 => {
                let seed = EncryptionKey::generate();
                let public = SigningKey::from_bytes(seed.as_bytes())
                    .verifying_key()
                    .to_bytes();
                (Some(seed), Some(BASE64.encode(public)))
            }
        };

        let material = match material {
            Some(key) => Some(self.seal(key.as_bytes()).await?),
            None => None,
        };

        Ok(KeyVersion {
            created_at: Utc::now(),
            material,
            hmac_key: self.seal(hmac_key.as_bytes()).await?,
            public_key,
        })
    }

    async fn seal(&self, secret: &[u8]) -> Result<String, TransitError> {
        let sealed = self.barrier.seal_field(FIELD_PURPOSE, secret).await?;
        Ok(BASE64.encode(sealed))
    }

    async fn open(&self, sealed_b64: &str) -> Result<EncryptionKey, TransitError> {
        let sealed = BASE64
            .decode(sealed_b64)
            .map_err(|e| TransitError::Serialization {
                reason: format!("sealed key material is not base64: {e}"),
            })?;
        let bytes = Zeroizing::new(self.barrier.open_field(FIELD_PURPOSE, &sealed).await?);
        EncryptionKey::from_slice(&bytes).ok_or_else(|| TransitError::Serialization {
            reason: "key material is not 32 bytes".to_owned(),
        })
    }

    async fn open_material(&self, version: &KeyVersion) -> Result<EncryptionKey, TransitError> {
        let sealed = version
            .material
            .as_deref()
            .ok_or_else(|| TransitError::Serialization {
                reason: "key version has no material".to_owned(),
            })?;
        self.open(sealed).await
    }

    async fn open_hmac_key(&self, version: &KeyVersion) -> Result<EncryptionKey, TransitError> {
        self.open(&version.hmac_key).await
    }

    async fn encryption_key(
        &self,
        version: &KeyVersion,
        context: Option<&[u8]>,
    ) -> Result<EncryptionKey, TransitError> {
        let material = self.open_material(version).await?;
        match context {
            Some(ctx) => Ok(crypto::derive_key(&material, Some(ctx), DERIVATION_INFO)?),
            None => Ok(material),
        }
    }
}

impl fmt::Debug for TransitEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransitEngine")
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

fn apply_config(record: &mut KeyRecord, update: &KeyConfigUpdate) -> Result<(), TransitError> {
    let in_range = |v: u32| (1..=record.latest_version).contains(&v);
    let min_dec = update
        .min_decryption_version
        .unwrap_or(record.min_decryption_version);
    let min_enc = update
        .min_encryption_version
        .unwrap_or(record.min_encryption_version);

    if !in_range(min_dec) || !in_range(min_enc) {
        return Err(TransitError::InvalidRequest {
            reason: format!(
                "minimum versions must be between 1 and {}",
                record.latest_version
            ),
        });
    }
    if min_enc < min_dec {
        return Err(TransitError::InvalidRequest {
            reason: format!(
                "min_encryption_version ({min_enc}) cannot be below min_decryption_version ({min_dec})"
            ),
        });
    }
    if update.exportable == Some(false) && record.exportable {
        return Err(TransitError::InvalidRequest {
            reason: "an exportable key cannot be made non-exportable".to_owned(),
        });
    }

    record.min_decryption_version = min_dec;
    record.min_encryption_version = min_enc;
    if let Some(allowed) = update.deletion_allowed {
        record.deletion_allowed = allowed;
    }
    if let Some(exportable) = update.exportable {
        record.exportable = exportable;
    }
    Ok(())
}

fn key_path(name: &str) -> String {
    format!("{KEYS_PREFIX}{name}")
}

fn not_found(name: &str) -> TransitError {
    TransitError::KeyNotFound {
        name: name.to_owned(),
    }
}

fn validate_name(name: &str) -> Result<(), TransitError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(TransitError::InvalidRequest {
            reason: format!(
                "invalid key name '{name}': use 1-128 characters from [A-Za-z0-9._-]"
            ),
        })
    }
}

fn encode(record: &KeyRecord) -> Result<Vec<u8>, TransitError> {
    serde_json::to_vec(record).map_err(|e| TransitError::Serialization {
        reason: format!("key serialization failed: {e}"),
    })
}

fn decode(bytes: &[u8]) -> Result<KeyRecord, TransitError> {
    serde_json::from_slice(bytes).map_err(|e| TransitError::Serialization {
        reason: format!("key deserialization failed: {e}"),
    })
}

fn format_tagged(version: u32, raw: &[u8]) -> String {
    format!("{WIRE_PREFIX}:v{version}:{}", BASE64.encode(raw))
}

fn format_labelled(version: u32, label: &str, raw: &[u8]) -> String {
    format!("{WIRE_PREFIX}:v{version}:{label}:{}", BASE64.encode(raw))
}

fn malformed(reason: &str) -> TransitError {
    TransitError::Malformed {
        reason: reason.to_owned(),
    }
}

/// Split `vault:v{version}:{rest}`.
fn split_version(input: &str) -> Result<(u32, &str), TransitError> {
    let mut parts = input.splitn(3, ':');
    let (Some(WIRE_PREFIX), Some(version), Some(rest)) = (parts.next(), parts.next(), parts.next())
    else {
        return Err(malformed("expected vault:v{N}:..."));
    };

    let version: u32 = version
        .strip_prefix('v')
        .and_then(|v| v.parse().ok())
        .filter(|v| *v > 0)
        .ok_or_else(|| malformed("invalid version tag, expected v{N} with N >= 1"))?;
    Ok((version, rest))
}

fn decode_payload(payload: &str) -> Result<Vec<u8>, TransitError> {
    BASE64
        .decode(payload)
        .map_err(|e| malformed(&format!("invalid base64 payload: {e}")))
}

/// Parse `vault:v{version}:{base64}`.
fn parse_tagged(input: &str) -> Result<(u32, Vec<u8>), TransitError> {
    let (version, payload) = split_version(input)?;
    Ok((version, decode_payload(payload)?))
}

/// Parse `vault:v{version}:{algorithm}:{base64}`.
fn parse_labelled(input: &str) -> Result<(u32, &str, Vec<u8>), TransitError> {
    let (version, rest) = split_version(input)?;
    let (label, payload) = rest
        .split_once(':')
        .ok_or_else(|| malformed("expected vault:v{N}:{algorithm}:{base64}"))?;
    Ok((version, label, decode_payload(payload)?))
}

fn parse_algorithm(label: &str) -> Result<HashAlgorithm, TransitError> {
    label
        .parse()
        .map_err(|_| malformed(&format!("unknown algorithm '{label}' in tag")))
}
