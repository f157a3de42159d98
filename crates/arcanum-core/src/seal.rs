//! Seal/unseal lifecycle for `Arcanum`.
//!
//! Implements the Shamir's Secret Sharing based initialization and unseal
//! protocol. The flow is:
//!
//! 1. **Init**: Generate the master key, wrap it with the key-encryption key
//!    (KEK), split the master key itself into N shares with threshold K,
//!    store the wrapped key and config in one create-only record, return the
//!    shares to the operator (shown once, never stored).
//!
//! 2. **Unseal**: Operators submit shares one call at a time. Once K distinct
//!    shares are collected the master key is reconstructed, then verified in
//!    constant time against the KEK-wrapped copy. Only a verified key is kept.
//!    Any failure at this stage discards every accumulated share.
//!
//! 3. **Seal**: Drop the master key (zeroized on drop) and clear pending
//!    shares. Idempotent.
//!
//! # Security model
//!
//! - The plaintext master key is never persisted.
//! - All key-bearing state sits behind one `Mutex`; consumers only ever get a
//!   short-lived clone via [`SealManager::master_key`].
//! - Shares are shown once at init time and never persisted by the server.

use std::sync::Arc;

use arcanum_storage::{Mutation, Precondition, StorageBackend};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sharks::{Share, Sharks};
use subtle::ConstantTimeEq;
use tokio::sync::Mutex;
use tracing::{info, warn};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditManager};
use crate::crypto::{self, EncryptionKey};
use crate::error::SealError;
use crate::kek::KekProvider;

/// Storage key for the persisted seal record.
pub const SEAL_CONFIG_PATH: &str = "sys/seal/config";

/// Encoded share length: one x-coordinate byte plus one y byte per key byte.
const SHARE_LEN: usize = 1 + 32;

/// Actor recorded on seal lifecycle audit events.
const OPERATOR: &str = "operator";

/// Persisted seal record. Written exactly once, at init.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SealRecord {
    /// Total number of unseal shares.
    pub shares: u8,
    /// Minimum shares required to reconstruct the master key.
    pub threshold: u8,
    /// Base64 of the master key encrypted under the KEK.
    pub encrypted_master_key: String,
    /// When the vault was initialized.
    pub initialized_at: DateTime<Utc>,
}

/// Result of a successful vault initialization.
pub struct InitResult {
    /// Base64-encoded master key shares. Shown once, never stored.
    pub shares: Vec<String>,
    /// Shares needed to unseal.
    pub threshold: u8,
}

impl std::fmt::Debug for InitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InitResult")
            .field("shares", &format_args!("[{} REDACTED]", self.shares.len()))
            .field("threshold", &self.threshold)
            .finish()
    }
}

/// Progress of an ongoing unseal operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnsealProgress {
    /// Total threshold required.
    pub threshold: u8,
    /// Number of distinct shares submitted so far.
    pub submitted: u8,
}

/// Current seal status of the vault. Never contains key material.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SealStatus {
    /// Whether the vault has been initialized.
    pub initialized: bool,
    /// Whether the vault is currently sealed.
    pub sealed: bool,
    /// Threshold of shares required to unseal.
    pub threshold: u8,
    /// Total number of shares.
    pub shares: u8,
    /// Number of shares submitted so far in the current unseal attempt.
    pub progress: u8,
}

#[derive(Default)]
struct SealState {
    master_key: Option<EncryptionKey>,
    pending: Vec<Zeroizing<Vec<u8>>>,
}

enum Submission {
    Pending(UnsealProgress),
    Unsealed(EncryptionKey),
}

/// Owns the master key for the lifetime of the process.
///
/// `Initialize → Unseal → [operational] → Seal`. Thread-safe via an
/// internal `Mutex` around the key and the share accumulator.
pub struct SealManager {
    storage: Arc<dyn StorageBackend>,
    kek: Arc<dyn KekProvider>,
    audit: Arc<AuditManager>,
    state: Mutex<SealState>,
}

impl SealManager {
    /// Create a sealed manager over the given storage and KEK provider.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        kek: Arc<dyn KekProvider>,
        audit: Arc<AuditManager>,
    ) -> Self {
        Self {
            storage,
            kek,
            audit,
            state: Mutex::new(SealState::default()),
        }
    }

    /// Initialize a new vault.
    ///
    /// The vault is left **sealed** after init. The operator must unseal it
    /// using the returned shares. If the event cannot be audited the seal
    /// record is removed again, so the shares are never silently lost.
    ///
    /// # Errors
    ///
    /// - [`SealError::InvalidConfig`] unless `2 <= threshold <= shares`.
    /// - [`SealError::AlreadyInitialized`] if a seal record exists, including
    ///   when a concurrent init won the race.
    /// - [`SealError::Kek`] if the KEK provider fails.
    /// - [`SealError::Audit`] if the event could not be recorded.
    pub async fn init(&self, shares: u8, threshold: u8) -> Result<InitResult, SealError> {
        let event = AuditEvent::new("sys/init", OPERATOR, SEAL_CONFIG_PATH)
            .with_detail(format!("shares={shares} threshold={threshold}"));

        let (result, record) = match self.init_inner(shares, threshold).await {
            Ok(pair) => pair,
            Err(e) => return self.audit.observe(event, Err(e)).await,
        };

        if let Err(e) = self.audit.log(&event).await {
            warn!(error = %e, "init could not be audited, removing seal record");
            self.storage
                .transact(&[Mutation::delete(
                    SEAL_CONFIG_PATH,
                    Precondition::Matches(record),
                )])
                .await?;
            return Err(e.into());
        }

        info!(shares, threshold, "vault initialized");
        Ok(result)
    }

    async fn init_inner(
        &self,
        shares: u8,
        threshold: u8,
    ) -> Result<(InitResult, Vec<u8>), SealError> {
        validate_config(shares, threshold)?;

        if self.storage.exists(SEAL_CONFIG_PATH).await? {
            return Err(SealError::AlreadyInitialized);
        }

        let master_key = EncryptionKey::generate();
        let kek = self.kek.key_encryption_key().await?;
        let wrapped = crypto::encrypt(&kek, master_key.as_bytes())?;

        let encoded_shares = split_secret(master_key.as_bytes(), shares, threshold)
            .iter()
            .map(|s| BASE64.encode(s.as_slice()))
            .collect();

        let record = SealRecord {
            shares,
            threshold,
            encrypted_master_key: BASE64.encode(wrapped),
            initialized_at: Utc::now(),
        };
        let bytes = serde_json::to_vec(&record).map_err(|e| SealError::Serialization {
            reason: e.to_string(),
        })?;

        if !self
            .storage
            .compare_and_swap(SEAL_CONFIG_PATH, None, &bytes)
            .await?
        {
            return Err(SealError::AlreadyInitialized);
        }

        Ok((
            InitResult {
                shares: encoded_shares,
                threshold,
            },
            bytes,
        ))
    }

    /// Submit an unseal share.
    ///
    /// Returns `Ok(Some(progress))` if more shares are needed, or `Ok(None)`
    /// when the threshold is reached and the vault is unsealed. Submitting a
    /// share that is already pending does not advance progress.
    ///
    /// # Errors
    ///
    /// - [`SealError::NotInitialized`] if the vault hasn't been initialized.
    /// - [`SealError::AlreadyUnsealed`] if the vault is already unsealed.
    /// - [`SealError::InvalidShare`] if the share is malformed or conflicts
    ///   with a pending share for the same x-coordinate.
    /// - [`SealError::UnsealVerificationFailed`] if the reconstructed key does
    ///   not match; all pending shares are discarded.
    pub async fn unseal(&self, share_b64: &str) -> Result<Option<UnsealProgress>, SealError> {
        let mut state = self.state.lock().await;
        let submission = self.accept_share(&mut state, share_b64).await;

        let mut event = AuditEvent::new("sys/unseal", OPERATOR, SEAL_CONFIG_PATH);
        if let Ok(Submission::Pending(p)) = &submission {
            event = event.with_detail(format!("progress={}/{}", p.submitted, p.threshold));
        }

        match self.audit.observe(event, submission).await? {
            Submission::Pending(progress) => Ok(Some(progress)),
            Submission::Unsealed(key) => {
                state.master_key = Some(key);
                info!("vault unsealed");
                Ok(None)
            }
        }
    }

    async fn accept_share(
        &self,
        state: &mut SealState,
        share_b64: &str,
    ) -> Result<Submission, SealError> {
        let record = self.load_record().await?.ok_or(SealError::NotInitialized)?;
        if state.master_key.is_some() {
            return Err(SealError::AlreadyUnsealed);
        }

        let share = Zeroizing::new(BASE64.decode(share_b64.trim()).map_err(|e| {
            SealError::InvalidShare {
                reason: format!("base64 decode failed: {e}"),
            }
        })?);
        if share.len() != SHARE_LEN {
            return Err(SealError::InvalidShare {
                reason: format!("expected {SHARE_LEN} bytes, got {}", share.len()),
            });
        }
        if share.first() == Some(&0) {
            return Err(SealError::InvalidShare {
                reason: "x-coordinate must be non-zero".to_owned(),
            });
        }

        if let Some(existing) = state.pending.iter().find(|p| p.first() == share.first()) {
            if existing.as_slice() == share.as_slice() {
                return Ok(Submission::Pending(progress(&record, state)));
            }
            return Err(SealError::InvalidShare {
                reason: "a different share with the same x-coordinate is already pending"
                    .to_owned(),
            });
        }

        state.pending.push(share);
        if state.pending.len() < usize::from(record.threshold) {
            return Ok(Submission::Pending(progress(&record, state)));
        }

        let result = self.reconstruct(&record, &state.pending).await;
        state.pending.clear();
        match result {
            Ok(key) => Ok(Submission::Unsealed(key)),
            Err(e) => {
                warn!(error = %e, "unseal failed, pending shares discarded");
                Err(e)
            }
        }
    }

    async fn reconstruct(
        &self,
        record: &SealRecord,
        pending: &[Zeroizing<Vec<u8>>],
    ) -> Result<EncryptionKey, SealError> {
        let candidate = combine_shares(record.threshold, pending)?;

        let wrapped = BASE64
            .decode(&record.encrypted_master_key)
            .map_err(|e| SealError::Serialization {
                reason: format!("encrypted master key is not base64: {e}"),
            })?;
        let kek = self.kek.key_encryption_key().await?;
        let expected = Zeroizing::new(crypto::decrypt(&kek, &wrapped).map_err(|e| {
            SealError::UnsealVerificationFailed {
                reason: format!("master key blob could not be opened: {e}"),
            }
        })?);

        if !bool::from(candidate.as_slice().ct_eq(expected.as_slice())) {
            return Err(SealError::UnsealVerificationFailed {
                reason: "reconstructed key does not match the stored master key".to_owned(),
            });
        }

        EncryptionKey::from_slice(&candidate).ok_or_else(|| SealError::UnsealVerificationFailed {
            reason: "reconstructed key is not 32 bytes".to_owned(),
        })
    }

    /// Seal the vault, zeroizing the master key and discarding pending
    /// shares. Sealing an already sealed vault succeeds.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Audit`] if the event could not be recorded. The
    /// vault is sealed either way.
    pub async fn seal(&self) -> Result<(), SealError> {
        let was_unsealed = {
            let mut state = self.state.lock().await;
            state.pending.clear();
            state.master_key.take().is_some()
        };

        if was_unsealed {
            info!("vault sealed");
        }

        let event = AuditEvent::new("sys/seal", OPERATOR, SEAL_CONFIG_PATH).with_detail(
            if was_unsealed {
                "sealed"
            } else {
                "already sealed"
            },
        );
        self.audit.observe(event, Ok::<(), SealError>(())).await
    }

    /// Short-lived accessor for the master key.
    ///
    /// Returns `None` while sealed. Callers must use the key for a single
    /// operation and let it drop.
    pub async fn master_key(&self) -> Option<EncryptionKey> {
        self.state.lock().await.master_key.clone()
    }

    /// Whether the master key is currently absent.
    pub async fn is_sealed(&self) -> bool {
        self.state.lock().await.master_key.is_none()
    }

    /// Check whether the vault has been initialized.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Storage`] if the storage backend fails.
    pub async fn is_initialized(&self) -> Result<bool, SealError> {
        Ok(self.storage.exists(SEAL_CONFIG_PATH).await?)
    }

    /// Get the current seal status.
    ///
    /// # Errors
    ///
    /// Returns [`SealError::Storage`] or [`SealError::Serialization`] if the
    /// seal record cannot be read.
    pub async fn status(&self) -> Result<SealStatus, SealError> {
        let record = self.load_record().await?;
        let state = self.state.lock().await;

        Ok(match record {
            Some(record) => SealStatus {
                initialized: true,
                sealed: state.master_key.is_none(),
                threshold: record.threshold,
                shares: record.shares,
                progress: progress(&record, &state).submitted,
            },
            None => SealStatus {
                initialized: false,
                sealed: true,
                threshold: 0,
                shares: 0,
                progress: 0,
            },
        })
    }

    async fn load_record(&self) -> Result<Option<SealRecord>, SealError> {
        let Some(bytes) = self.storage.get(SEAL_CONFIG_PATH).await? else {
            return Ok(None);
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SealError::Serialization {
                reason: format!("failed to deserialize seal record: {e}"),
            })
    }
}

impl std::fmt::Debug for SealManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SealManager").finish_non_exhaustive()
    }
}

fn progress(record: &SealRecord, state: &SealState) -> UnsealProgress {
    UnsealProgress {
        threshold: record.threshold,
        submitted: u8::try_from(state.pending.len()).unwrap_or(u8::MAX),
    }
}

/// Validate Shamir configuration parameters: `2 <= threshold <= shares`.
/// The upper bound of 255 shares is enforced by the `u8` type.
fn validate_config(shares: u8, threshold: u8) -> Result<(), SealError> {
    if threshold < 2 {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold must be at least 2, got {threshold}"),
        });
    }
    if threshold > shares {
        return Err(SealError::InvalidConfig {
            reason: format!("threshold ({threshold}) cannot exceed share count ({shares})"),
        });
    }
    Ok(())
}

/// Split `secret` into `shares` encoded shares over GF(256).
fn split_secret(secret: &[u8], shares: u8, threshold: u8) -> Vec<Zeroizing<Vec<u8>>> {
    Sharks(threshold)
        .dealer(secret)
        .take(usize::from(shares))
        .map(|share| Zeroizing::new(Vec::from(&share)))
        .collect()
}

/// Interpolate the secret at x = 0 from encoded shares.
fn combine_shares(
    threshold: u8,
    encoded: &[Zeroizing<Vec<u8>>],
) -> Result<Zeroizing<Vec<u8>>, SealError> {
    let shares = encoded
        .iter()
        .map(|bytes| Share::try_from(bytes.as_slice()))
        .collect::<Result<Vec<Share>, _>>()
        .map_err(|e| SealError::UnsealVerificationFailed {
            reason: format!("share decoding failed: {e}"),
        })?;

    Sharks(threshold)
        .recover(&shares)
        .map(Zeroizing::new)
        .map_err(|e| SealError::UnsealVerificationFailed {
            reason: format!("interpolation failed: {e}"),
        })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use arcanum_storage::MemoryBackend;

    use super::*;
    use crate::audit::MemoryAuditBackend;
    use crate::kek::StaticKek;

    struct Fixture {
        mgr: SealManager,
        storage: Arc<MemoryBackend>,
        audit: Arc<MemoryAuditBackend>,
    }

    async fn fixture() -> Fixture {
        let storage = Arc::new(MemoryBackend::new());
        let audit_backend = Arc::new(MemoryAuditBackend::new());
        let audit = Arc::new(AuditManager::new());
        audit.add_backend(audit_backend.clone()).await;
        let kek = Arc::new(StaticKek::new(EncryptionKey::generate()));
        Fixture {
            mgr: SealManager::new(storage.clone(), kek, audit),
            storage,
            audit: audit_backend,
        }
    }

    async fn unseal_with(mgr: &SealManager, shares: &[String]) -> Option<UnsealProgress> {
        let mut last = None;
        for share in shares {
            last = mgr.unseal(share).await.unwrap();
        }
        last
    }

    /// Flip one y byte so the share still decodes but interpolates wrongly.
    fn corrupt(share: &str) -> String {
        let mut bytes = BASE64.decode(share).unwrap();
        bytes[5] ^= 0x5A;
        BASE64.encode(bytes)
    }

    // ── validate_config ──────────────────────────────────────────────

    #[test]
    fn validate_config_bounds() {
        assert!(validate_config(2, 2).is_ok());
        assert!(validate_config(5, 3).is_ok());
        assert!(validate_config(255, 255).is_ok());
        assert!(matches!(
            validate_config(5, 1),
            Err(SealError::InvalidConfig { .. })
        ));
        assert!(matches!(
            validate_config(3, 4),
            Err(SealError::InvalidConfig { .. })
        ));
        assert!(matches!(
            validate_config(0, 0),
            Err(SealError::InvalidConfig { .. })
        ));
    }

    // ── shamir ───────────────────────────────────────────────────────

    #[test]
    fn any_threshold_subset_reconstructs_and_fewer_do_not() {
        let secret = EncryptionKey::generate();
        for (n, k) in [(2u8, 2u8), (3, 2), (5, 3), (7, 7), (10, 4), (255, 3)] {
            let shares = split_secret(secret.as_bytes(), n, k);
            assert_eq!(shares.len(), usize::from(n));

            let quorum = usize::from(k);
            let head = combine_shares(k, &shares[..quorum]).unwrap();
            assert_eq!(head.as_slice(), secret.as_bytes());
            let tail = combine_shares(k, &shares[shares.len() - quorum..]).unwrap();
            assert_eq!(tail.as_slice(), secret.as_bytes());

            assert!(combine_shares(k, &shares[..quorum - 1]).is_err());
        }
    }

    // ── init ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn init_returns_shares_and_leaves_vault_sealed() {
        let f = fixture().await;
        let result = f.mgr.init(5, 3).await.unwrap();
        assert_eq!(result.shares.len(), 5);
        assert_eq!(result.threshold, 3);
        assert!(f.mgr.is_sealed().await);
        assert!(f.mgr.is_initialized().await.unwrap());
        assert_eq!(f.audit.events_for("sys/init").await.len(), 1);
    }

    #[tokio::test]
    async fn init_persists_exactly_one_record_without_plaintext_key() {
        let f = fixture().await;
        f.mgr.init(3, 2).await.unwrap();
        assert_eq!(f.storage.list("").await.unwrap(), vec![SEAL_CONFIG_PATH]);

        let raw = f.storage.get(SEAL_CONFIG_PATH).await.unwrap().unwrap();
        let record: SealRecord = serde_json::from_slice(&raw).unwrap();
        assert_eq!((record.shares, record.threshold), (3, 2));
        assert!(!record.encrypted_master_key.is_empty());
    }

    #[tokio::test]
    async fn init_twice_returns_already_initialized() {
        let f = fixture().await;
        f.mgr.init(3, 2).await.unwrap();
        let err = f.mgr.init(3, 2).await.unwrap_err();
        assert!(matches!(err, SealError::AlreadyInitialized));
    }

    #[tokio::test]
    async fn init_invalid_config_is_rejected_and_audited() {
        let f = fixture().await;
        let err = f.mgr.init(3, 1).await.unwrap_err();
        assert!(matches!(err, SealError::InvalidConfig { .. }));
        assert!(!f.mgr.is_initialized().await.unwrap());
        assert_eq!(f.audit.events_for("sys/init").await.len(), 1);
    }

    #[tokio::test]
    async fn init_rolls_back_when_audit_fails() {
        let f = fixture().await;
        f.audit.set_failing(true);
        let err = f.mgr.init(3, 2).await.unwrap_err();
        assert!(matches!(err, SealError::Audit(_)));
        assert!(!f.mgr.is_initialized().await.unwrap());
    }

    #[tokio::test]
    async fn debug_output_redacts_shares() {
        let f = fixture().await;
        let result = f.mgr.init(3, 2).await.unwrap();
        let debug = format!("{result:?}");
        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains(&result.shares[0]));
    }

    // ── unseal ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn unseal_reports_progress_until_threshold() {
        let f = fixture().await;
        let result = f.mgr.init(5, 3).await.unwrap();

        let p = f.mgr.unseal(&result.shares[0]).await.unwrap().unwrap();
        assert_eq!((p.submitted, p.threshold), (1, 3));
        let p = f.mgr.unseal(&result.shares[3]).await.unwrap().unwrap();
        assert_eq!(p.submitted, 2);
        assert!(f.mgr.is_sealed().await);

        assert!(f.mgr.unseal(&result.shares[4]).await.unwrap().is_none());
        assert!(!f.mgr.is_sealed().await);
        assert!(f.mgr.master_key().await.is_some());
    }

    #[tokio::test]
    async fn duplicate_share_does_not_advance_progress() {
        let f = fixture().await;
        let result = f.mgr.init(3, 2).await.unwrap();

        f.mgr.unseal(&result.shares[0]).await.unwrap();
        let p = f.mgr.unseal(&result.shares[0]).await.unwrap().unwrap();
        assert_eq!(p.submitted, 1);
        assert!(f.mgr.is_sealed().await);
    }

    #[tokio::test]
    async fn conflicting_share_for_same_coordinate_is_rejected() {
        let f = fixture().await;
        let result = f.mgr.init(3, 2).await.unwrap();

        f.mgr.unseal(&result.shares[0]).await.unwrap();
        let err = f.mgr.unseal(&corrupt(&result.shares[0])).await.unwrap_err();
        assert!(matches!(err, SealError::InvalidShare { .. }));
        assert_eq!(f.mgr.status().await.unwrap().progress, 1);
    }

    #[tokio::test]
    async fn failed_verification_clears_progress() {
        let f = fixture().await;
        let result = f.mgr.init(5, 3).await.unwrap();

        f.mgr.unseal(&result.shares[0]).await.unwrap();
        f.mgr.unseal(&result.shares[1]).await.unwrap();
        let err = f.mgr.unseal(&corrupt(&result.shares[2])).await.unwrap_err();
        assert!(matches!(err, SealError::UnsealVerificationFailed { .. }));

        let status = f.mgr.status().await.unwrap();
        assert!(status.sealed);
        assert_eq!(status.progress, 0);

        // A fresh quorum still works.
        assert!(unseal_with(&f.mgr, &result.shares[2..5]).await.is_none());
        assert!(!f.mgr.is_sealed().await);
    }

    #[tokio::test]
    async fn shares_from_another_vault_fail_verification() {
        let a = fixture().await;
        let b = fixture().await;
        let shares_a = a.mgr.init(3, 2).await.unwrap().shares;
        b.mgr.init(3, 2).await.unwrap();

        b.mgr.unseal(&shares_a[0]).await.unwrap();
        let err = b.mgr.unseal(&shares_a[1]).await.unwrap_err();
        assert!(matches!(err, SealError::UnsealVerificationFailed { .. }));
    }

    #[tokio::test]
    async fn unseal_not_initialized_returns_error() {
        let f = fixture().await;
        let err = f.mgr.unseal("dGVzdA==").await.unwrap_err();
        assert!(matches!(err, SealError::NotInitialized));
    }

    #[tokio::test]
    async fn unseal_already_unsealed_returns_error() {
        let f = fixture().await;
        let result = f.mgr.init(2, 2).await.unwrap();
        unseal_with(&f.mgr, &result.shares).await;

        let err = f.mgr.unseal(&result.shares[0]).await.unwrap_err();
        assert!(matches!(err, SealError::AlreadyUnsealed));
    }

    #[tokio::test]
    async fn unseal_malformed_share_returns_invalid_share() {
        let f = fixture().await;
        f.mgr.init(3, 2).await.unwrap();

        let zero_x = BASE64.encode([0u8; SHARE_LEN]);
        for bad in ["not-valid-base64!!!", "dGVzdA==", zero_x.as_str()] {
            let err = f.mgr.unseal(bad).await.unwrap_err();
            assert!(matches!(err, SealError::InvalidShare { .. }), "{bad}");
        }
        assert_eq!(f.mgr.status().await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn every_unseal_call_is_audited() {
        let f = fixture().await;
        let result = f.mgr.init(3, 2).await.unwrap();
        f.mgr.unseal("garbage!").await.unwrap_err();
        unseal_with(&f.mgr, &result.shares[..2]).await;
        assert_eq!(f.audit.events_for("sys/unseal").await.len(), 3);
    }

    #[tokio::test]
    async fn unseal_fails_closed_when_audit_fails() {
        let f = fixture().await;
        let result = f.mgr.init(2, 2).await.unwrap();
        f.mgr.unseal(&result.shares[0]).await.unwrap();

        f.audit.set_failing(true);
        let err = f.mgr.unseal(&result.shares[1]).await.unwrap_err();
        assert!(matches!(err, SealError::Audit(_)));
        assert!(f.mgr.is_sealed().await);
    }

    // ── seal ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn seal_is_idempotent_and_audited() {
        let f = fixture().await;
        let result = f.mgr.init(2, 2).await.unwrap();
        unseal_with(&f.mgr, &result.shares).await;

        f.mgr.seal().await.unwrap();
        assert!(f.mgr.is_sealed().await);
        assert!(f.mgr.master_key().await.is_none());
        f.mgr.seal().await.unwrap();

        let events = f.audit.events_for("sys/seal").await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].detail.as_deref(), Some("already sealed"));
    }

    #[tokio::test]
    async fn seal_clears_pending_shares() {
        let f = fixture().await;
        let result = f.mgr.init(3, 3).await.unwrap();
        f.mgr.unseal(&result.shares[0]).await.unwrap();

        f.mgr.seal().await.unwrap();
        assert_eq!(f.mgr.status().await.unwrap().progress, 0);
    }

    #[tokio::test]
    async fn reseal_and_reunseal_with_other_quorum() {
        let f = fixture().await;
        let result = f.mgr.init(3, 2).await.unwrap();

        unseal_with(&f.mgr, &result.shares[..2]).await;
        let first = f.mgr.master_key().await.unwrap();
        f.mgr.seal().await.unwrap();

        unseal_with(&f.mgr, &result.shares[1..]).await;
        let second = f.mgr.master_key().await.unwrap();
        assert_eq!(first.as_bytes(), second.as_bytes());
    }

    // ── status ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn status_lifecycle() {
        let f = fixture().await;
        let status = f.mgr.status().await.unwrap();
        assert!(!status.initialized);
        assert!(status.sealed);

        let result = f.mgr.init(5, 3).await.unwrap();
        let status = f.mgr.status().await.unwrap();
        assert!(status.initialized && status.sealed);
        assert_eq!((status.shares, status.threshold, status.progress), (5, 3, 0));

        f.mgr.unseal(&result.shares[0]).await.unwrap();
        assert_eq!(f.mgr.status().await.unwrap().progress, 1);

        unseal_with(&f.mgr, &result.shares[1..3]).await;
        let status = f.mgr.status().await.unwrap();
        assert!(!status.sealed);
        assert_eq!(status.progress, 0);
    }

    #[tokio::test]
    async fn seal_manager_debug_does_not_leak() {
        let f = fixture().await;
        let debug = format!("{:?}", f.mgr);
        assert!(debug.contains("SealManager"));
        assert!(!debug.contains("pending"));
    }
}
