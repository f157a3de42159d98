//! Versioned key-value secret store for `Arcanum`.
//!
//! Each secret path has a small metadata record at `kv/meta/<path>` holding
//! its settings (check-and-set, version limit, automatic deletion, custom
//! metadata), the version counter and the versions that count against the
//! limit. Every version is its own barrier-encrypted row at
//! `kv/versions/<path>/<n>`, with the payload additionally sealed under the
//! `kv` field key.
//!
//! Every mutation is one guarded batch: the metadata record is replaced only
//! if nobody wrote it since it was read, an appended row must not exist yet
//! and a flagged row must be unchanged since it was read. Two concurrent
//! writers can therefore never both claim the same next version, and a
//! mutation only touches the rows it appends or flags.
//!
//! Version states:
//! - live: readable
//! - deleted: `deletion_time` has passed; [`KvEngine::undelete_versions`]
//!   brings it back
//! - destroyed: payload wiped, terminal

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeDelta, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditManager};
use crate::barrier::{Barrier, Change, Expect, expect_from};
use crate::config::EngineConfig;
use crate::error::KvError;

/// Storage prefix for per-path metadata records.
const META_PREFIX: &str = "kv/meta/";

/// Storage prefix for version rows.
const VERSION_PREFIX: &str = "kv/versions/";

/// Field-sealing purpose for payloads.
const FIELD_PURPOSE: &str = "kv";

const MAX_CUSTOM_KEYS: usize = 64;
const MAX_CUSTOM_KEY_LEN: usize = 128;
const MAX_CUSTOM_VALUE_LEN: usize = 512;

/// Secret payload: arbitrary JSON values by key.
pub type SecretData = BTreeMap<String, serde_json::Value>;

// ── Records ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct PathSettings {
    cas_required: bool,
    /// 0 means the engine default.
    max_versions: u32,
    /// 0 means versions are never deleted automatically.
    delete_version_after_secs: u64,
    custom_metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VersionRow {
    created_at: DateTime<Utc>,
    deletion_time: Option<DateTime<Utc>>,
    destroyed: bool,
    /// Field-sealed JSON payload, base64. `None` once destroyed.
    payload: Option<String>,
}

impl VersionRow {
    fn is_deleted(&self, now: DateTime<Utc>) -> bool {
        self.deletion_time.is_some_and(|t| t <= now)
    }

    fn is_live(&self, now: DateTime<Utc>) -> bool {
        !self.destroyed && !self.is_deleted(now)
    }

    fn summary(&self, version: u64) -> VersionMetadata {
        VersionMetadata {
            version,
            created_at: self.created_at,
            deletion_time: self.deletion_time,
            destroyed: self.destroyed,
        }
    }

    /// Apply a flag change. Returns whether the row changed.
    fn flag(&mut self, flag: RowFlag, now: DateTime<Utc>) -> bool {
        match flag {
            RowFlag::SoftDelete => {
                if self.destroyed || self.is_deleted(now) {
                    return false;
                }
                self.deletion_time = Some(now);
            }
            RowFlag::Undelete => {
                if self.destroyed || self.deletion_time.is_none() {
                    return false;
                }
                self.deletion_time = None;
            }
            RowFlag::Destroy => {
                if self.destroyed {
                    return false;
                }
                self.destroyed = true;
                self.payload = None;
            }
        }
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RowFlag {
    SoftDelete,
    Undelete,
    Destroy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct PathRecord {
    settings: PathSettings,
    /// Highest version ever assigned. Never decreases.
    current_version: u64,
    /// Versions counted against the limit, i.e. neither deleted, destroyed
    /// nor retired by the limit. Holds at most the limit after a write.
    retained: BTreeSet<u64>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl PathRecord {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            settings: PathSettings::default(),
            current_version: 0,
            retained: BTreeSet::new(),
            created_at: now,
            updated_at: now,
        }
    }

    fn version_limit(&self, default: u32) -> usize {
        let limit = match self.settings.max_versions {
            0 => default,
            n => n,
        };
        usize::try_from(limit).unwrap_or(usize::MAX)
    }

    fn metadata(&self, path: &str, rows: &BTreeMap<u64, VersionRow>) -> SecretMetadata {
        SecretMetadata {
            path: path.to_owned(),
            cas_required: self.settings.cas_required,
            max_versions: self.settings.max_versions,
            delete_version_after_secs: self.settings.delete_version_after_secs,
            custom_metadata: self.settings.custom_metadata.clone(),
            current_version: self.current_version,
            oldest_version: rows.keys().next().copied().unwrap_or(0),
            created_at: self.created_at,
            updated_at: self.updated_at,
            versions: rows.iter().map(|(n, row)| (*n, row.summary(*n))).collect(),
        }
    }
}

/// The row changes a mutation asks [`KvEngine::modify`] to commit alongside
/// the metadata record.
struct Step<T> {
    output: T,
    /// New version row; must not exist yet.
    append: Option<(u64, VersionRow)>,
    /// Flag changes to existing rows.
    flags: Vec<(u64, RowFlag)>,
    /// Soft-delete the oldest retained versions beyond the limit.
    enforce_limit: bool,
}

impl<T> Step<T> {
    fn new(output: T) -> Self {
        Self {
            output,
            append: None,
            flags: Vec::new(),
            enforce_limit: false,
        }
    }
}

// ── Public types ─────────────────────────────────────────────────────

/// State of one version, without its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionMetadata {
    pub version: u64,
    pub created_at: DateTime<Utc>,
    /// When the version is (or was) soft-deleted.
    pub deletion_time: Option<DateTime<Utc>>,
    pub destroyed: bool,
}

/// Per-path settings plus a summary of every stored version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretMetadata {
    pub path: String,
    pub cas_required: bool,
    /// 0 means the engine default.
    pub max_versions: u32,
    /// 0 means versions are never deleted automatically.
    pub delete_version_after_secs: u64,
    pub custom_metadata: BTreeMap<String, String>,
    pub current_version: u64,
    pub oldest_version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub versions: BTreeMap<u64, VersionMetadata>,
}

/// Changes accepted by [`KvEngine::update_metadata`]. `None` keeps the
/// current value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MetadataUpdate {
    pub cas_required: Option<bool>,
    pub max_versions: Option<u32>,
    pub delete_version_after_secs: Option<u64>,
    pub custom_metadata: Option<BTreeMap<String, String>>,
}

/// A decrypted secret version.
#[derive(Clone, Serialize)]
pub struct Secret {
    pub path: String,
    pub version: u64,
    pub data: SecretData,
    pub created_at: DateTime<Utc>,
    pub custom_metadata: BTreeMap<String, String>,
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("path", &self.path)
            .field("version", &self.version)
            .field("data", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

// ── Engine ───────────────────────────────────────────────────────────

/// Versioned KV engine.
pub struct KvEngine {
    barrier: Arc<Barrier>,
    audit: Arc<AuditManager>,
    default_max_versions: u32,
    retry_limit: u32,
}

impl KvEngine {
    /// Create a KV engine over the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, audit: Arc<AuditManager>, config: &EngineConfig) -> Self {
        Self {
            barrier,
            audit,
            default_max_versions: config.kv_default_max_versions.max(1),
            retry_limit: config.write_retry_limit.max(1),
        }
    }

    /// Write a new version of the secret at `path`.
    ///
    /// `cas = Some(0)` writes only if the path has no versions yet;
    /// `cas = Some(v)` writes only if the current version is `v`.
    ///
    /// # Errors
    ///
    /// - [`KvError::CasRequired`] if the path requires check-and-set and
    ///   `cas` is `None`.
    /// - [`KvError::AlreadyExists`] / [`KvError::CasMismatch`] if the
    ///   expectation does not hold.
    /// - [`KvError::InvalidPath`] for a malformed path.
    /// - [`KvError::Sealed`] if the vault is sealed.
    /// - [`KvError::Audit`] if the request could not be recorded; nothing
    ///   is written then.
    pub async fn write(
        &self,
        actor: &str,
        path: &str,
        data: &SecretData,
        cas: Option<u64>,
    ) -> Result<VersionMetadata, KvError> {
        let event = AuditEvent::new("kv/write", actor, path);
        let meta = self
            .audit
            .guard_with(event, self.write_inner(path, data, cas), |meta| {
                Some(format!("version={}", meta.version))
            })
            .await?;
        debug!(path, version = meta.version, "kv secret written");
        Ok(meta)
    }

    async fn write_inner(
        &self,
        path: &str,
        data: &SecretData,
        cas: Option<u64>,
    ) -> Result<VersionMetadata, KvError> {
        let path = normalize_path(path)?;
        let plaintext = Zeroizing::new(serde_json::to_vec(data).map_err(|e| {
            KvError::Serialization {
                reason: format!("payload serialization failed: {e}"),
            }
        })?);
        let sealed = BASE64.encode(self.barrier.seal_field(FIELD_PURPOSE, &plaintext).await?);

        self.modify(&path, true, |record, now| {
            check_cas(&path, record, cas)?;

            let version = record.current_version.saturating_add(1);
            let deletion_time = match record.settings.delete_version_after_secs {
                0 => None,
                secs => after(now, secs),
            };
            let row = VersionRow {
                created_at: now,
                deletion_time,
                destroyed: false,
                payload: Some(sealed.clone()),
            };
            let summary = row.summary(version);
            record.current_version = version;
            record.retained.insert(version);
            record.updated_at = now;

            Ok(Step {
                append: Some((version, row)),
                enforce_limit: true,
                ..Step::new(summary)
            })
        })
        .await
    }

    /// Read a version of the secret at `path`.
    ///
    /// `version = None` returns the latest live version. Destroyed versions
    /// never read, whatever their deletion state.
    ///
    /// # Errors
    ///
    /// - [`KvError::NotFound`] if the path has no live version.
    /// - [`KvError::VersionNotFound`] / [`KvError::Deleted`] /
    ///   [`KvError::Destroyed`] for an explicit version.
    /// - [`KvError::Audit`] if the read could not be recorded.
    pub async fn read(
        &self,
        actor: &str,
        path: &str,
        version: Option<u64>,
    ) -> Result<Secret, KvError> {
        let result = self.read_inner(path, version).await;
        let mut event = AuditEvent::new("kv/read", actor, path);
        if let Ok(secret) = &result {
            event = event.with_detail(format!("version={}", secret.version));
        }
        self.audit.observe(event, result).await
    }

    async fn read_inner(&self, path: &str, version: Option<u64>) -> Result<Secret, KvError> {
        let path = normalize_path(path)?;
        let record = self.load(&path).await?;
        let now = Utc::now();

        let (number, row) = match version {
            None => self
                .latest_live(&path, &record, now)
                .await?
                .ok_or_else(|| KvError::NotFound { path: path.clone() })?,
            Some(n) => {
                let row = self
                    .load_row(&path, n)
                    .await?
                    .ok_or_else(|| KvError::VersionNotFound {
                        path: path.clone(),
                        version: n,
                    })?;
                if row.destroyed {
                    return Err(KvError::Destroyed { path, version: n });
                }
                if row.is_deleted(now) {
                    return Err(KvError::Deleted { path, version: n });
                }
                (n, row)
            }
        };

        let sealed = row.payload.as_deref().ok_or_else(|| KvError::Destroyed {
            path: path.clone(),
            version: number,
        })?;
        let sealed = BASE64.decode(sealed).map_err(|e| KvError::Serialization {
            reason: format!("stored payload is not base64: {e}"),
        })?;
        let plaintext = Zeroizing::new(self.barrier.open_field(FIELD_PURPOSE, &sealed).await?);
        let data: SecretData =
            serde_json::from_slice(&plaintext).map_err(|e| KvError::Serialization {
                reason: format!("payload deserialization failed: {e}"),
            })?;

        Ok(Secret {
            version: number,
            data,
            created_at: row.created_at,
            custom_metadata: record.settings.custom_metadata,
            path,
        })
    }

    /// Soft-delete versions. An empty list deletes the current version.
    /// Unknown and destroyed versions are skipped.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] if the path doesn't exist.
    pub async fn delete_versions(
        &self,
        actor: &str,
        path: &str,
        versions: &[u64],
    ) -> Result<(), KvError> {
        let event = AuditEvent::new("kv/delete", actor, path).with_detail(describe(versions));
        self.audit
            .guard(event, self.flag_versions(path, versions, RowFlag::SoftDelete))
            .await
    }

    /// Restore soft-deleted versions. Destroyed versions stay destroyed.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] if the path doesn't exist.
    pub async fn undelete_versions(
        &self,
        actor: &str,
        path: &str,
        versions: &[u64],
    ) -> Result<(), KvError> {
        let event = AuditEvent::new("kv/undelete", actor, path).with_detail(describe(versions));
        self.audit
            .guard(event, self.flag_versions(path, versions, RowFlag::Undelete))
            .await
    }

    /// Wipe the payload of versions permanently.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] if the path doesn't exist.
    pub async fn destroy_versions(
        &self,
        actor: &str,
        path: &str,
        versions: &[u64],
    ) -> Result<(), KvError> {
        let event = AuditEvent::new("kv/destroy", actor, path).with_detail(describe(versions));
        self.audit
            .guard(event, self.flag_versions(path, versions, RowFlag::Destroy))
            .await?;
        info!(path, "kv versions destroyed");
        Ok(())
    }

    /// Update per-path settings, creating them for a path with no versions.
    /// A lowered `max_versions` takes effect immediately.
    ///
    /// # Errors
    ///
    /// - [`KvError::InvalidMetadata`] if custom metadata exceeds its limits or
    ///   the deletion delay is out of range.
    /// - [`KvError::InvalidPath`] for a malformed path.
    pub async fn update_metadata(
        &self,
        actor: &str,
        path: &str,
        update: MetadataUpdate,
    ) -> Result<SecretMetadata, KvError> {
        let event = AuditEvent::new("kv/metadata/update", actor, path);
        self.audit
            .guard(event, self.update_metadata_inner(path, update))
            .await
    }

    async fn update_metadata_inner(
        &self,
        path: &str,
        update: MetadataUpdate,
    ) -> Result<SecretMetadata, KvError> {
        let path = normalize_path(path)?;
        if let Some(custom) = &update.custom_metadata {
            validate_custom_metadata(custom)?;
        }
        if let Some(secs) = update.delete_version_after_secs {
            if secs > 0 && after(Utc::now(), secs).is_none() {
                return Err(KvError::InvalidMetadata {
                    reason: format!("delete_version_after of {secs}s is out of range"),
                });
            }
        }

        self.modify(&path, true, |record, now| {
            let settings = &mut record.settings;
            if let Some(v) = update.cas_required {
                settings.cas_required = v;
            }
            if let Some(v) = update.max_versions {
                settings.max_versions = v;
            }
            if let Some(v) = update.delete_version_after_secs {
                settings.delete_version_after_secs = v;
            }
            if let Some(v) = &update.custom_metadata {
                settings.custom_metadata.clone_from(v);
            }
            record.updated_at = now;
            Ok(Step {
                enforce_limit: true,
                ..Step::new(())
            })
        })
        .await?;
        let record = self.load(&path).await?;
        Ok(record.metadata(&path, &self.load_rows(&path).await?))
    }

    /// Remove the path, its settings and every version.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] if the path doesn't exist.
    pub async fn delete_metadata(&self, actor: &str, path: &str) -> Result<(), KvError> {
        let event = AuditEvent::new("kv/metadata/delete", actor, path);
        self.audit
            .guard(event, self.delete_metadata_inner(path))
            .await?;
        info!(path, "kv path and all versions removed");
        Ok(())
    }

    async fn delete_metadata_inner(&self, path: &str) -> Result<(), KvError> {
        let path = normalize_path(path)?;
        let key = meta_key(&path);
        for _ in 0..self.retry_limit {
            let current = self
                .barrier
                .read(&key)
                .await?
                .ok_or_else(|| KvError::NotFound { path: path.clone() })?;
            let mut changes = vec![Change::delete(
                key.clone(),
                Expect::Unchanged(current.revision),
            )];
            for version in self.version_numbers(&path).await? {
                changes.push(Change::delete(
                    version_key(&path, version),
                    Expect::Anything,
                ));
            }
            if self.barrier.apply(changes).await? {
                return Ok(());
            }
            debug!(path, "kv path changed during delete, retrying");
        }
        Err(KvError::Conflict { path })
    }

    /// Settings and version summaries for `path`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::NotFound`] if the path doesn't exist.
    pub async fn read_metadata(&self, path: &str) -> Result<SecretMetadata, KvError> {
        let path = normalize_path(path)?;
        let record = self.load(&path).await?;
        Ok(record.metadata(&path, &self.load_rows(&path).await?))
    }

    /// Immediate children of `prefix`. Nested paths appear once, as their
    /// first segment with a trailing `/`.
    ///
    /// # Errors
    ///
    /// Returns [`KvError::InvalidPath`] for a malformed prefix, or a barrier
    /// error.
    pub async fn list_secrets(&self, prefix: &str) -> Result<Vec<String>, KvError> {
        let prefix = match prefix.trim_matches('/') {
            "" => String::new(),
            _ => format!("{}/", normalize_path(prefix)?),
        };
        let storage_prefix = format!("{META_PREFIX}{prefix}");

        let children: BTreeSet<String> = self
            .barrier
            .list(&storage_prefix)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(&storage_prefix))
            .map(|rest| match rest.split_once('/') {
                Some((dir, _)) => format!("{dir}/"),
                None => rest.to_owned(),
            })
            .collect();
        Ok(children.into_iter().collect())
    }

    // ── Internal helpers ─────────────────────────────────────────────

    async fn load(&self, path: &str) -> Result<PathRecord, KvError> {
        let bytes = self
            .barrier
            .get(&meta_key(path))
            .await?
            .ok_or_else(|| KvError::NotFound {
                path: path.to_owned(),
            })?;
        decode(&bytes)
    }

    async fn load_row(&self, path: &str, version: u64) -> Result<Option<VersionRow>, KvError> {
        match self.barrier.get(&version_key(path, version)).await? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    async fn load_rows(&self, path: &str) -> Result<BTreeMap<u64, VersionRow>, KvError> {
        let mut rows = BTreeMap::new();
        for version in self.version_numbers(path).await? {
            if let Some(row) = self.load_row(path, version).await? {
                rows.insert(version, row);
            }
        }
        Ok(rows)
    }

    /// Version numbers with a stored row. Rows of nested paths share the
    /// listing prefix and are skipped.
    async fn version_numbers(&self, path: &str) -> Result<Vec<u64>, KvError> {
        let prefix = format!("{VERSION_PREFIX}{path}/");
        Ok(self
            .barrier
            .list(&prefix)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(&prefix))
            .filter_map(|rest| rest.parse::<u64>().ok())
            .collect())
    }

    /// Newest live version. Only retained versions can be live, so older
    /// rows are never read.
    async fn latest_live(
        &self,
        path: &str,
        record: &PathRecord,
        now: DateTime<Utc>,
    ) -> Result<Option<(u64, VersionRow)>, KvError> {
        for version in record.retained.iter().rev() {
            if let Some(row) = self.load_row(path, *version).await? {
                if row.is_live(now) {
                    return Ok(Some((*version, row)));
                }
            }
        }
        Ok(None)
    }

    /// Guarded update of the metadata record at `path` plus the rows the
    /// returned [`Step`] names, committed as one batch.
    ///
    /// With `create`, a missing record starts out empty; otherwise it is
    /// [`KvError::NotFound`].
    async fn modify<T, F>(&self, path: &str, create: bool, mut op: F) -> Result<T, KvError>
    where
        F: FnMut(&mut PathRecord, DateTime<Utc>) -> Result<Step<T>, KvError>,
    {
        let key = meta_key(path);
        for _ in 0..self.retry_limit {
            let current = self.barrier.read(&key).await?;
            let now = Utc::now();
            let mut record = match &current {
                Some(v) => decode(&v.value)?,
                None if create => PathRecord::new(now),
                None => {
                    return Err(KvError::NotFound {
                        path: path.to_owned(),
                    });
                }
            };

            let step = op(&mut record, now)?;
            let mut flags: BTreeMap<u64, RowFlag> = step.flags.into_iter().collect();
            if step.enforce_limit {
                let limit = record.version_limit(self.default_max_versions);
                while record.retained.len() > limit {
                    let Some(oldest) = record.retained.pop_first() else {
                        break;
                    };
                    flags.entry(oldest).or_insert(RowFlag::SoftDelete);
                }
            }

            let mut changes = Vec::with_capacity(flags.len() + 2);
            for (version, flag) in flags {
                let row_key = version_key(path, version);
                let Some(stored) = self.barrier.read(&row_key).await? else {
                    record.retained.remove(&version);
                    continue;
                };
                let mut row: VersionRow = decode(&stored.value)?;
                if row.destroyed {
                    record.retained.remove(&version);
                }
                if row.flag(flag, now) {
                    changes.push(Change::put(
                        row_key,
                        Expect::Unchanged(stored.revision),
                        encode(&row)?,
                    ));
                }
            }
            if let Some((version, row)) = &step.append {
                changes.push(Change::put(
                    version_key(path, *version),
                    Expect::Absent,
                    encode(row)?,
                ));
            }
            changes.push(Change::put(
                key.clone(),
                expect_from(current.as_ref()),
                encode(&record)?,
            ));

            if self.barrier.apply(changes).await? {
                return Ok(step.output);
            }
            debug!(path, "kv path changed concurrently, retrying");
        }
        Err(KvError::Conflict {
            path: path.to_owned(),
        })
    }

    async fn flag_versions(
        &self,
        path: &str,
        versions: &[u64],
        flag: RowFlag,
    ) -> Result<(), KvError> {
        let path = normalize_path(path)?;
        self.modify(&path, false, |record, now| {
            let targets: BTreeSet<u64> = if versions.is_empty() {
                BTreeSet::from([record.current_version])
            } else {
                versions.iter().copied().collect()
            };
            let mut flags = Vec::with_capacity(targets.len());
            for n in targets {
                if n == 0 || n > record.current_version {
                    continue;
                }
                if flag == RowFlag::Undelete {
                    record.retained.insert(n);
                } else {
                    record.retained.remove(&n);
                }
                flags.push((n, flag));
            }
            record.updated_at = now;
            Ok(Step {
                flags,
                ..Step::new(())
            })
        })
        .await
    }
}

impl fmt::Debug for KvEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvEngine")
            .field("default_max_versions", &self.default_max_versions)
            .field("retry_limit", &self.retry_limit)
            .finish_non_exhaustive()
    }
}

fn check_cas(path: &str, record: &PathRecord, cas: Option<u64>) -> Result<(), KvError> {
    match cas {
        None if record.settings.cas_required => Err(KvError::CasRequired {
            path: path.to_owned(),
        }),
        None => Ok(()),
        Some(0) if record.current_version > 0 => Err(KvError::AlreadyExists {
            path: path.to_owned(),
        }),
        Some(expected) if expected != record.current_version => Err(KvError::CasMismatch {
            path: path.to_owned(),
            expected,
            current: record.current_version,
        }),
        Some(_) => Ok(()),
    }
}

/// Trim surrounding slashes and reject empty, `.` and `..` segments.
fn normalize_path(path: &str) -> Result<String, KvError> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Err(KvError::InvalidPath {
            reason: "path is empty".to_owned(),
        });
    }
    if let Some(bad) = trimmed
        .split('/')
        .find(|s| s.is_empty() || *s == "." || *s == "..")
    {
        return Err(KvError::InvalidPath {
            reason: format!("'{path}' contains invalid segment '{bad}'"),
        });
    }
    Ok(trimmed.to_owned())
}

fn validate_custom_metadata(custom: &BTreeMap<String, String>) -> Result<(), KvError> {
    if custom.len() > MAX_CUSTOM_KEYS {
        return Err(KvError::InvalidMetadata {
            reason: format!("at most {MAX_CUSTOM_KEYS} custom metadata keys are allowed"),
        });
    }
    for (k, v) in custom {
        if k.is_empty() || k.len() > MAX_CUSTOM_KEY_LEN {
            return Err(KvError::InvalidMetadata {
                reason: format!("custom metadata keys must be 1-{MAX_CUSTOM_KEY_LEN} bytes"),
            });
        }
        if v.len() > MAX_CUSTOM_VALUE_LEN {
            return Err(KvError::InvalidMetadata {
                reason: format!(
                    "custom metadata value for '{k}' exceeds {MAX_CUSTOM_VALUE_LEN} bytes"
                ),
            });
        }
    }
    Ok(())
}

fn after(now: DateTime<Utc>, secs: u64) -> Option<DateTime<Utc>> {
    let delta = TimeDelta::try_seconds(i64::try_from(secs).ok()?)?;
    now.checked_add_signed(delta)
}

fn describe(versions: &[u64]) -> String {
    if versions.is_empty() {
        "versions=current".to_owned()
    } else {
        let list: Vec<String> = versions.iter().map(u64::to_string).collect();
        format!("versions={}", list.join(","))
    }
}

fn meta_key(path: &str) -> String {
    format!("{META_PREFIX}{path}")
}

fn version_key(path: &str, version: u64) -> String {
    format!("{VERSION_PREFIX}{path}/{version}")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, KvError> {
    serde_json::to_vec(value).map_err(|e| KvError::Serialization {
        reason: format!("record serialization failed: {e}"),
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, KvError> {
    serde_json::from_slice(bytes).map_err(|e| KvError::Serialization {
        reason: format!("record deserialization failed: {e}"),
    })
}
