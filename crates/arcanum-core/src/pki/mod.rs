//! PKI certificate authority engine for `Arcanum`.
//!
//! Operates a tree of certificate authorities, issues leaf certificates
//! under role rules and publishes CRLs. Uses `rcgen` for pure-Rust
//! certificate generation, no OpenSSL dependency.
//!
//! # Storage layout
//!
//! All records go through the barrier. CA and leaf private keys are sealed a
//! second time under the `pki` field key before they are written.
//!
//! - `pki/ca/<id>`: CA record (certificate, sealed key, counters)
//! - `pki/ca-names/<name>`: CA name to id
//! - `pki/roles/<name>`: issuance role
//! - `pki/certs/<serial>`: issuance ledger entry
//! - `pki/issued/<ca_id>/<serial>`: per-CA ledger index
//!
//! Issuance writes the ledger entry, its index and the CA's bumped counter in
//! one guarded batch, so a certificate is either fully recorded or not
//! issued at all.

mod domain;
pub mod types;
mod x509;

use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeDelta, Utc};
use rcgen::{KeyPair, PublicKeyData};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info};
use zeroize::Zeroizing;

use crate::audit::{AuditEvent, AuditManager};
use crate::barrier::{Barrier, Change, Expect, Revision};
use crate::config::EngineConfig;
use crate::error::PkiError;

pub use types::{
    CaKind, CertificateAuthority, CertificateRecord, Crl, ExtKeyUsage, IntermediateCaRequest,
    IssueRequest, IssuedCertificate, KeyUsage, PkiKeyType, PkiRole, RevokedEntry, RootCaRequest,
    SignCsrRequest,
};
use types::CaRecord;
use x509::{Issuer, LeafSpec, Validity};

const CA_PREFIX: &str = "pki/ca/";
const CA_NAMES_PREFIX: &str = "pki/ca-names/";
const ROLES_PREFIX: &str = "pki/roles/";
const CERTS_PREFIX: &str = "pki/certs/";
const ISSUED_PREFIX: &str = "pki/issued/";

/// Field-sealing purpose for private keys.
const FIELD_PURPOSE: &str = "pki";

/// A CA record together with the revision it was read at.
struct LoadedCa {
    record: CaRecord,
    revision: Revision,
}

/// Validated names for a leaf certificate.
struct Names {
    common_name: String,
    dns: Vec<String>,
    ips: Vec<IpAddr>,
}

/// The PKI engine.
pub struct PkiEngine {
    barrier: Arc<Barrier>,
    audit: Arc<AuditManager>,
    retry_limit: u32,
    crl_validity_secs: u64,
    max_ca_ttl_secs: u64,
}

impl PkiEngine {
    /// Create a PKI engine over the given barrier.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, audit: Arc<AuditManager>, config: &EngineConfig) -> Self {
        Self {
            barrier,
            audit,
            retry_limit: config.write_retry_limit.max(1),
            crl_validity_secs: config.crl_validity_secs.max(1),
            max_ca_ttl_secs: config.pki_max_ca_ttl_secs,
        }
    }

    // ── Certificate authorities ──────────────────────────────────────

    /// Generate a self-signed root CA.
    ///
    /// # Errors
    ///
    /// - [`PkiError::InvalidRequest`] for a bad name, empty common name or a
    ///   lifetime outside `1..=pki_max_ca_ttl_secs`.
    /// - [`PkiError::CaExists`] if the name is taken.
    /// - [`PkiError::Sealed`] if the vault is sealed.
    pub async fn create_root_ca(
        &self,
        actor: &str,
        req: RootCaRequest,
    ) -> Result<CertificateAuthority, PkiError> {
        let name = req.name.clone();
        let event = AuditEvent::new("pki/ca/create", actor, &name).with_detail("root");
        let ca = self
            .audit
            .guard(event, self.create_root_ca_inner(req))
            .await?;
        info!(ca = %ca.name, serial = %ca.serial, "root CA created");
        Ok(ca)
    }

    async fn create_root_ca_inner(
        &self,
        req: RootCaRequest,
    ) -> Result<CertificateAuthority, PkiError> {
        validate_name("CA", &req.name)?;
        require_common_name(&req.common_name)?;
        self.check_ca_ttl(req.ttl_secs)?;

        let now = Utc::now();
        let validity = Validity {
            not_before: now,
            not_after: add_secs(now, req.ttl_secs)?,
        };
        let key = x509::generate_key(req.key_type)?;
        let serial = x509::random_serial();
        let params = x509::ca_params(
            &req.common_name,
            req.organization.as_deref(),
            req.max_path_length,
            validity,
            &serial,
            false,
        )?;
        let certificate_pem = x509::self_sign(params, &key)?;

        let record = CaRecord {
            ca: CertificateAuthority {
                id: uuid::Uuid::new_v4().to_string(),
                name: req.name.clone(),
                kind: CaKind::Root,
                common_name: req.common_name,
                organization: req.organization,
                key_type: req.key_type,
                certificate_pem,
                serial,
                max_path_length: req.max_path_length,
                parent_id: None,
                revoked: false,
                revoked_at: None,
                issued_count: 0,
                crl_number: 0,
                not_before: validity.not_before,
                not_after: validity.not_after,
                created_at: now,
            },
            private_key: self.seal_key(&key).await?,
        };

        let created = self
            .barrier
            .apply(vec![
                Change::put(
                    ca_name_key(&req.name),
                    Expect::Absent,
                    record.ca.id.clone().into_bytes(),
                ),
                Change::put(ca_key(&record.ca.id), Expect::Absent, encode(&record)?),
            ])
            .await?;
        if !created {
            return Err(PkiError::CaExists { name: req.name });
        }
        Ok(record.ca)
    }

    /// Create an intermediate CA signed by an existing parent.
    ///
    /// The parent must not be revoked and must allow sub-CAs
    /// (`max_path_length >= 1`); the new CA's `max_path_length` must be
    /// strictly below the parent's. Validity is clamped to the parent's.
    ///
    /// # Errors
    ///
    /// - [`PkiError::CaNotFound`] if the parent doesn't exist.
    /// - [`PkiError::RevokedCa`] if the parent is revoked.
    /// - [`PkiError::Hierarchy`] if the path-length rules are violated.
    /// - [`PkiError::CaExists`] if the name is taken.
    pub async fn create_intermediate_ca(
        &self,
        actor: &str,
        req: IntermediateCaRequest,
    ) -> Result<CertificateAuthority, PkiError> {
        let name = req.name.clone();
        let parent = req.parent.clone();
        let event = AuditEvent::new("pki/ca/create", actor, &name)
            .with_detail(format!("intermediate of {parent}"));
        let ca = self
            .audit
            .guard(event, self.create_intermediate_ca_inner(req))
            .await?;
        info!(ca = %ca.name, parent = %parent, serial = %ca.serial, "intermediate CA created");
        Ok(ca)
    }

    async fn create_intermediate_ca_inner(
        &self,
        req: IntermediateCaRequest,
    ) -> Result<CertificateAuthority, PkiError> {
        validate_name("CA", &req.name)?;
        require_common_name(&req.common_name)?;
        self.check_ca_ttl(req.ttl_secs)?;
        let key = x509::generate_key(req.key_type)?;
        let sealed_key = self.seal_key(&key).await?;
        let id = uuid::Uuid::new_v4().to_string();

        for _ in 0..self.retry_limit {
            let LoadedCa {
                record: mut parent,
                revision,
            } = self.load_ca(&req.parent).await?;
            check_parent(&parent.ca, req.max_path_length)?;

            let now = Utc::now();
            let not_after = add_secs(now, req.ttl_secs)?.min(parent.ca.not_after);
            if not_after <= now {
                return Err(PkiError::Hierarchy {
                    reason: format!("parent CA '{}' has expired", parent.ca.name),
                });
            }
            let validity = Validity {
                not_before: now,
                not_after,
            };

            let serial = x509::random_serial();
            let params = x509::ca_params(
                &req.common_name,
                req.organization.as_deref(),
                req.max_path_length,
                validity,
                &serial,
                true,
            )?;
            let certificate_pem = self.issuer(&parent).await?.sign(params, &key)?;

            let record = CaRecord {
                ca: CertificateAuthority {
                    id: id.clone(),
                    name: req.name.clone(),
                    kind: CaKind::Intermediate,
                    common_name: req.common_name.clone(),
                    organization: req.organization.clone(),
                    key_type: req.key_type,
                    certificate_pem: certificate_pem.clone(),
                    serial: serial.clone(),
                    max_path_length: req.max_path_length,
                    parent_id: Some(parent.ca.id.clone()),
                    revoked: false,
                    revoked_at: None,
                    issued_count: 0,
                    crl_number: 0,
                    not_before: now,
                    not_after,
                    created_at: now,
                },
                private_key: sealed_key.clone(),
            };
            let ledger = CertificateRecord {
                serial: serial.clone(),
                ca_id: parent.ca.id.clone(),
                ca_name: parent.ca.name.clone(),
                role: None,
                common_name: req.common_name.clone(),
                certificate_pem,
                is_ca: true,
                not_before: now,
                not_after,
                issued_at: now,
                revoked: false,
                revoked_at: None,
            };
            parent.ca.issued_count = parent.ca.issued_count.saturating_add(1);

            let mut changes = vec![
                Change::put(ca_name_key(&req.name), Expect::Absent, id.clone().into_bytes()),
                Change::put(ca_key(&id), Expect::Absent, encode(&record)?),
            ];
            changes.extend(ledger_changes(&ledger)?);
            changes.push(Change::put(
                ca_key(&parent.ca.id),
                Expect::Unchanged(revision),
                encode(&parent)?,
            ));

            if self.barrier.apply(changes).await? {
                return Ok(record.ca);
            }
            if self.barrier.get(&ca_name_key(&req.name)).await?.is_some() {
                return Err(PkiError::CaExists { name: req.name });
            }
            debug!(parent = %req.parent, "parent CA changed concurrently, retrying");
        }
        Err(PkiError::Conflict { name: req.parent })
    }

    /// Read a CA by name.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CaNotFound`] if the CA doesn't exist.
    pub async fn read_ca(&self, name: &str) -> Result<CertificateAuthority, PkiError> {
        Ok(self.load_ca(name).await?.record.ca)
    }

    /// List CA names.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::Sealed`] or a barrier error.
    pub async fn list_cas(&self) -> Result<Vec<String>, PkiError> {
        self.list_suffixes(CA_NAMES_PREFIX).await
    }

    /// PEM certificates from the named CA up to its root.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CaNotFound`] if the CA doesn't exist.
    pub async fn ca_chain(&self, name: &str) -> Result<Vec<String>, PkiError> {
        let ca = self.load_ca(name).await?;
        self.chain(&ca.record).await
    }

    /// Permanently revoke a CA. It can no longer sign anything; an
    /// intermediate also shows up in its parent's CRL.
    ///
    /// # Errors
    ///
    /// - [`PkiError::CaNotFound`] if the CA doesn't exist.
    /// - [`PkiError::AlreadyRevoked`] if it is already revoked.
    pub async fn revoke_ca(
        &self,
        actor: &str,
        name: &str,
    ) -> Result<CertificateAuthority, PkiError> {
        let event = AuditEvent::new("pki/ca/revoke", actor, name);
        let ca = self.audit.guard(event, self.revoke_ca_inner(name)).await?;
        info!(ca = name, serial = %ca.serial, "CA revoked");
        Ok(ca)
    }

    async fn revoke_ca_inner(&self, name: &str) -> Result<CertificateAuthority, PkiError> {
        for _ in 0..self.retry_limit {
            let LoadedCa {
                mut record,
                revision,
            } = self.load_ca(name).await?;
            if record.ca.revoked {
                return Err(PkiError::AlreadyRevoked {
                    serial: record.ca.serial,
                });
            }
            let now = Utc::now();
            record.ca.revoked = true;
            record.ca.revoked_at = Some(now);

            let mut changes = vec![Change::put(
                ca_key(&record.ca.id),
                Expect::Unchanged(revision),
                encode(&record)?,
            )];
            if let Some(current) = self.barrier.read(&cert_key(&record.ca.serial)).await? {
                let mut ledger: CertificateRecord = decode(&current.value)?;
                ledger.revoked = true;
                ledger.revoked_at = Some(now);
                changes.push(Change::put(
                    cert_key(&ledger.serial),
                    Expect::Unchanged(current.revision),
                    encode(&ledger)?,
                ));
            }

            if self.barrier.apply(changes).await? {
                return Ok(record.ca);
            }
            debug!(ca = name, "CA changed during revocation, retrying");
        }
        Err(PkiError::Conflict {
            name: name.to_owned(),
        })
    }

    /// Delete a CA. Refused while intermediate children exist.
    ///
    /// # Errors
    ///
    /// - [`PkiError::CaNotFound`] if the CA doesn't exist.
    /// - [`PkiError::HasChildren`] while children exist.
    pub async fn delete_ca(&self, actor: &str, name: &str) -> Result<(), PkiError> {
        let event = AuditEvent::new("pki/ca/delete", actor, name);
        self.audit.guard(event, self.delete_ca_inner(name)).await?;
        info!(ca = name, "CA deleted");
        Ok(())
    }

    async fn delete_ca_inner(&self, name: &str) -> Result<(), PkiError> {
        for _ in 0..self.retry_limit {
            let LoadedCa { record, revision } = self.load_ca(name).await?;
            let children = self
                .all_cas()
                .await?
                .iter()
                .filter(|c| c.ca.parent_id.as_deref() == Some(record.ca.id.as_str()))
                .count();
            if children > 0 {
                return Err(PkiError::HasChildren {
                    name: name.to_owned(),
                    children,
                });
            }

            let deleted = self
                .barrier
                .apply(vec![
                    Change::delete(ca_key(&record.ca.id), Expect::Unchanged(revision)),
                    Change::delete(ca_name_key(name), Expect::Anything),
                ])
                .await?;
            if deleted {
                return Ok(());
            }
            debug!(ca = name, "CA changed during delete, retrying");
        }
        Err(PkiError::Conflict {
            name: name.to_owned(),
        })
    }

    // ── Roles ────────────────────────────────────────────────────────

    /// Create a role bound to an existing CA.
    ///
    /// # Errors
    ///
    /// - [`PkiError::InvalidRequest`] if the role is malformed.
    /// - [`PkiError::CaNotFound`] if the CA doesn't exist.
    /// - [`PkiError::RoleExists`] if the name is taken.
    pub async fn create_role(&self, actor: &str, role: PkiRole) -> Result<PkiRole, PkiError> {
        let name = role.name.clone();
        let event = AuditEvent::new("pki/role/create", actor, &name);
        self.audit.guard(event, self.create_role_inner(role)).await
    }

    async fn create_role_inner(&self, role: PkiRole) -> Result<PkiRole, PkiError> {
        validate_role(&role)?;
        self.load_ca(&role.ca).await?;
        let created = self
            .barrier
            .apply(vec![Change::put(
                role_key(&role.name),
                Expect::Absent,
                encode(&role)?,
            )])
            .await?;
        if created {
            Ok(role)
        } else {
            Err(PkiError::RoleExists { name: role.name })
        }
    }

    /// Replace an existing role.
    ///
    /// # Errors
    ///
    /// - [`PkiError::RoleNotFound`] if the role doesn't exist.
    /// - [`PkiError::InvalidRequest`] / [`PkiError::CaNotFound`] as for
    ///   [`create_role`](Self::create_role).
    pub async fn update_role(&self, actor: &str, role: PkiRole) -> Result<PkiRole, PkiError> {
        let name = role.name.clone();
        let event = AuditEvent::new("pki/role/update", actor, &name);
        self.audit.guard(event, self.update_role_inner(role)).await
    }

    async fn update_role_inner(&self, role: PkiRole) -> Result<PkiRole, PkiError> {
        validate_role(&role)?;
        self.load_ca(&role.ca).await?;
        let key = role_key(&role.name);
        for _ in 0..self.retry_limit {
            let current = self
                .barrier
                .read(&key)
                .await?
                .ok_or_else(|| PkiError::RoleNotFound {
                    name: role.name.clone(),
                })?;
            if self
                .barrier
                .apply(vec![Change::put(
                    key.clone(),
                    Expect::Unchanged(current.revision),
                    encode(&role)?,
                )])
                .await?
            {
                return Ok(role);
            }
        }
        Err(PkiError::Conflict { name: role.name })
    }

    /// Read a role.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::RoleNotFound`] if the role doesn't exist.
    pub async fn read_role(&self, name: &str) -> Result<PkiRole, PkiError> {
        let bytes = self
            .barrier
            .get(&role_key(name))
            .await?
            .ok_or_else(|| PkiError::RoleNotFound {
                name: name.to_owned(),
            })?;
        decode(&bytes)
    }

    /// List role names.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::Sealed`] or a barrier error.
    pub async fn list_roles(&self) -> Result<Vec<String>, PkiError> {
        self.list_suffixes(ROLES_PREFIX).await
    }

    /// Delete a role. Certificates already issued under it are unaffected.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::RoleNotFound`] if the role doesn't exist.
    pub async fn delete_role(&self, actor: &str, name: &str) -> Result<(), PkiError> {
        let event = AuditEvent::new("pki/role/delete", actor, name);
        let delete = async {
            let current = self
                .barrier
                .read(&role_key(name))
                .await?
                .ok_or_else(|| PkiError::RoleNotFound {
                    name: name.to_owned(),
                })?;
            self.barrier
                .apply(vec![Change::delete(
                    role_key(name),
                    Expect::Unchanged(current.revision),
                )])
                .await?;
            Ok(())
        };
        self.audit.guard(event, delete).await
    }

    // ── Issuance ─────────────────────────────────────────────────────

    /// Issue a leaf certificate with a freshly generated key pair.
    ///
    /// The common name and every SAN are checked against the role; the TTL
    /// must not exceed the role's `max_ttl_secs` and the certificate must
    /// not outlive its CA.
    ///
    /// # Errors
    ///
    /// - [`PkiError::RoleNotFound`] if the role doesn't exist.
    /// - [`PkiError::RoleConstraintViolation`] for a name or TTL outside the
    ///   role's rules.
    /// - [`PkiError::RevokedCa`] if the role's CA is revoked.
    pub async fn issue(
        &self,
        actor: &str,
        req: IssueRequest,
    ) -> Result<IssuedCertificate, PkiError> {
        let role = req.role.clone();
        let common_name = req.common_name.clone();
        let event =
            AuditEvent::new("pki/issue", actor, &role).with_detail(format!("cn={common_name}"));
        let issued = self
            .audit
            .guard_with(event, self.issue_inner(req), |issued| {
                Some(format!("cn={common_name} serial={}", issued.serial))
            })
            .await?;
        info!(role = %role, serial = %issued.serial, "certificate issued");
        Ok(issued)
    }

    async fn issue_inner(&self, req: IssueRequest) -> Result<IssuedCertificate, PkiError> {
        let role = self.read_role(&req.role).await?;
        let names = collect_names(&role, &req.common_name, &req.alt_names, &req.ip_sans, &[])?;
        let ttl = resolve_ttl(&role, req.ttl_secs)?;

        let key = x509::generate_key(role.key_type)?;
        let mut issued = self.sign_leaf(&role, &names, ttl, &key).await?;
        issued.private_key_pem = Some(key.serialize_pem());
        Ok(issued)
    }

    /// Sign a caller-supplied CSR under a role.
    ///
    /// The CSR's self-signature is verified and its names are re-checked
    /// against the role like any other request; only its public key is
    /// carried into the certificate as-is.
    ///
    /// # Errors
    ///
    /// - [`PkiError::InvalidCsr`] if the CSR cannot be parsed or verified.
    /// - Otherwise as for [`issue`](Self::issue).
    pub async fn sign_csr(
        &self,
        actor: &str,
        req: SignCsrRequest,
    ) -> Result<IssuedCertificate, PkiError> {
        let role = req.role.clone();
        let event = AuditEvent::new("pki/sign", actor, &role);
        let issued = self
            .audit
            .guard_with(event, self.sign_csr_inner(req), |issued| {
                Some(format!("serial={}", issued.serial))
            })
            .await?;
        info!(role = %role, serial = %issued.serial, "CSR signed");
        Ok(issued)
    }

    async fn sign_csr_inner(&self, req: SignCsrRequest) -> Result<IssuedCertificate, PkiError> {
        let role = self.read_role(&req.role).await?;
        let csr = x509::parse_csr(&req.csr_pem)?;

        let common_name = req
            .common_name
            .clone()
            .or(csr.common_name.clone())
            .ok_or_else(|| PkiError::InvalidCsr {
                reason: "no common name in the CSR or the request".to_owned(),
            })?;
        let mut alt_names = csr.dns_names.clone();
        alt_names.extend(req.alt_names.iter().cloned());

        let names = collect_names(&role, &common_name, &alt_names, &req.ip_sans, &csr.ip_sans)?;
        let ttl = resolve_ttl(&role, req.ttl_secs)?;
        self.sign_leaf(&role, &names, ttl, &csr.public_key).await
    }

    async fn sign_leaf(
        &self,
        role: &PkiRole,
        names: &Names,
        ttl: u64,
        subject_key: &impl PublicKeyData,
    ) -> Result<IssuedCertificate, PkiError> {
        for _ in 0..self.retry_limit {
            let LoadedCa {
                record: mut ca,
                revision,
            } = self.load_ca(&role.ca).await?;
            if ca.ca.revoked {
                return Err(PkiError::RevokedCa { name: ca.ca.name });
            }

            let now = Utc::now();
            let not_after = add_secs(now, ttl)?;
            if not_after > ca.ca.not_after {
                return Err(PkiError::InvalidRequest {
                    reason: format!(
                        "certificate would expire at {not_after}, after CA '{}' ({})",
                        ca.ca.name, ca.ca.not_after
                    ),
                });
            }

            let serial = x509::random_serial();
            let params = x509::leaf_params(&LeafSpec {
                common_name: &names.common_name,
                dns_names: &names.dns,
                ip_sans: &names.ips,
                organization: role.organization.as_deref(),
                key_usages: &role.key_usages,
                ext_key_usages: &role.ext_key_usages,
                validity: Validity {
                    not_before: now,
                    not_after,
                },
                serial: &serial,
            })?;
            let certificate_pem = self.issuer(&ca).await?.sign(params, subject_key)?;

            let ledger = CertificateRecord {
                serial: serial.clone(),
                ca_id: ca.ca.id.clone(),
                ca_name: ca.ca.name.clone(),
                role: Some(role.name.clone()),
                common_name: names.common_name.clone(),
                certificate_pem: certificate_pem.clone(),
                is_ca: false,
                not_before: now,
                not_after,
                issued_at: now,
                revoked: false,
                revoked_at: None,
            };
            ca.ca.issued_count = ca.ca.issued_count.saturating_add(1);

            let mut changes = ledger_changes(&ledger)?;
            changes.push(Change::put(
                ca_key(&ca.ca.id),
                Expect::Unchanged(revision),
                encode(&ca)?,
            ));
            if self.barrier.apply(changes).await? {
                let ca_chain = self.chain(&ca).await?;
                return Ok(IssuedCertificate {
                    serial,
                    certificate_pem,
                    private_key_pem: None,
                    issuing_ca_pem: ca.ca.certificate_pem,
                    ca_chain,
                    not_before: now,
                    not_after,
                });
            }
            debug!(ca = %ca.ca.name, "CA changed during issuance, retrying");
        }
        Err(PkiError::Conflict {
            name: role.ca.clone(),
        })
    }

    // ── Ledger and revocation ────────────────────────────────────────

    /// Revoke a leaf certificate. Permanent; the serial is never reused.
    ///
    /// # Errors
    ///
    /// - [`PkiError::CertificateNotFound`] if the serial is unknown.
    /// - [`PkiError::AlreadyRevoked`] on a second revocation.
    /// - [`PkiError::InvalidRequest`] for a CA certificate; use
    ///   [`revoke_ca`](Self::revoke_ca).
    pub async fn revoke_certificate(
        &self,
        actor: &str,
        serial: &str,
    ) -> Result<CertificateRecord, PkiError> {
        let event = AuditEvent::new("pki/revoke", actor, serial);
        let record = self
            .audit
            .guard(event, self.revoke_certificate_inner(serial))
            .await?;
        info!(serial, ca = %record.ca_name, "certificate revoked");
        Ok(record)
    }

    async fn revoke_certificate_inner(&self, serial: &str) -> Result<CertificateRecord, PkiError> {
        let key = cert_key(serial);
        for _ in 0..self.retry_limit {
            let current = self
                .barrier
                .read(&key)
                .await?
                .ok_or_else(|| PkiError::CertificateNotFound {
                    serial: serial.to_owned(),
                })?;
            let mut record: CertificateRecord = decode(&current.value)?;
            if record.is_ca {
                return Err(PkiError::InvalidRequest {
                    reason: format!("{serial} is a CA certificate, revoke the CA instead"),
                });
            }
            if record.revoked {
                return Err(PkiError::AlreadyRevoked {
                    serial: serial.to_owned(),
                });
            }
            record.revoked = true;
            record.revoked_at = Some(Utc::now());

            if self
                .barrier
                .apply(vec![Change::put(
                    key.clone(),
                    Expect::Unchanged(current.revision),
                    encode(&record)?,
                )])
                .await?
            {
                return Ok(record);
            }
        }
        Err(PkiError::Conflict {
            name: serial.to_owned(),
        })
    }

    /// Read a ledger entry.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CertificateNotFound`] if the serial is unknown.
    pub async fn read_certificate(&self, serial: &str) -> Result<CertificateRecord, PkiError> {
        let bytes = self
            .barrier
            .get(&cert_key(serial))
            .await?
            .ok_or_else(|| PkiError::CertificateNotFound {
                serial: serial.to_owned(),
            })?;
        decode(&bytes)
    }

    /// Serials issued by the named CA, leaves and intermediates alike.
    ///
    /// # Errors
    ///
    /// Returns [`PkiError::CaNotFound`] if the CA doesn't exist.
    pub async fn list_certificates(&self, ca: &str) -> Result<Vec<String>, PkiError> {
        let id = self.ca_id(ca).await?;
        self.list_suffixes(&issued_prefix(&id)).await
    }

    /// Sign a fresh CRL for the named CA listing every revoked, unexpired
    /// certificate it issued. Advances the CA's CRL number.
    ///
    /// # Errors
    ///
    /// - [`PkiError::CaNotFound`] if the CA doesn't exist.
    /// - [`PkiError::RevokedCa`] if the CA is revoked.
    pub async fn generate_crl(&self, ca: &str) -> Result<Crl, PkiError> {
        for _ in 0..self.retry_limit {
            let LoadedCa {
                mut record,
                revision,
            } = self.load_ca(ca).await?;
            if record.ca.revoked {
                return Err(PkiError::RevokedCa {
                    name: record.ca.name,
                });
            }

            let now = Utc::now();
            let mut revoked = Vec::new();
            for serial in self.list_suffixes(&issued_prefix(&record.ca.id)).await? {
                let entry = self.read_certificate(&serial).await?;
                if let (true, Some(revoked_at)) = (entry.revoked, entry.revoked_at) {
                    if entry.not_after > now {
                        revoked.push(RevokedEntry {
                            serial: entry.serial,
                            revoked_at,
                        });
                    }
                }
            }

            let crl_number = record.ca.crl_number.saturating_add(1);
            let window = Validity {
                not_before: now,
                not_after: add_secs(now, self.crl_validity_secs)?,
            };
            let pem = self.issuer(&record).await?.sign_crl(crl_number, window, &revoked)?;

            record.ca.crl_number = crl_number;
            let applied = self
                .barrier
                .apply(vec![Change::put(
                    ca_key(&record.ca.id),
                    Expect::Unchanged(revision),
                    encode(&record)?,
                )])
                .await?;
            if applied {
                info!(ca, crl_number, revoked = revoked.len(), "CRL generated");
                return Ok(Crl {
                    ca: record.ca.name,
                    crl_number,
                    this_update: window.not_before,
                    next_update: window.not_after,
                    revoked,
                    pem,
                });
            }
            debug!(ca, "CA changed during CRL generation, retrying");
        }
        Err(PkiError::Conflict { name: ca.to_owned() })
    }

    // ── Internal helpers ─────────────────────────────────────────────

    fn check_ca_ttl(&self, ttl_secs: u64) -> Result<(), PkiError> {
        if ttl_secs == 0 || ttl_secs > self.max_ca_ttl_secs {
            return Err(PkiError::InvalidRequest {
                reason: format!(
                    "CA ttl must be between 1 and {} seconds",
                    self.max_ca_ttl_secs
                ),
            });
        }
        Ok(())
    }

    async fn ca_id(&self, name: &str) -> Result<String, PkiError> {
        let bytes = self
            .barrier
            .get(&ca_name_key(name))
            .await?
            .ok_or_else(|| PkiError::CaNotFound {
                name: name.to_owned(),
            })?;
        String::from_utf8(bytes).map_err(|e| PkiError::Serialization {
            reason: format!("CA id for '{name}' is not UTF-8: {e}"),
        })
    }

    async fn load_ca(&self, name: &str) -> Result<LoadedCa, PkiError> {
        let id = self.ca_id(name).await?;
        self.load_ca_by_id(&id)
            .await?
            .ok_or_else(|| PkiError::CaNotFound {
                name: name.to_owned(),
            })
    }

    async fn load_ca_by_id(&self, id: &str) -> Result<Option<LoadedCa>, PkiError> {
        match self.barrier.read(&ca_key(id)).await? {
            Some(v) => Ok(Some(LoadedCa {
                record: decode(&v.value)?,
                revision: v.revision,
            })),
            None => Ok(None),
        }
    }

    async fn all_cas(&self) -> Result<Vec<CaRecord>, PkiError> {
        let mut cas = Vec::new();
        for key in self.barrier.list(CA_PREFIX).await? {
            if let Some(bytes) = self.barrier.get(&key).await? {
                cas.push(decode(&bytes)?);
            }
        }
        Ok(cas)
    }

    async fn chain(&self, record: &CaRecord) -> Result<Vec<String>, PkiError> {
        let mut chain = vec![record.ca.certificate_pem.clone()];
        let mut parent_id = record.ca.parent_id.clone();
        while let Some(id) = parent_id {
            let parent = self
                .load_ca_by_id(&id)
                .await?
                .ok_or_else(|| PkiError::CaNotFound { name: id.clone() })?;
            chain.push(parent.record.ca.certificate_pem);
            parent_id = parent.record.ca.parent_id;
        }
        Ok(chain)
    }

    async fn list_suffixes(&self, prefix: &str) -> Result<Vec<String>, PkiError> {
        Ok(self
            .barrier
            .list(prefix)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(prefix).map(String::from))
            .collect())
    }

    async fn seal_key(&self, key: &KeyPair) -> Result<String, PkiError> {
        let pem = Zeroizing::new(key.serialize_pem());
        let sealed = self.barrier.seal_field(FIELD_PURPOSE, pem.as_bytes()).await?;
        Ok(BASE64.encode(sealed))
    }

    async fn issuer(&self, record: &CaRecord) -> Result<Issuer, PkiError> {
        let sealed = BASE64
            .decode(&record.private_key)
            .map_err(|e| PkiError::Serialization {
                reason: format!("sealed CA key is not base64: {e}"),
            })?;
        let pem = Zeroizing::new(self.barrier.open_field(FIELD_PURPOSE, &sealed).await?);
        let pem = std::str::from_utf8(&pem).map_err(|e| PkiError::Serialization {
            reason: format!("CA key is not UTF-8: {e}"),
        })?;
        Issuer::load(&record.ca.certificate_pem, x509::parse_key(pem)?)
    }
}

impl fmt::Debug for PkiEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PkiEngine")
            .field("retry_limit", &self.retry_limit)
            .field("crl_validity_secs", &self.crl_validity_secs)
            .finish_non_exhaustive()
    }
}

fn check_parent(parent: &CertificateAuthority, requested: u8) -> Result<(), PkiError> {
    if parent.revoked {
        return Err(PkiError::RevokedCa {
            name: parent.name.clone(),
        });
    }
    if parent.max_path_length == 0 {
        return Err(PkiError::Hierarchy {
            reason: format!("CA '{}' does not permit sub-CAs", parent.name),
        });
    }
    if requested >= parent.max_path_length {
        return Err(PkiError::Hierarchy {
            reason: format!(
                "max_path_length {requested} must be below parent '{}' ({})",
                parent.name, parent.max_path_length
            ),
        });
    }
    Ok(())
}

fn validate_role(role: &PkiRole) -> Result<(), PkiError> {
    validate_name("role", &role.name)?;
    if role.max_ttl_secs == 0 {
        return Err(PkiError::InvalidRequest {
            reason: "max_ttl_secs must be positive".to_owned(),
        });
    }
    if role.ttl_secs > role.max_ttl_secs {
        return Err(PkiError::InvalidRequest {
            reason: format!(
                "ttl_secs ({}) exceeds max_ttl_secs ({})",
                role.ttl_secs, role.max_ttl_secs
            ),
        });
    }
    if role.allowed_domains.iter().any(|d| d.trim().is_empty()) {
        return Err(PkiError::InvalidRequest {
            reason: "allowed_domains must not contain empty entries".to_owned(),
        });
    }
    Ok(())
}

fn resolve_ttl(role: &PkiRole, requested: Option<u64>) -> Result<u64, PkiError> {
    let ttl = match requested {
        Some(ttl) => ttl,
        None if role.ttl_secs > 0 => role.ttl_secs,
        None => role.max_ttl_secs,
    };
    if ttl == 0 {
        return Err(PkiError::InvalidRequest {
            reason: "ttl must be positive".to_owned(),
        });
    }
    if ttl > role.max_ttl_secs {
        return Err(PkiError::RoleConstraintViolation {
            role: role.name.clone(),
            reason: format!("ttl {ttl}s exceeds max_ttl {}s", role.max_ttl_secs),
        });
    }
    Ok(ttl)
}

/// Check the common name and every SAN against the role.
fn collect_names(
    role: &PkiRole,
    common_name: &str,
    alt_names: &[String],
    ip_sans: &[String],
    csr_ips: &[IpAddr],
) -> Result<Names, PkiError> {
    let violation = |reason: String| PkiError::RoleConstraintViolation {
        role: role.name.clone(),
        reason,
    };

    let common_name = common_name.trim();
    if common_name.is_empty() {
        return Err(PkiError::InvalidRequest {
            reason: "common_name is required".to_owned(),
        });
    }

    let mut dns: Vec<String> = Vec::new();
    let mut ips: Vec<IpAddr> = csr_ips.to_vec();
    for name in std::iter::once(common_name).chain(alt_names.iter().map(String::as_str)) {
        if let Ok(ip) = name.parse::<IpAddr>() {
            if !ips.contains(&ip) {
                ips.push(ip);
            }
            continue;
        }
        domain::check_name(role, name).map_err(violation)?;
        let lower = name.to_ascii_lowercase();
        if !dns.contains(&lower) {
            dns.push(lower);
        }
    }
    for raw in ip_sans {
        let ip = raw.parse::<IpAddr>().map_err(|e| PkiError::InvalidRequest {
            reason: format!("invalid IP SAN '{raw}': {e}"),
        })?;
        if !ips.contains(&ip) {
            ips.push(ip);
        }
    }
    for ip in &ips {
        domain::check_ip(role, *ip).map_err(violation)?;
    }

    Ok(Names {
        common_name: common_name.to_owned(),
        dns,
        ips,
    })
}

fn ledger_changes(entry: &CertificateRecord) -> Result<Vec<Change>, PkiError> {
    Ok(vec![
        Change::put(cert_key(&entry.serial), Expect::Absent, encode(entry)?),
        Change::put(
            format!("{}{}", issued_prefix(&entry.ca_id), entry.serial),
            Expect::Absent,
            entry.serial.clone().into_bytes(),
        ),
    ])
}

fn validate_name(kind: &str, name: &str) -> Result<(), PkiError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PkiError::InvalidRequest {
            reason: format!("invalid {kind} name '{name}': use 1-128 characters from [A-Za-z0-9._-]"),
        })
    }
}

fn require_common_name(common_name: &str) -> Result<(), PkiError> {
    if common_name.trim().is_empty() {
        Err(PkiError::InvalidRequest {
            reason: "common_name is required".to_owned(),
        })
    } else {
        Ok(())
    }
}

fn add_secs(now: DateTime<Utc>, secs: u64) -> Result<DateTime<Utc>, PkiError> {
    i64::try_from(secs)
        .ok()
        .and_then(TimeDelta::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .ok_or_else(|| PkiError::InvalidRequest {
            reason: format!("ttl of {secs}s is out of range"),
        })
}

fn ca_key(id: &str) -> String {
    format!("{CA_PREFIX}{id}")
}

fn ca_name_key(name: &str) -> String {
    format!("{CA_NAMES_PREFIX}{name}")
}

fn role_key(name: &str) -> String {
    format!("{ROLES_PREFIX}{name}")
}

fn cert_key(serial: &str) -> String {
    format!("{CERTS_PREFIX}{serial}")
}

fn issued_prefix(ca_id: &str) -> String {
    format!("{ISSUED_PREFIX}{ca_id}/")
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, PkiError> {
    serde_json::to_vec(value).map_err(|e| PkiError::Serialization {
        reason: format!("serialization failed: {e}"),
    })
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, PkiError> {
    serde_json::from_slice(bytes).map_err(|e| PkiError::Serialization {
        reason: format!("deserialization failed: {e}"),
    })
}
