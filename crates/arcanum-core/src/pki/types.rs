//! PKI records, requests and responses.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::PkiError;

/// Key algorithm for CA and leaf key pairs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PkiKeyType {
    #[default]
    #[serde(rename = "ec-p256")]
    EcP256,
    #[serde(rename = "ec-p384")]
    EcP384,
    #[serde(rename = "ed25519")]
    Ed25519,
}

impl PkiKeyType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::EcP256 => "ec-p256",
            Self::EcP384 => "ec-p384",
            Self::Ed25519 => "ed25519",
        }
    }

    pub(crate) fn algorithm(self) -> &'static rcgen::SignatureAlgorithm {
        match self {
            Self::EcP256 => &rcgen::PKCS_ECDSA_P256_SHA256,
            Self::EcP384 => &rcgen::PKCS_ECDSA_P384_SHA384,
            Self::Ed25519 => &rcgen::PKCS_ED25519,
        }
    }
}

impl fmt::Display for PkiKeyType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PkiKeyType {
    type Err = PkiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ec-p256" | "ec" => Ok(Self::EcP256),
            "ec-p384" => Ok(Self::EcP384),
            "ed25519" => Ok(Self::Ed25519),
            other => Err(PkiError::InvalidRequest {
                reason: format!("unknown key type '{other}'"),
            }),
        }
    }
}

/// Root or intermediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaKind {
    Root,
    Intermediate,
}

/// X.509 key usage bits a role may grant to leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyUsage {
    DigitalSignature,
    ContentCommitment,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
}

/// Extended key usages a role may grant to leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExtKeyUsage {
    Any,
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

/// A certificate authority, without its private key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateAuthority {
    pub id: String,
    pub name: String,
    pub kind: CaKind,
    pub common_name: String,
    pub organization: Option<String>,
    pub key_type: PkiKeyType,
    pub certificate_pem: String,
    pub serial: String,
    pub max_path_length: u8,
    pub parent_id: Option<String>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    /// Leaves and intermediates signed by this CA.
    pub issued_count: u64,
    /// Number of the last CRL published. 0 before the first one.
    pub crl_number: u64,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Persisted CA: the public record plus the field-sealed private key.
#[derive(Clone, Serialize, Deserialize)]
pub(crate) struct CaRecord {
    #[serde(flatten)]
    pub ca: CertificateAuthority,
    /// Field-sealed PKCS#8 PEM, base64.
    pub private_key: String,
}

/// Parameters for [`PkiEngine::create_root_ca`](super::PkiEngine::create_root_ca).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RootCaRequest {
    pub name: String,
    pub common_name: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub key_type: PkiKeyType,
    pub ttl_secs: u64,
    pub max_path_length: u8,
}

/// Parameters for
/// [`PkiEngine::create_intermediate_ca`](super::PkiEngine::create_intermediate_ca).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntermediateCaRequest {
    pub name: String,
    /// Name of the signing CA.
    pub parent: String,
    pub common_name: String,
    #[serde(default)]
    pub organization: Option<String>,
    #[serde(default)]
    pub key_type: PkiKeyType,
    pub ttl_secs: u64,
    pub max_path_length: u8,
}

fn default_key_usages() -> Vec<KeyUsage> {
    vec![KeyUsage::DigitalSignature, KeyUsage::KeyEncipherment]
}

fn default_ext_key_usages() -> Vec<ExtKeyUsage> {
    vec![ExtKeyUsage::ServerAuth]
}

/// Issuance rules bound to one CA.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PkiRole {
    pub name: String,
    /// Name of the issuing CA.
    pub ca: String,
    #[serde(default)]
    pub key_type: PkiKeyType,
    /// Default leaf lifetime. 0 means `max_ttl_secs`.
    #[serde(default)]
    pub ttl_secs: u64,
    pub max_ttl_secs: u64,
    #[serde(default)]
    pub allowed_domains: Vec<String>,
    #[serde(default)]
    pub allow_bare_domains: bool,
    #[serde(default)]
    pub allow_subdomains: bool,
    #[serde(default)]
    pub allow_wildcard_certificates: bool,
    #[serde(default)]
    pub allow_localhost: bool,
    #[serde(default)]
    pub allow_ip_sans: bool,
    #[serde(default)]
    pub allow_any_name: bool,
    #[serde(default = "default_key_usages")]
    pub key_usages: Vec<KeyUsage>,
    #[serde(default = "default_ext_key_usages")]
    pub ext_key_usages: Vec<ExtKeyUsage>,
    #[serde(default)]
    pub organization: Option<String>,
}

impl PkiRole {
    /// A role with no permissions beyond the given CA and lifetime.
    #[must_use]
    pub fn new(name: impl Into<String>, ca: impl Into<String>, max_ttl_secs: u64) -> Self {
        Self {
            name: name.into(),
            ca: ca.into(),
            key_type: PkiKeyType::default(),
            ttl_secs: 0,
            max_ttl_secs,
            allowed_domains: Vec::new(),
            allow_bare_domains: false,
            allow_subdomains: false,
            allow_wildcard_certificates: false,
            allow_localhost: false,
            allow_ip_sans: false,
            allow_any_name: false,
            key_usages: default_key_usages(),
            ext_key_usages: default_ext_key_usages(),
            organization: None,
        }
    }
}

/// Parameters for [`PkiEngine::issue`](super::PkiEngine::issue).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IssueRequest {
    pub role: String,
    pub common_name: String,
    /// Extra DNS names. Entries that parse as IP addresses become IP SANs.
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub ip_sans: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// Parameters for [`PkiEngine::sign_csr`](super::PkiEngine::sign_csr).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SignCsrRequest {
    pub role: String,
    pub csr_pem: String,
    /// Overrides the CSR's common name when set.
    #[serde(default)]
    pub common_name: Option<String>,
    #[serde(default)]
    pub alt_names: Vec<String>,
    #[serde(default)]
    pub ip_sans: Vec<String>,
    #[serde(default)]
    pub ttl_secs: Option<u64>,
}

/// A freshly issued certificate.
#[derive(Clone, Serialize)]
pub struct IssuedCertificate {
    pub serial: String,
    pub certificate_pem: String,
    /// PKCS#8 PEM, only for server-generated keys.
    pub private_key_pem: Option<String>,
    pub issuing_ca_pem: String,
    /// Issuing CA first, root last.
    pub ca_chain: Vec<String>,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

impl fmt::Debug for IssuedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IssuedCertificate")
            .field("serial", &self.serial)
            .field(
                "private_key_pem",
                &self.private_key_pem.as_ref().map(|_| "[REDACTED]"),
            )
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

/// One entry of the append-only issuance ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CertificateRecord {
    pub serial: String,
    pub ca_id: String,
    pub ca_name: String,
    /// Issuing role, `None` for intermediate CA certificates.
    pub role: Option<String>,
    pub common_name: String,
    pub certificate_pem: String,
    pub is_ca: bool,
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
    pub issued_at: DateTime<Utc>,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

/// A revoked serial as listed in a CRL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RevokedEntry {
    pub serial: String,
    pub revoked_at: DateTime<Utc>,
}

/// A signed certificate revocation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Crl {
    pub ca: String,
    pub crl_number: u64,
    pub this_update: DateTime<Utc>,
    pub next_update: DateTime<Utc>,
    pub revoked: Vec<RevokedEntry>,
    pub pem: String,
}
