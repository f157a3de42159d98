//! X.509 plumbing over `rcgen`: key generation, certificate parameters,
//! CSR parsing and CRL signing.

use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, CertificateRevocationListParams,
    CertificateSigningRequestParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, KeyIdMethod, KeyPair, KeyUsagePurpose, PublicKeyData,
    RevokedCertParams, SanType, SerialNumber,
};
use time::OffsetDateTime;

use super::types::{ExtKeyUsage, KeyUsage, PkiKeyType, RevokedEntry};
use crate::crypto;
use crate::error::PkiError;

/// Serial numbers are 128 random bits with the top bit cleared.
const SERIAL_LEN: usize = 16;

/// A CA certificate and its key, ready to sign.
pub(crate) struct Issuer {
    cert: Certificate,
    key: KeyPair,
}

/// Validity window of a certificate.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Validity {
    pub not_before: DateTime<Utc>,
    pub not_after: DateTime<Utc>,
}

/// Everything that goes into a leaf certificate.
pub(crate) struct LeafSpec<'a> {
    pub common_name: &'a str,
    pub dns_names: &'a [String],
    pub ip_sans: &'a [IpAddr],
    pub organization: Option<&'a str>,
    pub key_usages: &'a [KeyUsage],
    pub ext_key_usages: &'a [ExtKeyUsage],
    pub validity: Validity,
    pub serial: &'a str,
}

/// Names and key taken from a verified CSR.
pub(crate) struct ParsedCsr {
    pub common_name: Option<String>,
    pub dns_names: Vec<String>,
    pub ip_sans: Vec<IpAddr>,
    pub public_key: rcgen::PublicKey,
}

fn generation(context: &str, e: impl std::fmt::Display) -> PkiError {
    PkiError::CertGeneration {
        reason: format!("{context}: {e}"),
    }
}

pub(crate) fn generate_key(key_type: PkiKeyType) -> Result<KeyPair, PkiError> {
    KeyPair::generate_for(key_type.algorithm())
        .map_err(|e| generation(&format!("{key_type} key generation failed"), e))
}

pub(crate) fn parse_key(pem: &str) -> Result<KeyPair, PkiError> {
    KeyPair::from_pem(pem).map_err(|e| generation("failed to parse CA key", e))
}

/// Fresh random serial, as lowercase hex.
pub(crate) fn random_serial() -> String {
    let mut bytes = crypto::random_bytes(SERIAL_LEN);
    if let Some(first) = bytes.first_mut() {
        // Positive, and no leading zero byte for DER to strip.
        *first = (*first & 0x7f) | 0x40;
    }
    hex::encode(bytes)
}

fn serial_number(serial: &str) -> Result<SerialNumber, PkiError> {
    hex::decode(serial)
        .map(|bytes| SerialNumber::from_slice(&bytes))
        .map_err(|e| PkiError::Serialization {
            reason: format!("serial '{serial}' is not hex: {e}"),
        })
}

pub(crate) fn to_offset(t: DateTime<Utc>) -> Result<OffsetDateTime, PkiError> {
    OffsetDateTime::from_unix_timestamp(t.timestamp()).map_err(|e| PkiError::InvalidRequest {
        reason: format!("timestamp {t} is out of range: {e}"),
    })
}

fn subject(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, org);
    }
    dn
}

/// Parameters for a CA certificate with the given path-length limit.
pub(crate) fn ca_params(
    common_name: &str,
    organization: Option<&str>,
    max_path_length: u8,
    validity: Validity,
    serial: &str,
    signed_by_parent: bool,
) -> Result<CertificateParams, PkiError> {
    let mut params = CertificateParams::default();
    params.distinguished_name = subject(common_name, organization);
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(max_path_length));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params.not_before = to_offset(validity.not_before)?;
    params.not_after = to_offset(validity.not_after)?;
    params.serial_number = Some(serial_number(serial)?);
    params.use_authority_key_identifier_extension = signed_by_parent;
    Ok(params)
}

/// Parameters for a leaf certificate (`CA:false`).
pub(crate) fn leaf_params(spec: &LeafSpec<'_>) -> Result<CertificateParams, PkiError> {
    let names: Vec<String> = spec
        .dns_names
        .iter()
        .cloned()
        .chain(spec.ip_sans.iter().map(ToString::to_string))
        .collect();
    let mut params = CertificateParams::new(names)
        .map_err(|e| PkiError::InvalidRequest {
            reason: format!("invalid subject alternative name: {e}"),
        })?;
    params.distinguished_name = subject(spec.common_name, spec.organization);
    params.is_ca = IsCa::ExplicitNoCa;
    params.key_usages = spec.key_usages.iter().map(|u| key_usage(*u)).collect();
    params.extended_key_usages = spec
        .ext_key_usages
        .iter()
        .map(|u| ext_key_usage(*u))
        .collect();
    params.not_before = to_offset(spec.validity.not_before)?;
    params.not_after = to_offset(spec.validity.not_after)?;
    params.serial_number = Some(serial_number(spec.serial)?);
    params.use_authority_key_identifier_extension = true;
    Ok(params)
}

fn key_usage(usage: KeyUsage) -> KeyUsagePurpose {
    match usage {
        KeyUsage::DigitalSignature => KeyUsagePurpose::DigitalSignature,
        KeyUsage::ContentCommitment => KeyUsagePurpose::ContentCommitment,
        KeyUsage::KeyEncipherment => KeyUsagePurpose::KeyEncipherment,
        KeyUsage::DataEncipherment => KeyUsagePurpose::DataEncipherment,
        KeyUsage::KeyAgreement => KeyUsagePurpose::KeyAgreement,
    }
}

fn ext_key_usage(usage: ExtKeyUsage) -> ExtendedKeyUsagePurpose {
    match usage {
        ExtKeyUsage::Any => ExtendedKeyUsagePurpose::Any,
        ExtKeyUsage::ServerAuth => ExtendedKeyUsagePurpose::ServerAuth,
        ExtKeyUsage::ClientAuth => ExtendedKeyUsagePurpose::ClientAuth,
        ExtKeyUsage::CodeSigning => ExtendedKeyUsagePurpose::CodeSigning,
        ExtKeyUsage::EmailProtection => ExtendedKeyUsagePurpose::EmailProtection,
        ExtKeyUsage::TimeStamping => ExtendedKeyUsagePurpose::TimeStamping,
        ExtKeyUsage::OcspSigning => ExtendedKeyUsagePurpose::OcspSigning,
    }
}

/// Self-sign a root CA certificate.
pub(crate) fn self_sign(params: CertificateParams, key: &KeyPair) -> Result<String, PkiError> {
    params
        .self_signed(key)
        .map(|cert| cert.pem())
        .map_err(|e| generation("self-signing failed", e))
}

impl Issuer {
    /// Rebuild a signing issuer from a stored CA certificate and key.
    pub(crate) fn load(cert_pem: &str, key: KeyPair) -> Result<Self, PkiError> {
        let params = CertificateParams::from_ca_cert_pem(cert_pem)
            .map_err(|e| generation("failed to parse CA certificate", e))?;
        let cert = params
            .self_signed(&key)
            .map_err(|e| generation("failed to rebuild CA certificate", e))?;
        Ok(Self { cert, key })
    }

    /// Sign a certificate for `subject_key`. Returns the PEM.
    pub(crate) fn sign(
        &self,
        params: CertificateParams,
        subject_key: &impl PublicKeyData,
    ) -> Result<String, PkiError> {
        params
            .signed_by(subject_key, &self.cert, &self.key)
            .map(|cert| cert.pem())
            .map_err(|e| generation("certificate signing failed", e))
    }

    /// Sign a CRL listing `revoked`. Returns the PEM.
    pub(crate) fn sign_crl(
        &self,
        crl_number: u64,
        window: Validity,
        revoked: &[RevokedEntry],
    ) -> Result<String, PkiError> {
        let revoked_certs = revoked
            .iter()
            .map(|entry| {
                Ok(RevokedCertParams {
                    serial_number: serial_number(&entry.serial)?,
                    revocation_time: to_offset(entry.revoked_at)?,
                    reason_code: None,
                    invalidity_date: None,
                })
            })
            .collect::<Result<Vec<_>, PkiError>>()?;

        let params = CertificateRevocationListParams {
            this_update: to_offset(window.not_before)?,
            next_update: to_offset(window.not_after)?,
            crl_number: SerialNumber::from(crl_number),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        };
        let crl = params
            .signed_by(&self.cert, &self.key)
            .map_err(|e| generation("CRL signing failed", e))?;
        Ok(pem::encode(&pem::Pem::new("X509 CRL", crl.der().to_vec())))
    }
}

/// Parse a PEM CSR and verify its self-signature.
pub(crate) fn parse_csr(pem: &str) -> Result<ParsedCsr, PkiError> {
    let csr = CertificateSigningRequestParams::from_pem(pem).map_err(|e| PkiError::InvalidCsr {
        reason: e.to_string(),
    })?;

    let common_name = csr
        .params
        .distinguished_name
        .get(&DnType::CommonName)
        .map(dn_text)
        .transpose()?;

    let mut dns_names = Vec::new();
    let mut ip_sans = Vec::new();
    for san in &csr.params.subject_alt_names {
        match san {
            SanType::DnsName(name) => dns_names.push(name.as_str().to_owned()),
            SanType::IpAddress(ip) => ip_sans.push(*ip),
            other => {
                return Err(PkiError::InvalidCsr {
                    reason: format!("unsupported subject alternative name {other:?}"),
                });
            }
        }
    }

    Ok(ParsedCsr {
        common_name,
        dns_names,
        ip_sans,
        public_key: csr.public_key,
    })
}

fn dn_text(value: &DnValue) -> Result<String, PkiError> {
    match value {
        DnValue::Utf8String(s) => Ok(s.clone()),
        DnValue::PrintableString(s) => Ok(s.as_str().to_owned()),
        DnValue::Ia5String(s) => Ok(s.as_str().to_owned()),
        _ => Err(PkiError::InvalidCsr {
            reason: "common name uses an unsupported string type".to_owned(),
        }),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn validity() -> Validity {
        let now = Utc::now();
        Validity {
            not_before: now,
            not_after: now + chrono::Duration::days(1),
        }
    }

    #[test]
    fn serials_are_positive_and_fixed_width() {
        for _ in 0..32 {
            let serial = random_serial();
            assert_eq!(serial.len(), SERIAL_LEN * 2);
            let first = u8::from_str_radix(&serial[..2], 16).unwrap();
            assert_eq!(first & 0xc0, 0x40);
        }
        assert_ne!(random_serial(), random_serial());
    }

    #[test]
    fn ca_params_round_trip_through_pem() {
        let key = generate_key(PkiKeyType::EcP256).unwrap();
        let params = ca_params("Root", Some("Acme"), 2, validity(), &random_serial(), false).unwrap();
        let pem = self_sign(params, &key).unwrap();

        let parsed = CertificateParams::from_ca_cert_pem(&pem).unwrap();
        assert!(matches!(
            parsed.is_ca,
            IsCa::Ca(BasicConstraints::Constrained(2))
        ));
    }

    #[test]
    fn csr_names_are_extracted() {
        let key = KeyPair::generate().unwrap();
        let mut params =
            CertificateParams::new(vec!["app.example.com".to_owned(), "10.1.2.3".to_owned()])
                .unwrap();
        params.distinguished_name = subject("app.example.com", None);
        let pem = params.serialize_request(&key).unwrap().pem().unwrap();

        let csr = parse_csr(&pem).unwrap();
        assert_eq!(csr.common_name.as_deref(), Some("app.example.com"));
        assert_eq!(csr.dns_names, vec!["app.example.com"]);
        assert_eq!(csr.ip_sans, vec!["10.1.2.3".parse::<IpAddr>().unwrap()]);
    }

    #[test]
    fn garbage_csr_is_rejected() {
        assert!(matches!(
            parse_csr("-----BEGIN CERTIFICATE REQUEST-----\nAAAA\n-----END CERTIFICATE REQUEST-----\n"),
            Err(PkiError::InvalidCsr { .. })
        ));
    }
}
