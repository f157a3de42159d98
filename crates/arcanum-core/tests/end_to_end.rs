//! End-to-end behaviour of a wired vault over in-memory storage.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;

use arcanum_core::audit::{AuditManager, MemoryAuditBackend};
use arcanum_core::config::EngineConfig;
use arcanum_core::crypto::EncryptionKey;
use arcanum_core::error::{KvError, PkiError, SealError, TransitError, VaultError};
use arcanum_core::kek::StaticKek;
use arcanum_core::kv::SecretData;
use arcanum_core::pki::{
    IntermediateCaRequest, IssueRequest, PkiKeyType, PkiRole, RootCaRequest,
};
use arcanum_core::policy::StaticIdentityResolver;
use arcanum_core::transit::{KeyOptions, KeyType};
use arcanum_core::vault::Vault;
use arcanum_storage::MemoryBackend;

const DAY: u64 = 24 * 60 * 60;

fn vault_with(resolver: StaticIdentityResolver) -> Vault {
    Vault::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(StaticKek::new(EncryptionKey::generate())),
        Arc::new(resolver),
        Arc::new(AuditManager::new()),
        EngineConfig::default(),
    )
}

fn vault() -> Vault {
    vault_with(StaticIdentityResolver::new())
}

async fn unsealed() -> Vault {
    let vault = vault();
    let init = vault.seal.init(3, 2).await.unwrap();
    for share in &init.shares[..2] {
        vault.seal.unseal(share).await.unwrap();
    }
    vault
}

fn data(pairs: &[(&str, &str)]) -> SecretData {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_owned(), serde_json::Value::from(*v)))
        .collect()
}

// ── seal ─────────────────────────────────────────────────────────────

#[tokio::test]
async fn any_threshold_subset_unseals_and_one_fewer_does_not() {
    for (shares, threshold) in [(2u8, 2u8), (5, 3), (7, 5), (255, 2)] {
        let vault = vault();
        let init = vault.seal.init(shares, threshold).await.unwrap();
        assert_eq!(init.shares.len(), usize::from(shares));

        // Take the last K shares so the subset differs from the first K.
        let subset = &init.shares[init.shares.len() - usize::from(threshold)..];
        let (last, rest) = subset.split_last().unwrap();
        for share in rest {
            assert!(vault.seal.unseal(share).await.unwrap().is_some());
        }
        assert!(vault.seal.is_sealed().await, "{threshold}-1 of {shares} unsealed");

        assert!(vault.seal.unseal(last).await.unwrap().is_none());
        assert!(!vault.seal.is_sealed().await, "{threshold} of {shares} stayed sealed");
    }
}

#[tokio::test]
async fn failed_reconstruction_resets_progress() {
    let vault = vault();
    let init = vault.seal.init(5, 3).await.unwrap();
    let foreign = self::vault().seal.init(5, 3).await.unwrap();

    vault.seal.unseal(&init.shares[0]).await.unwrap();
    vault.seal.unseal(&init.shares[1]).await.unwrap();
    assert!(matches!(
        vault.seal.unseal(&foreign.shares[2]).await,
        Err(SealError::UnsealVerificationFailed { .. })
    ));

    let status = vault.seal.status().await.unwrap();
    assert!(status.sealed);
    assert_eq!(status.progress, 0);

    for share in &init.shares[2..] {
        vault.seal.unseal(share).await.unwrap();
    }
    assert!(!vault.seal.is_sealed().await);
}

#[tokio::test]
async fn sealing_stops_every_engine() {
    let vault = vault();
    let init = vault.seal.init(5, 3).await.unwrap();
    for i in [4, 0, 2] {
        vault.seal.unseal(&init.shares[i]).await.unwrap();
    }
    assert!(!vault.seal.status().await.unwrap().sealed);

    vault
        .transit
        .create_key("ops", "app", KeyOptions::default())
        .await
        .unwrap();
    vault
        .kv
        .write("ops", "app/db", &data(&[("password", "hunter2")]), None)
        .await
        .unwrap();

    vault.seal.seal().await.unwrap();
    assert!(vault.seal.status().await.unwrap().sealed);

    assert!(matches!(
        vault.transit.encrypt("app", b"x", None, None).await,
        Err(TransitError::Sealed)
    ));
    assert!(matches!(
        vault.kv.read("ops", "app/db", None).await,
        Err(KvError::Sealed)
    ));
    assert!(matches!(vault.pki.list_cas().await, Err(PkiError::Sealed)));
    assert!(matches!(
        vault.authorize("ops", "read", "kv/data/app/db").await,
        Err(VaultError::Sealed)
    ));
}

// ── kv ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn kv_versions_are_immutable_and_cas_guarded() {
    let vault = unsealed().await;
    let kv = &vault.kv;

    assert_eq!(kv.write("ops", "app/db", &data(&[("v", "1")]), Some(0)).await.unwrap().version, 1);
    assert!(matches!(
        kv.write("ops", "app/db", &data(&[("v", "x")]), Some(0)).await,
        Err(KvError::AlreadyExists { .. })
    ));
    assert_eq!(kv.write("ops", "app/db", &data(&[("v", "2")]), Some(1)).await.unwrap().version, 2);
    assert!(matches!(
        kv.write("ops", "app/db", &data(&[("v", "x")]), Some(1)).await,
        Err(KvError::CasMismatch { current: 2, .. })
    ));
    kv.write("ops", "app/db", &data(&[("v", "3")]), None).await.unwrap();

    let old = kv.read("ops", "app/db", Some(2)).await.unwrap();
    assert_eq!(old.data, data(&[("v", "2")]));
    assert_eq!(kv.read("ops", "app/db", None).await.unwrap().version, 3);
}

#[tokio::test]
async fn destroyed_versions_stay_destroyed() {
    let vault = unsealed().await;
    let kv = &vault.kv;
    kv.write("ops", "app/db", &data(&[("v", "1")]), None).await.unwrap();
    kv.write("ops", "app/db", &data(&[("v", "2")]), None).await.unwrap();

    kv.delete_versions("ops", "app/db", &[1]).await.unwrap();
    assert!(matches!(
        kv.read("ops", "app/db", Some(1)).await,
        Err(KvError::Deleted { .. })
    ));
    kv.undelete_versions("ops", "app/db", &[1]).await.unwrap();
    assert!(kv.read("ops", "app/db", Some(1)).await.is_ok());

    kv.destroy_versions("ops", "app/db", &[1]).await.unwrap();
    kv.undelete_versions("ops", "app/db", &[1]).await.unwrap();
    assert!(matches!(
        kv.read("ops", "app/db", Some(1)).await,
        Err(KvError::Destroyed { .. })
    ));
    assert!(kv.read("ops", "app/db", Some(2)).await.is_ok());
}

// ── transit ──────────────────────────────────────────────────────────

#[tokio::test]
async fn transit_rotation_keeps_old_ciphertexts_readable() {
    let vault = unsealed().await;
    let transit = &vault.transit;

    for key_type in [KeyType::Aes256Gcm96, KeyType::ChaCha20Poly1305] {
        let name = format!("k-{key_type}");
        transit
            .create_key(
                "ops",
                &name,
                KeyOptions {
                    key_type,
                    ..KeyOptions::default()
                },
            )
            .await
            .unwrap();

        let v1 = transit.encrypt(&name, b"payload", None, None).await.unwrap();
        assert!(v1.starts_with("vault:v1:"));
        assert_eq!(transit.rotate_key("ops", &name).await.unwrap(), 2);

        let v2 = transit.encrypt(&name, b"payload", None, None).await.unwrap();
        assert!(v2.starts_with("vault:v2:"));
        assert_eq!(transit.decrypt("ops", &name, &v1, None).await.unwrap(), b"payload");

        let rewrapped = transit.rewrap(&name, &v1, None).await.unwrap();
        assert!(rewrapped.starts_with("vault:v2:"));
        assert_eq!(transit.decrypt("ops", &name, &rewrapped, None).await.unwrap(), b"payload");
    }
}

// ── pki ──────────────────────────────────────────────────────────────

#[tokio::test]
async fn pki_hierarchy_issuance_and_revocation() {
    let vault = unsealed().await;
    let pki = &vault.pki;

    pki.create_root_ca(
        "ops",
        RootCaRequest {
            name: "root".to_owned(),
            common_name: "Example Root".to_owned(),
            organization: None,
            key_type: PkiKeyType::EcP256,
            ttl_secs: 365 * DAY,
            max_path_length: 1,
        },
    )
    .await
    .unwrap();

    let intermediate = |max_path_length| IntermediateCaRequest {
        name: "issuing".to_owned(),
        parent: "root".to_owned(),
        common_name: "Example Issuing".to_owned(),
        organization: None,
        key_type: PkiKeyType::EcP384,
        ttl_secs: 90 * DAY,
        max_path_length,
    };
    assert!(matches!(
        pki.create_intermediate_ca("ops", intermediate(1)).await,
        Err(PkiError::Hierarchy { .. })
    ));
    pki.create_intermediate_ca("ops", intermediate(0)).await.unwrap();

    let mut role = PkiRole::new("web", "issuing", 30 * DAY);
    role.allowed_domains = vec!["example.com".to_owned()];
    role.allow_subdomains = true;
    pki.create_role("ops", role).await.unwrap();

    let request = |cn: &str| IssueRequest {
        role: "web".to_owned(),
        common_name: cn.to_owned(),
        ..IssueRequest::default()
    };
    assert!(matches!(
        pki.issue("ops", request("www.example.org")).await,
        Err(PkiError::RoleConstraintViolation { .. })
    ));

    let issued = pki.issue("ops", request("www.example.com")).await.unwrap();
    assert_eq!(issued.ca_chain.len(), 2);

    pki.revoke_certificate("ops", &issued.serial).await.unwrap();
    let crl = pki.generate_crl("issuing").await.unwrap();
    let entry = crl
        .revoked
        .iter()
        .find(|e| e.serial == issued.serial)
        .unwrap();
    assert_eq!(
        Some(entry.revoked_at),
        pki.read_certificate(&issued.serial).await.unwrap().revoked_at
    );
    assert!(crl.pem.starts_with("-----BEGIN X509 CRL-----"));
}

// ── policy ───────────────────────────────────────────────────────────

#[tokio::test]
async fn policy_deny_overrides_and_wildcard_depth() {
    let vault = vault_with(
        StaticIdentityResolver::new()
            .with("dev", &["reader", "lockdown"])
            .with("deep", &["deep"])
            .with("shallow", &["shallow"]),
    );
    let init = vault.seal.init(3, 2).await.unwrap();
    for share in &init.shares[1..] {
        vault.seal.unseal(share).await.unwrap();
    }

    vault
        .policies
        .put("ops", "reader", r#"path "secret/foo" { capabilities = ["read"] }"#)
        .await
        .unwrap();
    vault
        .policies
        .put("ops", "lockdown", r#"{"path": {"secret/*": {"capabilities": ["deny"]}}}"#)
        .await
        .unwrap();
    vault
        .policies
        .put("ops", "deep", r#"path "a/+" { capabilities = ["read"] }"#)
        .await
        .unwrap();
    vault
        .policies
        .put("ops", "shallow", r#"path "a/*" { capabilities = ["read"] }"#)
        .await
        .unwrap();

    assert!(matches!(
        vault.authorize("dev", "read", "secret/foo").await,
        Err(VaultError::Denied { .. })
    ));
    vault.authorize("deep", "read", "a/b/c").await.unwrap();
    assert!(matches!(
        vault.authorize("shallow", "read", "a/b/c").await,
        Err(VaultError::Denied { .. })
    ));
}

// ── audit ────────────────────────────────────────────────────────────

#[tokio::test]
async fn destructive_failures_are_audited() {
    let backend = Arc::new(MemoryAuditBackend::new());
    let audit = Arc::new(AuditManager::new());
    audit.add_backend(backend.clone()).await;
    let vault = Vault::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(StaticKek::new(EncryptionKey::generate())),
        Arc::new(StaticIdentityResolver::new()),
        audit,
        EngineConfig::default(),
    );
    let init = vault.seal.init(3, 2).await.unwrap();
    for share in &init.shares[..2] {
        vault.seal.unseal(share).await.unwrap();
    }

    assert!(vault.transit.rotate_key("ops", "missing").await.is_err());
    assert!(vault.kv.destroy_versions("ops", "missing", &[1]).await.is_err());
    assert!(vault.pki.revoke_certificate("ops", "00aa").await.is_err());

    for op in ["transit/rotate", "kv/destroy", "pki/revoke"] {
        let events = backend.events_for(op).await;
        assert_eq!(events.len(), 1, "{op}");
        assert!(matches!(
            events[0].outcome,
            arcanum_core::audit::AuditOutcome::Failure { .. }
        ));
    }
}
