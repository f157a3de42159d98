//! The `Arcanum` facade.
//!
//! A single [`Vault`] wires every component around one storage backend and
//! implements the request gate callers go through before touching an
//! engine: seal status first, policy second.

use std::sync::Arc;

use arcanum_storage::StorageBackend;
use tracing::debug;

use crate::audit::AuditManager;
use crate::barrier::Barrier;
use crate::config::EngineConfig;
use crate::error::VaultError;
use crate::kek::KekProvider;
use crate::kv::KvEngine;
use crate::pki::PkiEngine;
use crate::policy::{Decision, IdentityResolver, PolicyEvaluator, PolicyStore, Request};
use crate::seal::SealManager;
use crate::transit::TransitEngine;

/// Every component of a running vault.
pub struct Vault {
    /// Seal/unseal lifecycle manager.
    pub seal: Arc<SealManager>,
    /// The encryption barrier shared by the engines.
    pub barrier: Arc<Barrier>,
    pub transit: Arc<TransitEngine>,
    pub kv: Arc<KvEngine>,
    pub pki: Arc<PkiEngine>,
    /// Policy documents.
    pub policies: Arc<PolicyStore>,
    pub evaluator: Arc<PolicyEvaluator>,
    pub audit: Arc<AuditManager>,
    pub config: EngineConfig,
}

impl Vault {
    /// Wire a vault over `storage`. The vault starts sealed.
    #[must_use]
    pub fn new(
        storage: Arc<dyn StorageBackend>,
        kek: Arc<dyn KekProvider>,
        resolver: Arc<dyn IdentityResolver>,
        audit: Arc<AuditManager>,
        config: EngineConfig,
    ) -> Self {
        let seal = Arc::new(SealManager::new(
            Arc::clone(&storage),
            kek,
            Arc::clone(&audit),
        ));
        let barrier = Arc::new(Barrier::new(Arc::clone(&storage), Arc::clone(&seal)));
        let policies = Arc::new(PolicyStore::new(storage, Arc::clone(&audit)));

        Self {
            transit: Arc::new(TransitEngine::new(
                Arc::clone(&barrier),
                Arc::clone(&audit),
                &config,
            )),
            kv: Arc::new(KvEngine::new(Arc::clone(&barrier), Arc::clone(&audit), &config)),
            pki: Arc::new(PkiEngine::new(
                Arc::clone(&barrier),
                Arc::clone(&audit),
                &config,
            )),
            evaluator: Arc::new(PolicyEvaluator::new(Arc::clone(&policies), resolver)),
            seal,
            barrier,
            policies,
            audit,
            config,
        }
    }

    /// Gate a request: refused with [`VaultError::Sealed`] while sealed and
    /// with [`VaultError::Denied`] when the identity's policies don't allow
    /// it.
    ///
    /// # Errors
    ///
    /// - [`VaultError::Sealed`] if the vault is sealed.
    /// - [`VaultError::Denied`] if policy refuses the request.
    /// - [`VaultError::Policy`] if evaluation itself fails.
    pub async fn authorize(
        &self,
        identity: &str,
        action: &str,
        resource: &str,
    ) -> Result<(), VaultError> {
        if self.seal.is_sealed().await {
            return Err(VaultError::Sealed);
        }
        let decision = self.evaluator.evaluate(identity, action, resource).await?;
        gate(identity, action, resource, decision)
    }

    /// [`authorize`](Self::authorize) including parameter and wrapping-TTL
    /// constraints.
    ///
    /// # Errors
    ///
    /// As for [`authorize`](Self::authorize).
    pub async fn authorize_request(
        &self,
        identity: &str,
        request: &Request,
    ) -> Result<(), VaultError> {
        if self.seal.is_sealed().await {
            return Err(VaultError::Sealed);
        }
        let decision = self.evaluator.evaluate_request(identity, request).await?;
        gate(identity, &request.action, &request.resource, decision)
    }
}

fn gate(identity: &str, action: &str, resource: &str, decision: Decision) -> Result<(), VaultError> {
    match decision {
        Decision::Allow => Ok(()),
        Decision::Deny(reason) => {
            debug!(identity, action, resource, %reason, "request denied");
            Err(VaultError::Denied {
                identity: identity.to_owned(),
                action: action.to_owned(),
                resource: resource.to_owned(),
            })
        }
    }
}

impl std::fmt::Debug for Vault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Vault")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use arcanum_storage::MemoryBackend;

    use super::*;
    use crate::crypto::EncryptionKey;
    use crate::kek::StaticKek;
    use crate::policy::StaticIdentityResolver;

    fn vault() -> Vault {
        let resolver = StaticIdentityResolver::new()
            .with("admin", &["root"])
            .with("reader", &["reader"]);
        Vault::new(
            Arc::new(MemoryBackend::new()),
            Arc::new(StaticKek::new(EncryptionKey::generate())),
            Arc::new(resolver),
            Arc::new(AuditManager::new()),
            EngineConfig::default(),
        )
    }

    async fn unsealed() -> Vault {
        let vault = vault();
        let init = vault.seal.init(3, 2).await.unwrap();
        for share in &init.shares[..2] {
            vault.seal.unseal(share).await.unwrap();
        }
        vault
    }

    #[tokio::test]
    async fn sealed_vault_refuses_before_policy() {
        let vault = vault();
        assert!(matches!(
            vault.authorize("admin", "read", "kv/data/app").await,
            Err(VaultError::Sealed)
        ));
    }

    #[tokio::test]
    async fn policy_gates_unsealed_requests() {
        let vault = unsealed().await;
        vault
            .policies
            .put("admin", "reader", r#"path "kv/data/*" { capabilities = ["read"] }"#)
            .await
            .unwrap();

        vault.authorize("admin", "write", "pki/issue/web").await.unwrap();
        vault.authorize("reader", "read", "kv/data/app").await.unwrap();
        assert!(matches!(
            vault.authorize("reader", "write", "kv/data/app").await,
            Err(VaultError::Denied { .. })
        ));
        assert!(matches!(
            vault.authorize("reader", "warp", "kv/data/app").await,
            Err(VaultError::Policy(_))
        ));

        vault.seal.seal().await.unwrap();
        assert!(matches!(
            vault.authorize("admin", "read", "kv/data/app").await,
            Err(VaultError::Sealed)
        ));
    }

    #[tokio::test]
    async fn request_constraints_flow_through_the_gate() {
        let vault = unsealed().await;
        vault
            .policies
            .put(
                "admin",
                "reader",
                r#"path "transit/+" { capabilities = ["read"] max_wrapping_ttl = "1h" }"#,
            )
            .await
            .unwrap();

        let unwrapped = Request::new("read", "transit/keys/app");
        assert!(matches!(
            vault.authorize_request("reader", &unwrapped).await,
            Err(VaultError::Denied { .. })
        ));
        vault
            .authorize_request("reader", &unwrapped.with_wrapping_ttl(300))
            .await
            .unwrap();
    }
}
