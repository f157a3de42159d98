//! Policy persistence, the parse cache and the evaluator.

use std::collections::HashMap;
use std::sync::Arc;

use arcanum_storage::StorageBackend;
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use super::{Decision, IdentityResolver, Policy, Request};
use crate::audit::{AuditEvent, AuditManager};
use crate::error::PolicyError;

type DocumentHash = [u8; 32];

/// Storage prefix for policy documents.
const POLICY_PREFIX: &str = "sys/policies/";

/// Name of the built-in policy.
pub const ROOT_POLICY_NAME: &str = "root";

/// Source of the built-in policy, as returned by
/// [`PolicyStore::read_document`].
pub const ROOT_POLICY: &str = r#"path "+" {
  capabilities = ["create", "read", "update", "delete", "list", "sudo", "patch"]
}
"#;

/// Parsed policies by document hash, and the document each stored policy
/// name currently uses. A parse stays cached only while a name refers to it.
#[derive(Default)]
struct PolicyCache {
    parsed: HashMap<DocumentHash, Arc<Policy>>,
    names: HashMap<String, DocumentHash>,
}

impl PolicyCache {
    fn bind(&mut self, name: &str, hash: DocumentHash, policy: Arc<Policy>) -> Arc<Policy> {
        let policy = Arc::clone(self.parsed.entry(hash).or_insert(policy));
        if let Some(previous) = self.names.insert(name.to_owned(), hash).filter(|p| *p != hash) {
            self.release(previous);
        }
        policy
    }

    fn unbind(&mut self, name: &str) {
        if let Some(previous) = self.names.remove(name) {
            self.release(previous);
        }
    }

    fn release(&mut self, hash: DocumentHash) {
        if !self.names.values().any(|h| *h == hash) {
            self.parsed.remove(&hash);
        }
    }
}

/// Named policy documents in raw storage.
///
/// Documents are stored as written. Parsing goes through a cache keyed by the
/// SHA-256 of the document text, so re-reading an unchanged policy never
/// re-parses it. Replacing or deleting a policy evicts its old parse unless
/// another policy still uses the same document.
pub struct PolicyStore {
    storage: Arc<dyn StorageBackend>,
    audit: Arc<AuditManager>,
    cache: RwLock<PolicyCache>,
    root: Arc<Policy>,
}

impl PolicyStore {
    #[must_use]
    pub fn new(storage: Arc<dyn StorageBackend>, audit: Arc<AuditManager>) -> Self {
        Self {
            storage,
            audit,
            cache: RwLock::new(PolicyCache::default()),
            root: Arc::new(Policy::root()),
        }
    }

    /// Validate and store a policy document under `name`.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for the `root` policy.
    /// - [`PolicyError::Malformed`] for a bad name or document.
    /// - [`PolicyError::Storage`] if the write fails.
    /// - [`PolicyError::Audit`] if the request could not be recorded. Nothing
    ///   is written then.
    pub async fn put(
        &self,
        actor: &str,
        name: &str,
        document: &str,
    ) -> Result<Arc<Policy>, PolicyError> {
        let event = AuditEvent::new("sys/policy/write", actor, name);
        let policy = self.audit.guard(event, self.put_inner(name, document)).await?;
        info!(name, rules = policy.rules.len(), "policy written");
        Ok(policy)
    }

    async fn put_inner(&self, name: &str, document: &str) -> Result<Arc<Policy>, PolicyError> {
        if name == ROOT_POLICY_NAME {
            return Err(PolicyError::BuiltIn {
                name: name.to_owned(),
            });
        }
        validate_name(name)?;
        let policy = self.compile(document).await?;
        self.storage
            .put(&policy_key(name), document.as_bytes())
            .await?;
        Ok(self
            .cache
            .write()
            .await
            .bind(name, document_hash(document), policy))
    }

    /// Load and parse a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::NotFound`] if no such policy exists.
    /// - [`PolicyError::Malformed`] if the stored document no longer parses.
    pub async fn get(&self, name: &str) -> Result<Arc<Policy>, PolicyError> {
        if name == ROOT_POLICY_NAME {
            return Ok(Arc::clone(&self.root));
        }
        let document = self.read_document(name).await?;
        let policy = self.compile(&document).await?;
        Ok(self
            .cache
            .write()
            .await
            .bind(name, document_hash(&document), policy))
    }

    /// The document text of a policy.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::NotFound`] if no such policy exists.
    pub async fn read_document(&self, name: &str) -> Result<String, PolicyError> {
        if name == ROOT_POLICY_NAME {
            return Ok(ROOT_POLICY.to_owned());
        }
        let bytes = self
            .storage
            .get(&policy_key(name))
            .await?
            .ok_or_else(|| PolicyError::NotFound {
                name: name.to_owned(),
            })?;
        String::from_utf8(bytes).map_err(|e| PolicyError::Malformed {
            reason: format!("stored policy '{name}' is not UTF-8: {e}"),
        })
    }

    /// Delete a policy.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::BuiltIn`] for the `root` policy.
    /// - [`PolicyError::NotFound`] if no such policy exists.
    /// - [`PolicyError::Audit`] if the request could not be recorded.
    pub async fn delete(&self, actor: &str, name: &str) -> Result<(), PolicyError> {
        let event = AuditEvent::new("sys/policy/delete", actor, name);
        self.audit.guard(event, self.delete_inner(name)).await?;
        info!(name, "policy deleted");
        Ok(())
    }

    async fn delete_inner(&self, name: &str) -> Result<(), PolicyError> {
        if name == ROOT_POLICY_NAME {
            return Err(PolicyError::BuiltIn {
                name: name.to_owned(),
            });
        }
        let key = policy_key(name);
        if !self.storage.exists(&key).await? {
            return Err(PolicyError::NotFound {
                name: name.to_owned(),
            });
        }
        self.storage.delete(&key).await?;
        self.cache.write().await.unbind(name);
        Ok(())
    }

    /// All policy names, including `root`, sorted.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Storage`] if listing fails.
    pub async fn list(&self) -> Result<Vec<String>, PolicyError> {
        let mut names: Vec<String> = self
            .storage
            .list(POLICY_PREFIX)
            .await?
            .iter()
            .filter_map(|k| k.strip_prefix(POLICY_PREFIX).map(String::from))
            .collect();
        names.push(ROOT_POLICY_NAME.to_owned());
        names.sort();
        names.dedup();
        Ok(names)
    }

    /// Parse a document, reusing the cached parse when a stored policy has
    /// the same text. Documents not stored under a name are never cached.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Malformed`] if the document fails validation.
    pub async fn compile(&self, document: &str) -> Result<Arc<Policy>, PolicyError> {
        let hash = document_hash(document);
        if let Some(policy) = self.cache.read().await.parsed.get(&hash) {
            return Ok(Arc::clone(policy));
        }
        Ok(Arc::new(Policy::parse(document)?))
    }

    #[cfg(test)]
    async fn cached(&self) -> usize {
        self.cache.read().await.parsed.len()
    }
}

impl std::fmt::Debug for PolicyStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyStore").finish_non_exhaustive()
    }
}

/// Resolves an identity's policies and evaluates requests against them.
pub struct PolicyEvaluator {
    store: Arc<PolicyStore>,
    resolver: Arc<dyn IdentityResolver>,
}

impl PolicyEvaluator {
    #[must_use]
    pub fn new(store: Arc<PolicyStore>, resolver: Arc<dyn IdentityResolver>) -> Self {
        Self { store, resolver }
    }

    /// Decide whether `identity` may perform `action` on `resource`.
    ///
    /// # Errors
    ///
    /// - [`PolicyError::UnknownAction`] if the action has no capability.
    /// - [`PolicyError::Identity`] if the resolver fails.
    pub async fn evaluate(
        &self,
        identity: &str,
        action: &str,
        resource: &str,
    ) -> Result<Decision, PolicyError> {
        let policies = self.policies_for(identity).await?;
        let decision = super::evaluate(&policies, action, resource)?;
        debug!(identity, action, resource, allowed = decision.is_allowed(), "policy evaluated");
        Ok(decision)
    }

    /// Like [`evaluate`](Self::evaluate), also checking the request's
    /// parameters and wrapping TTL.
    ///
    /// # Errors
    ///
    /// As for [`evaluate`](Self::evaluate).
    pub async fn evaluate_request(
        &self,
        identity: &str,
        request: &Request,
    ) -> Result<Decision, PolicyError> {
        let policies = self.policies_for(identity).await?;
        let decision = super::evaluate_request(&policies, request)?;
        debug!(
            identity,
            action = %request.action,
            resource = %request.resource,
            allowed = decision.is_allowed(),
            "policy request evaluated"
        );
        Ok(decision)
    }

    async fn policies_for(&self, identity: &str) -> Result<Vec<Arc<Policy>>, PolicyError> {
        let names = self.resolver.policies_for(identity).await?;
        let mut policies = Vec::with_capacity(names.len());
        for name in &names {
            match self.store.get(name).await {
                Ok(policy) => policies.push(policy),
                Err(PolicyError::NotFound { .. }) => {
                    warn!(identity, policy = %name, "attached policy does not exist, skipping");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(policies)
    }
}

impl std::fmt::Debug for PolicyEvaluator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyEvaluator").finish_non_exhaustive()
    }
}

fn validate_name(name: &str) -> Result<(), PolicyError> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(PolicyError::Malformed {
            reason: format!("invalid policy name '{name}'"),
        })
    }
}

fn document_hash(document: &str) -> DocumentHash {
    Sha256::digest(document.as_bytes()).into()
}

fn policy_key(name: &str) -> String {
    format!("{POLICY_PREFIX}{name}")
}
