//! Identity to policy resolution.
//!
//! Identity and role storage live outside this crate. The evaluator only
//! asks an [`IdentityResolver`] which policy names are attached to a caller.

use std::collections::HashMap;

use tokio::sync::RwLock;

use crate::error::PolicyError;

/// Supplies the policy names attached to an identity.
#[async_trait::async_trait]
pub trait IdentityResolver: Send + Sync + 'static {
    /// Policy names for `identity`. Unknown identities resolve to an empty
    /// list.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Identity`] if the identity source fails.
    async fn policies_for(&self, identity: &str) -> Result<Vec<String>, PolicyError>;
}

/// In-process resolver backed by a map.
#[derive(Debug, Default)]
pub struct StaticIdentityResolver {
    bindings: RwLock<HashMap<String, Vec<String>>>,
}

impl StaticIdentityResolver {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder-style binding, for setup code.
    #[must_use]
    pub fn with(mut self, identity: impl Into<String>, policies: &[&str]) -> Self {
        self.bindings.get_mut().insert(
            identity.into(),
            policies.iter().map(|p| (*p).to_owned()).collect(),
        );
        self
    }

    /// Replace the policies attached to `identity`.
    pub async fn bind(&self, identity: impl Into<String>, policies: Vec<String>) {
        self.bindings.write().await.insert(identity.into(), policies);
    }

    /// Detach every policy from `identity`.
    pub async fn unbind(&self, identity: &str) {
        self.bindings.write().await.remove(identity);
    }
}

#[async_trait::async_trait]
impl IdentityResolver for StaticIdentityResolver {
    async fn policies_for(&self, identity: &str) -> Result<Vec<String>, PolicyError> {
        Ok(self
            .bindings
            .read()
            .await
            .get(identity)
            .cloned()
            .unwrap_or_default())
    }
}
