//! Path policy evaluator for `Arcanum`.
//!
//! A policy is a list of path blocks. Each block pairs a [`PathPattern`]
//! with a capability set and optional parameter and response-wrapping
//! constraints. Documents are written in JSON or an HCL subset (see
//! [`Policy::parse`]).
//!
//! Evaluation is deny-overrides: any matching block carrying `deny` refuses
//! the request outright; otherwise at least one matching block must grant the
//! capability implied by the action, or `sudo`.
//!
//! Policies live in raw storage and do not need the master key. Parsed
//! documents are cached by content hash in the [`PolicyStore`].

mod identity;
mod parser;
mod pattern;
mod store;

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::PolicyError;

pub use identity::{IdentityResolver, StaticIdentityResolver};
pub use pattern::PathPattern;
pub use store::{PolicyEvaluator, PolicyStore, ROOT_POLICY, ROOT_POLICY_NAME};

/// An access capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Create,
    Read,
    Update,
    Delete,
    List,
    /// Administrative access; satisfies any action.
    Sudo,
    /// Refuses the request regardless of other grants.
    Deny,
    Patch,
}

impl Capability {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Read => "read",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::List => "list",
            Self::Sudo => "sudo",
            Self::Deny => "deny",
            Self::Patch => "patch",
        }
    }

    /// Map a request action to the capability it needs.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::UnknownAction`] for anything outside the
    /// known action vocabulary.
    pub fn for_action(action: &str) -> Result<Self, PolicyError> {
        match action.to_ascii_lowercase().as_str() {
            "read" | "get" => Ok(Self::Read),
            "list" => Ok(Self::List),
            "create" | "post" => Ok(Self::Create),
            "put" | "update" | "write" => Ok(Self::Update),
            "delete" | "destroy" => Ok(Self::Delete),
            "patch" => Ok(Self::Patch),
            "sudo" => Ok(Self::Sudo),
            _ => Err(PolicyError::UnknownAction {
                action: action.to_owned(),
            }),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = PolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "create" => Ok(Self::Create),
            "read" => Ok(Self::Read),
            "update" => Ok(Self::Update),
            "delete" => Ok(Self::Delete),
            "list" => Ok(Self::List),
            "sudo" => Ok(Self::Sudo),
            "deny" => Ok(Self::Deny),
            "patch" => Ok(Self::Patch),
            other => Err(PolicyError::Malformed {
                reason: format!("unknown capability '{other}'"),
            }),
        }
    }
}

/// One path block of a policy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRule {
    pub pattern: PathPattern,
    pub capabilities: BTreeSet<Capability>,
    /// Parameter name to permitted values. An empty list permits any value;
    /// the key `*` covers parameters not listed by name.
    pub allowed_parameters: BTreeMap<String, Vec<Value>>,
    /// Parameter name to forbidden values. An empty list forbids the
    /// parameter entirely.
    pub denied_parameters: BTreeMap<String, Vec<Value>>,
    pub required_parameters: Vec<String>,
    pub min_wrapping_ttl: Option<u64>,
    pub max_wrapping_ttl: Option<u64>,
}

impl PathRule {
    fn is_deny(&self) -> bool {
        self.capabilities.contains(&Capability::Deny)
    }

    fn grants(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability) || self.capabilities.contains(&Capability::Sudo)
    }

    /// Check a request's parameters and wrapping TTL against this block.
    fn admits(&self, request: &Request) -> Result<(), DenyReason> {
        for name in &self.required_parameters {
            if !request.parameters.contains_key(name) {
                return Err(DenyReason::Parameter {
                    name: name.clone(),
                    reason: "required parameter is missing".to_owned(),
                });
            }
        }

        for (name, value) in &request.parameters {
            let denied = [self.denied_parameters.get(name), self.denied_parameters.get("*")]
                .into_iter()
                .flatten()
                .any(|values| values.is_empty() || values.contains(value));
            if denied {
                return Err(DenyReason::Parameter {
                    name: name.clone(),
                    reason: "parameter value is denied".to_owned(),
                });
            }

            if !self.allowed_parameters.is_empty() {
                let permitted = match self
                    .allowed_parameters
                    .get(name)
                    .or_else(|| self.allowed_parameters.get("*"))
                {
                    Some(values) => values.is_empty() || values.contains(value),
                    None => false,
                };
                if !permitted {
                    return Err(DenyReason::Parameter {
                        name: name.clone(),
                        reason: "parameter value is not allowed".to_owned(),
                    });
                }
            }
        }

        if self.min_wrapping_ttl.is_some() || self.max_wrapping_ttl.is_some() {
            let Some(ttl) = request.wrapping_ttl else {
                return Err(DenyReason::Wrapping {
                    reason: "response wrapping is required".to_owned(),
                });
            };
            if let Some(min) = self.min_wrapping_ttl.filter(|min| ttl < *min) {
                return Err(DenyReason::Wrapping {
                    reason: format!("wrapping ttl {ttl}s is below the minimum {min}s"),
                });
            }
            if let Some(max) = self.max_wrapping_ttl.filter(|max| ttl > *max) {
                return Err(DenyReason::Wrapping {
                    reason: format!("wrapping ttl {ttl}s exceeds the maximum {max}s"),
                });
            }
        }
        Ok(())
    }
}

/// A parsed, validated policy document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Policy {
    pub rules: Vec<PathRule>,
}

impl Policy {
    /// Parse and validate a JSON or HCL policy document.
    ///
    /// # Errors
    ///
    /// Returns [`PolicyError::Malformed`] for syntax errors, an empty path,
    /// an unknown or empty capability set, `deny` mixed with other
    /// capabilities, or a minimum wrapping TTL above the maximum.
    pub fn parse(document: &str) -> Result<Self, PolicyError> {
        parser::parse(document)
    }

    /// The built-in `root` policy: every capability except `deny` on every
    /// path.
    #[must_use]
    pub fn root() -> Self {
        Self {
            rules: vec![PathRule {
                pattern: PathPattern::any_path(),
                capabilities: BTreeSet::from([
                    Capability::Create,
                    Capability::Read,
                    Capability::Update,
                    Capability::Delete,
                    Capability::List,
                    Capability::Sudo,
                    Capability::Patch,
                ]),
                allowed_parameters: BTreeMap::new(),
                denied_parameters: BTreeMap::new(),
                required_parameters: Vec::new(),
                min_wrapping_ttl: None,
                max_wrapping_ttl: None,
            }],
        }
    }
}

/// A request presented for authorization.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub action: String,
    pub resource: String,
    pub parameters: BTreeMap<String, Value>,
    /// Requested response-wrapping TTL in seconds.
    pub wrapping_ttl: Option<u64>,
}

impl Request {
    #[must_use]
    pub fn new(action: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            resource: resource.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.parameters.insert(name.into(), value.into());
        self
    }

    #[must_use]
    pub fn with_wrapping_ttl(mut self, ttl_secs: u64) -> Self {
        self.wrapping_ttl = Some(ttl_secs);
        self
    }
}

/// Outcome of an evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Deny(DenyReason),
}

impl Decision {
    #[must_use]
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow)
    }
}

/// Why a request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// A matching block carries `deny`.
    ExplicitDeny { pattern: String },
    /// No matching block grants the capability.
    NoGrant { capability: Capability },
    /// A request parameter failed the granting blocks' constraints.
    Parameter { name: String, reason: String },
    /// The wrapping TTL failed the granting blocks' bounds.
    Wrapping { reason: String },
}

impl fmt::Display for DenyReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ExplicitDeny { pattern } => write!(f, "explicitly denied by path '{pattern}'"),
            Self::NoGrant { capability } => write!(f, "no policy grants '{capability}'"),
            Self::Parameter { name, reason } => write!(f, "parameter '{name}': {reason}"),
            Self::Wrapping { reason } => f.write_str(reason),
        }
    }
}

/// Deny-overrides over every block matching `resource`. Returns the blocks
/// that grant `capability`.
fn granting_rules<'a>(
    policies: &'a [Arc<Policy>],
    capability: Capability,
    resource: &str,
) -> Result<Vec<&'a PathRule>, DenyReason> {
    let mut granting = Vec::new();
    for rule in policies.iter().flat_map(|p| p.rules.iter()) {
        if !rule.pattern.matches(resource) {
            continue;
        }
        if rule.is_deny() {
            return Err(DenyReason::ExplicitDeny {
                pattern: rule.pattern.to_string(),
            });
        }
        if rule.grants(capability) {
            granting.push(rule);
        }
    }
    if granting.is_empty() {
        Err(DenyReason::NoGrant { capability })
    } else {
        Ok(granting)
    }
}

/// Evaluate `action` on `resource` against a set of policies, without
/// parameter or wrapping constraints.
///
/// # Errors
///
/// Returns [`PolicyError::UnknownAction`] if the action has no capability.
pub fn evaluate(
    policies: &[Arc<Policy>],
    action: &str,
    resource: &str,
) -> Result<Decision, PolicyError> {
    let capability = Capability::for_action(action)?;
    Ok(match granting_rules(policies, capability, resource) {
        Ok(_) => Decision::Allow,
        Err(reason) => Decision::Deny(reason),
    })
}

/// Evaluate a full request. On top of [`evaluate`], at least one granting
/// block must admit the request's parameters and wrapping TTL; when none
/// does, the first block's refusal is reported.
///
/// # Errors
///
/// Returns [`PolicyError::UnknownAction`] if the action has no capability.
pub fn evaluate_request(
    policies: &[Arc<Policy>],
    request: &Request,
) -> Result<Decision, PolicyError> {
    let capability = Capability::for_action(&request.action)?;
    let rules = match granting_rules(policies, capability, &request.resource) {
        Ok(rules) => rules,
        Err(reason) => return Ok(Decision::Deny(reason)),
    };

    let mut first_refusal = None;
    for rule in rules {
        match rule.admits(request) {
            Ok(()) => return Ok(Decision::Allow),
            Err(reason) => {
                first_refusal.get_or_insert(reason);
            }
        }
    }
    Ok(Decision::Deny(first_refusal.unwrap_or(DenyReason::NoGrant { capability })))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn policies(documents: &[&str]) -> Vec<Arc<Policy>> {
        documents
            .iter()
            .map(|d| Arc::new(Policy::parse(d).unwrap()))
            .collect()
    }

    // ── actions ──────────────────────────────────────────────────────

    #[test]
    fn actions_map_to_capabilities() {
        let cases = [
            ("read", Capability::Read),
            ("GET", Capability::Read),
            ("list", Capability::List),
            ("post", Capability::Create),
            ("create", Capability::Create),
            ("put", Capability::Update),
            ("write", Capability::Update),
            ("update", Capability::Update),
            ("destroy", Capability::Delete),
            ("delete", Capability::Delete),
            ("patch", Capability::Patch),
            ("sudo", Capability::Sudo),
        ];
        for (action, expected) in cases {
            assert_eq!(Capability::for_action(action).unwrap(), expected, "{action}");
        }
        assert!(matches!(
            Capability::for_action("teleport"),
            Err(PolicyError::UnknownAction { .. })
        ));
    }

    // ── deny-overrides ───────────────────────────────────────────────

    #[test]
    fn deny_overrides_explicit_grant() {
        let set = policies(&[
            r#"path "secret/foo" { capabilities = ["read"] }"#,
            r#"path "secret/*" { capabilities = ["deny"] }"#,
        ]);
        assert_eq!(
            evaluate(&set, "read", "secret/foo").unwrap(),
            Decision::Deny(DenyReason::ExplicitDeny {
                pattern: "secret/*".to_owned()
            })
        );
    }

    #[test]
    fn grant_requires_matching_capability_or_sudo() {
        let set = policies(&[
            r#"path "secret/app/*" { capabilities = ["read", "list"] }
               path "sys/+" { capabilities = ["sudo"] }"#,
        ]);
        assert!(evaluate(&set, "read", "secret/app/db").unwrap().is_allowed());
        assert_eq!(
            evaluate(&set, "write", "secret/app/db").unwrap(),
            Decision::Deny(DenyReason::NoGrant {
                capability: Capability::Update
            })
        );
        assert!(evaluate(&set, "delete", "sys/seal/keys").unwrap().is_allowed());
        assert!(!evaluate(&set, "read", "secret/other/db").unwrap().is_allowed());
    }

    #[test]
    fn plus_and_star_differ_on_depth() {
        let plus = policies(&[r#"path "a/+" { capabilities = ["read"] }"#]);
        let star = policies(&[r#"path "a/*" { capabilities = ["read"] }"#]);
        assert!(evaluate(&plus, "read", "a/b/c").unwrap().is_allowed());
        assert!(!evaluate(&star, "read", "a/b/c").unwrap().is_allowed());
        assert!(evaluate(&star, "read", "a/b").unwrap().is_allowed());
    }

    #[test]
    fn no_policies_denies() {
        assert!(!evaluate(&[], "read", "anything").unwrap().is_allowed());
    }

    #[test]
    fn root_policy_allows_everything_unless_denied() {
        let root = vec![Arc::new(Policy::root())];
        for action in ["read", "write", "delete", "list", "patch", "sudo"] {
            assert!(evaluate(&root, action, "kv/data/x").unwrap().is_allowed());
        }

        let mut with_deny = root.clone();
        with_deny.extend(policies(&[r#"path "kv/+" { capabilities = ["deny"] }"#]));
        assert!(!evaluate(&with_deny, "read", "kv/data/x").unwrap().is_allowed());
    }

    // ── request constraints ──────────────────────────────────────────

    #[test]
    fn parameter_constraints_apply_to_granting_blocks() {
        let set = policies(&[r#"path "kv/data/app" {
            capabilities = ["update"]
            allowed_parameters = { "env" = ["dev", "staging"], "note" = [] }
            denied_parameters = { "note" = ["forbidden"] }
            required_parameters = ["env"]
        }"#]);

        let ok = Request::new("write", "kv/data/app")
            .with_parameter("env", "dev")
            .with_parameter("note", "hello");
        assert!(evaluate_request(&set, &ok).unwrap().is_allowed());

        let missing = Request::new("write", "kv/data/app");
        assert!(matches!(
            evaluate_request(&set, &missing).unwrap(),
            Decision::Deny(DenyReason::Parameter { .. })
        ));

        let wrong_value = Request::new("write", "kv/data/app").with_parameter("env", "prod");
        assert!(!evaluate_request(&set, &wrong_value).unwrap().is_allowed());

        let unlisted = ok.clone().with_parameter("owner", "me");
        assert!(!evaluate_request(&set, &unlisted).unwrap().is_allowed());

        let denied = Request::new("write", "kv/data/app")
            .with_parameter("env", "dev")
            .with_parameter("note", "forbidden");
        assert!(!evaluate_request(&set, &denied).unwrap().is_allowed());

        // Plain evaluation ignores parameter constraints.
        assert!(evaluate(&set, "write", "kv/data/app").unwrap().is_allowed());
    }

    #[test]
    fn any_granting_block_may_admit_the_request() {
        let set = policies(&[
            r#"path "kv/data/app" { capabilities = ["update"] required_parameters = ["env"] }"#,
            r#"path "kv/data/app" { capabilities = ["update"] }"#,
        ]);
        assert!(evaluate_request(&set, &Request::new("write", "kv/data/app")).unwrap().is_allowed());
    }

    #[test]
    fn wrapping_ttl_bounds() {
        let set = policies(&[r#"path "transit/+" {
            capabilities = ["read"]
            min_wrapping_ttl = "1m"
            max_wrapping_ttl = "1h"
        }"#]);
        let req = Request::new("read", "transit/keys/app");

        assert!(matches!(
            evaluate_request(&set, &req).unwrap(),
            Decision::Deny(DenyReason::Wrapping { .. })
        ));
        assert!(!evaluate_request(&set, &req.clone().with_wrapping_ttl(30)).unwrap().is_allowed());
        assert!(evaluate_request(&set, &req.clone().with_wrapping_ttl(600)).unwrap().is_allowed());
        assert!(!evaluate_request(&set, &req.with_wrapping_ttl(7200)).unwrap().is_allowed());
    }

    #[test]
    fn deny_reasons_render() {
        let reason = DenyReason::ExplicitDeny {
            pattern: "secret/*".to_owned(),
        };
        assert!(reason.to_string().contains("secret/*"));
        let reason = DenyReason::NoGrant {
            capability: Capability::List,
        };
        assert!(reason.to_string().contains("list"));
    }
}
