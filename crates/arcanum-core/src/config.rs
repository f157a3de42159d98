//! Engine configuration for `Arcanum`.
//!
//! Loads tunables from environment variables with sensible defaults.
//! All settings can be overridden via `ARCANUM_*` environment variables.

use serde::{Deserialize, Serialize};

/// Ten years, the default ceiling on CA certificate validity.
const TEN_YEARS_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Engine tunables shared by KV, transit and PKI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Versions kept per KV path when its metadata sets `max_versions = 0`.
    pub kv_default_max_versions: u32,
    /// Attempts for a guarded read-modify-write before giving up with a
    /// conflict error.
    pub write_retry_limit: u32,
    /// Seconds between a CRL's `this_update` and `next_update`.
    pub crl_validity_secs: u64,
    /// Upper bound on a CA certificate's validity in seconds.
    pub pki_max_ca_ttl_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            kv_default_max_versions: 10,
            write_retry_limit: 16,
            crl_validity_secs: 72 * 60 * 60,
            pki_max_ca_ttl_secs: TEN_YEARS_SECS,
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `ARCANUM_KV_MAX_VERSIONS` (default: `10`)
    /// - `ARCANUM_WRITE_RETRY_LIMIT` (default: `16`)
    /// - `ARCANUM_CRL_VALIDITY_SECS` (default: `259200`, three days)
    /// - `ARCANUM_PKI_MAX_CA_TTL_SECS` (default: ten years)
    ///
    /// Unparseable or zero values fall back to the default.
    #[must_use]
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            kv_default_max_versions: env_or("ARCANUM_KV_MAX_VERSIONS", defaults.kv_default_max_versions),
            write_retry_limit: env_or("ARCANUM_WRITE_RETRY_LIMIT", defaults.write_retry_limit),
            crl_validity_secs: env_or("ARCANUM_CRL_VALIDITY_SECS", defaults.crl_validity_secs),
            pki_max_ca_ttl_secs: env_or("ARCANUM_PKI_MAX_CA_TTL_SECS", defaults.pki_max_ca_ttl_secs),
        }
    }
}

fn env_or<T>(name: &str, default: T) -> T
where
    T: std::str::FromStr + PartialEq + Default,
{
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse::<T>().ok())
        .filter(|v| *v != T::default())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.kv_default_max_versions, 10);
        assert_eq!(cfg.write_retry_limit, 16);
        assert_eq!(cfg.crl_validity_secs, 259_200);
        assert_eq!(cfg.pki_max_ca_ttl_secs, 315_360_000);
    }

    #[test]
    fn env_or_falls_back_on_missing_variable() {
        assert_eq!(env_or("ARCANUM_TEST_SURELY_UNSET_VARIABLE", 42u32), 42);
    }
}
