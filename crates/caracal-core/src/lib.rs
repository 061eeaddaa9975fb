//! Pre-execution authority enforcement for autonomous agents: signed
//! execution mandates, a fail-closed evaluator, and a tamper-evident ledger.
//!
//! This crate is the enforcement core; HTTP middleware, a function
//! decorator, and external-API adapters live in `caracal-gateway` on top of
//! it.

pub mod cache;
pub mod crypto;
pub mod error;
pub mod evaluator;
pub mod ledger;
pub mod mandate_manager;
pub mod model;
pub mod scope;
pub mod store;

pub use cache::MandateCache;
pub use error::{DenialReason, GatewayError, LedgerError, MandateManagerError};
pub use evaluator::{AuthorityEvaluator, EvaluatorConfig, ValidationRequest};
pub use ledger::{inclusion_proof, EventFilter, InclusionProof, LedgerQuery, LedgerWriter, MerkleBatcher};
pub use mandate_manager::{DelegateParams, IssueParams, MandateManager};
pub use model::{
    Decision, ExecutionMandate, LedgerDecision, LedgerEvent, LedgerEventType, Principal, PrincipalType,
    SignedMerkleBatch,
};
pub use store::{Store, StoreError};

/// Top-level configuration for an authority enforcement deployment (§10.3).
/// Constructed from environment variables by the binary/gateway crate;
/// kept as plain fields here so library consumers can build one
/// programmatically in tests without touching the environment.
#[derive(Debug, Clone)]
pub struct AuthorityConfig {
    /// SQLite database path. `None` uses an in-memory database (tests only).
    pub database_path: Option<std::path::PathBuf>,
    /// Maximum delegation chain depth accepted by both the Mandate Manager
    /// and the Authority Evaluator. Default 5.
    pub max_delegation_depth: u32,
    /// Number of ledger events accumulated before a Merkle batch is cut.
    pub merkle_batch_size: u64,
    /// Whether a ledger write failure during `validate()` denies the
    /// request. Default `true` (fail-closed).
    pub deny_on_ledger_failure: bool,
    /// Maximum number of distinct mandates the evaluator's read-through
    /// cache holds at once. `0` disables the cache entirely — `validate()`
    /// then always reads through to the store, which is always correct,
    /// just slower (§4.2's "correctness never depends on the cache").
    pub cache_capacity: usize,
    /// Upper bound, independent of `valid_until`, on how long a cached
    /// mandate is trusted before a fresh store read is forced. Never
    /// widens a mandate's own validity window, only narrows the window in
    /// which a revocation can be missed by a cache hit that predates the
    /// revocation's invalidation.
    pub cache_ttl_seconds: u64,
    /// Identifier of the key used to sign Merkle roots, carried through for
    /// audit/bookkeeping only. Key material itself is supplied directly to
    /// `MerkleBatcher::build_and_sign`; this crate does not manage keys or
    /// talk to a KMS (out of scope — see DESIGN.md).
    pub ledger_signing_key_id: Option<String>,
    /// Reserved for future cross-node clock reconciliation. Deliberately
    /// **not** applied to the per-mandate `valid_from`/`valid_until`
    /// boundary check, which must stay exact to the nanosecond (see
    /// DESIGN.md); carried here only so deployments have a documented place
    /// to record an agreed tolerance ahead of any feature that needs it.
    pub clock_skew_tolerance_seconds: u64,
}

impl Default for AuthorityConfig {
    fn default() -> Self {
        Self {
            database_path: None,
            max_delegation_depth: 5,
            merkle_batch_size: 1000,
            deny_on_ledger_failure: true,
            cache_capacity: 10_000,
            cache_ttl_seconds: 30,
            ledger_signing_key_id: None,
            clock_skew_tolerance_seconds: 0,
        }
    }
}

impl AuthorityConfig {
    /// Reads overrides from the process environment, per §10.3:
    /// `CARACAL_DATABASE_PATH`, `CARACAL_MAX_DELEGATION_DEPTH`,
    /// `CARACAL_MERKLE_BATCH_SIZE`, `CARACAL_DENY_ON_LEDGER_FAILURE`,
    /// `CARACAL_CACHE_CAPACITY`, `CARACAL_CACHE_TTL_SECONDS`,
    /// `CARACAL_LEDGER_SIGNING_KEY_ID`, `CARACAL_CLOCK_SKEW_TOLERANCE_SECONDS`.
    /// Unset or unparseable variables fall back to the default; an
    /// explicit `false` for `CARACAL_DENY_ON_LEDGER_FAILURE` is the only
    /// way to turn off fail-closed ledger handling.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_path: std::env::var("CARACAL_DATABASE_PATH").ok().map(std::path::PathBuf::from),
            max_delegation_depth: std::env::var("CARACAL_MAX_DELEGATION_DEPTH")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_delegation_depth),
            merkle_batch_size: std::env::var("CARACAL_MERKLE_BATCH_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.merkle_batch_size),
            deny_on_ledger_failure: std::env::var("CARACAL_DENY_ON_LEDGER_FAILURE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.deny_on_ledger_failure),
            cache_capacity: std::env::var("CARACAL_CACHE_CAPACITY")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cache_capacity),
            cache_ttl_seconds: std::env::var("CARACAL_CACHE_TTL_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.cache_ttl_seconds),
            ledger_signing_key_id: std::env::var("CARACAL_LEDGER_SIGNING_KEY_ID").ok(),
            clock_skew_tolerance_seconds: std::env::var("CARACAL_CLOCK_SKEW_TOLERANCE_SECONDS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.clock_skew_tolerance_seconds),
        }
    }

    /// Opens the configured store (file-backed or in-memory).
    pub fn open_store(&self) -> Result<Store, StoreError> {
        match &self.database_path {
            Some(path) => Store::open(path),
            None => Store::memory(),
        }
    }

    /// Builds the mandate cache this configuration describes, or `None` if
    /// `cache_capacity` is `0` (cache disabled).
    pub fn build_cache(&self) -> Option<MandateCache> {
        if self.cache_capacity == 0 {
            return None;
        }
        Some(MandateCache::new(
            self.cache_capacity,
            std::time::Duration::from_secs(self.cache_ttl_seconds),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_fail_closed() {
        let config = AuthorityConfig::default();
        assert!(config.deny_on_ledger_failure);
        assert_eq!(config.max_delegation_depth, 5);
    }

    #[test]
    fn default_config_builds_a_cache() {
        let config = AuthorityConfig::default();
        assert!(config.build_cache().is_some());
    }

    #[test]
    fn zero_capacity_disables_the_cache() {
        let config = AuthorityConfig {
            cache_capacity: 0,
            ..AuthorityConfig::default()
        };
        assert!(config.build_cache().is_none());
    }

    // `std::env` is process-global, so any test that sets/removes variables
    // must not interleave with another test reading them concurrently.
    #[test]
    #[serial_test::serial]
    fn from_env_reads_overrides() {
        std::env::set_var("CARACAL_MAX_DELEGATION_DEPTH", "9");
        std::env::set_var("CARACAL_CACHE_TTL_SECONDS", "120");
        std::env::set_var("CARACAL_LEDGER_SIGNING_KEY_ID", "prod-root-2026");

        let config = AuthorityConfig::from_env();

        std::env::remove_var("CARACAL_MAX_DELEGATION_DEPTH");
        std::env::remove_var("CARACAL_CACHE_TTL_SECONDS");
        std::env::remove_var("CARACAL_LEDGER_SIGNING_KEY_ID");

        assert_eq!(config.max_delegation_depth, 9);
        assert_eq!(config.cache_ttl_seconds, 120);
        assert_eq!(config.ledger_signing_key_id.as_deref(), Some("prod-root-2026"));
    }

    #[test]
    #[serial_test::serial]
    fn from_env_falls_back_to_defaults_when_unset() {
        std::env::remove_var("CARACAL_MAX_DELEGATION_DEPTH");
        let config = AuthorityConfig::from_env();
        assert_eq!(config.max_delegation_depth, AuthorityConfig::default().max_delegation_depth);
    }
}
