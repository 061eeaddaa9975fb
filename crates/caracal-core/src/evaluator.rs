//! Authority Evaluator: the hot-path `validate()` call every gateway
//! surface goes through before executing an action (§4.2).
//!
//! Evaluation is fail-closed end to end: any unexpected condition — a
//! missing principal, an unreadable store row, a ledger write failure —
//! produces a denial, never a fallback allow. The evaluation order below is
//! load-bearing: cheaper checks (mandate presence, expiry) run before the
//! signature verification and delegation-chain walk, so a malformed mandate
//! is rejected before spending a signature check on it.

use std::time::Instant;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::cache::MandateCache;
use crate::error::DenialReason;
use crate::ledger::LedgerWriter;
use crate::model::{Decision, ExecutionMandate, LedgerDecision};
use crate::scope;
use crate::store::Store;

/// Bounds the delegation-chain walk so a cyclic or pathologically long
/// `parent_mandate_id` chain cannot turn a single `validate()` call into an
/// unbounded scan. Chosen well above any realistic delegation depth
/// (§4.1's own depth cap is 5 by default); this is a safety net, not a
/// policy limit.
const MAX_CHAIN_WALK: u32 = 64;

pub struct EvaluatorConfig {
    pub max_delegation_depth: u32,
    /// Whether a ledger write failure during evaluation itself denies the
    /// request. `true` matches §4.2's fail-closed contract; set `false`
    /// only for environments that accept losing audit completeness over
    /// losing availability (see DESIGN.md).
    pub deny_on_ledger_failure: bool,
}

impl Default for EvaluatorConfig {
    fn default() -> Self {
        Self {
            max_delegation_depth: 5,
            deny_on_ledger_failure: true,
        }
    }
}

pub struct AuthorityEvaluator {
    store: Store,
    ledger: LedgerWriter,
    config: EvaluatorConfig,
    /// Optional read-through cache in front of `store.get_mandate()` (§4.2).
    /// Never consulted for anything but skipping a store round-trip:
    /// signature verification, scope checks, and the delegation-chain walk
    /// all still run against whatever mandate row comes back, cached or not.
    cache: Option<MandateCache>,
}

/// The request a gateway surface asks the evaluator to authorize.
pub struct ValidationRequest<'a> {
    pub mandate_id: Option<Uuid>,
    pub requested_action: &'a str,
    pub requested_resource: &'a str,
    pub correlation_id: Option<String>,
}

impl AuthorityEvaluator {
    pub fn new(store: Store, config: EvaluatorConfig) -> Self {
        let ledger = LedgerWriter::new(store.clone());
        Self {
            store,
            ledger,
            config,
            cache: None,
        }
    }

    /// Attaches a mandate cache. Idiomatic builder, matching the existing
    /// `with_max_delegation_depth` style on `MandateManager`.
    #[must_use]
    pub fn with_cache(mut self, cache: MandateCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Evaluates a single request and returns a `Decision`. Never panics on
    /// bad input; every failure mode resolves to `allowed = false`.
    ///
    /// Equivalent to [`Self::validate_with_deadline`] with no deadline.
    pub fn validate(&self, request: ValidationRequest<'_>) -> Decision {
        self.validate_with_deadline(request, None)
    }

    /// Evaluates a single request, denying with `timeout_exceeded` (§5) if
    /// `deadline` has already passed by the time evaluation reaches it — at
    /// entry, and again at each hop of the delegation-chain walk. There is
    /// no partial commit: a timeout denial is ledgered exactly like any
    /// other denial, never silently dropped.
    pub fn validate_with_deadline(&self, request: ValidationRequest<'_>, deadline: Option<Instant>) -> Decision {
        let now = Utc::now();
        let outcome = self.evaluate(&request, now, deadline);

        let (decision, principal_id, mandate_id) = match &outcome {
            Ok(mandate) => (LedgerDecision::Allowed, Some(mandate.subject_id), Some(mandate.mandate_id)),
            Err((reason, principal_id, mandate_id)) => {
                let _ = reason;
                (LedgerDecision::Denied, *principal_id, *mandate_id)
            }
        };

        let denial_reason = match &outcome {
            Err((reason, ..)) => Some(reason.message()),
            Ok(_) => None,
        };

        let ledger_result = self.ledger.record_evaluation(
            principal_id.unwrap_or(Uuid::nil()),
            mandate_id,
            decision,
            denial_reason,
            request.requested_action,
            request.requested_resource,
            request.correlation_id.clone(),
            serde_json::json!({}),
        );

        if let Err(ledger_err) = ledger_result {
            if self.config.deny_on_ledger_failure {
                tracing::error!(error = %ledger_err, "ledger write failed during evaluation, denying fail-closed");
                return Decision::deny(
                    DenialReason::LedgerUnavailable.message(),
                    mandate_id,
                    principal_id,
                    request.requested_action,
                    request.requested_resource,
                    now,
                );
            }
            tracing::warn!(error = %ledger_err, "ledger write failed during evaluation, continuing per configuration");
        }

        match outcome {
            Ok(mandate) => Decision::allow(
                mandate.mandate_id,
                mandate.subject_id,
                request.requested_action,
                request.requested_resource,
                now,
            ),
            Err((reason, principal_id, mandate_id)) => {
                tracing::warn!(
                    reason = %reason.message(),
                    mandate_id = ?mandate_id,
                    action = request.requested_action,
                    resource = request.requested_resource,
                    "authority denied"
                );
                Decision::deny(
                    reason.message(),
                    mandate_id,
                    principal_id,
                    request.requested_action,
                    request.requested_resource,
                    now,
                )
            }
        }
    }

    /// Core evaluation steps (§4.2): mandate lookup, revocation, time
    /// window, issuer signature, scope, and delegation-chain validity.
    /// Returns the validated mandate on success, or a denial reason plus
    /// whatever principal/mandate identifiers are known for ledger
    /// recording.
    fn evaluate(
        &self,
        request: &ValidationRequest<'_>,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<ExecutionMandate, (DenialReason, Option<Uuid>, Option<Uuid>)> {
        if timed_out(deadline) {
            return Err((DenialReason::TimeoutExceeded, None, None));
        }

        let mandate_id = request.mandate_id.ok_or((DenialReason::NoMandateProvided, None, None))?;

        let mandate = self
            .fetch_mandate(mandate_id, now)
            .map_err(|_| (DenialReason::LedgerUnavailable, None, Some(mandate_id)))?
            .ok_or((DenialReason::MandateNotFound, None, Some(mandate_id)))?;

        if mandate.revoked {
            return Err((
                DenialReason::MandateRevoked {
                    revocation_reason: mandate.revocation_reason.clone(),
                },
                Some(mandate.subject_id),
                Some(mandate_id),
            ));
        }

        if now < mandate.valid_from {
            return Err((DenialReason::NotYetValid, Some(mandate.subject_id), Some(mandate_id)));
        }
        if now > mandate.valid_until {
            return Err((DenialReason::Expired, Some(mandate.subject_id), Some(mandate_id)));
        }

        let issuer = self
            .store
            .get_principal(mandate.issuer_id)
            .map_err(|_| (DenialReason::LedgerUnavailable, Some(mandate.subject_id), Some(mandate_id)))?
            .ok_or((DenialReason::IssuerUnknown, Some(mandate.subject_id), Some(mandate_id)))?;

        if issuer.public_key_pem.is_empty() {
            return Err((DenialReason::IssuerNoKey, Some(mandate.subject_id), Some(mandate_id)));
        }
        if !crate::crypto::verify_value(&mandate.signed_payload(), &mandate.signature, &issuer.public_key_pem) {
            return Err((
                DenialReason::SignatureVerificationFailed,
                Some(mandate.subject_id),
                Some(mandate_id),
            ));
        }

        if !scope::any_matches(&mandate.action_scope, request.requested_action) {
            return Err((DenialReason::ActionNotInScope, Some(mandate.subject_id), Some(mandate_id)));
        }
        if !scope::any_matches(&mandate.resource_scope, request.requested_resource) {
            return Err((DenialReason::ResourceNotInScope, Some(mandate.subject_id), Some(mandate_id)));
        }

        self.check_delegation_chain(&mandate, now, deadline)
            .map_err(|reason| (reason, Some(mandate.subject_id), Some(mandate_id)))?;

        Ok(mandate)
    }

    /// Looks up `mandate_id`, consulting the cache first if one is attached.
    /// A cache hit is returned as-is — the caller still re-runs every
    /// correctness check (revocation, time window, signature) against it, so
    /// a stale-but-not-yet-invalidated entry can only cost an extra denial,
    /// never a wrongful allow. A cache miss falls through to the store and
    /// populates the cache for next time.
    fn fetch_mandate(
        &self,
        mandate_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<ExecutionMandate>, crate::store::StoreError> {
        if let Some(cache) = &self.cache {
            if let Some(mandate) = cache.get(mandate_id, now) {
                return Ok(Some(mandate));
            }
        }

        let mandate = self.store.get_mandate(mandate_id)?;
        if let (Some(cache), Some(mandate)) = (&self.cache, &mandate) {
            cache.put(mandate.clone());
        }
        Ok(mandate)
    }

    /// Walks `parent_mandate_id` up to the root, verifying every ancestor
    /// is unrevoked, time-valid, and within the configured maximum
    /// delegation depth, and that each hop's scope narrows its parent's.
    /// This re-checks the narrowing invariant `MandateManager::delegate`
    /// already enforces at issuance time: the evaluator is the independent
    /// enforcement point and must not trust that a child row in the store
    /// was actually produced by `delegate()` rather than written directly.
    /// Bounded by [`MAX_CHAIN_WALK`] regardless of the configured maximum
    /// depth.
    fn check_delegation_chain(
        &self,
        mandate: &ExecutionMandate,
        now: DateTime<Utc>,
        deadline: Option<Instant>,
    ) -> Result<(), DenialReason> {
        if mandate.delegation_depth > self.config.max_delegation_depth {
            return Err(DenialReason::DelegationChainInvalid);
        }

        let mut current = mandate.clone();
        let mut hops = 0u32;
        while let Some(parent_id) = current.parent_mandate_id {
            if timed_out(deadline) {
                return Err(DenialReason::TimeoutExceeded);
            }
            hops += 1;
            if hops > MAX_CHAIN_WALK {
                return Err(DenialReason::DelegationChainInvalid);
            }
            let parent = self
                .fetch_mandate(parent_id, now)
                .map_err(|_| DenialReason::DelegationChainInvalid)?
                .ok_or(DenialReason::DelegationChainInvalid)?;
            if parent.revoked || !parent.is_time_valid(now) {
                return Err(DenialReason::DelegationChainInvalid);
            }
            if !scope::is_narrowing(&current.resource_scope, &parent.resource_scope)
                || !scope::is_narrowing(&current.action_scope, &parent.action_scope)
            {
                return Err(DenialReason::DelegationChainInvalid);
            }
            current = parent;
        }
        Ok(())
    }
}

/// `true` once `deadline` (if any) has passed. No deadline never times out.
fn timed_out(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|d| Instant::now() > d)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mandate_manager::{DelegateParams, IssueParams, MandateManager};
    use crate::model::{Principal, PrincipalType};
    use p256::ecdsa::SigningKey;
    use p256::pkcs8::EncodePrivateKey;

    fn signing_principal(name: &str) -> Principal {
        let signing_key = SigningKey::random(&mut rand_core::OsRng);
        let private_pem = signing_key.to_pkcs8_pem(Default::default()).unwrap().to_string();
        let public_pem = p256::ecdsa::VerifyingKey::from(&signing_key)
            .to_public_key_pem(Default::default())
            .unwrap();
        Principal {
            principal_id: Uuid::new_v4(),
            name: name.to_string(),
            principal_type: PrincipalType::Agent,
            owner: "org".to_string(),
            public_key_pem: public_pem,
            private_key_pem: Some(private_pem),
        }
    }

    fn subject_only(name: &str) -> Principal {
        Principal {
            principal_id: Uuid::new_v4(),
            name: name.to_string(),
            principal_type: PrincipalType::Agent,
            owner: "org".to_string(),
            public_key_pem: "unused".to_string(),
            private_key_pem: None,
        }
    }

    #[test]
    fn no_mandate_denies_fail_closed() {
        let store = Store::memory().unwrap();
        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: None,
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::NoMandateProvided.message());
    }

    #[test]
    fn valid_mandate_allows_matching_request() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = subject_only("subject");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();

        let manager = MandateManager::new(store.clone());
        let mandate = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:openai:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(mandate.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(decision.allowed);
    }

    #[test]
    fn resource_outside_scope_is_denied() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = subject_only("subject");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();

        let manager = MandateManager::new(store.clone());
        let mandate = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:openai:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(mandate.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:anthropic:claude-3",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::ResourceNotInScope.message());
    }

    #[test]
    fn revoked_mandate_is_denied() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = subject_only("subject");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();

        let manager = MandateManager::new(store.clone());
        let mandate = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();
        manager.revoke(mandate.mandate_id, issuer.principal_id, "rotated", false).unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(mandate.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, "mandate_revoked: rotated");
    }

    #[test]
    fn revoked_parent_denies_child_via_chain_check() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = signing_principal("subject");
        let grandchild = subject_only("grandchild");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();
        store.insert_principal(&grandchild).unwrap();

        let manager = MandateManager::new(store.clone());
        let root = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();
        let child = manager
            .delegate(DelegateParams {
                parent_mandate_id: root.mandate_id,
                subject_id: grandchild.principal_id,
                resource_scope: vec!["api:openai:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 60,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        // Revoke only the root directly; the child row itself is untouched
        // by anything other than the manager's own cascade, which we bypass
        // here to exercise the evaluator's independent chain check.
        store
            .mark_revoked(root.mandate_id, Utc::now(), issuer.principal_id, "rotated")
            .unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(child.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::DelegationChainInvalid.message());
    }

    #[test]
    fn child_with_broadened_scope_is_denied_even_if_inserted_directly() {
        // `MandateManager::delegate` enforces scope narrowing at issuance
        // time, but the evaluator must not rely on that: a child row that
        // somehow bypasses `delegate()` (a compromised delegator, a direct
        // store write) and claims a scope broader than its parent's must
        // still be denied by the chain check itself.
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = signing_principal("subject");
        let grandchild = subject_only("grandchild");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();
        store.insert_principal(&grandchild).unwrap();

        let manager = MandateManager::new(store.clone());
        let root = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:openai:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        // Hand-craft a child mandate with a scope broader than its parent's
        // (`api:*` is not narrowed by `api:openai:*`) and sign it honestly
        // with the subject's own key, bypassing `delegate()`'s narrowing
        // check entirely.
        let now = Utc::now();
        let mut child = ExecutionMandate {
            mandate_id: Uuid::new_v4(),
            issuer_id: subject.principal_id,
            subject_id: grandchild.principal_id,
            valid_from: now,
            valid_until: root.valid_until,
            resource_scope: vec!["api:*".to_string()],
            action_scope: vec!["api_call".to_string()],
            delegation_depth: 1,
            parent_mandate_id: Some(root.mandate_id),
            intent_hash: None,
            signature: String::new(),
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            revoked_by: None,
            created_at: now,
        };
        child.signature =
            crate::crypto::sign_value(&child.signed_payload(), subject.private_key_pem.as_deref().unwrap()).unwrap();
        store.insert_mandate(&child).unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(child.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:anthropic:claude-3",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::DelegationChainInvalid.message());
    }

    #[test]
    fn tampered_signature_is_denied() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = subject_only("subject");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();

        let manager = MandateManager::new(store.clone());
        let mandate = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        {
            let conn = store.conn.lock().unwrap();
            conn.execute(
                "UPDATE mandates SET signature = 'deadbeef' WHERE mandate_id = ?1",
                rusqlite::params![mandate.mandate_id.to_string()],
            )
            .unwrap();
        }

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(mandate.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::SignatureVerificationFailed.message());
    }

    #[test]
    fn expired_deadline_denies_with_timeout_exceeded() {
        let store = Store::memory().unwrap();
        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let already_passed = Instant::now() - std::time::Duration::from_millis(1);
        let decision = evaluator.validate_with_deadline(
            ValidationRequest {
                mandate_id: None,
                requested_action: "api_call",
                requested_resource: "api:openai:gpt-4",
                correlation_id: None,
            },
            Some(already_passed),
        );
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::TimeoutExceeded.message());
    }

    #[test]
    fn cache_hit_skips_the_store_but_still_enforces_correctness() {
        let store = Store::memory().unwrap();
        let issuer = signing_principal("issuer");
        let subject = subject_only("subject");
        store.insert_principal(&issuer).unwrap();
        store.insert_principal(&subject).unwrap();

        let manager = MandateManager::new(store.clone());
        let mandate = manager
            .issue(IssueParams {
                issuer_id: issuer.principal_id,
                subject_id: subject.principal_id,
                resource_scope: vec!["api:openai:*".to_string()],
                action_scope: vec!["api_call".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        let cache = crate::cache::MandateCache::new(8, std::time::Duration::from_secs(60));
        cache.put(mandate.clone());

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default()).with_cache(cache.clone());
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(mandate.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(decision.allowed);
        // a cached mandate with a tampered signature still must be denied:
        // the cache only ever saves a store round-trip, never a correctness
        // check.
        let mut tampered = mandate.clone();
        tampered.signature = "deadbeef".to_string();
        cache.put(tampered);
        let decision = evaluator.validate(ValidationRequest {
            mandate_id: Some(mandate.mandate_id),
            requested_action: "api_call",
            requested_resource: "api:openai:gpt-4",
            correlation_id: None,
        });
        assert!(!decision.allowed);
        assert_eq!(decision.reason, DenialReason::SignatureVerificationFailed.message());
    }
}
