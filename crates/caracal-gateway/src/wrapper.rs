//! Function-level authority wrapper (§4.4).
//!
//! The source's decorator inspects the wrapped function's signature via
//! reflection to pull a `mandate` argument out of `*args`/`**kwargs`. Rust
//! has no runtime reflection, so this is an ordinary higher-order function:
//! the caller passes the mandate id explicitly and a closure to run on
//! allow.

use uuid::Uuid;

use caracal_core::{AuthorityEvaluator, Decision, ValidationRequest};

/// Raised when a wrapped call is denied authority. Carries the evaluator's
/// `Decision` so callers can inspect the stable reason/code if needed.
#[derive(Debug, thiserror::Error)]
#[error("authority denied: {}", decision.reason)]
pub struct AuthorityDenied {
    pub decision: Decision,
}

/// Validates `mandate_id` against `(action, resource)` and, on allow, runs
/// `f`. On denial, returns [`AuthorityDenied`] without running `f`.
///
/// ```ignore
/// let result = require_authority(&evaluator, Some(mandate_id), "read", "database:users", || {
///     Ok(load_users())
/// })?;
/// ```
pub fn require_authority<T>(
    evaluator: &AuthorityEvaluator,
    mandate_id: Option<Uuid>,
    action: &str,
    resource: &str,
    f: impl FnOnce() -> T,
) -> Result<T, AuthorityDenied> {
    let decision = evaluator.validate(ValidationRequest {
        mandate_id,
        requested_action: action,
        requested_resource: resource,
        correlation_id: None,
    });

    if !decision.allowed {
        tracing::warn!(reason = %decision.reason, action, resource, "function call denied authority");
        return Err(AuthorityDenied { decision });
    }

    tracing::debug!(mandate_id = ?decision.mandate_id, action, resource, "function call authorized");
    Ok(f())
}

#[cfg(test)]
mod tests {
    use super::*;
    use caracal_core::{EvaluatorConfig, IssueParams, MandateManager, Principal, PrincipalType, Store};
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
    fn allowed_call_runs_the_closure() {
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
                resource_scope: vec!["database:users".to_string()],
                action_scope: vec!["read".to_string()],
                validity_seconds: 3600,
                intent_hash: None,
                correlation_id: None,
            })
            .unwrap();

        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let result = require_authority(
            &evaluator,
            Some(mandate.mandate_id),
            "read",
            "database:users",
            || 42,
        );
        assert_eq!(result.unwrap(), 42);
    }

    #[test]
    fn missing_mandate_denies_without_running_closure() {
        let store = Store::memory().unwrap();
        let evaluator = AuthorityEvaluator::new(store, EvaluatorConfig::default());
        let mut ran = false;
        let result = require_authority(&evaluator, None, "read", "database:users", || {
            ran = true;
        });
        assert!(result.is_err());
        assert!(!ran);
    }
}
