//! Mandate Manager: issuance, delegation, and revocation (§4.1).
//!
//! Every write here goes through the same sequence: validate, persist, sign
//! is folded into persistence (the signature is part of what gets written),
//! record on the ledger. A ledger write failure after a successful store
//! write is not swallowed — §4.1's contract is that issuance/delegation/
//! revocation are only as durable as their ledger record, so a ledger
//! failure here surfaces as an error even though the row already landed in
//! `mandates`. Callers that need strict atomicity should wrap both in a
//! transaction at the `Store` level; this type does not currently do that
//! (see DESIGN.md).

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use crate::cache::MandateCache;
use crate::error::MandateManagerError;
use crate::ledger::LedgerWriter;
use crate::model::ExecutionMandate;
use crate::scope;
use crate::store::Store;

const DEFAULT_MAX_DELEGATION_DEPTH: u32 = 5;

/// Parameters for issuing a root mandate (no parent).
pub struct IssueParams {
    pub issuer_id: Uuid,
    pub subject_id: Uuid,
    pub resource_scope: Vec<String>,
    pub action_scope: Vec<String>,
    pub validity_seconds: i64,
    pub intent_hash: Option<String>,
    pub correlation_id: Option<String>,
}

/// Parameters for delegating a child mandate from an existing one.
pub struct DelegateParams {
    pub parent_mandate_id: Uuid,
    pub subject_id: Uuid,
    pub resource_scope: Vec<String>,
    pub action_scope: Vec<String>,
    pub validity_seconds: i64,
    pub intent_hash: Option<String>,
    pub correlation_id: Option<String>,
}

pub struct MandateManager {
    store: Store,
    ledger: LedgerWriter,
    max_delegation_depth: u32,
    /// Shared with the evaluator's read-through cache, if one is in use, so
    /// a revocation here is immediately visible to `validate()` instead of
    /// waiting out the cache's TTL (§4.2).
    cache: Option<MandateCache>,
}

impl MandateManager {
    pub fn new(store: Store) -> Self {
        let ledger = LedgerWriter::new(store.clone());
        Self {
            store,
            ledger,
            max_delegation_depth: DEFAULT_MAX_DELEGATION_DEPTH,
            cache: None,
        }
    }

    pub fn with_max_delegation_depth(mut self, max_depth: u32) -> Self {
        self.max_delegation_depth = max_depth;
        self
    }

    /// Attaches the same [`MandateCache`] the evaluator reads from, so
    /// `revoke()` can invalidate entries as it writes them.
    #[must_use]
    pub fn with_cache(mut self, cache: MandateCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Issues a new root mandate (`parent_mandate_id = None`, `delegation_depth = 0`).
    pub fn issue(&self, params: IssueParams) -> Result<ExecutionMandate, MandateManagerError> {
        if params.validity_seconds <= 0 {
            return Err(MandateManagerError::InvalidValiditySeconds(params.validity_seconds));
        }
        if !scope::is_valid_scope(&params.resource_scope) || !scope::is_valid_scope(&params.action_scope) {
            return Err(MandateManagerError::InvalidScopeSyntax);
        }

        let issuer = self
            .store
            .get_principal(params.issuer_id)
            .map_err(MandateManagerError::from)?
            .ok_or(MandateManagerError::UnknownPrincipal(params.issuer_id))?;
        if !issuer.can_sign() {
            return Err(MandateManagerError::PrincipalCannotSign(params.issuer_id));
        }
        self.store
            .get_principal(params.subject_id)
            .map_err(MandateManagerError::from)?
            .ok_or(MandateManagerError::UnknownPrincipal(params.subject_id))?;

        let now = Utc::now();
        let mut mandate = ExecutionMandate {
            mandate_id: Uuid::new_v4(),
            issuer_id: params.issuer_id,
            subject_id: params.subject_id,
            valid_from: now,
            valid_until: now + Duration::seconds(params.validity_seconds),
            resource_scope: params.resource_scope,
            action_scope: params.action_scope,
            delegation_depth: 0,
            parent_mandate_id: None,
            intent_hash: params.intent_hash,
            signature: String::new(),
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            revoked_by: None,
            created_at: now,
        };
        mandate.signature = crate::crypto::sign_value(
            &mandate.signed_payload(),
            issuer.private_key_pem.as_deref().expect("checked by can_sign"),
        )
        .map_err(|e| MandateManagerError::Store(crate::store::StoreError::Database(e.to_string())))?;

        self.store.insert_mandate(&mandate).map_err(MandateManagerError::from)?;
        self.ledger
            .record_issuance(
                params.issuer_id,
                mandate.mandate_id,
                params.correlation_id,
                serde_json::json!({"subject_id": params.subject_id, "root": true}),
            )
            .map_err(|e| {
                tracing::error!(mandate_id = %mandate.mandate_id, error = %e, "ledger write failed after issuance");
                MandateManagerError::LedgerWriteFailure(e.to_string())
            })?;

        tracing::debug!(mandate_id = %mandate.mandate_id, issuer_id = %params.issuer_id, "mandate issued");
        Ok(mandate)
    }

    /// Derives a narrower child mandate from `parent_mandate_id`. The
    /// child's scope must be a subset of the parent's (§4.1 subset rule),
    /// its validity window must nest within the parent's, and its
    /// `delegation_depth` must stay within the configured maximum.
    pub fn delegate(&self, params: DelegateParams) -> Result<ExecutionMandate, MandateManagerError> {
        if params.validity_seconds <= 0 {
            return Err(MandateManagerError::InvalidValiditySeconds(params.validity_seconds));
        }
        if !scope::is_valid_scope(&params.resource_scope) || !scope::is_valid_scope(&params.action_scope) {
            return Err(MandateManagerError::InvalidScopeSyntax);
        }

        let parent = self
            .store
            .get_mandate(params.parent_mandate_id)
            .map_err(MandateManagerError::from)?
            .ok_or(MandateManagerError::UnknownParentMandate(params.parent_mandate_id))?;
        if parent.revoked {
            return Err(MandateManagerError::ParentRevoked(params.parent_mandate_id));
        }
        let now = Utc::now();
        if !parent.is_time_valid(now) {
            return Err(MandateManagerError::ParentExpired(params.parent_mandate_id));
        }

        let child_depth = parent.delegation_depth + 1;
        if child_depth > self.max_delegation_depth {
            return Err(MandateManagerError::DelegationDepthExceeded {
                depth: child_depth,
                max: self.max_delegation_depth,
            });
        }

        if !scope::is_narrowing(&params.resource_scope, &parent.resource_scope)
            || !scope::is_narrowing(&params.action_scope, &parent.action_scope)
        {
            return Err(MandateManagerError::ScopeNotSubset);
        }

        let valid_until = now + Duration::seconds(params.validity_seconds);
        if valid_until > parent.valid_until {
            return Err(MandateManagerError::ValidityOutsideParent);
        }

        // The delegating principal is the parent's subject: it holds the
        // parent grant and must itself be able to sign to pass it on.
        let delegator = self
            .store
            .get_principal(parent.subject_id)
            .map_err(MandateManagerError::from)?
            .ok_or(MandateManagerError::UnknownPrincipal(parent.subject_id))?;
        if !delegator.can_sign() {
            return Err(MandateManagerError::PrincipalCannotSign(parent.subject_id));
        }
        self.store
            .get_principal(params.subject_id)
            .map_err(MandateManagerError::from)?
            .ok_or(MandateManagerError::UnknownPrincipal(params.subject_id))?;

        let mut mandate = ExecutionMandate {
            mandate_id: Uuid::new_v4(),
            issuer_id: parent.subject_id,
            subject_id: params.subject_id,
            valid_from: now,
            valid_until,
            resource_scope: params.resource_scope,
            action_scope: params.action_scope,
            delegation_depth: child_depth,
            parent_mandate_id: Some(parent.mandate_id),
            intent_hash: params.intent_hash,
            signature: String::new(),
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
            revoked_by: None,
            created_at: now,
        };
        mandate.signature = crate::crypto::sign_value(
            &mandate.signed_payload(),
            delegator.private_key_pem.as_deref().expect("checked by can_sign"),
        )
        .map_err(|e| MandateManagerError::Store(crate::store::StoreError::Database(e.to_string())))?;

        self.store.insert_mandate(&mandate).map_err(MandateManagerError::from)?;
        self.ledger
            .record_issuance(
                parent.subject_id,
                mandate.mandate_id,
                params.correlation_id,
                serde_json::json!({"subject_id": params.subject_id, "parent_mandate_id": parent.mandate_id}),
            )
            .map_err(|e| {
                tracing::error!(mandate_id = %mandate.mandate_id, error = %e, "ledger write failed after delegation");
                MandateManagerError::LedgerWriteFailure(e.to_string())
            })?;

        tracing::debug!(mandate_id = %mandate.mandate_id, parent_mandate_id = %parent.mandate_id, "mandate delegated");
        Ok(mandate)
    }

    /// Revokes `mandate_id`. If `cascade` is set, every descendant reachable
    /// via `parent_mandate_id` is revoked too, each with `reason` prefixed
    /// by `cascaded from <mandate_id>` (§4.1). Idempotent: revoking an
    /// already-revoked mandate leaves its stored state unchanged but still
    /// emits a `revoked` ledger event noting the duplicate, so the audit
    /// trail reflects every revoke *call*, not just every state transition.
    pub fn revoke(
        &self,
        mandate_id: Uuid,
        revoked_by: Uuid,
        reason: &str,
        cascade: bool,
    ) -> Result<Vec<ExecutionMandate>, MandateManagerError> {
        let mandate = self
            .store
            .get_mandate(mandate_id)
            .map_err(MandateManagerError::from)?
            .ok_or(MandateManagerError::UnknownParentMandate(mandate_id))?;

        let now = Utc::now();
        let mut revoked = Vec::new();
        self.revoke_one(&mandate, revoked_by, reason, now, &mut revoked)?;
        if cascade {
            self.cascade_children(&mandate, revoked_by, mandate_id, reason, now, &mut revoked)?;
        }
        Ok(revoked)
    }

    /// Revokes descendants of `mandate`, prefixing `reason` with `cascaded
    /// from <root_id>` per §4.1. `root_id` is the mandate the caller
    /// originally targeted, not each child's immediate parent, so every
    /// cascaded event names the revocation that triggered it.
    fn cascade_children(
        &self,
        mandate: &ExecutionMandate,
        revoked_by: Uuid,
        root_id: Uuid,
        reason: &str,
        now: DateTime<Utc>,
        acc: &mut Vec<ExecutionMandate>,
    ) -> Result<(), MandateManagerError> {
        let cascaded_reason = format!("cascaded from {root_id}: {reason}");
        let children = self.store.get_children(mandate.mandate_id).map_err(MandateManagerError::from)?;
        for child in children {
            self.revoke_one(&child, revoked_by, &cascaded_reason, now, acc)?;
            self.cascade_children(&child, revoked_by, root_id, reason, now, acc)?;
        }
        Ok(())
    }

    /// Revokes a single mandate (no recursion into children). If it is
    /// already revoked this is a no-op against the store, but a `revoked`
    /// ledger event is still appended, noting the duplicate call.
    fn revoke_one(
        &self,
        mandate: &ExecutionMandate,
        revoked_by: Uuid,
        reason: &str,
        now: DateTime<Utc>,
        acc: &mut Vec<ExecutionMandate>,
    ) -> Result<(), MandateManagerError> {
        let mut updated = mandate.clone();
        if mandate.revoked {
            self.ledger
                .record_revocation(
                    revoked_by,
                    mandate.mandate_id,
                    reason,
                    None,
                    serde_json::json!({"duplicate": true}),
                )
                .map_err(|e| {
                    tracing::error!(mandate_id = %mandate.mandate_id, error = %e, "ledger write failed recording duplicate revocation");
                    MandateManagerError::LedgerWriteFailure(e.to_string())
                })?;
            tracing::debug!(mandate_id = %mandate.mandate_id, "revoke no-op: already revoked");
        } else {
            self.store
                .mark_revoked(mandate.mandate_id, now, revoked_by, reason)
                .map_err(MandateManagerError::from)?;
            self.ledger
                .record_revocation(revoked_by, mandate.mandate_id, reason, None, serde_json::json!({"duplicate": false}))
                .map_err(|e| {
                    tracing::error!(mandate_id = %mandate.mandate_id, error = %e, "ledger write failed after revocation");
                    MandateManagerError::LedgerWriteFailure(e.to_string())
                })?;
            updated.revoked = true;
            updated.revoked_at = Some(now);
            updated.revocation_reason = Some(reason.to_string());
            updated.revoked_by = Some(revoked_by);
            tracing::warn!(mandate_id = %mandate.mandate_id, revoked_by = %revoked_by, reason, "mandate revoked");
        }
        if let Some(cache) = &self.cache {
            cache.invalidate(mandate.mandate_id);
        }
        acc.push(updated);
        Ok(())
    }
}
