//! Error taxonomy (§7): tagged variants per category rather than a single
//! stringly-typed error, and an exhaustive mapping from evaluator denials to
//! stable machine codes for the gateway surface (§4.4).

use thiserror::Error;
use uuid::Uuid;

/// Closed set of reasons the Authority Evaluator may deny a request.
/// Replaces the source's free-text `reason` string + substring-sniffed
/// error-code mapping with an exhaustive tagged enum (§9 "tagged variants
/// over inheritance").
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    NoMandateProvided,
    MandateNotFound,
    MandateRevoked { revocation_reason: Option<String> },
    NotYetValid,
    Expired,
    IssuerUnknown,
    IssuerNoKey,
    SignatureVerificationFailed,
    ActionNotInScope,
    ResourceNotInScope,
    DelegationChainInvalid,
    LedgerUnavailable,
    TimeoutExceeded,
}

impl DenialReason {
    /// The stable machine code surfaced by the gateway (§4.4).
    pub fn code(&self) -> &'static str {
        match self {
            DenialReason::NoMandateProvided => "MANDATE_NOT_PROVIDED",
            DenialReason::MandateNotFound => "MANDATE_NOT_FOUND",
            DenialReason::MandateRevoked { .. } => "MANDATE_REVOKED",
            DenialReason::NotYetValid => "MANDATE_NOT_YET_VALID",
            DenialReason::Expired => "MANDATE_EXPIRED",
            DenialReason::IssuerUnknown | DenialReason::IssuerNoKey => {
                "MANDATE_VALIDATION_FAILED"
            }
            DenialReason::SignatureVerificationFailed => "MANDATE_INVALID_SIGNATURE",
            DenialReason::ActionNotInScope => "ACTION_NOT_IN_SCOPE",
            DenialReason::ResourceNotInScope => "RESOURCE_NOT_IN_SCOPE",
            DenialReason::DelegationChainInvalid => "DELEGATION_CHAIN_INVALID",
            DenialReason::LedgerUnavailable => "MANDATE_VALIDATION_FAILED",
            DenialReason::TimeoutExceeded => "MANDATE_VALIDATION_FAILED",
        }
    }

    /// Human-readable reason string, as recorded on the ledger event and in
    /// the `Decision`. Kept short; detail stays in logs, not in this string.
    pub fn message(&self) -> String {
        match self {
            DenialReason::NoMandateProvided => "no_mandate_provided".to_string(),
            DenialReason::MandateNotFound => "mandate_not_found".to_string(),
            DenialReason::MandateRevoked {
                revocation_reason: Some(r),
            } => format!("mandate_revoked: {r}"),
            DenialReason::MandateRevoked {
                revocation_reason: None,
            } => "mandate_revoked".to_string(),
            DenialReason::NotYetValid => "not_yet_valid".to_string(),
            DenialReason::Expired => "expired".to_string(),
            DenialReason::IssuerUnknown => "issuer_unknown".to_string(),
            DenialReason::IssuerNoKey => "issuer_no_key".to_string(),
            DenialReason::SignatureVerificationFailed => {
                "signature_verification_failed".to_string()
            }
            DenialReason::ActionNotInScope => "action_not_in_scope".to_string(),
            DenialReason::ResourceNotInScope => "resource_not_in_scope".to_string(),
            DenialReason::DelegationChainInvalid => "delegation_chain_invalid".to_string(),
            DenialReason::LedgerUnavailable => "ledger_unavailable".to_string(),
            DenialReason::TimeoutExceeded => "timeout_exceeded".to_string(),
        }
    }
}

/// Errors from Mandate Manager write paths (issue/delegate/revoke). Every
/// variant here is surfaced to the caller; none of these widen access.
#[derive(Debug, Error)]
pub enum MandateManagerError {
    #[error("unknown principal: {0}")]
    UnknownPrincipal(Uuid),
    #[error("principal {0} has no private signing key")]
    PrincipalCannotSign(Uuid),
    #[error("unknown parent mandate: {0}")]
    UnknownParentMandate(Uuid),
    #[error("parent mandate {0} is revoked")]
    ParentRevoked(Uuid),
    #[error("parent mandate {0} is outside its validity window")]
    ParentExpired(Uuid),
    #[error("child scope is not a subset of the parent's scope")]
    ScopeNotSubset,
    #[error("child validity window is not contained in the parent's")]
    ValidityOutsideParent,
    #[error("delegation depth {depth} would exceed the configured maximum {max}")]
    DelegationDepthExceeded { depth: u32, max: u32 },
    #[error("invalid scope pattern or empty scope list")]
    InvalidScopeSyntax,
    #[error("validity_seconds must be positive, got {0}")]
    InvalidValiditySeconds(i64),
    #[error("ledger write failed after mandate persistence: {0}")]
    LedgerWriteFailure(String),
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Errors from the Authority Ledger writer/query surface.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("denial_reason must be non-empty when decision=denied")]
    MissingDenialReason,
    #[error("store error: {0}")]
    Store(#[from] crate::store::StoreError),
}

/// Errors surfaced by the gateway surface above the evaluator (§4.4).
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("authority denied: {0}")]
    Denied(String),
    #[error("downstream call failed: {0}")]
    ForwardFailed(String),
}
