//! Core data types: principals, execution mandates, ledger events, and
//! Merkle batches.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of entity that can issue, hold, or revoke mandates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrincipalType {
    User,
    Agent,
    Service,
}

/// An entity that can issue, hold, or revoke mandates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Principal {
    pub principal_id: Uuid,
    pub name: String,
    pub principal_type: PrincipalType,
    pub owner: String,
    pub public_key_pem: String,
    /// Present only for principals that may sign (issuers). `None` for
    /// subject-only principals.
    pub private_key_pem: Option<String>,
}

impl Principal {
    /// Whether this principal has a private key and may therefore issue or
    /// delegate mandates.
    pub fn can_sign(&self) -> bool {
        self.private_key_pem.is_some()
    }
}

/// The central credential: a signed, time-bounded, scope-limited grant of
/// authority from an issuer to a subject.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionMandate {
    pub mandate_id: Uuid,
    pub issuer_id: Uuid,
    pub subject_id: Uuid,
    pub valid_from: DateTime<Utc>,
    pub valid_until: DateTime<Utc>,
    pub resource_scope: Vec<String>,
    pub action_scope: Vec<String>,
    pub delegation_depth: u32,
    pub parent_mandate_id: Option<Uuid>,
    pub intent_hash: Option<String>,
    pub signature: String,
    pub revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
    pub revocation_reason: Option<String>,
    pub revoked_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl ExecutionMandate {
    /// The canonical JSON value signed at issuance: every field except
    /// `signature` and the lifecycle fields (`revoked`, `revoked_at`,
    /// `revocation_reason`, `revoked_by`, `created_at`).
    pub fn signed_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "mandate_id": self.mandate_id,
            "issuer_id": self.issuer_id,
            "subject_id": self.subject_id,
            "valid_from": self.valid_from,
            "valid_until": self.valid_until,
            "resource_scope": self.resource_scope,
            "action_scope": self.action_scope,
            "delegation_depth": self.delegation_depth,
            "parent_mandate_id": self.parent_mandate_id,
            "intent_hash": self.intent_hash,
        })
    }

    /// Whether `now` falls within `[valid_from, valid_until]` inclusive.
    pub fn is_time_valid(&self, now: DateTime<Utc>) -> bool {
        now >= self.valid_from && now <= self.valid_until
    }
}

/// Closed set of ledger event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerEventType {
    Issued,
    Validated,
    Denied,
    Revoked,
}

/// Decision recorded on a `validated`/`denied` event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerDecision {
    Allowed,
    Denied,
}

/// A single append-only ledger row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub event_id: u64,
    pub event_type: LedgerEventType,
    pub timestamp: DateTime<Utc>,
    pub principal_id: Uuid,
    pub mandate_id: Option<Uuid>,
    pub decision: Option<LedgerDecision>,
    pub denial_reason: Option<String>,
    pub requested_action: Option<String>,
    pub requested_resource: Option<String>,
    pub correlation_id: Option<String>,
    pub metadata: serde_json::Value,
}

/// A signed Merkle tree over a contiguous range of ledger events.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedMerkleBatch {
    pub batch_id: Uuid,
    pub first_event_id: u64,
    pub last_event_id: u64,
    pub event_count: u64,
    /// 32-byte SHA-256 root, hex-encoded for storage/transport.
    pub root_hex: String,
    pub signature_hex: String,
    pub created_at: DateTime<Utc>,
}

/// The decision returned by the Authority Evaluator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Decision {
    pub allowed: bool,
    pub reason: String,
    pub mandate_id: Option<Uuid>,
    pub principal_id: Option<Uuid>,
    pub requested_action: String,
    pub requested_resource: String,
    pub timestamp: DateTime<Utc>,
}

impl Decision {
    pub fn allow(
        mandate_id: Uuid,
        principal_id: Uuid,
        requested_action: impl Into<String>,
        requested_resource: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: true,
            reason: "valid".to_string(),
            mandate_id: Some(mandate_id),
            principal_id: Some(principal_id),
            requested_action: requested_action.into(),
            requested_resource: requested_resource.into(),
            timestamp: now,
        }
    }

    pub fn deny(
        reason: impl Into<String>,
        mandate_id: Option<Uuid>,
        principal_id: Option<Uuid>,
        requested_action: impl Into<String>,
        requested_resource: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            allowed: false,
            reason: reason.into(),
            mandate_id,
            principal_id,
            requested_action: requested_action.into(),
            requested_resource: requested_resource.into(),
            timestamp: now,
        }
    }
}
