//! Ledger writer: the only path by which rows are added to `ledger_events`.
//! Every write is a single `INSERT`; the ledger never updates or deletes a
//! row once written.

use chrono::{DateTime, Utc};
use rusqlite::params;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::model::{LedgerDecision, LedgerEvent, LedgerEventType};
use crate::store::Store;

/// Writes events onto the ledger, assigning each a monotonically increasing
/// `event_id` (SQLite's `AUTOINCREMENT` rowid).
#[derive(Clone)]
pub struct LedgerWriter {
    store: Store,
}

impl LedgerWriter {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn record_issuance(
        &self,
        principal_id: Uuid,
        mandate_id: Uuid,
        correlation_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<LedgerEvent, LedgerError> {
        self.insert(
            LedgerEventType::Issued,
            principal_id,
            Some(mandate_id),
            None,
            None,
            None,
            None,
            correlation_id,
            metadata,
        )
    }

    /// Records a revocation. `reason` lands in the `denial_reason` slot
    /// (§4.3): the ledger has no separate column for revocation reasons, so
    /// it reuses the one already shaped for "why wasn't this allowed".
    pub fn record_revocation(
        &self,
        principal_id: Uuid,
        mandate_id: Uuid,
        reason: &str,
        correlation_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<LedgerEvent, LedgerError> {
        self.insert(
            LedgerEventType::Revoked,
            principal_id,
            Some(mandate_id),
            None,
            Some(reason.to_string()),
            None,
            None,
            correlation_id,
            metadata,
        )
    }

    /// Records the outcome of a single `validate()` call. `decision` and, for
    /// denials, a non-empty `denial_reason` are required — this is the one
    /// shape constraint the writer enforces before touching the database.
    #[allow(clippy::too_many_arguments)]
    pub fn record_evaluation(
        &self,
        principal_id: Uuid,
        mandate_id: Option<Uuid>,
        decision: LedgerDecision,
        denial_reason: Option<String>,
        requested_action: &str,
        requested_resource: &str,
        correlation_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<LedgerEvent, LedgerError> {
        if matches!(decision, LedgerDecision::Denied) && denial_reason.as_deref().unwrap_or("").is_empty() {
            return Err(LedgerError::MissingDenialReason);
        }
        let event_type = match decision {
            LedgerDecision::Allowed => LedgerEventType::Validated,
            LedgerDecision::Denied => LedgerEventType::Denied,
        };
        self.insert(
            event_type,
            principal_id,
            mandate_id,
            Some(decision),
            denial_reason,
            Some(requested_action.to_string()),
            Some(requested_resource.to_string()),
            correlation_id,
            metadata,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn insert(
        &self,
        event_type: LedgerEventType,
        principal_id: Uuid,
        mandate_id: Option<Uuid>,
        decision: Option<LedgerDecision>,
        denial_reason: Option<String>,
        requested_action: Option<String>,
        requested_resource: Option<String>,
        correlation_id: Option<String>,
        metadata: serde_json::Value,
    ) -> Result<LedgerEvent, LedgerError> {
        let timestamp = Utc::now();
        let conn = self.store.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO ledger_events (
                event_type, timestamp, principal_id, mandate_id, decision,
                denial_reason, requested_action, requested_resource,
                correlation_id, metadata
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10)",
            params![
                event_type_str(event_type),
                timestamp.to_rfc3339(),
                principal_id.to_string(),
                mandate_id.map(|id| id.to_string()),
                decision.map(decision_str),
                denial_reason,
                requested_action,
                requested_resource,
                correlation_id,
                metadata.to_string(),
            ],
        )
        .map_err(|e| LedgerError::Store(e.into()))?;

        let event_id = conn.last_insert_rowid() as u64;
        Ok(LedgerEvent {
            event_id,
            event_type,
            timestamp,
            principal_id,
            mandate_id,
            decision,
            denial_reason,
            requested_action,
            requested_resource,
            correlation_id,
            metadata,
        })
    }
}

pub(crate) fn event_type_str(t: LedgerEventType) -> &'static str {
    match t {
        LedgerEventType::Issued => "issued",
        LedgerEventType::Validated => "validated",
        LedgerEventType::Denied => "denied",
        LedgerEventType::Revoked => "revoked",
    }
}

pub(crate) fn decision_str(d: LedgerDecision) -> &'static str {
    match d {
        LedgerDecision::Allowed => "allowed",
        LedgerDecision::Denied => "denied",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn issuance_assigns_monotonic_ids() {
        let store = Store::memory().unwrap();
        let writer = LedgerWriter::new(store);
        let principal = Uuid::new_v4();
        let e1 = writer
            .record_issuance(principal, Uuid::new_v4(), None, serde_json::json!({}))
            .unwrap();
        let e2 = writer
            .record_issuance(principal, Uuid::new_v4(), None, serde_json::json!({}))
            .unwrap();
        assert!(e2.event_id > e1.event_id);
    }

    #[test]
    fn denial_without_reason_is_rejected() {
        let store = Store::memory().unwrap();
        let writer = LedgerWriter::new(store);
        let result = writer.record_evaluation(
            Uuid::new_v4(),
            None,
            LedgerDecision::Denied,
            None,
            "api_call",
            "api:openai:gpt-4",
            None,
            serde_json::json!({}),
        );
        assert!(matches!(result, Err(LedgerError::MissingDenialReason)));
    }
}
