//! Ledger query surface: filtered/ordered reads and native SQL aggregation.
//!
//! Aggregation runs as a `GROUP BY` in SQLite rather than by fetching every
//! row and counting in process — the corpus this crate is built from calls
//! out exactly that anti-pattern, and it gets worse the longer the ledger
//! runs.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::params_from_iter;
use uuid::Uuid;

use crate::error::LedgerError;
use crate::ledger::writer::{decision_str, event_type_str};
use crate::model::{LedgerDecision, LedgerEvent, LedgerEventType};
use crate::store::Store;

/// Combinable filters for [`LedgerQuery::get_events`] (§4.3). `None` fields
/// are unconstrained.
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub principal_id: Option<Uuid>,
    pub mandate_id: Option<Uuid>,
    pub event_type: Option<LedgerEventType>,
    pub decision: Option<LedgerDecision>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

#[derive(Clone)]
pub struct LedgerQuery {
    store: Store,
}

impl LedgerQuery {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Events matching `filter`, ordered by `timestamp` descending (§4.3).
    pub fn get_events(&self, filter: &EventFilter) -> Result<Vec<LedgerEvent>, LedgerError> {
        let mut sql = String::from(
            "SELECT event_id, event_type, timestamp, principal_id, mandate_id, decision,
                    denial_reason, requested_action, requested_resource, correlation_id, metadata
             FROM ledger_events WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(pid) = filter.principal_id {
            sql.push_str(" AND principal_id = ?");
            args.push(Box::new(pid.to_string()));
        }
        if let Some(mid) = filter.mandate_id {
            sql.push_str(" AND mandate_id = ?");
            args.push(Box::new(mid.to_string()));
        }
        if let Some(et) = filter.event_type {
            sql.push_str(" AND event_type = ?");
            args.push(Box::new(event_type_str(et)));
        }
        if let Some(decision) = filter.decision {
            sql.push_str(" AND decision = ?");
            args.push(Box::new(decision_str(decision)));
        }
        if let Some(start) = filter.start_time {
            sql.push_str(" AND timestamp >= ?");
            args.push(Box::new(start.to_rfc3339()));
        }
        if let Some(end) = filter.end_time {
            sql.push_str(" AND timestamp <= ?");
            args.push(Box::new(end.to_rfc3339()));
        }
        sql.push_str(" ORDER BY timestamp DESC, event_id DESC");
        if let Some(limit) = filter.limit {
            sql.push_str(" LIMIT ?");
            args.push(Box::new(limit));
        }

        let conn = self.store.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql).map_err(|e| LedgerError::Store(e.into()))?;
        let rows = stmt
            .query_map(params_from_iter(args.iter().map(|b| b.as_ref())), row_to_event)
            .map_err(|e| LedgerError::Store(e.into()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::Store(e.into()))?;
        Ok(rows)
    }

    /// Per-principal event counts within `[start_time, end_time]`, optionally
    /// narrowed to one `event_type`, as a single native `GROUP BY` (§4.3) —
    /// never a fetch-then-count over materialized rows.
    pub fn aggregate_by_principal(
        &self,
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        event_type: Option<LedgerEventType>,
    ) -> Result<HashMap<Uuid, u64>, LedgerError> {
        let conn = self.store.conn.lock().unwrap();
        let mut sql = String::from(
            "SELECT principal_id, COUNT(*) FROM ledger_events WHERE timestamp >= ?1 AND timestamp <= ?2",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> =
            vec![Box::new(start_time.to_rfc3339()), Box::new(end_time.to_rfc3339())];
        if let Some(et) = event_type {
            sql.push_str(" AND event_type = ?3");
            args.push(Box::new(event_type_str(et)));
        }
        sql.push_str(" GROUP BY principal_id");

        let mut stmt = conn.prepare(&sql).map_err(|e| LedgerError::Store(e.into()))?;
        let raw = stmt
            .query_map(params_from_iter(args.iter().map(|b| b.as_ref())), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })
            .map_err(|e| LedgerError::Store(e.into()))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| LedgerError::Store(e.into()))?;

        raw.into_iter()
            .map(|(pid, count)| {
                Uuid::parse_str(&pid)
                    .map(|id| (id, count as u64))
                    .map_err(|e| LedgerError::Store(rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text).into()))
            })
            .collect()
    }
}

fn parse_event_type(s: &str) -> Result<LedgerEventType, rusqlite::Error> {
    match s {
        "issued" => Ok(LedgerEventType::Issued),
        "validated" => Ok(LedgerEventType::Validated),
        "denied" => Ok(LedgerEventType::Denied),
        "revoked" => Ok(LedgerEventType::Revoked),
        other => Err(rusqlite::Error::InvalidColumnType(
            1,
            format!("unknown event_type {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn parse_decision(s: &str) -> Result<LedgerDecision, rusqlite::Error> {
    match s {
        "allowed" => Ok(LedgerDecision::Allowed),
        "denied" => Ok(LedgerDecision::Denied),
        other => Err(rusqlite::Error::InvalidColumnType(
            5,
            format!("unknown decision {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn row_to_event(row: &rusqlite::Row<'_>) -> rusqlite::Result<LedgerEvent> {
    let event_id: i64 = row.get(0)?;
    let event_type: String = row.get(1)?;
    let timestamp: String = row.get(2)?;
    let principal_id: String = row.get(3)?;
    let mandate_id: Option<String> = row.get(4)?;
    let decision: Option<String> = row.get(5)?;
    let denial_reason: Option<String> = row.get(6)?;
    let requested_action: Option<String> = row.get(7)?;
    let requested_resource: Option<String> = row.get(8)?;
    let correlation_id: Option<String> = row.get(9)?;
    let metadata: String = row.get(10)?;

    Ok(LedgerEvent {
        event_id: event_id as u64,
        event_type: parse_event_type(&event_type)?,
        timestamp: chrono::DateTime::parse_from_rfc3339(&timestamp)
            .map(|t| t.with_timezone(&chrono::Utc))
            .map_err(|e| rusqlite::Error::InvalidColumnType(2, e.to_string(), rusqlite::types::Type::Text))?,
        principal_id: Uuid::parse_str(&principal_id)
            .map_err(|e| rusqlite::Error::InvalidColumnType(3, e.to_string(), rusqlite::types::Type::Text))?,
        mandate_id: mandate_id
            .map(|s| Uuid::parse_str(&s))
            .transpose()
            .map_err(|e| rusqlite::Error::InvalidColumnType(4, e.to_string(), rusqlite::types::Type::Text))?,
        decision: decision.map(|s| parse_decision(&s)).transpose()?,
        denial_reason,
        requested_action,
        requested_resource,
        correlation_id,
        metadata: serde_json::from_str(&metadata).unwrap_or(serde_json::Value::Null),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::writer::LedgerWriter;
    use crate::model::LedgerDecision;

    #[test]
    fn filters_by_principal_and_type() {
        let store = Store::memory().unwrap();
        let writer = LedgerWriter::new(store.clone());
        let query = LedgerQuery::new(store);

        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        writer.record_issuance(p1, Uuid::new_v4(), None, serde_json::json!({})).unwrap();
        writer
            .record_evaluation(p1, None, LedgerDecision::Denied, Some("expired".into()), "a", "r", None, serde_json::json!({}))
            .unwrap();
        writer.record_issuance(p2, Uuid::new_v4(), None, serde_json::json!({})).unwrap();

        let events = query
            .get_events(&EventFilter {
                principal_id: Some(p1),
                event_type: Some(LedgerEventType::Issued),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].principal_id, p1);
    }

    #[test]
    fn aggregate_groups_by_principal_within_time_range() {
        let store = Store::memory().unwrap();
        let writer = LedgerWriter::new(store.clone());
        let query = LedgerQuery::new(store);

        let p1 = Uuid::new_v4();
        let p2 = Uuid::new_v4();
        writer.record_issuance(p1, Uuid::new_v4(), None, serde_json::json!({})).unwrap();
        writer.record_issuance(p1, Uuid::new_v4(), None, serde_json::json!({})).unwrap();
        writer.record_issuance(p2, Uuid::new_v4(), None, serde_json::json!({})).unwrap();

        let start = Utc::now() - chrono::Duration::hours(1);
        let end = Utc::now() + chrono::Duration::hours(1);
        let counts = query.aggregate_by_principal(start, end, Some(LedgerEventType::Issued)).unwrap();
        assert_eq!(counts.get(&p1), Some(&2));
        assert_eq!(counts.get(&p2), Some(&1));
    }

    #[test]
    fn aggregate_excludes_events_outside_time_range() {
        let store = Store::memory().unwrap();
        let writer = LedgerWriter::new(store.clone());
        let query = LedgerQuery::new(store);

        let p1 = Uuid::new_v4();
        writer.record_issuance(p1, Uuid::new_v4(), None, serde_json::json!({})).unwrap();

        let long_ago_start = Utc::now() - chrono::Duration::days(10);
        let long_ago_end = Utc::now() - chrono::Duration::days(9);
        let counts = query.aggregate_by_principal(long_ago_start, long_ago_end, None).unwrap();
        assert!(counts.is_empty());
    }

    #[test]
    fn events_ordered_by_timestamp_descending() {
        let store = Store::memory().unwrap();
        let writer = LedgerWriter::new(store.clone());
        let query = LedgerQuery::new(store);

        let p1 = Uuid::new_v4();
        let first = writer.record_issuance(p1, Uuid::new_v4(), None, serde_json::json!({})).unwrap();
        let second = writer.record_issuance(p1, Uuid::new_v4(), None, serde_json::json!({})).unwrap();

        let events = query.get_events(&EventFilter::default()).unwrap();
        assert_eq!(events[0].event_id, second.event_id);
        assert_eq!(events[1].event_id, first.event_id);
    }
}
