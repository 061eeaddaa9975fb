//! SQLite-backed persistence for principals and mandates.
//!
//! Follows the same connection-ownership idiom as the evaluated codebase's
//! mandate store: a single `Arc<Mutex<Connection>>`, WAL mode, a foreign-key
//! pragma, and a bounded busy-timeout so concurrent writers serialize
//! instead of failing outright.

use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{ExecutionMandate, Principal, PrincipalType};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),
    #[error("malformed row in {table}: {detail}")]
    MalformedRow { table: &'static str, detail: String },
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}

pub(crate) const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS principals (
    principal_id TEXT PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    principal_type TEXT NOT NULL,
    owner TEXT NOT NULL,
    public_key_pem TEXT NOT NULL,
    private_key_pem TEXT
);

CREATE TABLE IF NOT EXISTS mandates (
    mandate_id TEXT PRIMARY KEY,
    issuer_id TEXT NOT NULL REFERENCES principals(principal_id),
    subject_id TEXT NOT NULL REFERENCES principals(principal_id),
    valid_from TEXT NOT NULL,
    valid_until TEXT NOT NULL,
    resource_scope TEXT NOT NULL,
    action_scope TEXT NOT NULL,
    delegation_depth INTEGER NOT NULL,
    parent_mandate_id TEXT REFERENCES mandates(mandate_id),
    intent_hash TEXT,
    signature TEXT NOT NULL,
    revoked INTEGER NOT NULL DEFAULT 0,
    revoked_at TEXT,
    revocation_reason TEXT,
    revoked_by TEXT,
    created_at TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_mandates_parent ON mandates(parent_mandate_id);

CREATE TABLE IF NOT EXISTS ledger_events (
    event_id INTEGER PRIMARY KEY AUTOINCREMENT,
    event_type TEXT NOT NULL,
    timestamp TEXT NOT NULL,
    principal_id TEXT NOT NULL,
    mandate_id TEXT,
    decision TEXT,
    denial_reason TEXT,
    requested_action TEXT,
    requested_resource TEXT,
    correlation_id TEXT,
    metadata TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_ledger_principal ON ledger_events(principal_id);
CREATE INDEX IF NOT EXISTS idx_ledger_mandate ON ledger_events(mandate_id);
CREATE INDEX IF NOT EXISTS idx_ledger_type ON ledger_events(event_type);
CREATE INDEX IF NOT EXISTS idx_ledger_timestamp ON ledger_events(timestamp);

CREATE TABLE IF NOT EXISTS merkle_batches (
    batch_id TEXT PRIMARY KEY,
    first_event_id INTEGER NOT NULL,
    last_event_id INTEGER NOT NULL,
    event_count INTEGER NOT NULL,
    root_hex TEXT NOT NULL,
    signature_hex TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

/// Shared SQLite-backed store for principals, mandates, ledger events, and
/// Merkle batches. Cloning shares the same underlying connection.
#[derive(Clone)]
pub struct Store {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl Store {
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        let _ = conn.execute("PRAGMA journal_mode = WAL", []);
        let _ = conn.execute("PRAGMA busy_timeout = 5000", []);
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // -- Principals ----------------------------------------------------

    pub fn insert_principal(&self, principal: &Principal) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO principals (principal_id, name, principal_type, owner, public_key_pem, private_key_pem)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                principal.principal_id.to_string(),
                principal.name,
                principal_type_str(principal.principal_type),
                principal.owner,
                principal.public_key_pem,
                principal.private_key_pem,
            ],
        )?;
        Ok(())
    }

    pub fn get_principal(&self, principal_id: Uuid) -> Result<Option<Principal>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT principal_id, name, principal_type, owner, public_key_pem, private_key_pem
             FROM principals WHERE principal_id = ?1",
            params![principal_id.to_string()],
            row_to_principal,
        )
        .optional()
        .map_err(StoreError::from)
    }

    // -- Mandates --------------------------------------------------------

    pub fn insert_mandate(&self, mandate: &ExecutionMandate) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO mandates (
                mandate_id, issuer_id, subject_id, valid_from, valid_until,
                resource_scope, action_scope, delegation_depth, parent_mandate_id,
                intent_hash, signature, revoked, revoked_at, revocation_reason,
                revoked_by, created_at
            ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15,?16)",
            params![
                mandate.mandate_id.to_string(),
                mandate.issuer_id.to_string(),
                mandate.subject_id.to_string(),
                mandate.valid_from.to_rfc3339(),
                mandate.valid_until.to_rfc3339(),
                serde_json::to_string(&mandate.resource_scope).unwrap(),
                serde_json::to_string(&mandate.action_scope).unwrap(),
                mandate.delegation_depth,
                mandate.parent_mandate_id.map(|id| id.to_string()),
                mandate.intent_hash,
                mandate.signature,
                mandate.revoked as i64,
                mandate.revoked_at.map(|t| t.to_rfc3339()),
                mandate.revocation_reason,
                mandate.revoked_by.map(|id| id.to_string()),
                mandate.created_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn get_mandate(&self, mandate_id: Uuid) -> Result<Option<ExecutionMandate>, StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT mandate_id, issuer_id, subject_id, valid_from, valid_until,
                    resource_scope, action_scope, delegation_depth, parent_mandate_id,
                    intent_hash, signature, revoked, revoked_at, revocation_reason,
                    revoked_by, created_at
             FROM mandates WHERE mandate_id = ?1",
            params![mandate_id.to_string()],
            row_to_mandate,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Direct children (`parent_mandate_id = mandate_id`), used by cascade revoke.
    pub fn get_children(&self, mandate_id: Uuid) -> Result<Vec<ExecutionMandate>, StoreError> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT mandate_id, issuer_id, subject_id, valid_from, valid_until,
                    resource_scope, action_scope, delegation_depth, parent_mandate_id,
                    intent_hash, signature, revoked, revoked_at, revocation_reason,
                    revoked_by, created_at
             FROM mandates WHERE parent_mandate_id = ?1",
        )?;
        let rows = stmt
            .query_map(params![mandate_id.to_string()], row_to_mandate)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Marks a mandate revoked in place. Idempotent: re-applying to an
    /// already-revoked mandate is a no-op at the storage layer (the caller
    /// still emits a ledger event noting the duplicate).
    pub fn mark_revoked(
        &self,
        mandate_id: Uuid,
        revoked_at: DateTime<Utc>,
        revoked_by: Uuid,
        reason: &str,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE mandates SET revoked = 1, revoked_at = ?2, revoked_by = ?3, revocation_reason = ?4
             WHERE mandate_id = ?1 AND revoked = 0",
            params![
                mandate_id.to_string(),
                revoked_at.to_rfc3339(),
                revoked_by.to_string(),
                reason,
            ],
        )?;
        Ok(())
    }

    /// Runs an arbitrary statement against the underlying connection.
    ///
    /// Not part of the enforcement API; exists so integration tests can
    /// force storage states (tampered rows, backdated windows) that no
    /// legitimate caller can produce through `Store`'s other methods.
    #[doc(hidden)]
    pub fn exec_raw(&self, sql: &str, params: &[&dyn rusqlite::types::ToSql]) -> Result<usize, StoreError> {
        let conn = self.conn.lock().unwrap();
        Ok(conn.execute(sql, params)?)
    }
}

fn principal_type_str(t: PrincipalType) -> &'static str {
    match t {
        PrincipalType::User => "user",
        PrincipalType::Agent => "agent",
        PrincipalType::Service => "service",
    }
}

fn parse_principal_type(s: &str) -> Result<PrincipalType, rusqlite::Error> {
    match s {
        "user" => Ok(PrincipalType::User),
        "agent" => Ok(PrincipalType::Agent),
        "service" => Ok(PrincipalType::Service),
        other => Err(rusqlite::Error::InvalidColumnType(
            2,
            format!("unknown principal_type {other}"),
            rusqlite::types::Type::Text,
        )),
    }
}

fn row_to_principal(row: &rusqlite::Row<'_>) -> rusqlite::Result<Principal> {
    let id_str: String = row.get(0)?;
    let type_str: String = row.get(2)?;
    Ok(Principal {
        principal_id: Uuid::parse_str(&id_str)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))?,
        name: row.get(1)?,
        principal_type: parse_principal_type(&type_str)?,
        owner: row.get(3)?,
        public_key_pem: row.get(4)?,
        private_key_pem: row.get(5)?,
    })
}

fn row_to_mandate(row: &rusqlite::Row<'_>) -> rusqlite::Result<ExecutionMandate> {
    let parse_uuid = |s: String| -> rusqlite::Result<Uuid> {
        Uuid::parse_str(&s)
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
    };
    let parse_time = |s: String| -> rusqlite::Result<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| rusqlite::Error::InvalidColumnType(0, e.to_string(), rusqlite::types::Type::Text))
    };

    let mandate_id: String = row.get(0)?;
    let issuer_id: String = row.get(1)?;
    let subject_id: String = row.get(2)?;
    let valid_from: String = row.get(3)?;
    let valid_until: String = row.get(4)?;
    let resource_scope: String = row.get(5)?;
    let action_scope: String = row.get(6)?;
    let delegation_depth: u32 = row.get(7)?;
    let parent_mandate_id: Option<String> = row.get(8)?;
    let intent_hash: Option<String> = row.get(9)?;
    let signature: String = row.get(10)?;
    let revoked: i64 = row.get(11)?;
    let revoked_at: Option<String> = row.get(12)?;
    let revocation_reason: Option<String> = row.get(13)?;
    let revoked_by: Option<String> = row.get(14)?;
    let created_at: String = row.get(15)?;

    Ok(ExecutionMandate {
        mandate_id: parse_uuid(mandate_id)?,
        issuer_id: parse_uuid(issuer_id)?,
        subject_id: parse_uuid(subject_id)?,
        valid_from: parse_time(valid_from)?,
        valid_until: parse_time(valid_until)?,
        resource_scope: serde_json::from_str(&resource_scope).unwrap_or_default(),
        action_scope: serde_json::from_str(&action_scope).unwrap_or_default(),
        delegation_depth,
        parent_mandate_id: parent_mandate_id.map(parse_uuid).transpose()?,
        intent_hash,
        signature,
        revoked: revoked != 0,
        revoked_at: revoked_at.map(parse_time).transpose()?,
        revocation_reason,
        revoked_by: revoked_by.map(parse_uuid).transpose()?,
        created_at: parse_time(created_at)?,
    })
}
