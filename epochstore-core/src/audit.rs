//! Audit sink (C7): append-only update and access history.
//!
//! Writes go through a connection opened independently of the caller's main
//! transaction, *after* that transaction has already committed, so that
//! (a) an audit failure never rolls back the user's change, (b) the main
//! connection is released to the pool promptly, and (c) concurrent readers
//! are not blocked by the audit write. A failed audit write is logged via
//! `tracing::warn!` and swallowed — it is never surfaced to the CRUD caller.

use crate::error::CallerSite;
use crate::pool::ConnectionPool;

/// DDL for both audit tables.
pub const AUDIT_SCHEMA_DDL: &str = "
    CREATE TABLE IF NOT EXISTS update_history (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_key    TEXT    NOT NULL,
        type_name     TEXT    NOT NULL,
        event_kind    TEXT    NOT NULL CHECK (event_kind IN ('insert', 'update', 'delete')),
        old_version   INTEGER,
        new_version   INTEGER,
        payload_size  INTEGER NOT NULL DEFAULT 0,
        caller_file   TEXT    NOT NULL,
        caller_member TEXT    NOT NULL,
        caller_line   INTEGER NOT NULL,
        occurred_at   INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS access_history (
        id            INTEGER PRIMARY KEY AUTOINCREMENT,
        entity_key    TEXT    NOT NULL,
        type_name     TEXT    NOT NULL,
        event_kind    TEXT    NOT NULL CHECK (event_kind IN ('get', 'exists')),
        hit           INTEGER NOT NULL,
        version       INTEGER,
        caller_file   TEXT    NOT NULL,
        caller_member TEXT    NOT NULL,
        caller_line   INTEGER NOT NULL,
        elapsed_micros INTEGER NOT NULL,
        occurred_at   INTEGER NOT NULL
    );
";

/// One of the three write events audited by `update_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateEventKind {
    Insert,
    Update,
    Delete,
}

impl UpdateEventKind {
    fn as_db_str(self) -> &'static str {
        match self {
            UpdateEventKind::Insert => "insert",
            UpdateEventKind::Update => "update",
            UpdateEventKind::Delete => "delete",
        }
    }
}

/// One recorded write, ready to be appended to `update_history`.
#[derive(Debug, Clone)]
pub struct UpdateEvent {
    pub entity_key: String,
    pub type_name: &'static str,
    pub kind: UpdateEventKind,
    pub old_version: Option<u64>,
    pub new_version: Option<u64>,
    pub payload_size: usize,
    pub caller: CallerSite,
    pub occurred_at: i64,
}

/// One recorded read, ready to be appended to `access_history`.
#[derive(Debug, Clone)]
pub struct AccessEvent {
    pub entity_key: String,
    pub type_name: &'static str,
    pub kind: AccessEventKind,
    pub hit: bool,
    pub version: Option<u64>,
    pub caller: CallerSite,
    pub elapsed: std::time::Duration,
    pub occurred_at: i64,
}

/// One of the two read events audited by `access_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessEventKind {
    Get,
    Exists,
}

impl AccessEventKind {
    fn as_db_str(self) -> &'static str {
        match self {
            AccessEventKind::Get => "get",
            AccessEventKind::Exists => "exists",
        }
    }
}

/// Append-only writer for both audit tables, operating on its own connection
/// drawn from the pool's side-connection path.
pub struct AuditSink {
    pool: std::sync::Arc<ConnectionPool>,
}

impl AuditSink {
    pub fn new(pool: std::sync::Arc<ConnectionPool>) -> Self {
        AuditSink { pool }
    }

    /// Appends an update-history row. Failures are logged and swallowed.
    pub async fn record_update(&self, event: UpdateEvent) {
        if let Err(e) = self.try_record_update(&event).await {
            tracing::warn!(
                error = %e,
                key = %event.entity_key,
                type_name = event.type_name,
                "audit update_history write failed; continuing without it"
            );
        }
    }

    async fn try_record_update(&self, event: &UpdateEvent) -> crate::error::Result<()> {
        let conn = self
            .pool
            .open_side_connection()
            .await?;
        let event = event.clone();
        conn.call(move |db| {
            db.execute(
                "INSERT INTO update_history
                    (entity_key, type_name, event_kind, old_version, new_version,
                     payload_size, caller_file, caller_member, caller_line, occurred_at)
                 VALUES (:key, :type_name, :kind, :old_version, :new_version,
                         :payload_size, :caller_file, :caller_member, :caller_line, :occurred_at)",
                rusqlite::named_params! {
                    ":key": event.entity_key,
                    ":type_name": event.type_name,
                    ":kind": event.kind.as_db_str(),
                    ":old_version": event.old_version.map(|v| v as i64),
                    ":new_version": event.new_version.map(|v| v as i64),
                    ":payload_size": event.payload_size as i64,
                    ":caller_file": event.caller.file,
                    ":caller_member": event.caller.member,
                    ":caller_line": event.caller.line,
                    ":occurred_at": event.occurred_at,
                },
            )?;
            Ok(())
        })
        .await
        .map_err(|e| crate::error::Error::connection("audit_update", e))
    }

    /// Appends an access-history row. Failures are logged and swallowed.
    pub async fn record_access(&self, event: AccessEvent) {
        if let Err(e) = self.try_record_access(&event).await {
            tracing::warn!(
                error = %e,
                key = %event.entity_key,
                type_name = event.type_name,
                "audit access_history write failed; continuing without it"
            );
        }
    }

    async fn try_record_access(&self, event: &AccessEvent) -> crate::error::Result<()> {
        let conn = self.pool.open_side_connection().await?;
        let event = event.clone();
        conn.call(move |db| {
            db.execute(
                "INSERT INTO access_history
                    (entity_key, type_name, event_kind, hit, version,
                     caller_file, caller_member, caller_line, elapsed_micros, occurred_at)
                 VALUES (:key, :type_name, :kind, :hit, :version,
                         :caller_file, :caller_member, :caller_line, :elapsed_micros, :occurred_at)",
                rusqlite::named_params! {
                    ":key": event.entity_key,
                    ":type_name": event.type_name,
                    ":kind": event.kind.as_db_str(),
                    ":hit": event.hit as i64,
                    ":version": event.version.map(|v| v as i64),
                    ":caller_file": event.caller.file,
                    ":caller_member": event.caller.member,
                    ":caller_line": event.caller.line,
                    ":elapsed_micros": event.elapsed.as_micros() as i64,
                    ":occurred_at": event.occurred_at,
                },
            )?;
            Ok(())
        })
        .await
        .map_err(|e| crate::error::Error::connection("audit_access", e))
    }
}
