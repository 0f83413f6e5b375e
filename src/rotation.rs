//! Append-only audit log of key registry changes.
//!
//! Every registration, primary switch, and retirement appends one event.
//! Entries are never reordered, mutated, or deleted.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Result, VaultError};

/// Which registry mutation produced an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    Registered,
    PrimaryChanged,
    Retired,
}

impl RotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationKind::Registered => "registered",
            RotationKind::PrimaryChanged => "primary_changed",
            RotationKind::Retired => "retired",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "registered" => Some(RotationKind::Registered),
            "primary_changed" => Some(RotationKind::PrimaryChanged),
            "retired" => Some(RotationKind::Retired),
            _ => None,
        }
    }
}

/// One audit entry.
///
/// For a primary switch, `old_version` is the demoted version (None on the
/// first switch). For registration and retirement it is None.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotationEvent {
    pub kind: RotationKind,
    pub old_version: Option<u32>,
    pub new_version: u32,
    pub at: DateTime<Utc>,
    pub operator: String,
}

impl RotationEvent {
    pub fn now(
        kind: RotationKind,
        old_version: Option<u32>,
        new_version: u32,
        operator: &str,
    ) -> Self {
        Self {
            kind,
            old_version,
            new_version,
            at: Utc::now(),
            operator: operator.to_string(),
        }
    }
}

/// Durable, queryable audit trail for registry mutations.
pub trait RotationLog: Send + Sync {
    /// Append one event. Never reorders or mutates prior entries.
    fn append(&self, event: &RotationEvent) -> Result<()>;

    /// All events at or after `since`, in append order.
    fn list(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RotationEvent>>;
}

// ============================================================================
// MemoryRotationLog
// ============================================================================

/// In-memory log for tests and embedders that handle durability themselves.
#[derive(Default)]
pub struct MemoryRotationLog {
    events: Mutex<Vec<RotationEvent>>,
}

impl MemoryRotationLog {
    pub fn new() -> Self {
        Self::default()
    }
}

impl RotationLog for MemoryRotationLog {
    fn append(&self, event: &RotationEvent) -> Result<()> {
        self.events.lock().push(event.clone());
        Ok(())
    }

    fn list(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RotationEvent>> {
        let events = self.events.lock();
        Ok(events
            .iter()
            .filter(|e| since.map_or(true, |s| e.at >= s))
            .cloned()
            .collect())
    }
}

// ============================================================================
// SqliteRotationLog
// ============================================================================

/// SQLite-backed log. Insert-only; reads are ordered by insertion sequence so
/// the log order matches call order even for same-microsecond events.
pub struct SqliteRotationLog {
    conn: Mutex<Connection>,
}

impl SqliteRotationLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS rotation_log (
                seq         INTEGER PRIMARY KEY AUTOINCREMENT,
                kind        TEXT NOT NULL,
                old_version INTEGER,
                new_version INTEGER NOT NULL,
                at_micros   INTEGER NOT NULL,
                operator    TEXT NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

impl RotationLog for SqliteRotationLog {
    fn append(&self, event: &RotationEvent) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO rotation_log (kind, old_version, new_version, at_micros, operator)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                event.kind.as_str(),
                event.old_version,
                event.new_version,
                event.at.timestamp_micros(),
                event.operator,
            ],
        )?;
        Ok(())
    }

    fn list(&self, since: Option<DateTime<Utc>>) -> Result<Vec<RotationEvent>> {
        let since_micros = since.map(|s| s.timestamp_micros());
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT kind, old_version, new_version, at_micros, operator FROM rotation_log
             WHERE ?1 IS NULL OR at_micros >= ?1
             ORDER BY seq ASC",
        )?;
        let rows = stmt.query_map(params![since_micros], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<u32>>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, i64>(3)?,
                row.get::<_, String>(4)?,
            ))
        })?;

        let mut events = Vec::new();
        for row in rows {
            let (kind, old_version, new_version, at_micros, operator) = row?;
            let kind = RotationKind::parse(&kind)
                .ok_or_else(|| VaultError::Storage(format!("unknown rotation kind: {kind}")))?;
            let at = DateTime::from_timestamp_micros(at_micros).ok_or_else(|| {
                VaultError::Storage(format!("rotation timestamp out of range: {at_micros}"))
            })?;
            events.push(RotationEvent {
                kind,
                old_version,
                new_version,
                at,
                operator,
            });
        }
        Ok(events)
    }
}
