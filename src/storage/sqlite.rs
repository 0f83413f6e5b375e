//! SQLite-backed record store.
//!
//! Each protected field persists as one version-tag column (queryable, so
//! migration fetches and the version distribution never decode blobs) plus
//! one self-contained value blob. One short transaction per migration batch
//! covers the row rewrites and the cursor upsert, so a concurrent reader
//! observes each row fully-old or fully-new, never a mixed
//! ciphertext/version pairing, and no lock ever spans batches.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::DateTime;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use veil_crypto::EncryptedValue;

use crate::error::{Result, VaultError};
use crate::migrate::{MigrationCursor, MigrationStatus, Partition};

use super::traits::{ProtectedRecord, RecordStore};

pub struct SqliteStore {
    collection: String,
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>, collection: impl Into<String>) -> Result<Self> {
        Self::from_connection(Connection::open(path)?, collection)
    }

    pub fn open_in_memory(collection: impl Into<String>) -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, collection)
    }

    fn from_connection(conn: Connection, collection: impl Into<String>) -> Result<Self> {
        // journal_mode returns a row, so it cannot go through execute_batch
        conn.query_row("PRAGMA journal_mode = WAL", [], |_row| Ok(()))?;
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS protected_fields (
                 id          INTEGER PRIMARY KEY,
                 key_version INTEGER NOT NULL,
                 value       BLOB NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_protected_fields_version
                 ON protected_fields (key_version);
             CREATE TABLE IF NOT EXISTS migration_cursors (
                 target_version    INTEGER NOT NULL,
                 partition_start   INTEGER NOT NULL,
                 partition_end     INTEGER NOT NULL,
                 batch_size        INTEGER NOT NULL,
                 last_id           INTEGER,
                 status            TEXT NOT NULL,
                 updated_at_micros INTEGER NOT NULL,
                 PRIMARY KEY (target_version, partition_start, partition_end)
             );",
        )?;
        Ok(Self {
            collection: collection.into(),
            conn: Mutex::new(conn),
        })
    }

    /// Decode a value blob and cross-check it against the version column.
    fn decode_row(id: i64, key_version: u32, blob: &[u8]) -> Result<EncryptedValue> {
        let value = EncryptedValue::from_bytes(blob)?;
        if value.key_version != key_version {
            return Err(VaultError::Storage(format!(
                "record {id}: version tag {key_version} does not match value blob version {}",
                value.key_version
            )));
        }
        Ok(value)
    }

    fn upsert_cursor(conn: &Connection, cursor: &MigrationCursor) -> Result<()> {
        conn.execute(
            "INSERT INTO migration_cursors
                 (target_version, partition_start, partition_end,
                  batch_size, last_id, status, updated_at_micros)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
             ON CONFLICT (target_version, partition_start, partition_end)
             DO UPDATE SET batch_size = excluded.batch_size,
                           last_id = excluded.last_id,
                           status = excluded.status,
                           updated_at_micros = excluded.updated_at_micros",
            params![
                cursor.target_version,
                cursor.partition.start,
                cursor.partition.end,
                cursor.batch_size as i64,
                cursor.last_id,
                cursor.status.as_str(),
                cursor.updated_at.timestamp_micros(),
            ],
        )?;
        Ok(())
    }
}

impl RecordStore for SqliteStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn get(&self, id: i64) -> Result<Option<EncryptedValue>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT key_version, value FROM protected_fields WHERE id = ?1",
                params![id],
                |row| Ok((row.get::<_, u32>(0)?, row.get::<_, Vec<u8>>(1)?)),
            )
            .optional()?;
        match row {
            Some((key_version, blob)) => Ok(Some(Self::decode_row(id, key_version, &blob)?)),
            None => Ok(None),
        }
    }

    fn put(&self, id: i64, value: &EncryptedValue) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO protected_fields (id, key_version, value)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (id) DO UPDATE SET key_version = excluded.key_version,
                                            value = excluded.value",
            params![id, value.key_version, value.to_bytes()],
        )?;
        Ok(())
    }

    fn fetch_mismatched(
        &self,
        target_version: u32,
        after: Option<i64>,
        limit: usize,
        partition: &Partition,
    ) -> Result<Vec<ProtectedRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT id, key_version, value FROM protected_fields
             WHERE key_version != ?1
               AND id >= ?2 AND id <= ?3
               AND (?4 IS NULL OR id > ?4)
             ORDER BY id ASC
             LIMIT ?5",
        )?;
        let rows = stmt.query_map(
            params![
                target_version,
                partition.start,
                partition.end,
                after,
                limit as i64
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, u32>(1)?,
                    row.get::<_, Vec<u8>>(2)?,
                ))
            },
        )?;

        let mut records = Vec::new();
        for row in rows {
            let (id, key_version, blob) = row?;
            records.push(ProtectedRecord {
                id,
                value: Self::decode_row(id, key_version, &blob)?,
            });
        }
        Ok(records)
    }

    fn commit_batch(&self, records: &[ProtectedRecord], cursor: &MigrationCursor) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        for record in records {
            tx.execute(
                "UPDATE protected_fields SET key_version = ?2, value = ?3 WHERE id = ?1",
                params![
                    record.id,
                    record.value.key_version,
                    record.value.to_bytes()
                ],
            )?;
        }
        Self::upsert_cursor(&tx, cursor)?;
        tx.commit()?;
        Ok(())
    }

    fn load_cursor(
        &self,
        target_version: u32,
        partition: &Partition,
    ) -> Result<Option<MigrationCursor>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT batch_size, last_id, status, updated_at_micros FROM migration_cursors
                 WHERE target_version = ?1 AND partition_start = ?2 AND partition_end = ?3",
                params![target_version, partition.start, partition.end],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, Option<i64>>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((batch_size, last_id, status, updated_micros)) = row else {
            return Ok(None);
        };
        let batch_size = usize::try_from(batch_size)
            .map_err(|_| VaultError::CursorCorrupt(format!("negative batch size: {batch_size}")))?;
        let status = MigrationStatus::parse(&status)
            .ok_or_else(|| VaultError::CursorCorrupt(format!("unknown status: {status}")))?;
        let updated_at = DateTime::from_timestamp_micros(updated_micros).ok_or_else(|| {
            VaultError::CursorCorrupt(format!("timestamp out of range: {updated_micros}"))
        })?;
        Ok(Some(MigrationCursor {
            target_version,
            partition: *partition,
            batch_size,
            last_id,
            status,
            updated_at,
        }))
    }

    fn save_cursor(&self, cursor: &MigrationCursor) -> Result<()> {
        let conn = self.conn.lock();
        Self::upsert_cursor(&conn, cursor)
    }

    fn version_distribution(&self) -> Result<BTreeMap<u32, u64>> {
        let conn = self.conn.lock();
        let mut stmt = conn
            .prepare("SELECT key_version, COUNT(*) FROM protected_fields GROUP BY key_version")?;
        let rows = stmt.query_map([], |row| Ok((row.get::<_, u32>(0)?, row.get::<_, i64>(1)?)))?;
        let mut distribution = BTreeMap::new();
        for row in rows {
            let (version, count) = row?;
            distribution.insert(version, count as u64);
        }
        Ok(distribution)
    }

    fn count(&self) -> Result<u64> {
        let conn = self.conn.lock();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM protected_fields", [], |row| row.get(0))?;
        Ok(count as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn value(key_version: u32, fill: u8) -> EncryptedValue {
        EncryptedValue {
            key_version,
            nonce: [fill; 12],
            ciphertext: vec![fill; 20],
        }
    }

    fn seeded() -> SqliteStore {
        let store = SqliteStore::open_in_memory("customers").unwrap();
        for id in 1..=5 {
            store.put(id, &value(1, id as u8)).unwrap();
        }
        store
    }

    #[test]
    fn put_get_round_trip() {
        let store = SqliteStore::open_in_memory("customers").unwrap();
        store.put(7, &value(1, 7)).unwrap();
        assert_eq!(store.get(7).unwrap(), Some(value(1, 7)));
        assert_eq!(store.get(8).unwrap(), None);
    }

    #[test]
    fn put_overwrites_existing_row() {
        let store = seeded();
        store.put(3, &value(2, 9)).unwrap();
        assert_eq!(store.get(3).unwrap().unwrap().key_version, 2);
        assert_eq!(store.count().unwrap(), 5);
    }

    #[test]
    fn version_tag_mismatch_is_rejected() {
        let store = seeded();
        {
            let conn = store.conn.lock();
            conn.execute(
                "UPDATE protected_fields SET key_version = 3 WHERE id = 2",
                [],
            )
            .unwrap();
        }
        assert!(matches!(store.get(2), Err(VaultError::Storage(_))));
    }

    #[test]
    fn fetch_orders_and_filters() {
        let store = seeded();
        store.put(2, &value(2, 2)).unwrap();

        let batch = store
            .fetch_mismatched(2, None, 10, &Partition::all())
            .unwrap();
        assert_eq!(
            batch.iter().map(|r| r.id).collect::<Vec<_>>(),
            vec![1, 3, 4, 5]
        );

        let batch = store
            .fetch_mismatched(2, Some(1), 2, &Partition::all())
            .unwrap();
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4]);

        let batch = store
            .fetch_mismatched(2, None, 10, &Partition::new(3, 4))
            .unwrap();
        assert_eq!(batch.iter().map(|r| r.id).collect::<Vec<_>>(), vec![3, 4]);
    }

    #[test]
    fn commit_batch_is_atomic_with_cursor() {
        let store = seeded();
        let mut cursor = MigrationCursor::new(2, Partition::all(), 2);
        cursor.last_id = Some(2);
        store
            .commit_batch(
                &[
                    ProtectedRecord {
                        id: 1,
                        value: value(2, 1),
                    },
                    ProtectedRecord {
                        id: 2,
                        value: value(2, 2),
                    },
                ],
                &cursor,
            )
            .unwrap();

        assert_eq!(store.get(1).unwrap().unwrap().key_version, 2);
        assert_eq!(store.get(2).unwrap().unwrap().key_version, 2);
        let loaded = store.load_cursor(2, &Partition::all()).unwrap().unwrap();
        assert_eq!(loaded.last_id, Some(2));
        assert_eq!(loaded.status, MigrationStatus::Running);
        assert_eq!(loaded.batch_size, 2);
    }

    #[test]
    fn cursor_keyed_by_target_and_partition() {
        let store = seeded();
        store
            .save_cursor(&MigrationCursor::new(2, Partition::new(1, 2), 10))
            .unwrap();
        assert!(store
            .load_cursor(2, &Partition::new(1, 2))
            .unwrap()
            .is_some());
        assert!(store
            .load_cursor(2, &Partition::new(3, 5))
            .unwrap()
            .is_none());
        assert!(store
            .load_cursor(3, &Partition::new(1, 2))
            .unwrap()
            .is_none());
    }

    #[test]
    fn corrupt_cursor_status_is_rejected() {
        let store = seeded();
        {
            let conn = store.conn.lock();
            conn.execute(
                "INSERT INTO migration_cursors
                     (target_version, partition_start, partition_end,
                      batch_size, last_id, status, updated_at_micros)
                 VALUES (2, ?1, ?2, 10, NULL, 'finished?', 0)",
                params![i64::MIN, i64::MAX],
            )
            .unwrap();
        }
        assert!(matches!(
            store.load_cursor(2, &Partition::all()),
            Err(VaultError::CursorCorrupt(_))
        ));
    }

    #[test]
    fn version_distribution_counts() {
        let store = seeded();
        store.put(4, &value(2, 4)).unwrap();
        let dist = store.version_distribution().unwrap();
        assert_eq!(dist.get(&1), Some(&4));
        assert_eq!(dist.get(&2), Some(&1));
    }

    #[test]
    fn reopen_preserves_records_and_cursor() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fields.db");

        {
            let store = SqliteStore::open(&path, "customers").unwrap();
            store.put(1, &value(1, 1)).unwrap();
            let mut cursor = MigrationCursor::new(2, Partition::all(), 3);
            cursor.last_id = Some(1);
            cursor.status = MigrationStatus::Paused;
            store.save_cursor(&cursor).unwrap();
        }

        let store = SqliteStore::open(&path, "customers").unwrap();
        assert_eq!(store.get(1).unwrap(), Some(value(1, 1)));
        let cursor = store.load_cursor(2, &Partition::all()).unwrap().unwrap();
        assert_eq!(cursor.last_id, Some(1));
        assert_eq!(cursor.status, MigrationStatus::Paused);
    }
}
