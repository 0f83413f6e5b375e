//! Narrow storage interface covering only what the keyring's callers and the
//! migration engine need from the record store.

use std::collections::BTreeMap;
use std::sync::Arc;

use veil_crypto::EncryptedValue;

use crate::error::Result;
use crate::migrate::{MigrationCursor, Partition};

/// One protected field row: ordering key plus its encrypted value.
#[derive(Debug, Clone, PartialEq)]
pub struct ProtectedRecord {
    pub id: i64,
    pub value: EncryptedValue,
}

/// Store of protected fields addressed by a monotonic i64 ordering key.
///
/// `commit_batch` is the engine's one write path during migration: row
/// rewrites and the cursor advance land as a single all-or-nothing unit.
pub trait RecordStore: Send + Sync {
    /// Label used as the table component of every record's encryption
    /// context. Must match what the application bound at write time.
    fn collection(&self) -> &str;

    fn get(&self, id: i64) -> Result<Option<EncryptedValue>>;

    fn put(&self, id: i64, value: &EncryptedValue) -> Result<()>;

    /// Up to `limit` records inside `partition` whose version differs from
    /// `target_version`, strictly after `after`, in ascending id order.
    fn fetch_mismatched(
        &self,
        target_version: u32,
        after: Option<i64>,
        limit: usize,
        partition: &Partition,
    ) -> Result<Vec<ProtectedRecord>>;

    /// Write back every record in the batch and persist the advanced cursor
    /// atomically. On error nothing is applied.
    fn commit_batch(&self, records: &[ProtectedRecord], cursor: &MigrationCursor) -> Result<()>;

    /// The persisted cursor for (target, partition), if any.
    fn load_cursor(
        &self,
        target_version: u32,
        partition: &Partition,
    ) -> Result<Option<MigrationCursor>>;

    /// Persist a cursor outside a batch commit (pause and completion marks).
    fn save_cursor(&self, cursor: &MigrationCursor) -> Result<()>;

    /// Record count per key version.
    fn version_distribution(&self) -> Result<BTreeMap<u32, u64>>;

    fn count(&self) -> Result<u64>;
}

impl<S: RecordStore + ?Sized> RecordStore for Arc<S> {
    fn collection(&self) -> &str {
        (**self).collection()
    }

    fn get(&self, id: i64) -> Result<Option<EncryptedValue>> {
        (**self).get(id)
    }

    fn put(&self, id: i64, value: &EncryptedValue) -> Result<()> {
        (**self).put(id, value)
    }

    fn fetch_mismatched(
        &self,
        target_version: u32,
        after: Option<i64>,
        limit: usize,
        partition: &Partition,
    ) -> Result<Vec<ProtectedRecord>> {
        (**self).fetch_mismatched(target_version, after, limit, partition)
    }

    fn commit_batch(&self, records: &[ProtectedRecord], cursor: &MigrationCursor) -> Result<()> {
        (**self).commit_batch(records, cursor)
    }

    fn load_cursor(
        &self,
        target_version: u32,
        partition: &Partition,
    ) -> Result<Option<MigrationCursor>> {
        (**self).load_cursor(target_version, partition)
    }

    fn save_cursor(&self, cursor: &MigrationCursor) -> Result<()> {
        (**self).save_cursor(cursor)
    }

    fn version_distribution(&self) -> Result<BTreeMap<u32, u64>> {
        (**self).version_distribution()
    }

    fn count(&self) -> Result<u64> {
        (**self).count()
    }
}
