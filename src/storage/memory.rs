//! In-memory record store for tests and embedders with their own durability.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use veil_crypto::EncryptedValue;

use crate::error::Result;
use crate::migrate::{MigrationCursor, Partition};

use super::traits::{ProtectedRecord, RecordStore};

type CursorKey = (u32, i64, i64);

#[derive(Default)]
struct MemoryInner {
    records: BTreeMap<i64, EncryptedValue>,
    cursors: HashMap<CursorKey, MigrationCursor>,
}

/// BTreeMap-backed store. Batch commits apply under a single mutex hold, so
/// they are all-or-nothing with respect to any other caller.
pub struct MemoryStore {
    collection: String,
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            inner: Mutex::new(MemoryInner::default()),
        }
    }
}

fn cursor_key(target_version: u32, partition: &Partition) -> CursorKey {
    (target_version, partition.start, partition.end)
}

impl RecordStore for MemoryStore {
    fn collection(&self) -> &str {
        &self.collection
    }

    fn get(&self, id: i64) -> Result<Option<EncryptedValue>> {
        Ok(self.inner.lock().records.get(&id).cloned())
    }

    fn put(&self, id: i64, value: &EncryptedValue) -> Result<()> {
        self.inner.lock().records.insert(id, value.clone());
        Ok(())
    }

    fn fetch_mismatched(
        &self,
        target_version: u32,
        after: Option<i64>,
        limit: usize,
        partition: &Partition,
    ) -> Result<Vec<ProtectedRecord>> {
        let inner = self.inner.lock();
        let lower = match after {
            // i64::MAX cursor means the partition is exhausted
            Some(i64::MAX) => return Ok(Vec::new()),
            Some(after) => partition.start.max(after + 1),
            None => partition.start,
        };
        if lower > partition.end {
            return Ok(Vec::new());
        }
        Ok(inner
            .records
            .range(lower..=partition.end)
            .filter(|(_, value)| value.key_version != target_version)
            .take(limit)
            .map(|(id, value)| ProtectedRecord {
                id: *id,
                value: value.clone(),
            })
            .collect())
    }

    fn commit_batch(&self, records: &[ProtectedRecord], cursor: &MigrationCursor) -> Result<()> {
        let mut inner = self.inner.lock();
        for record in records {
            inner.records.insert(record.id, record.value.clone());
        }
        inner
            .cursors
            .insert(cursor_key(cursor.target_version, &cursor.partition), cursor.clone());
        Ok(())
    }

    fn load_cursor(
        &self,
        target_version: u32,
        partition: &Partition,
    ) -> Result<Option<MigrationCursor>> {
        Ok(self
            .inner
            .lock()
            .cursors
            .get(&cursor_key(target_version, partition))
            .cloned())
    }

    fn save_cursor(&self, cursor: &MigrationCursor) -> Result<()> {
        self.inner
            .lock()
            .cursors
            .insert(cursor_key(cursor.target_version, &cursor.partition), cursor.clone());
        Ok(())
    }

    fn version_distribution(&self) -> Result<BTreeMap<u32, u64>> {
        let inner = self.inner.lock();
        let mut distribution = BTreeMap::new();
        for value in inner.records.values() {
            *distribution.entry(value.key_version).or_insert(0u64) += 1;
        }
        Ok(distribution)
    }

    fn count(&self) -> Result<u64> {
        Ok(self.inner.lock().records.len() as u64)
    }
}
