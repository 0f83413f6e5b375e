//! Bulk re-encryption of stored records toward a target key version.
//!
//! The engine walks the record total order in batches, decrypting each row
//! under its recorded version and re-encrypting under the target, and commits
//! every batch together with the advanced cursor as one unit. A crash or
//! pause between batches resumes from the persisted cursor; batches are never
//! half-applied.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tracing::{debug, info, warn};
use zeroize::Zeroize;

use veil_crypto::EncryptionContext;

use crate::error::{Result, VaultError};
use crate::keyring::Keyring;
use crate::migrate::cursor::{MigrationCursor, MigrationStatus};
use crate::migrate::partition::Partition;
use crate::storage::traits::{ProtectedRecord, RecordStore};

/// Operator-tunable knobs for one engine instance.
#[derive(Debug, Clone)]
pub struct MigrationOptions {
    /// Records per batch transaction.
    pub batch_size: usize,
    /// Commit attempts per batch boundary before giving up.
    pub max_batch_attempts: u32,
    /// Base delay between commit attempts; grows linearly per attempt.
    pub retry_backoff: Duration,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            batch_size: 500,
            max_batch_attempts: 5,
            retry_backoff: Duration::from_millis(250),
        }
    }
}

/// Outcome of one engine run over one partition.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MigrationReport {
    pub target_version: u32,
    pub partition: Partition,
    pub records_migrated: u64,
    pub batches_committed: u64,
    pub status: MigrationStatus,
}

/// Operator-facing view of how far a migration has progressed.
#[derive(Debug, Clone, Serialize)]
pub struct MigrationProgress {
    pub target_version: u32,
    /// Record count per key version across the whole store.
    pub distribution: BTreeMap<u32, u64>,
    pub total: u64,
    pub migrated: u64,
    /// Fraction of records already at the target version (1.0 when empty).
    pub fraction: f64,
    /// Persisted cursor for the full-range run, if one exists.
    pub cursor: Option<MigrationCursor>,
}

/// Re-encryption driver over one record store.
///
/// Holds its own [`Keyring`] handle; a deployment typically initializes it
/// from the same key material as the serving processes. Multiple engine
/// instances may run concurrently as long as their partitions are disjoint.
pub struct MigrationEngine<S: RecordStore> {
    keyring: Arc<Keyring>,
    store: S,
    options: MigrationOptions,
    pause: Arc<AtomicBool>,
}

impl<S: RecordStore> MigrationEngine<S> {
    pub fn new(keyring: Arc<Keyring>, store: S) -> Self {
        Self::with_options(keyring, store, MigrationOptions::default())
    }

    pub fn with_options(keyring: Arc<Keyring>, store: S, options: MigrationOptions) -> Self {
        Self {
            keyring,
            store,
            options,
            pause: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Ask the engine to stop cleanly at the next batch boundary. The
    /// in-flight batch always runs to full commit or rollback.
    pub fn request_pause(&self) {
        self.pause.store(true, Ordering::SeqCst);
    }

    /// Clear a pause request so the next run proceeds.
    pub fn resume(&self) {
        self.pause.store(false, Ordering::SeqCst);
    }

    /// Shared pause flag, for wiring to signal handlers or other threads.
    pub fn pause_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.pause)
    }

    /// Migrate every record in the store to `target_version`.
    pub fn run(&self, target_version: u32) -> Result<MigrationReport> {
        self.run_partition(target_version, Partition::all())
    }

    /// Migrate the records inside `partition` to `target_version`, resuming
    /// from a persisted cursor when one exists.
    pub fn run_partition(
        &self,
        target_version: u32,
        partition: Partition,
    ) -> Result<MigrationReport> {
        if !self.keyring.contains(target_version) {
            return Err(VaultError::KeyNotFound(target_version));
        }

        let mut cursor = match self.store.load_cursor(target_version, &partition)? {
            Some(found) => {
                found.validate(target_version, &partition)?;
                if found.status == MigrationStatus::Complete {
                    // A finished run starts a fresh pass; with nothing left
                    // mismatched it performs zero writes.
                    MigrationCursor::new(target_version, partition, self.options.batch_size)
                } else {
                    MigrationCursor {
                        batch_size: self.options.batch_size,
                        status: MigrationStatus::Running,
                        ..found
                    }
                }
            }
            None => MigrationCursor::new(target_version, partition, self.options.batch_size),
        };

        info!(
            target_version,
            partition_start = partition.start,
            partition_end = partition.end,
            resume_from = ?cursor.last_id,
            "starting re-encryption run"
        );

        let mut report = MigrationReport {
            target_version,
            partition,
            records_migrated: 0,
            batches_committed: 0,
            status: MigrationStatus::Running,
        };

        loop {
            if self.pause.load(Ordering::SeqCst) {
                cursor.status = MigrationStatus::Paused;
                cursor.updated_at = Utc::now();
                self.store.save_cursor(&cursor)?;
                report.status = MigrationStatus::Paused;
                info!(target_version, position = ?cursor.last_id, "run paused at batch boundary");
                return Ok(report);
            }

            let batch = self.store.fetch_mismatched(
                target_version,
                cursor.last_id,
                cursor.batch_size,
                &partition,
            )?;
            let Some(boundary) = batch.last().map(|r| r.id) else {
                cursor.status = MigrationStatus::Complete;
                cursor.updated_at = Utc::now();
                self.store.save_cursor(&cursor)?;
                report.status = MigrationStatus::Complete;
                info!(
                    target_version,
                    records = report.records_migrated,
                    batches = report.batches_committed,
                    "re-encryption run complete"
                );
                return Ok(report);
            };

            let rewritten = self.reencrypt_batch(&batch, target_version)?;
            let previous_boundary = cursor.last_id;
            cursor.last_id = Some(boundary);
            cursor.updated_at = Utc::now();
            self.commit_with_retry(&rewritten, &cursor, previous_boundary)?;

            report.records_migrated += rewritten.len() as u64;
            report.batches_committed += 1;
            debug!(
                target_version,
                records = rewritten.len(),
                boundary,
                "batch committed"
            );
        }
    }

    /// Version distribution and completion fraction for `target_version`.
    pub fn progress(&self, target_version: u32) -> Result<MigrationProgress> {
        let distribution = self.store.version_distribution()?;
        let total: u64 = distribution.values().sum();
        let migrated = distribution.get(&target_version).copied().unwrap_or(0);
        let fraction = if total == 0 {
            1.0
        } else {
            migrated as f64 / total as f64
        };
        let cursor = self.store.load_cursor(target_version, &Partition::all())?;
        Ok(MigrationProgress {
            target_version,
            distribution,
            total,
            migrated,
            fraction,
            cursor,
        })
    }

    /// Decrypt each record under its recorded version and re-encrypt under
    /// the target. A row failure (retired version, tampered value) aborts the
    /// whole batch: skipping it silently would leave unmigrated PII behind.
    fn reencrypt_batch(
        &self,
        batch: &[ProtectedRecord],
        target_version: u32,
    ) -> Result<Vec<ProtectedRecord>> {
        let mut rewritten = Vec::with_capacity(batch.len());
        for record in batch {
            let context = EncryptionContext::for_record(self.store.collection(), record.id);
            let mut plaintext = self.keyring.decrypt(&record.value, Some(&context))?;
            let value = self
                .keyring
                .encrypt_under(target_version, &plaintext, Some(&context))?;
            plaintext.zeroize();
            rewritten.push(ProtectedRecord {
                id: record.id,
                value,
            });
        }
        Ok(rewritten)
    }

    /// Commit one batch, retrying the same boundary with linear backoff.
    /// Exhausted attempts escalate as `MigrationBatchFailed`; the persisted
    /// cursor still marks the previous boundary, so a later run retries the
    /// identical batch.
    fn commit_with_retry(
        &self,
        records: &[ProtectedRecord],
        cursor: &MigrationCursor,
        previous_boundary: Option<i64>,
    ) -> Result<()> {
        let mut attempt = 1u32;
        loop {
            match self.store.commit_batch(records, cursor) {
                Ok(()) => return Ok(()),
                Err(err) if attempt < self.options.max_batch_attempts => {
                    warn!(
                        target_version = cursor.target_version,
                        attempt,
                        error = %err,
                        "batch commit failed; retrying same boundary"
                    );
                    std::thread::sleep(self.options.retry_backoff * attempt);
                    attempt += 1;
                }
                Err(err) => {
                    return Err(VaultError::MigrationBatchFailed {
                        target: cursor.target_version,
                        boundary: previous_boundary,
                        attempts: attempt,
                        reason: err.to_string(),
                    })
                }
            }
        }
    }
}
