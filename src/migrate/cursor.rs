//! Persisted migration progress.
//!
//! The cursor is the engine's only durable payload: it advances in the same
//! transaction that commits a batch, so a crash between batches always leaves
//! it at the last fully committed boundary, never mid-batch.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{Result, VaultError};
use crate::migrate::partition::Partition;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    Running,
    Paused,
    Complete,
}

impl MigrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Running => "running",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Complete => "complete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "running" => Some(MigrationStatus::Running),
            "paused" => Some(MigrationStatus::Paused),
            "complete" => Some(MigrationStatus::Complete),
            _ => None,
        }
    }
}

/// Resumable progress marker for one (target version, partition) run.
///
/// `last_id` is the highest ordering key whose batch has committed:
/// everything at or before it is done, everything after it may still need
/// processing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MigrationCursor {
    pub target_version: u32,
    pub partition: Partition,
    pub batch_size: usize,
    pub last_id: Option<i64>,
    pub status: MigrationStatus,
    pub updated_at: DateTime<Utc>,
}

impl MigrationCursor {
    pub fn new(target_version: u32, partition: Partition, batch_size: usize) -> Self {
        Self {
            target_version,
            partition,
            batch_size,
            last_id: None,
            status: MigrationStatus::Running,
            updated_at: Utc::now(),
        }
    }

    /// Reject a persisted cursor that is inconsistent with the run about to
    /// use it. Never guessed-and-continued: a corrupt cursor is fatal to the
    /// run and requires operator intervention.
    pub fn validate(&self, target_version: u32, partition: &Partition) -> Result<()> {
        if self.target_version != target_version {
            return Err(VaultError::CursorCorrupt(format!(
                "cursor targets version {}, run targets {}",
                self.target_version, target_version
            )));
        }
        if self.partition != *partition {
            return Err(VaultError::CursorCorrupt(format!(
                "cursor partition [{}, {}] does not match run partition [{}, {}]",
                self.partition.start, self.partition.end, partition.start, partition.end
            )));
        }
        if self.batch_size == 0 {
            return Err(VaultError::CursorCorrupt(
                "cursor batch size is zero".to_string(),
            ));
        }
        if let Some(last_id) = self.last_id {
            if !partition.contains(last_id) {
                return Err(VaultError::CursorCorrupt(format!(
                    "cursor position {last_id} lies outside partition [{}, {}]",
                    partition.start, partition.end
                )));
            }
        }
        Ok(())
    }
}
