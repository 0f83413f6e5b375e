//! Versioned field encryption with zero-downtime key rotation.
//!
//! Protected fields are stored as one ciphertext blob plus one key-version
//! tag. The [`Keyring`] owns the registered key versions and the single
//! primary used for new writes; the [`MigrationEngine`] re-encrypts existing
//! records toward a target version in resumable, crash-safe batches; every
//! registry mutation lands in an append-only [`rotation::RotationLog`].
//!
//! Rotation sequence: register the new version, switch the primary, run the
//! migration to completion, then retire the old version. An emergency
//! rotation is the same sequence run under time pressure with a larger batch
//! size — there is no separate code path.

pub mod error;
pub mod keyring;
pub mod migrate;
pub mod rotation;
pub mod storage;

pub use error::{Result, VaultError};
pub use keyring::{KeyMaterial, Keyring};
pub use migrate::{
    MigrationCursor, MigrationEngine, MigrationOptions, MigrationProgress, MigrationReport,
    MigrationStatus, Partition,
};
pub use rotation::{
    MemoryRotationLog, RotationEvent, RotationKind, RotationLog, SqliteRotationLog,
};
pub use storage::{MemoryStore, ProtectedRecord, RecordStore, SqliteStore};
pub use veil_crypto::{CryptoError, EncryptedValue, EncryptionContext};
