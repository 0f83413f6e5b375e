use thiserror::Error;
use veil_crypto::CryptoError;

pub type Result<T> = std::result::Result<T, VaultError>;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("Key version {0} is already registered")]
    KeyAlreadyRegistered(u32),

    #[error("Key version {0} is not registered")]
    KeyNotFound(u32),

    #[error("No primary key version is set")]
    NoPrimaryKey,

    #[error("Key version {0} is the current primary and cannot be retired")]
    CannotRetirePrimary(u32),

    #[error("Migration cursor corrupt: {0}")]
    CursorCorrupt(String),

    #[error(
        "Migration batch after {boundary:?} toward version {target} failed after {attempts} attempt(s): {reason}"
    )]
    MigrationBatchFailed {
        target: u32,
        /// Last committed ordering key; the failed batch starts just past it.
        boundary: Option<i64>,
        attempts: u32,
        reason: String,
    },

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Storage error: {0}")]
    Storage(String),
}

impl From<rusqlite::Error> for VaultError {
    fn from(e: rusqlite::Error) -> Self {
        VaultError::Storage(e.to_string())
    }
}
