//! Versioned encrypted value and its storage wire format.
//!
//! Wire format: [key_version: 4 BE][nonce: 12][ciphertext + tag]

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::types::{AES_GCM_NONCE_LENGTH, AES_GCM_TAG_LENGTH};

/// Header size ahead of the ciphertext: version prefix + nonce.
pub const VALUE_HEADER_LENGTH: usize = 4 + AES_GCM_NONCE_LENGTH;

/// One encrypted field as stored at rest: the key version that produced it,
/// the nonce, and the ciphertext with the authentication tag appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedValue {
    /// Version tag of the key that encrypted this value.
    pub key_version: u32,
    pub nonce: [u8; AES_GCM_NONCE_LENGTH],
    pub ciphertext: Vec<u8>,
}

impl EncryptedValue {
    /// Encode as a single self-contained blob:
    /// [key_version: 4 BE][nonce: 12][ciphertext + tag].
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(VALUE_HEADER_LENGTH + self.ciphertext.len());
        out.extend_from_slice(&self.key_version.to_be_bytes());
        out.extend_from_slice(&self.nonce);
        out.extend_from_slice(&self.ciphertext);
        out
    }

    /// Decode a blob produced by [`EncryptedValue::to_bytes`].
    pub fn from_bytes(data: &[u8]) -> Result<Self, CryptoError> {
        if data.len() < VALUE_HEADER_LENGTH + AES_GCM_TAG_LENGTH {
            return Err(CryptoError::DataTooShort);
        }
        let key_version = u32::from_be_bytes(
            data[..4]
                .try_into()
                .expect("slice is exactly 4 bytes after length check"),
        );
        let mut nonce = [0u8; AES_GCM_NONCE_LENGTH];
        nonce.copy_from_slice(&data[4..VALUE_HEADER_LENGTH]);
        Ok(Self {
            key_version,
            nonce,
            ciphertext: data[VALUE_HEADER_LENGTH..].to_vec(),
        })
    }
}
