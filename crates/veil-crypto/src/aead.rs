//! AES-256-GCM seal/open for a single key.
//!
//! The nonce is drawn from the OS RNG inside `seal` on every call — callers
//! cannot supply one, so nonce reuse under a key is not expressible through
//! this API.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};

use crate::error::CryptoError;
use crate::types::{
    build_aad, EncryptionContext, AES_GCM_NONCE_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH,
};

/// Generate a random 12-byte AES-GCM nonce.
pub fn generate_nonce() -> Result<[u8; AES_GCM_NONCE_LENGTH], CryptoError> {
    let mut nonce = [0u8; AES_GCM_NONCE_LENGTH];
    getrandom::getrandom(&mut nonce).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(nonce)
}

/// Generate random 256-bit key material.
pub fn generate_key() -> Result<[u8; AES_KEY_LENGTH], CryptoError> {
    let mut key = [0u8; AES_KEY_LENGTH];
    getrandom::getrandom(&mut key).map_err(|e| CryptoError::RngFailed(e.to_string()))?;
    Ok(key)
}

/// Encrypt `plaintext` under `key`, binding `context` into the tag when given.
///
/// Returns the fresh nonce and the ciphertext with the 16-byte tag appended.
pub fn seal(
    key: &[u8],
    plaintext: &[u8],
    context: Option<&EncryptionContext>,
) -> Result<([u8; AES_GCM_NONCE_LENGTH], Vec<u8>), CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let nonce_bytes = generate_nonce()?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = match context {
        Some(ctx) => {
            let aad = build_aad(ctx);
            cipher.encrypt(
                nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
        }
        None => cipher.encrypt(nonce, plaintext),
    }
    .map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;

    Ok((nonce_bytes, ciphertext))
}

/// Decrypt `ciphertext` (with appended tag) under `key` and `nonce`.
///
/// Fails with [`CryptoError::AuthenticationFailure`] on any tag mismatch:
/// wrong key, tampered bytes, or associated data that does not match what was
/// bound at seal time. Never returns partial plaintext.
pub fn open(
    key: &[u8],
    nonce: &[u8; AES_GCM_NONCE_LENGTH],
    ciphertext: &[u8],
    context: Option<&EncryptionContext>,
) -> Result<Vec<u8>, CryptoError> {
    if key.len() != AES_KEY_LENGTH {
        return Err(CryptoError::InvalidKeyLength {
            expected: AES_KEY_LENGTH,
            got: key.len(),
        });
    }
    if ciphertext.len() < AES_GCM_TAG_LENGTH {
        return Err(CryptoError::DataTooShort);
    }
    let cipher =
        Aes256Gcm::new_from_slice(key).map_err(|e| CryptoError::EncryptionFailed(e.to_string()))?;
    let nonce = Nonce::from_slice(nonce);

    match context {
        Some(ctx) => {
            let aad = build_aad(ctx);
            cipher.decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
        }
        None => cipher.decrypt(nonce, ciphertext),
    }
    .map_err(|_| CryptoError::AuthenticationFailure)
}
