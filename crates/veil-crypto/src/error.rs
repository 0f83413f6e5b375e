use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid key length: expected {expected} bytes, got {got}")]
    InvalidKeyLength { expected: usize, got: usize },

    #[error("Encrypted data too short")]
    DataTooShort,

    #[error("Authentication failure: ciphertext, nonce, or associated data rejected")]
    AuthenticationFailure,

    #[error("Encryption failed: {0}")]
    EncryptionFailed(String),

    #[error("Random number generation failed: {0}")]
    RngFailed(String),
}
