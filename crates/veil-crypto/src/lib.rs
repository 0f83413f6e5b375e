//! Stateless AES-256-GCM primitives for field-level encryption.
//!
//! This crate knows nothing about key registries or migrations: it seals and
//! opens byte buffers under a caller-supplied key, binds the owning record's
//! identity into the authentication tag, and defines the versioned value
//! format the rest of the system stores at rest.

pub mod aead;
pub mod error;
pub mod types;
pub mod value;

pub use aead::{generate_key, generate_nonce, open, seal};
pub use error::CryptoError;
pub use types::{
    EncryptionContext, AES_GCM_NONCE_LENGTH, AES_GCM_TAG_LENGTH, AES_KEY_LENGTH,
};
pub use value::{EncryptedValue, VALUE_HEADER_LENGTH};
