use serde::{Deserialize, Serialize};

/// AES-256 key size in bytes.
pub const AES_KEY_LENGTH: usize = 32;

/// AES-GCM nonce size in bytes.
pub const AES_GCM_NONCE_LENGTH: usize = 12;

/// AES-GCM authentication tag size in bytes.
pub const AES_GCM_TAG_LENGTH: usize = 16;

/// Identity of the record that owns an encrypted field.
///
/// Bound into the authentication tag as associated data so a ciphertext
/// cannot be relocated to a different row and still decrypt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptionContext {
    /// Logical table or collection holding the field.
    pub table: String,
    /// The owning record's identity within that table.
    pub record_id: String,
}

impl EncryptionContext {
    pub fn new(table: impl Into<String>, record_id: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            record_id: record_id.into(),
        }
    }

    /// Context for a record addressed by numeric id.
    pub fn for_record(table: &str, id: i64) -> Self {
        Self::new(table, id.to_string())
    }
}

/// Build AAD bytes from an encryption context.
/// Format: [4 bytes: table length (u32 BE)][table UTF-8][record_id UTF-8]
pub(crate) fn build_aad(context: &EncryptionContext) -> Vec<u8> {
    let table_bytes = context.table.as_bytes();
    let id_bytes = context.record_id.as_bytes();
    let mut aad = Vec::with_capacity(4 + table_bytes.len() + id_bytes.len());
    aad.extend_from_slice(&(table_bytes.len() as u32).to_be_bytes());
    aad.extend_from_slice(table_bytes);
    aad.extend_from_slice(id_bytes);
    aad
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aad_is_length_prefixed() {
        let ctx = EncryptionContext::new("customers", "17");
        let aad = build_aad(&ctx);
        assert_eq!(&aad[..4], &9u32.to_be_bytes());
        assert_eq!(&aad[4..13], b"customers");
        assert_eq!(&aad[13..], b"17");
    }

    #[test]
    fn aad_distinguishes_boundary_shift() {
        // "ab" + "c" must not collide with "a" + "bc"
        let a = build_aad(&EncryptionContext::new("ab", "c"));
        let b = build_aad(&EncryptionContext::new("a", "bc"));
        assert_ne!(a, b);
    }

    #[test]
    fn for_record_formats_id() {
        let ctx = EncryptionContext::for_record("deals", 42);
        assert_eq!(ctx.record_id, "42");
    }
}
