//! Versioned key registry: the only sanctioned entry points for encrypting
//! and decrypting protected fields.
//!
//! The registry is shared, long-lived, in-process state. Reads (encrypt,
//! decrypt, accessors) take the read lock and run concurrently; mutations
//! (register, set_primary, retire) take the write lock, append their audit
//! event before releasing it, and are serialized against each other and
//! against the read path. No caller ever observes a torn registry.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use zeroize::{Zeroize, ZeroizeOnDrop};

use veil_crypto::{open, seal, CryptoError, EncryptedValue, EncryptionContext, AES_KEY_LENGTH};

use crate::error::{Result, VaultError};
use crate::rotation::{RotationEvent, RotationKind, RotationLog};

/// Key material handed over by the deployment's secret store at process
/// start: (version, 256-bit key) pairs plus the designated primary.
///
/// Zeroized on drop; [`Keyring::from_material`] consumes it.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    pub keys: Vec<(u32, [u8; AES_KEY_LENGTH])>,
    pub primary: Option<u32>,
}

/// Registered key material. Zeroized when dropped, which includes retirement.
#[derive(Zeroize, ZeroizeOnDrop)]
struct SecretKey([u8; AES_KEY_LENGTH]);

struct Registry {
    keys: HashMap<u32, SecretKey>,
    primary: Option<u32>,
}

/// Versioned key registry with a single primary version for new writes.
pub struct Keyring {
    registry: RwLock<Registry>,
    log: Arc<dyn RotationLog>,
}

impl Keyring {
    /// Empty registry; versions are added via [`Keyring::register`].
    pub fn new(log: Arc<dyn RotationLog>) -> Self {
        Self {
            registry: RwLock::new(Registry {
                keys: HashMap::new(),
                primary: None,
            }),
            log,
        }
    }

    /// Initialize from supplied key material.
    ///
    /// Re-hydrates already-registered state, so no rotation events are
    /// appended. Fails with `KeyAlreadyRegistered` on a duplicate version and
    /// `KeyNotFound` if the designated primary is not among the keys.
    pub fn from_material(material: KeyMaterial, log: Arc<dyn RotationLog>) -> Result<Self> {
        let mut keys = HashMap::with_capacity(material.keys.len());
        for (version, key) in &material.keys {
            if keys.insert(*version, SecretKey(*key)).is_some() {
                return Err(VaultError::KeyAlreadyRegistered(*version));
            }
        }
        if let Some(primary) = material.primary {
            if !keys.contains_key(&primary) {
                return Err(VaultError::KeyNotFound(primary));
            }
        }
        let primary = material.primary;
        Ok(Self {
            registry: RwLock::new(Registry { keys, primary }),
            log,
        })
    }

    /// Register a new key version. The version becomes active (decryptable)
    /// but not primary.
    pub fn register(&self, version: u32, key: &[u8], operator: &str) -> Result<()> {
        if key.len() != AES_KEY_LENGTH {
            return Err(CryptoError::InvalidKeyLength {
                expected: AES_KEY_LENGTH,
                got: key.len(),
            }
            .into());
        }
        let mut registry = self.registry.write();
        if registry.keys.contains_key(&version) {
            return Err(VaultError::KeyAlreadyRegistered(version));
        }
        self.log.append(&RotationEvent::now(
            RotationKind::Registered,
            None,
            version,
            operator,
        ))?;
        let mut material = [0u8; AES_KEY_LENGTH];
        material.copy_from_slice(key);
        registry.keys.insert(version, SecretKey(material));
        tracing::info!(version, "key version registered");
        Ok(())
    }

    /// Atomically make `version` the primary for all new encryption,
    /// demoting any previous primary to active. Stored ciphertext is
    /// unaffected.
    pub fn set_primary(&self, version: u32, operator: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if !registry.keys.contains_key(&version) {
            return Err(VaultError::KeyNotFound(version));
        }
        let old = registry.primary;
        self.log.append(&RotationEvent::now(
            RotationKind::PrimaryChanged,
            old,
            version,
            operator,
        ))?;
        registry.primary = Some(version);
        tracing::info!(old_version = ?old, new_version = version, "primary key switched");
        Ok(())
    }

    /// Remove `version` from the registry entirely. Values still tagged with
    /// it become undecryptable, so retire only after a migration has
    /// confirmed zero remaining rows reference the version.
    pub fn retire(&self, version: u32, operator: &str) -> Result<()> {
        let mut registry = self.registry.write();
        if registry.primary == Some(version) {
            return Err(VaultError::CannotRetirePrimary(version));
        }
        if !registry.keys.contains_key(&version) {
            return Err(VaultError::KeyNotFound(version));
        }
        self.log.append(&RotationEvent::now(
            RotationKind::Retired,
            None,
            version,
            operator,
        ))?;
        registry.keys.remove(&version);
        tracing::info!(version, "key version retired");
        Ok(())
    }

    /// Encrypt under the current primary version.
    pub fn encrypt(
        &self,
        plaintext: &[u8],
        context: Option<&EncryptionContext>,
    ) -> Result<EncryptedValue> {
        let registry = self.registry.read();
        let primary = registry.primary.ok_or(VaultError::NoPrimaryKey)?;
        Self::seal_with(&registry, primary, plaintext, context)
    }

    /// Encrypt under an explicit registered version.
    ///
    /// Application writes go through [`Keyring::encrypt`]; this entry point
    /// exists for the migration engine, which re-encrypts toward a target
    /// version that may not be primary yet.
    pub fn encrypt_under(
        &self,
        version: u32,
        plaintext: &[u8],
        context: Option<&EncryptionContext>,
    ) -> Result<EncryptedValue> {
        let registry = self.registry.read();
        Self::seal_with(&registry, version, plaintext, context)
    }

    /// Decrypt a stored value under whatever version it is tagged with.
    pub fn decrypt(
        &self,
        value: &EncryptedValue,
        context: Option<&EncryptionContext>,
    ) -> Result<Vec<u8>> {
        let registry = self.registry.read();
        let key = registry
            .keys
            .get(&value.key_version)
            .ok_or(VaultError::KeyNotFound(value.key_version))?;
        Ok(open(&key.0, &value.nonce, &value.ciphertext, context)?)
    }

    /// The current primary version, if one is set.
    pub fn primary(&self) -> Option<u32> {
        self.registry.read().primary
    }

    /// All registered versions, ascending.
    pub fn versions(&self) -> Vec<u32> {
        let registry = self.registry.read();
        let mut versions: Vec<u32> = registry.keys.keys().copied().collect();
        versions.sort_unstable();
        versions
    }

    /// Whether `version` is registered.
    pub fn contains(&self, version: u32) -> bool {
        self.registry.read().keys.contains_key(&version)
    }

    fn seal_with(
        registry: &Registry,
        version: u32,
        plaintext: &[u8],
        context: Option<&EncryptionContext>,
    ) -> Result<EncryptedValue> {
        let key = registry
            .keys
            .get(&version)
            .ok_or(VaultError::KeyNotFound(version))?;
        let (nonce, ciphertext) = seal(&key.0, plaintext, context)?;
        Ok(EncryptedValue {
            key_version: version,
            nonce,
            ciphertext,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::MemoryRotationLog;
    use veil_crypto::generate_key;

    fn keyring() -> (Keyring, Arc<MemoryRotationLog>) {
        let log = Arc::new(MemoryRotationLog::new());
        (Keyring::new(log.clone()), log)
    }

    fn ctx() -> EncryptionContext {
        EncryptionContext::for_record("customers", 1)
    }

    #[test]
    fn register_rejects_wrong_length() {
        let (kr, _) = keyring();
        let err = kr.register(1, &[0u8; 16], "ops").unwrap_err();
        assert!(matches!(
            err,
            VaultError::Crypto(CryptoError::InvalidKeyLength { expected: 32, got: 16 })
        ));
    }

    #[test]
    fn register_rejects_duplicate() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        assert!(matches!(
            kr.register(1, &generate_key().unwrap(), "ops"),
            Err(VaultError::KeyAlreadyRegistered(1))
        ));
    }

    #[test]
    fn register_does_not_set_primary() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        assert_eq!(kr.primary(), None);
        assert!(matches!(
            kr.encrypt(b"pii", None),
            Err(VaultError::NoPrimaryKey)
        ));
    }

    #[test]
    fn set_primary_unknown_leaves_primary_unchanged() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        assert!(matches!(
            kr.set_primary(9, "ops"),
            Err(VaultError::KeyNotFound(9))
        ));
        assert_eq!(kr.primary(), Some(1));
    }

    #[test]
    fn encrypt_uses_current_primary() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.register(2, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        assert_eq!(kr.encrypt(b"a", None).unwrap().key_version, 1);
        kr.set_primary(2, "ops").unwrap();
        assert_eq!(kr.encrypt(b"a", None).unwrap().key_version, 2);
    }

    #[test]
    fn round_trip_with_context() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        let value = kr.encrypt(b"555-12-3456", Some(&ctx())).unwrap();
        assert_eq!(kr.decrypt(&value, Some(&ctx())).unwrap(), b"555-12-3456");
    }

    #[test]
    fn decrypt_propagates_authentication_failure() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        let mut value = kr.encrypt(b"secret", Some(&ctx())).unwrap();
        let last = value.ciphertext.len() - 1;
        value.ciphertext[last] ^= 0xff;
        assert!(matches!(
            kr.decrypt(&value, Some(&ctx())),
            Err(VaultError::Crypto(CryptoError::AuthenticationFailure))
        ));
    }

    #[test]
    fn decrypt_relocated_value_fails() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        let value = kr.encrypt(b"secret", Some(&ctx())).unwrap();
        let elsewhere = EncryptionContext::for_record("customers", 2);
        assert!(matches!(
            kr.decrypt(&value, Some(&elsewhere)),
            Err(VaultError::Crypto(CryptoError::AuthenticationFailure))
        ));
    }

    #[test]
    fn retire_rejects_current_primary() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        assert!(matches!(
            kr.retire(1, "ops"),
            Err(VaultError::CannotRetirePrimary(1))
        ));
        assert!(kr.contains(1));
    }

    #[test]
    fn retired_version_is_undecryptable() {
        let (kr, _) = keyring();
        kr.register(1, &generate_key().unwrap(), "ops").unwrap();
        kr.register(2, &generate_key().unwrap(), "ops").unwrap();
        kr.set_primary(1, "ops").unwrap();
        let value = kr.encrypt(b"pii", Some(&ctx())).unwrap();

        kr.set_primary(2, "ops").unwrap();
        kr.retire(1, "ops").unwrap();
        assert!(matches!(
            kr.decrypt(&value, Some(&ctx())),
            Err(VaultError::KeyNotFound(1))
        ));
        assert_eq!(kr.versions(), vec![2]);
    }

    #[test]
    fn retire_unknown_fails() {
        let (kr, _) = keyring();
        assert!(matches!(
            kr.retire(5, "ops"),
            Err(VaultError::KeyNotFound(5))
        ));
    }

    #[test]
    fn encrypt_under_requires_registration() {
        let (kr, _) = keyring();
        assert!(matches!(
            kr.encrypt_under(3, b"x", None),
            Err(VaultError::KeyNotFound(3))
        ));
    }

    #[test]
    fn from_material_initializes_registry() {
        let material = KeyMaterial {
            keys: vec![
                (1, generate_key().unwrap()),
                (2, generate_key().unwrap()),
            ],
            primary: Some(2),
        };
        let kr = Keyring::from_material(material, Arc::new(MemoryRotationLog::new())).unwrap();
        assert_eq!(kr.primary(), Some(2));
        assert_eq!(kr.versions(), vec![1, 2]);
        let value = kr.encrypt(b"pii", None).unwrap();
        assert_eq!(value.key_version, 2);
    }

    #[test]
    fn from_material_rejects_unknown_primary() {
        let material = KeyMaterial {
            keys: vec![(1, generate_key().unwrap())],
            primary: Some(9),
        };
        assert!(matches!(
            Keyring::from_material(material, Arc::new(MemoryRotationLog::new())),
            Err(VaultError::KeyNotFound(9))
        ));
    }

    #[test]
    fn from_material_rejects_duplicate_version() {
        let material = KeyMaterial {
            keys: vec![
                (1, generate_key().unwrap()),
                (1, generate_key().unwrap()),
            ],
            primary: None,
        };
        assert!(matches!(
            Keyring::from_material(material, Arc::new(MemoryRotationLog::new())),
            Err(VaultError::KeyAlreadyRegistered(1))
        ));
    }

    #[test]
    fn mutations_append_events_in_call_order() {
        let (kr, log) = keyring();
        kr.register(1, &generate_key().unwrap(), "alice").unwrap();
        kr.set_primary(1, "alice").unwrap();
        kr.register(2, &generate_key().unwrap(), "bob").unwrap();
        kr.set_primary(2, "bob").unwrap();
        kr.retire(1, "bob").unwrap();

        let events = log.list(None).unwrap();
        let kinds: Vec<RotationKind> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![
                RotationKind::Registered,
                RotationKind::PrimaryChanged,
                RotationKind::Registered,
                RotationKind::PrimaryChanged,
                RotationKind::Retired,
            ]
        );
        // First switch has no previous primary; second demotes version 1
        assert_eq!(events[1].old_version, None);
        assert_eq!(events[1].new_version, 1);
        assert_eq!(events[3].old_version, Some(1));
        assert_eq!(events[3].new_version, 2);
        assert_eq!(events[3].operator, "bob");
    }

    #[test]
    fn failed_set_primary_appends_no_event() {
        let (kr, log) = keyring();
        let _ = kr.set_primary(1, "ops");
        assert!(log.list(None).unwrap().is_empty());
    }
}
