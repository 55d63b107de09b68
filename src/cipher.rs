//! Session cipher: the single holder of the in-memory session key.
//!
//! The key is installed by whoever owns the session lifecycle and read, never
//! copied out, for exactly one encrypt/decrypt call at a time. Consumers get a
//! [`CipherHandle`], which can use the key but cannot install or clear it.

use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand_core::{OsRng, RngCore};
use zeroize::Zeroizing;

use crate::aead;
use crate::error::CipherError;
use crate::wire::{EncryptedBlob, KEY_BYTES};

type SessionKey = Zeroizing<[u8; KEY_BYTES]>;

/// AES-256-GCM over a 256-bit session key.
pub struct AuthenticatedCipher {
    key: RwLock<Option<SessionKey>>,
}

impl Default for AuthenticatedCipher {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AuthenticatedCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthenticatedCipher")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

impl AuthenticatedCipher {
    /// A cipher with no key installed.
    pub fn new() -> Self {
        Self {
            key: RwLock::new(None),
        }
    }

    /// Install the session key. Any previous key is scrubbed first.
    pub fn set_key(&self, key: &[u8]) -> Result<(), CipherError> {
        if key.len() != KEY_BYTES {
            return Err(CipherError::InvalidKeyLength(key.len()));
        }
        let mut fresh: SessionKey = Zeroizing::new([0u8; KEY_BYTES]);
        fresh.copy_from_slice(key);

        let mut slot = self.write_slot();
        if let Some(mut old) = slot.take() {
            scrub(&mut old);
        }
        *slot = Some(fresh);
        tracing::debug!("session key installed");
        Ok(())
    }

    /// Overwrite the key with random bytes and drop it. Idempotent.
    pub fn clear_key(&self) {
        let mut slot = self.write_slot();
        if let Some(mut old) = slot.take() {
            scrub(&mut old);
            tracing::debug!("session key cleared");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.read_slot().is_some()
    }

    /// Encrypt under a fresh random nonce.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, CipherError> {
        let slot = self.read_slot();
        let key = slot.as_ref().ok_or(CipherError::Locked)?;
        let nonce = aead::nonce()?;
        let ciphertext = aead::aead_seal(key, &nonce, plaintext)?;
        Ok(EncryptedBlob::sealed(nonce, ciphertext))
    }

    /// Authenticate and decrypt.
    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, CipherError> {
        let slot = self.read_slot();
        let key = slot.as_ref().ok_or(CipherError::Locked)?;
        if !blob.is_supported() {
            return Err(CipherError::Decryption);
        }
        aead::aead_open(key, &blob.nonce, &blob.ciphertext)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedBlob, CipherError> {
        self.encrypt(plaintext.as_bytes())
    }

    pub fn decrypt_to_string(&self, blob: &EncryptedBlob) -> Result<String, CipherError> {
        let bytes = self.decrypt(blob)?;
        String::from_utf8(bytes)
            .map_err(|_| CipherError::MalformedBlob("plaintext is not UTF-8".into()))
    }

    /// Read-only handle for consumers of the cipher.
    pub fn handle(self: &Arc<Self>) -> CipherHandle {
        CipherHandle(Arc::clone(self))
    }

    // A poisoned lock only means another thread panicked mid-call; the slot
    // itself is always either a whole key or None.
    fn read_slot(&self) -> RwLockReadGuard<'_, Option<SessionKey>> {
        self.key.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write_slot(&self) -> RwLockWriteGuard<'_, Option<SessionKey>> {
        self.key.write().unwrap_or_else(|e| e.into_inner())
    }
}

fn scrub(key: &mut SessionKey) {
    OsRng.fill_bytes(&mut key[..]);
    // Zeroizing wipes again on drop.
}

/// Shared, read-only access to an [`AuthenticatedCipher`].
///
/// Every call checks the lock state on its own, so a lock that lands halfway
/// through a batch makes the remaining items fail with `Locked`.
#[derive(Clone, Debug)]
pub struct CipherHandle(Arc<AuthenticatedCipher>);

impl CipherHandle {
    pub fn is_unlocked(&self) -> bool {
        self.0.is_unlocked()
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, CipherError> {
        self.0.encrypt(plaintext)
    }

    pub fn decrypt(&self, blob: &EncryptedBlob) -> Result<Vec<u8>, CipherError> {
        self.0.decrypt(blob)
    }

    pub fn encrypt_str(&self, plaintext: &str) -> Result<EncryptedBlob, CipherError> {
        self.0.encrypt_str(plaintext)
    }

    pub fn decrypt_to_string(&self, blob: &EncryptedBlob) -> Result<String, CipherError> {
        self.0.decrypt_to_string(blob)
    }
}

impl From<Arc<AuthenticatedCipher>> for CipherHandle {
    fn from(cipher: Arc<AuthenticatedCipher>) -> Self {
        Self(cipher)
    }
}
