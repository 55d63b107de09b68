//! KDF: Argon2id password → 256-bit session key
//!
//! key      = Argon2id(password, salt, t, m, p, len=32)
//! verifier = "sha256:" || hex(SHA-256(key))
//!
//! Every cost parameter travels in a [`KdfConfig`] that is persisted next to
//! the salt, so a keystore written today still derives the same key after the
//! defaults change.

use std::sync::atomic::{AtomicU64, Ordering};

use argon2::{Algorithm, Argon2, Params, Version};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

use crate::error::KeyDerivationError;
use crate::wire::KEY_BYTES;

pub const SALT_BYTES: usize = 16;
pub const ALGORITHM_ARGON2ID: &str = "argon2id";
pub const VERIFIER_PREFIX: &str = "sha256:";

/// Default Argon2id costs: 3 passes over 64 MiB on 4 lanes.
pub const DEFAULT_TIME_COST: u32 = 3;
pub const DEFAULT_MEMORY_COST_KIB: u32 = 65536;
pub const DEFAULT_PARALLELISM: u32 = 4;

/// Derived key material, wiped on drop.
pub type DerivedKey = Zeroizing<[u8; KEY_BYTES]>;

/// Persisted key-derivation parameters.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KdfConfig {
    pub algorithm: String,
    pub time_cost: u32,
    /// KiB.
    pub memory_cost: u32,
    pub parallelism: u32,
    pub salt_length: usize,
    pub hash_length: usize,
}

impl Default for KdfConfig {
    fn default() -> Self {
        Self::argon2id(DEFAULT_TIME_COST, DEFAULT_MEMORY_COST_KIB, DEFAULT_PARALLELISM)
    }
}

impl KdfConfig {
    /// Argon2id with explicit costs and the fixed 16-byte salt / 32-byte key.
    pub fn argon2id(time_cost: u32, memory_cost: u32, parallelism: u32) -> Self {
        Self {
            algorithm: ALGORITHM_ARGON2ID.to_string(),
            time_cost,
            memory_cost,
            parallelism,
            salt_length: SALT_BYTES,
            hash_length: KEY_BYTES,
        }
    }

    /// Check the parameters are something this build can reproduce.
    pub fn validate(&self) -> Result<(), KeyDerivationError> {
        self.params().map(|_| ())
    }

    fn params(&self) -> Result<Params, KeyDerivationError> {
        if self.algorithm != ALGORITHM_ARGON2ID {
            return Err(KeyDerivationError::new(format!(
                "unsupported algorithm {:?}",
                self.algorithm
            )));
        }
        if self.salt_length != SALT_BYTES {
            return Err(KeyDerivationError::new(format!(
                "salt_length must be {}, got {}",
                SALT_BYTES, self.salt_length
            )));
        }
        if self.hash_length != KEY_BYTES {
            return Err(KeyDerivationError::new(format!(
                "hash_length must be {}, got {}",
                KEY_BYTES, self.hash_length
            )));
        }
        Params::new(
            self.memory_cost,
            self.time_cost,
            self.parallelism,
            Some(self.hash_length),
        )
        .map_err(|e| KeyDerivationError::new(format!("argon2 params: {}", e)))
    }
}

/// Outcome of [`KeyDerivationEngine::verify_password`].
///
/// `key` is the real derived key when `valid`, otherwise random bytes of the
/// same shape.
pub struct PasswordCheck {
    pub valid: bool,
    pub key: DerivedKey,
}

impl std::fmt::Debug for PasswordCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PasswordCheck")
            .field("valid", &self.valid)
            .field("key", &"[REDACTED]")
            .finish()
    }
}

/// Password-based key derivation and verification.
#[derive(Debug, Default)]
pub struct KeyDerivationEngine {
    derivations: AtomicU64,
}

impl KeyDerivationEngine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn generate_salt(&self) -> [u8; SALT_BYTES] {
        let mut salt = [0u8; SALT_BYTES];
        OsRng.fill_bytes(&mut salt);
        salt
    }

    /// Derive the session key. Deterministic in (password, salt, config).
    pub fn derive_key(
        &self,
        password: &str,
        salt: &[u8],
        config: &KdfConfig,
    ) -> Result<DerivedKey, KeyDerivationError> {
        if password.is_empty() {
            return Err(KeyDerivationError::new("password is empty"));
        }
        let params = config.params()?;
        if salt.len() != config.salt_length {
            return Err(KeyDerivationError::new(format!(
                "salt must be {} bytes, got {}",
                config.salt_length,
                salt.len()
            )));
        }

        let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
        let mut key: DerivedKey = Zeroizing::new([0u8; KEY_BYTES]);
        self.derivations.fetch_add(1, Ordering::Relaxed);
        argon2
            .hash_password_into(password.as_bytes(), salt, &mut key[..])
            .map_err(|e| KeyDerivationError::new(format!("argon2 derive: {}", e)))?;
        Ok(key)
    }

    /// Fast secondary hash of the derived key, used only to check passwords.
    pub fn verifier_hash(&self, key: &[u8]) -> String {
        format!("{}{}", VERIFIER_PREFIX, hex::encode(Sha256::digest(key)))
    }

    /// Re-derive and compare against the stored verifier in constant time.
    pub fn verify_password(
        &self,
        password: &str,
        salt: &[u8],
        config: &KdfConfig,
        stored_verifier: &str,
    ) -> Result<PasswordCheck, KeyDerivationError> {
        let key = self.derive_key(password, salt, config)?;
        let computed = self.verifier_hash(&key[..]);
        let valid: bool = computed.as_bytes().ct_eq(stored_verifier.as_bytes()).into();

        if valid {
            Ok(PasswordCheck { valid, key })
        } else {
            let mut decoy: DerivedKey = Zeroizing::new([0u8; KEY_BYTES]);
            OsRng.fill_bytes(&mut decoy[..]);
            Ok(PasswordCheck { valid, key: decoy })
        }
    }

    /// Number of Argon2 invocations made by this engine.
    pub fn derivation_count(&self) -> u64 {
        self.derivations.load(Ordering::Relaxed)
    }
}

/// Whether `s` has the `sha256:<64 lowercase hex>` verifier shape.
pub fn is_verifier_format(s: &str) -> bool {
    match s.strip_prefix(VERIFIER_PREFIX) {
        Some(digest) => {
            digest.len() == 64
                && digest
                    .bytes()
                    .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
        }
        None => false,
    }
}
