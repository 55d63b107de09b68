//! # Enclave Core
//!
//! Password-derived session encryption for a local knowledge store.
//!
//! ## Quick Start
//!
//! ```rust
//! use enclave_core::{AuthenticatedCipher, KdfConfig, KeyDerivationEngine};
//! use std::sync::Arc;
//!
//! let engine = KeyDerivationEngine::new();
//! let config = KdfConfig::argon2id(1, 256, 1);
//! let salt = engine.generate_salt();
//! let key = engine.derive_key("Sup3r$ecret!", &salt, &config).unwrap();
//!
//! let cipher = Arc::new(AuthenticatedCipher::new());
//! cipher.set_key(&key[..]).unwrap();
//!
//! let blob = cipher.encrypt(b"chunk text").unwrap();
//! assert_eq!(cipher.decrypt(&blob).unwrap(), b"chunk text");
//!
//! cipher.clear_key();
//! assert!(cipher.decrypt(&blob).is_err());
//! ```
//!
//! ## Security Properties
//!
//! - **Argon2id**: memory-hard derivation with persisted, explicit costs
//! - **AES-256-GCM**: fresh random 96-bit nonce per encryption; any bit flip
//!   fails authentication
//! - **No key at rest**: only a SHA-256 verifier of the key is ever stored
//! - **Constant-time verifier check** via `subtle`
//!
//! ## What's NOT Provided
//!
//! - Key escrow or recovery
//! - Protection while unlocked against code running on the host

#![deny(unsafe_code)]

mod aead;
mod error;

pub mod cipher;
pub mod kdf;
pub mod wire;

pub use cipher::{AuthenticatedCipher, CipherHandle};
pub use error::{CipherError, KeyDerivationError};
pub use kdf::{is_verifier_format, DerivedKey, KdfConfig, KeyDerivationEngine, PasswordCheck, SALT_BYTES};
pub use wire::{EncryptedBlob, ALGORITHM_AES256GCM, BLOB_VERSION, KEY_BYTES, NONCE_BYTES};
