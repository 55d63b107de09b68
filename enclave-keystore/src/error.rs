//! Error types for the keystore, the encrypted store and the session.

use enclave_core::{CipherError, KeyDerivationError};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Keystore file errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum KeystoreError {
    /// No keystore has been created yet.
    NotFound,
    /// `create` was called over an existing keystore.
    AlreadyExists,
    /// The record exists but does not match the expected schema.
    Corrupted(String),
    /// Filesystem or backend failure.
    Io(String),
}

impl KeystoreError {
    pub fn corrupted(msg: impl Into<String>) -> Self {
        Self::Corrupted(msg.into())
    }

    pub fn io(context: &str, e: impl fmt::Display) -> Self {
        Self::Io(format!("{}: {}", context, e))
    }
}

impl fmt::Display for KeystoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound => write!(f, "keystore not found"),
            Self::AlreadyExists => write!(f, "keystore already exists"),
            Self::Corrupted(msg) => write!(f, "keystore corrupted: {}", msg),
            Self::Io(msg) => write!(f, "keystore i/o: {}", msg),
        }
    }
}

impl std::error::Error for KeystoreError {}

// ---------------------------------------------------------------------------
// Encrypted store errors
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum StoreError {
    /// The session is not unlocked.
    Locked,
    Cipher(CipherError),
    /// Caller-supplied metadata that cannot be stored.
    InvalidMetadata(String),
    InvalidFilter(String),
    Serialization(String),
    /// The vector backend failed.
    Backend(String),
}

impl StoreError {
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "store is locked"),
            Self::Cipher(e) => write!(f, "cipher: {}", e),
            Self::InvalidMetadata(msg) => write!(f, "invalid metadata: {}", msg),
            Self::InvalidFilter(msg) => write!(f, "invalid filter: {}", msg),
            Self::Serialization(msg) => write!(f, "serialization: {}", msg),
            Self::Backend(msg) => write!(f, "vector backend: {}", msg),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Cipher(e) => Some(e),
            _ => None,
        }
    }
}

impl From<CipherError> for StoreError {
    fn from(e: CipherError) -> Self {
        if e.is_locked() {
            Self::Locked
        } else {
            Self::Cipher(e)
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

// ---------------------------------------------------------------------------
// Session errors
// ---------------------------------------------------------------------------

/// Failures surfaced by the session state machine.
///
/// Unlock failures are deliberately coarse: a wrong password and a corrupted
/// keystore both come back as `UnlockFailed`.
#[derive(Debug)]
pub enum SessionError {
    /// No keystore yet; run setup.
    SetupRequired,
    AlreadySetUp,
    WeakPassword(String),
    UnlockFailed,
    TooManyAttempts { retry_after: Option<Duration> },
    NotUnlocked,
    /// The session is in the Error state; only `reset` recovers.
    Unavailable,
    Keystore(KeystoreError),
    KeyDerivation(KeyDerivationError),
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::SetupRequired => write!(f, "setup required"),
            Self::AlreadySetUp => write!(f, "already set up"),
            Self::WeakPassword(reason) => write!(f, "weak password: {}", reason),
            Self::UnlockFailed => write!(f, "unlock failed"),
            Self::TooManyAttempts { retry_after: Some(d) } => {
                write!(f, "too many failed attempts, retry in {}s", d.as_secs())
            }
            Self::TooManyAttempts { retry_after: None } => write!(f, "too many failed attempts"),
            Self::NotUnlocked => write!(f, "session is not unlocked"),
            Self::Unavailable => write!(f, "session unavailable, reset required"),
            Self::Keystore(e) => write!(f, "{}", e),
            Self::KeyDerivation(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Keystore(e) => Some(e),
            Self::KeyDerivation(e) => Some(e),
            _ => None,
        }
    }
}

impl From<KeystoreError> for SessionError {
    fn from(e: KeystoreError) -> Self {
        Self::Keystore(e)
    }
}

impl From<KeyDerivationError> for SessionError {
    fn from(e: KeyDerivationError) -> Self {
        Self::KeyDerivation(e)
    }
}
