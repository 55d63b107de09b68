//! Error types for the session cipher and key derivation.

use core::fmt;

/// Failure of an [`AuthenticatedCipher`](crate::AuthenticatedCipher) operation.
///
/// `Decryption` is reserved for authentication failures (tampered or
/// corrupted ciphertext, foreign key, unknown algorithm). Structural problems
/// with a blob are reported as `MalformedBlob` so callers can tell the two apart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// No session key is installed.
    Locked,
    /// `set_key` was given something other than 32 bytes.
    InvalidKeyLength(usize),
    /// The AEAD backend refused to seal.
    Encryption(String),
    /// Authentication tag did not verify, or the algorithm is not recognised.
    Decryption,
    /// The blob or its document encoding is structurally invalid.
    MalformedBlob(String),
}

impl CipherError {
    /// Whether this error means the session is locked.
    pub fn is_locked(&self) -> bool {
        matches!(self, Self::Locked)
    }
}

impl fmt::Display for CipherError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Locked => write!(f, "session is locked"),
            Self::InvalidKeyLength(len) => {
                write!(f, "invalid session key length: expected 32 bytes, got {}", len)
            }
            Self::Encryption(msg) => write!(f, "encryption failed: {}", msg),
            Self::Decryption => write!(f, "decryption failed"),
            Self::MalformedBlob(msg) => write!(f, "malformed blob: {}", msg),
        }
    }
}

impl std::error::Error for CipherError {}

/// Bad password, salt or KDF parameters, or an Argon2 backend fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyDerivationError(pub String);

impl KeyDerivationError {
    pub(crate) fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

impl fmt::Display for KeyDerivationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "key derivation: {}", self.0)
    }
}

impl std::error::Error for KeyDerivationError {}
