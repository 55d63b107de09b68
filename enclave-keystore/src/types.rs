//! Core types: the persisted keystore record, session state, and the
//! metadata shapes exchanged with the vector backend.

use chrono::{DateTime, Utc};
use enclave_core::KdfConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Keystore schema version written by this crate.
pub const KEYSTORE_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Keystore record
// ---------------------------------------------------------------------------

/// The on-disk keystore. Holds everything needed to re-derive and check the
/// session key, and never the key itself.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeystoreRecord {
    pub version: u32,
    pub created_at: DateTime<Utc>,
    pub kdf_config: KdfConfig,
    /// Hex-encoded 16-byte salt.
    pub salt: String,
    /// `sha256:<64 hex>` digest of the derived key.
    pub verifier_hash: String,
    pub metadata: KeystoreMetadata,
}

/// Attempt accounting carried alongside the key material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KeystoreMetadata {
    pub installation_id: Uuid,
    pub first_setup_completed: DateTime<Utc>,
    pub last_unlock_attempt: Option<DateTime<Utc>>,
    pub unlock_attempt_count: u64,
    pub last_successful_unlock: Option<DateTime<Utc>>,
}

impl KeystoreRecord {
    /// A fresh version-1 record for a just-completed setup.
    pub fn new(salt: &[u8], verifier_hash: impl Into<String>, kdf_config: KdfConfig) -> Self {
        let now = Utc::now();
        Self {
            version: KEYSTORE_VERSION,
            created_at: now,
            kdf_config,
            salt: hex::encode(salt),
            verifier_hash: verifier_hash.into(),
            metadata: KeystoreMetadata {
                installation_id: Uuid::new_v4(),
                first_setup_completed: now,
                last_unlock_attempt: None,
                unlock_attempt_count: 0,
                last_successful_unlock: None,
            },
        }
    }

    /// Decoded salt bytes. Only meaningful on a validated record.
    pub fn salt_bytes(&self) -> Result<Vec<u8>, hex::FromHexError> {
        hex::decode(&self.salt)
    }
}

// ---------------------------------------------------------------------------
// Session state machine
// ---------------------------------------------------------------------------

/// Session lifecycle state.
///
/// ```text
/// SETUP_REQUIRED → UNLOCKED ↔ LOCKED        (→ LOCKED if another process set up)
///        │             │        │
///        └─────────────┴────────┴──→ ERROR → (reset) → SETUP_REQUIRED
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    /// No keystore exists yet.
    SetupRequired,
    /// Keystore exists, no key in memory.
    Locked,
    /// Session key installed in the cipher.
    Unlocked,
    /// Keystore unreadable or corrupted. Terminal until reset.
    Error,
}

impl SessionState {
    /// Valid transitions from this state.
    pub fn valid_transitions(&self) -> &[SessionState] {
        match self {
            SessionState::SetupRequired => &[
                SessionState::Unlocked,
                SessionState::Locked,
                SessionState::Error,
            ],
            SessionState::Locked => &[
                SessionState::Unlocked,
                SessionState::SetupRequired,
                SessionState::Error,
            ],
            SessionState::Unlocked => &[
                SessionState::Locked,
                SessionState::SetupRequired,
                SessionState::Error,
            ],
            SessionState::Error => &[SessionState::SetupRequired],
        }
    }

    /// Check if transitioning to `target` is valid.
    pub fn can_transition_to(&self, target: SessionState) -> bool {
        self.valid_transitions().contains(&target)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionState::SetupRequired => write!(f, "SETUP_REQUIRED"),
            SessionState::Locked => write!(f, "LOCKED"),
            SessionState::Unlocked => write!(f, "UNLOCKED"),
            SessionState::Error => write!(f, "ERROR"),
        }
    }
}

/// Snapshot of the session for status displays.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SessionStatus {
    pub state: SessionState,
    pub unlocked_at: Option<DateTime<Utc>>,
    /// Time left before the lazy timeout locks the session.
    pub remaining: Option<Duration>,
    pub failed_attempts: u32,
    pub max_attempts: u32,
}

impl SessionStatus {
    pub fn is_locked_out(&self) -> bool {
        self.failed_attempts >= self.max_attempts
    }
}

// ---------------------------------------------------------------------------
// Chunk metadata
// ---------------------------------------------------------------------------

/// Caller-facing metadata: flat key to arbitrary JSON value.
pub type Metadata = BTreeMap<String, serde_json::Value>;

/// Metadata as handed to the vector backend.
pub type StoredMetadata = BTreeMap<String, MetadataValue>;

/// A value the vector backend can index and filter on.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl MetadataValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Int(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Map a JSON value onto a backend primitive. Arrays and objects are
    /// rendered as JSON text; `null` has no primitive form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        use serde_json::Value;
        match value {
            Value::Null => None,
            Value::Bool(b) => Some(Self::Bool(*b)),
            Value::Number(n) => match n.as_i64() {
                Some(i) => Some(Self::Int(i)),
                None => n.as_f64().map(Self::Float),
            },
            Value::String(s) => Some(Self::Str(s.clone())),
            Value::Array(_) | Value::Object(_) => Some(Self::Str(value.to_string())),
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Int(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Str(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        Self::Str(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        Self::Str(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        Self::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(f: f64) -> Self {
        Self::Float(f)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        Self::Bool(b)
    }
}
