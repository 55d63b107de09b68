//! Audit logging: every session transition emits a structured event.
//!
//! Events carry no secrets: no passwords, keys, plaintext or metadata values.

use crate::types::SessionState;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

const CHAIN_GENESIS: &[u8] = b"enclave-audit-genesis";

// ---------------------------------------------------------------------------
// Audit events
// ---------------------------------------------------------------------------

/// What happened.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    SetupCompleted,
    SetupFailed,
    UnlockSucceeded,
    UnlockFailed { failed_attempts: u32 },
    UnlockRejectedLockedOut { failed_attempts: u32 },
    Locked,
    SessionTimedOut,
    SessionExtended,
    KeystoreFailure,
    Reset,
}

/// A structured audit event.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    /// Session state after the action.
    pub state: SessionState,
    pub success: bool,
    pub detail: Option<String>,
    /// Monotonic sequence number (populated by integrity chain sink).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sequence: Option<u64>,
    /// SHA-256 of the previous event's JSON (populated by integrity chain sink).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
}

impl AuditEvent {
    pub fn new(action: AuditAction, state: SessionState) -> Self {
        Self {
            timestamp: Utc::now(),
            action,
            state,
            success: true,
            detail: None,
            sequence: None,
            prev_hash: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn with_failure(mut self) -> Self {
        self.success = false;
        self
    }
}

// ---------------------------------------------------------------------------
// Audit sink trait
// ---------------------------------------------------------------------------

/// Where audit events go.
///
/// Events are delivered in order once the session has finished updating its
/// state. A sink may query the session from inside `record`.
pub trait AuditSinkSync: Send + Sync {
    fn record(&self, event: AuditEvent);
}

// ---------------------------------------------------------------------------
// Built-in sinks
// ---------------------------------------------------------------------------

/// Logs events via the `tracing` crate.
pub struct TracingAuditSink;

impl AuditSinkSync for TracingAuditSink {
    fn record(&self, event: AuditEvent) {
        tracing::info!(
            timestamp = %event.timestamp,
            action = ?event.action,
            state = %event.state,
            success = event.success,
            detail = ?event.detail,
            "audit"
        );
    }
}

/// Collects events in memory (for testing).
#[derive(Clone, Default)]
pub struct InMemoryAuditSink {
    events: Arc<Mutex<Vec<AuditEvent>>>,
}

impl InMemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<AuditEvent> {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn actions(&self) -> Vec<AuditAction> {
        self.events().into_iter().map(|e| e.action).collect()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl AuditSinkSync for InMemoryAuditSink {
    fn record(&self, event: AuditEvent) {
        self.events
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(event);
    }
}

/// Appends JSON lines to a file.
pub struct FileAuditSink {
    path: PathBuf,
}

impl FileAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl AuditSinkSync for FileAuditSink {
    fn record(&self, event: AuditEvent) {
        let json = match serde_json::to_string(&event) {
            Ok(json) => json,
            Err(e) => {
                tracing::error!(error = %e, "audit serialize failed");
                return;
            }
        };
        let written = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut file| writeln!(file, "{}", json));
        if let Err(e) = written {
            tracing::error!(path = ?self.path, error = %e, "audit write failed");
        }
    }
}

// ---------------------------------------------------------------------------
// Integrity chain sink (tamper-evident audit log)
// ---------------------------------------------------------------------------

/// Wraps any `AuditSinkSync` and adds a SHA-256 hash chain.
///
/// Each event gets a monotonic `sequence` and a `prev_hash` holding the hex
/// SHA-256 of the previous event's JSON. The genesis hash is
/// `SHA-256("enclave-audit-genesis")`.
pub struct IntegrityChainSink {
    inner: Arc<dyn AuditSinkSync>,
    state: Mutex<ChainState>,
}

struct ChainState {
    sequence: u64,
    prev_hash: String,
}

impl IntegrityChainSink {
    pub fn new(inner: Arc<dyn AuditSinkSync>) -> Self {
        Self {
            inner,
            state: Mutex::new(ChainState {
                sequence: 0,
                prev_hash: genesis_hash(),
            }),
        }
    }
}

pub fn genesis_hash() -> String {
    hex::encode(Sha256::digest(CHAIN_GENESIS))
}

/// Recompute the chain over `events` and report the first broken link.
pub fn verify_chain(events: &[AuditEvent]) -> Result<(), u64> {
    let mut expected = genesis_hash();
    for (i, event) in events.iter().enumerate() {
        let i = i as u64;
        if event.sequence != Some(i) || event.prev_hash.as_deref() != Some(expected.as_str()) {
            return Err(i);
        }
        let json = serde_json::to_string(event).map_err(|_| i)?;
        expected = hex::encode(Sha256::digest(json.as_bytes()));
    }
    Ok(())
}

impl AuditSinkSync for IntegrityChainSink {
    fn record(&self, mut event: AuditEvent) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());

        event.sequence = Some(state.sequence);
        event.prev_hash = Some(state.prev_hash.clone());

        // Hash covers the whole event, sequence and prev_hash included.
        if let Ok(json) = serde_json::to_string(&event) {
            state.prev_hash = hex::encode(Sha256::digest(json.as_bytes()));
        }
        state.sequence += 1;

        drop(state);
        self.inner.record(event);
    }
}
