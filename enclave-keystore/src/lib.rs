//! # Enclave Keystore
//!
//! Password-gated session lifecycle and encrypted chunk storage.
//!
//! A [`SessionStateMachine`] owns the persisted keystore and the session
//! cipher. An [`EncryptedStore`] borrows the cipher through a read-only
//! handle and seals chunk text and sensitive metadata before anything
//! reaches the [`VectorBackend`]. Embeddings and a fixed set of searchable
//! fields stay in the clear so similarity search and filtering still work.
//!
//! ## Quick Start
//!
//! ```rust
//! use enclave_keystore::*;
//! use enclave_core::KdfConfig;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! let config = SessionConfig::default().with_kdf(KdfConfig::argon2id(1, 256, 1));
//! let session = SessionStateMachine::with_backend(config, Arc::new(InMemoryBackend::new()));
//! session.setup("Sup3r$ecret!").unwrap();
//!
//! let store = EncryptedStore::new(session.cipher(), Arc::new(InMemoryVectorBackend::new("notes")));
//! let mut metadata = Metadata::new();
//! metadata.insert("source_id".into(), json!("doc1"));
//! metadata.insert("user_notes".into(), json!("private"));
//! store.add_chunk("hello world", &metadata, vec![0.1, 0.2], None).unwrap();
//!
//! session.lock();
//! assert!(store.query(&[0.1, 0.2], 1, None).unwrap_err().is_locked());
//! ```

pub mod audit;
pub mod backend;
pub mod config;
pub mod error;
pub mod filter;
pub mod keystore;
pub mod metadata;
pub mod policy;
pub mod session;
pub mod storage;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use audit::{
    AuditAction, AuditEvent, AuditSinkSync, FileAuditSink, InMemoryAuditSink, IntegrityChainSink,
    TracingAuditSink,
};
pub use backend::{InMemoryVectorBackend, QueryHit, StoredChunk, VectorBackend};
pub use config::SessionConfig;
pub use error::{KeystoreError, SessionError, StoreError};
pub use filter::{Condition, Filter};
pub use keystore::Keystore;
pub use metadata::{FilterValidation, MetadataSplitter, SEARCHABLE_FIELDS, SENSITIVE_FIELDS};
pub use policy::{PasswordPolicy, PolicyVerdict};
pub use session::SessionStateMachine;
pub use storage::{FileBackend, InMemoryBackend, KeystoreBackend};
pub use store::{ChunkResult, CollectionInfo, DecryptedChunk, EncryptedStore, NewChunk, RecordError};
pub use types::{
    KeystoreMetadata, KeystoreRecord, Metadata, MetadataValue, SessionState, SessionStatus,
    StoredMetadata,
};

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
