//! Keystore: create, load and update the persisted password record.

use crate::error::KeystoreError;
use crate::storage::{FileBackend, KeystoreBackend};
use crate::types::{KeystoreRecord, KEYSTORE_VERSION};

use chrono::Utc;
use enclave_core::{is_verifier_format, KdfConfig, SALT_BYTES};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct Keystore {
    backend: Arc<dyn KeystoreBackend>,
}

impl Keystore {
    pub fn new(backend: Arc<dyn KeystoreBackend>) -> Self {
        Self { backend }
    }

    /// File-backed keystore at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        Self::new(Arc::new(FileBackend::new(path)))
    }

    pub fn path(&self) -> Option<&Path> {
        self.backend.path()
    }

    pub fn exists(&self) -> Result<bool, KeystoreError> {
        self.backend.exists()
    }

    /// Write a brand-new record. Never overwrites an existing keystore.
    pub fn create(
        &self,
        salt: &[u8],
        verifier_hash: &str,
        kdf_config: &KdfConfig,
    ) -> Result<KeystoreRecord, KeystoreError> {
        let record = KeystoreRecord::new(salt, verifier_hash, kdf_config.clone());
        validate(&record)?;
        self.backend.create_new(&render(&record)?)?;
        tracing::info!(
            installation_id = %record.metadata.installation_id,
            "keystore created"
        );
        Ok(record)
    }

    /// Read and strictly validate the record.
    pub fn load(&self) -> Result<KeystoreRecord, KeystoreError> {
        let data = self.backend.read()?.ok_or(KeystoreError::NotFound)?;
        let record: KeystoreRecord = serde_json::from_str(&data)
            .map_err(|e| KeystoreError::corrupted(format!("parse: {}", e)))?;
        validate(&record)?;
        Ok(record)
    }

    /// Count an unlock attempt; on success also stamp the last success.
    /// Salt, verifier and KDF parameters are carried over untouched.
    pub fn record_unlock_attempt(&self, success: bool) -> Result<KeystoreRecord, KeystoreError> {
        let mut record = self.load()?;
        let now = Utc::now();
        record.metadata.unlock_attempt_count = record.metadata.unlock_attempt_count.saturating_add(1);
        record.metadata.last_unlock_attempt = Some(now);
        if success {
            record.metadata.last_successful_unlock = Some(now);
        }
        self.persist(&record)?;
        Ok(record)
    }

    /// Delete the keystore. Everything encrypted under it becomes unreadable.
    pub fn reset(&self) -> Result<(), KeystoreError> {
        self.backend.remove()?;
        tracing::warn!("keystore deleted");
        Ok(())
    }

    fn persist(&self, record: &KeystoreRecord) -> Result<(), KeystoreError> {
        self.backend.write(&render(record)?)
    }
}

fn render(record: &KeystoreRecord) -> Result<String, KeystoreError> {
    serde_json::to_string_pretty(record).map_err(|e| KeystoreError::io("serialize", e))
}

impl std::fmt::Debug for Keystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keystore").field("path", &self.path()).finish()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

fn validate(record: &KeystoreRecord) -> Result<(), KeystoreError> {
    if record.version != KEYSTORE_VERSION {
        return Err(KeystoreError::corrupted(format!(
            "unsupported version {}",
            record.version
        )));
    }

    let salt_hex_len = SALT_BYTES * 2;
    if record.salt.len() != salt_hex_len || !is_lower_hex(&record.salt) {
        return Err(KeystoreError::corrupted(format!(
            "salt must be {} hex characters",
            salt_hex_len
        )));
    }

    if !is_verifier_format(&record.verifier_hash) {
        return Err(KeystoreError::corrupted("verifier_hash format"));
    }

    record
        .kdf_config
        .validate()
        .map_err(|e| KeystoreError::corrupted(format!("kdf_config: {}", e)))?;

    if record.metadata.installation_id.is_nil() {
        return Err(KeystoreError::corrupted("installation_id is nil"));
    }
    Ok(())
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes().all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryBackend;
    use serde_json::Value;

    fn verifier() -> String {
        format!("sha256:{}", "ab".repeat(32))
    }

    fn fresh() -> (Keystore, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new());
        (Keystore::new(backend.clone()), backend)
    }

    fn tamper(backend: &InMemoryBackend, edit: impl FnOnce(&mut Value)) {
        let mut value: Value = serde_json::from_str(&backend.read().unwrap().unwrap()).unwrap();
        edit(&mut value);
        backend.write(&value.to_string()).unwrap();
    }

    #[test]
    fn create_then_load() {
        let (ks, _) = fresh();
        assert!(!ks.exists().unwrap());
        let created = ks.create(&[3u8; 16], &verifier(), &KdfConfig::default()).unwrap();
        assert!(ks.exists().unwrap());

        let loaded = ks.load().unwrap();
        assert_eq!(loaded, created);
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.salt, "03".repeat(16));
        assert_eq!(loaded.metadata.unlock_attempt_count, 0);
    }

    #[test]
    fn concurrent_create_has_one_winner() {
        use std::sync::Barrier;

        for round in 0..10u8 {
            let dir = tempfile::tempdir().unwrap();
            let path = dir.path().join("keystore.json");
            let barrier = Arc::new(Barrier::new(4));

            let handles: Vec<_> = (0..4u8)
                .map(|i| {
                    let path = path.clone();
                    let barrier = Arc::clone(&barrier);
                    std::thread::spawn(move || {
                        let ks = Keystore::open(path);
                        barrier.wait();
                        ks.create(&[i + 1; 16], &verifier(), &KdfConfig::default())
                    })
                })
                .collect();
            let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

            let winners: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
            assert_eq!(winners.len(), 1, "round {}", round);
            assert!(results
                .iter()
                .filter_map(|r| r.as_ref().err())
                .all(|e| matches!(e, KeystoreError::AlreadyExists)));
            let on_disk = Keystore::open(&path).load().unwrap();
            assert_eq!(&on_disk, winners[0]);
        }
    }

    #[test]
    fn create_refuses_to_overwrite() {
        let (ks, _) = fresh();
        let first = ks.create(&[1u8; 16], &verifier(), &KdfConfig::default()).unwrap();
        let err = ks.create(&[2u8; 16], &verifier(), &KdfConfig::default()).unwrap_err();
        assert!(matches!(err, KeystoreError::AlreadyExists));
        assert_eq!(ks.load().unwrap().salt, first.salt);
    }

    #[test]
    fn load_missing_is_not_found() {
        let (ks, _) = fresh();
        assert!(matches!(ks.load(), Err(KeystoreError::NotFound)));
    }

    #[test]
    fn record_attempts() {
        let (ks, _) = fresh();
        let created = ks.create(&[1u8; 16], &verifier(), &KdfConfig::default()).unwrap();

        let after_fail = ks.record_unlock_attempt(false).unwrap();
        assert_eq!(after_fail.metadata.unlock_attempt_count, 1);
        assert!(after_fail.metadata.last_unlock_attempt.is_some());
        assert!(after_fail.metadata.last_successful_unlock.is_none());

        let after_ok = ks.record_unlock_attempt(true).unwrap();
        assert_eq!(after_ok.metadata.unlock_attempt_count, 2);
        assert!(after_ok.metadata.last_successful_unlock.is_some());

        let loaded = ks.load().unwrap();
        assert_eq!(loaded.salt, created.salt);
        assert_eq!(loaded.verifier_hash, created.verifier_hash);
        assert_eq!(loaded.kdf_config, created.kdf_config);
    }

    #[test]
    fn garbage_is_corrupted() {
        let (ks, backend) = fresh();
        backend.write("not json at all").unwrap();
        assert!(matches!(ks.load(), Err(KeystoreError::Corrupted(_))));
    }

    fn assert_corrupted(case: &str, edit: impl FnOnce(&mut Value)) {
        let (ks, backend) = fresh();
        ks.create(&[1u8; 16], &verifier(), &KdfConfig::default()).unwrap();
        tamper(&backend, edit);
        assert!(
            matches!(ks.load(), Err(KeystoreError::Corrupted(_))),
            "case {} should be corrupted",
            case
        );
    }

    #[test]
    fn strict_validation() {
        assert_corrupted("version", |v| v["version"] = 2.into());
        assert_corrupted("short salt", |v| v["salt"] = "abcd".into());
        assert_corrupted("upper salt", |v| v["salt"] = "AB".repeat(16).into());
        assert_corrupted("verifier", |v| v["verifier_hash"] = "md5:1234".into());
        assert_corrupted("kdf", |v| v["kdf_config"]["algorithm"] = "scrypt".into());
        assert_corrupted("uuid", |v| v["metadata"]["installation_id"] = "not-a-uuid".into());
        assert_corrupted("extra field", |v| v["derived_key"] = "00".into());
        assert_corrupted("missing field", |v| {
            v.as_object_mut().unwrap().remove("verifier_hash");
        });
    }

    #[test]
    fn create_rejects_bad_inputs() {
        let (ks, _) = fresh();
        assert!(matches!(
            ks.create(&[1u8; 8], &verifier(), &KdfConfig::default()),
            Err(KeystoreError::Corrupted(_))
        ));
        assert!(!ks.exists().unwrap());
    }

    #[test]
    fn reset_deletes() {
        let (ks, _) = fresh();
        ks.create(&[1u8; 16], &verifier(), &KdfConfig::default()).unwrap();
        ks.reset().unwrap();
        assert!(!ks.exists().unwrap());
        ks.create(&[2u8; 16], &verifier(), &KdfConfig::default()).unwrap();
    }

    #[test]
    fn file_keystore_never_holds_more_than_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let ks = Keystore::open(dir.path().join("keystore.json"));
        ks.create(&[9u8; 16], &verifier(), &KdfConfig::argon2id(1, 256, 1)).unwrap();

        let raw = std::fs::read_to_string(ks.path().unwrap()).unwrap();
        let value: Value = serde_json::from_str(&raw).unwrap();
        let keys: Vec<_> = value.as_object().unwrap().keys().cloned().collect();
        assert_eq!(
            keys,
            vec!["created_at", "kdf_config", "metadata", "salt", "verifier_hash", "version"]
        );
        assert_eq!(value["kdf_config"]["memory_cost"], 256);
    }
}
