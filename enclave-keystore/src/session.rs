//! Session lifecycle: setup, unlock, lock, timeout and lockout.
//!
//! One reentrant mutex serializes every operation, so concurrent unlock and
//! lock calls never interleave. Audit events are queued while the state is
//! borrowed and handed to the sink once the borrow ends, so a sink may read
//! the session back. Timeouts are checked lazily on every state query;
//! nothing runs in the background.

use crate::audit::{AuditAction, AuditEvent, AuditSinkSync, TracingAuditSink};
use crate::config::SessionConfig;
use crate::error::{KeystoreError, SessionError};
use crate::keystore::Keystore;
use crate::policy::PolicyVerdict;
use crate::storage::KeystoreBackend;
use crate::types::{KeystoreRecord, SessionState, SessionStatus};

use chrono::{DateTime, Utc};
use enclave_core::{
    AuthenticatedCipher, CipherHandle, DerivedKey, KeyDerivationEngine, KeyDerivationError,
};
use parking_lot::ReentrantMutex;
use std::cell::RefCell;
use std::sync::Arc;
use std::time::{Duration, Instant};

struct SessionInner {
    state: SessionState,
    /// Monotonic unlock time, drives the timeout.
    unlocked_at: Option<Instant>,
    /// Wall-clock unlock time, for status displays only.
    unlocked_wall: Option<DateTime<Utc>>,
    failed_attempts: u32,
    last_failure: Option<Instant>,
    pending: Vec<AuditEvent>,
}

impl SessionInner {
    fn emit(&mut self, event: AuditEvent) {
        self.pending.push(event);
    }

    fn clear_unlock(&mut self) {
        self.unlocked_at = None;
        self.unlocked_wall = None;
    }
}

/// Owns the keystore, the derivation engine and the session cipher.
pub struct SessionStateMachine {
    config: SessionConfig,
    keystore: Keystore,
    engine: KeyDerivationEngine,
    cipher: Arc<AuthenticatedCipher>,
    audit: Arc<dyn AuditSinkSync>,
    inner: ReentrantMutex<RefCell<SessionInner>>,
}

impl SessionStateMachine {
    /// File-backed session at `config.keystore_path`.
    pub fn new(config: SessionConfig) -> Self {
        let keystore = Keystore::open(config.keystore_path.clone());
        Self::build(config, keystore)
    }

    pub fn with_backend(config: SessionConfig, backend: Arc<dyn KeystoreBackend>) -> Self {
        Self::build(config, Keystore::new(backend))
    }

    pub fn with_audit(mut self, audit: Arc<dyn AuditSinkSync>) -> Self {
        self.audit = audit;
        self
    }

    fn build(config: SessionConfig, keystore: Keystore) -> Self {
        let state = match keystore.exists() {
            Ok(true) => SessionState::Locked,
            Ok(false) => SessionState::SetupRequired,
            Err(e) => {
                tracing::error!(error = %e, "keystore unreadable at startup");
                SessionState::Error
            }
        };
        tracing::debug!(%state, path = ?keystore.path(), "session initialized");
        Self {
            config,
            keystore,
            engine: KeyDerivationEngine::new(),
            cipher: Arc::new(AuthenticatedCipher::new()),
            audit: Arc::new(TracingAuditSink),
            inner: ReentrantMutex::new(RefCell::new(SessionInner {
                state,
                unlocked_at: None,
                unlocked_wall: None,
                failed_attempts: 0,
                last_failure: None,
                pending: Vec::new(),
            })),
        }
    }

    // -----------------------------------------------------------------------
    // Setup
    // -----------------------------------------------------------------------

    /// First-run setup. Derives the key, writes the keystore and leaves the
    /// session unlocked.
    pub fn setup(&self, password: &str) -> Result<(), SessionError> {
        self.run(|inner| self.setup_locked(inner, password))
    }

    fn setup_locked(&self, inner: &mut SessionInner, password: &str) -> Result<(), SessionError> {
        match inner.state {
            SessionState::SetupRequired => {}
            SessionState::Error => return Err(SessionError::Unavailable),
            _ => return Err(SessionError::AlreadySetUp),
        }

        if let PolicyVerdict::Rejected { reason } = self.config.password_policy.evaluate(password) {
            inner.emit(
                AuditEvent::new(AuditAction::SetupFailed, inner.state)
                    .with_failure()
                    .with_detail("password rejected by policy"),
            );
            return Err(SessionError::WeakPassword(reason));
        }
        self.config.kdf.validate()?;

        let salt = self.engine.generate_salt();
        let key = self.engine.derive_key(password, &salt, &self.config.kdf)?;
        let verifier = self.engine.verifier_hash(&key[..]);

        match self.keystore.create(&salt, &verifier, &self.config.kdf) {
            Ok(_) => {}
            Err(KeystoreError::AlreadyExists) => {
                // Another process finished setup first.
                self.set_state(inner, SessionState::Locked);
                return Err(SessionError::AlreadySetUp);
            }
            Err(e) => {
                self.enter_error(inner, &e);
                inner.emit(
                    AuditEvent::new(AuditAction::SetupFailed, inner.state)
                        .with_failure()
                        .with_detail(e.to_string()),
                );
                return Err(SessionError::Keystore(e));
            }
        }

        self.install_key(&key[..])?;
        self.mark_unlocked(inner);
        inner.emit(AuditEvent::new(AuditAction::SetupCompleted, inner.state));
        tracing::info!("setup complete, session unlocked");
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Unlock / lock
    // -----------------------------------------------------------------------

    /// Verify the password and install the session key.
    ///
    /// Once `max_attempts` consecutive failures have accumulated this returns
    /// `TooManyAttempts` without deriving anything. Unlocking an already
    /// unlocked session is a no-op.
    pub fn unlock(&self, password: &str) -> Result<(), SessionError> {
        self.run(|inner| self.unlock_locked(inner, password))
    }

    fn unlock_locked(&self, inner: &mut SessionInner, password: &str) -> Result<(), SessionError> {
        self.expire_if_due(inner);
        match inner.state {
            SessionState::Locked => {}
            SessionState::Unlocked => return Ok(()),
            SessionState::SetupRequired => return Err(SessionError::SetupRequired),
            SessionState::Error => return Err(SessionError::Unavailable),
        }

        if inner.failed_attempts >= self.config.max_attempts {
            let cooled = match (self.config.lockout_cooldown, inner.last_failure) {
                (Some(cooldown), Some(at)) => at.elapsed() >= cooldown,
                _ => false,
            };
            if !cooled {
                inner.emit(
                    AuditEvent::new(
                        AuditAction::UnlockRejectedLockedOut {
                            failed_attempts: inner.failed_attempts,
                        },
                        inner.state,
                    )
                    .with_failure(),
                );
                tracing::warn!(
                    failed_attempts = inner.failed_attempts,
                    "unlock rejected, too many failed attempts"
                );
                return Err(SessionError::TooManyAttempts {
                    retry_after: self.retry_after(inner),
                });
            }
            tracing::info!("lockout cooldown elapsed, attempts reset");
            inner.failed_attempts = 0;
        }

        let record = match self.keystore.load() {
            Ok(record) => record,
            Err(KeystoreError::NotFound) => {
                tracing::warn!("keystore vanished, setup required");
                self.set_state(inner, SessionState::SetupRequired);
                return Err(SessionError::SetupRequired);
            }
            Err(e) => {
                self.enter_error(inner, &e);
                return Err(SessionError::UnlockFailed);
            }
        };

        match self.check_password(password, &record) {
            Ok(Some(key)) => {
                if let Err(e) = self.keystore.record_unlock_attempt(true) {
                    self.enter_error(inner, &e);
                    return Err(SessionError::UnlockFailed);
                }
                self.install_key(&key[..])?;
                inner.failed_attempts = 0;
                inner.last_failure = None;
                self.mark_unlocked(inner);
                inner.emit(AuditEvent::new(AuditAction::UnlockSucceeded, inner.state));
                tracing::info!("session unlocked");
                Ok(())
            }
            Ok(None) => self.fail_attempt(inner, "wrong password"),
            Err(e) => {
                tracing::debug!(error = %e, "derivation failed during unlock");
                self.fail_attempt(inner, "key derivation failed")
            }
        }
    }

    /// Scrub the key and return to Locked. Returns whether anything changed;
    /// locking a locked session is a silent no-op.
    pub fn lock(&self) -> bool {
        self.run(|inner| {
            self.cipher.clear_key();
            if inner.state != SessionState::Unlocked {
                return false;
            }
            self.set_state(inner, SessionState::Locked);
            inner.clear_unlock();
            inner.emit(AuditEvent::new(AuditAction::Locked, inner.state));
            tracing::info!("session locked");
            true
        })
    }

    /// Restart the timeout window.
    pub fn extend_session(&self) -> Result<(), SessionError> {
        self.run(|inner| {
            self.expire_if_due(inner);
            if inner.state != SessionState::Unlocked {
                return Err(SessionError::NotUnlocked);
            }
            inner.unlocked_at = Some(Instant::now());
            inner.emit(AuditEvent::new(AuditAction::SessionExtended, inner.state));
            Ok(())
        })
    }

    /// Delete the keystore and return to SetupRequired. The only way out of
    /// the Error state.
    pub fn reset(&self) -> Result<(), SessionError> {
        self.run(|inner| {
            self.cipher.clear_key();
            if let Err(e) = self.keystore.reset() {
                self.enter_error(inner, &e);
                return Err(SessionError::Keystore(e));
            }
            self.set_state(inner, SessionState::SetupRequired);
            inner.clear_unlock();
            inner.failed_attempts = 0;
            inner.last_failure = None;
            inner.emit(AuditEvent::new(AuditAction::Reset, inner.state));
            Ok(())
        })
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_state(&self) -> SessionState {
        self.run(|inner| {
            self.expire_if_due(inner);
            inner.state
        })
    }

    pub fn is_unlocked(&self) -> bool {
        self.get_state() == SessionState::Unlocked
    }

    pub fn is_setup_required(&self) -> bool {
        self.get_state() == SessionState::SetupRequired
    }

    /// Lock now if the session has outlived its timeout. Returns whether it
    /// did.
    pub fn check_timeout(&self) -> bool {
        self.run(|inner| self.expire_if_due(inner))
    }

    pub fn status(&self) -> SessionStatus {
        self.run(|inner| {
            self.expire_if_due(inner);
            let remaining = inner
                .unlocked_at
                .filter(|_| inner.state == SessionState::Unlocked)
                .map(|at| self.config.session_timeout.saturating_sub(at.elapsed()));
            SessionStatus {
                state: inner.state,
                unlocked_at: inner.unlocked_wall,
                remaining,
                failed_attempts: inner.failed_attempts,
                max_attempts: self.config.max_attempts,
            }
        })
    }

    /// Read-only cipher access for the encrypted store.
    pub fn cipher(&self) -> CipherHandle {
        self.cipher.handle()
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn keystore(&self) -> &Keystore {
        &self.keystore
    }

    /// Argon2 invocations so far.
    pub fn derivation_count(&self) -> u64 {
        self.engine.derivation_count()
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    /// Run `op` under the session lock, then deliver the events it queued.
    ///
    /// Delivery happens with the lock still held, so events from concurrent
    /// callers never interleave, but after the state borrow is released.
    fn run<R>(&self, op: impl FnOnce(&mut SessionInner) -> R) -> R {
        let guard = self.inner.lock();
        let (result, events) = {
            let mut inner = guard.borrow_mut();
            let result = op(&mut *inner);
            (result, std::mem::take(&mut inner.pending))
        };
        for event in events {
            self.audit.record(event);
        }
        result
    }

    fn set_state(&self, inner: &mut SessionInner, to: SessionState) {
        if inner.state == to {
            return;
        }
        debug_assert!(
            inner.state.can_transition_to(to),
            "invalid session transition {} -> {}",
            inner.state,
            to
        );
        tracing::debug!(from = %inner.state, %to, "session transition");
        inner.state = to;
    }

    fn mark_unlocked(&self, inner: &mut SessionInner) {
        self.set_state(inner, SessionState::Unlocked);
        inner.unlocked_at = Some(Instant::now());
        inner.unlocked_wall = Some(Utc::now());
    }

    fn install_key(&self, key: &[u8]) -> Result<(), SessionError> {
        self.cipher
            .set_key(key)
            .map_err(|e| SessionError::KeyDerivation(KeyDerivationError(e.to_string())))
    }

    /// `Ok(Some(key))` on a match, `Ok(None)` on a wrong password.
    fn check_password(
        &self,
        password: &str,
        record: &KeystoreRecord,
    ) -> Result<Option<DerivedKey>, KeyDerivationError> {
        let salt = record
            .salt_bytes()
            .map_err(|e| KeyDerivationError(format!("salt: {}", e)))?;
        let check =
            self.engine
                .verify_password(password, &salt, &record.kdf_config, &record.verifier_hash)?;
        Ok(if check.valid { Some(check.key) } else { None })
    }

    fn fail_attempt(&self, inner: &mut SessionInner, detail: &str) -> Result<(), SessionError> {
        inner.failed_attempts = inner.failed_attempts.saturating_add(1);
        inner.last_failure = Some(Instant::now());
        if let Err(e) = self.keystore.record_unlock_attempt(false) {
            self.enter_error(inner, &e);
            return Err(SessionError::UnlockFailed);
        }
        inner.emit(
            AuditEvent::new(
                AuditAction::UnlockFailed {
                    failed_attempts: inner.failed_attempts,
                },
                inner.state,
            )
            .with_failure()
            .with_detail(detail),
        );
        tracing::warn!(
            failed_attempts = inner.failed_attempts,
            max_attempts = self.config.max_attempts,
            "unlock failed"
        );
        Err(SessionError::UnlockFailed)
    }

    fn retry_after(&self, inner: &SessionInner) -> Option<Duration> {
        let cooldown = self.config.lockout_cooldown?;
        let since = inner.last_failure?.elapsed();
        Some(cooldown.saturating_sub(since))
    }

    fn enter_error(&self, inner: &mut SessionInner, err: &KeystoreError) {
        self.cipher.clear_key();
        self.set_state(inner, SessionState::Error);
        inner.clear_unlock();
        tracing::error!(error = %err, "keystore failure, reset required");
        inner.emit(
            AuditEvent::new(AuditAction::KeystoreFailure, inner.state)
                .with_failure()
                .with_detail(err.to_string()),
        );
    }

    /// Strictly greater than the timeout locks.
    fn expire_if_due(&self, inner: &mut SessionInner) -> bool {
        if inner.state != SessionState::Unlocked {
            return false;
        }
        let expired = inner
            .unlocked_at
            .map_or(false, |at| at.elapsed() > self.config.session_timeout);
        if !expired {
            return false;
        }
        self.cipher.clear_key();
        self.set_state(inner, SessionState::Locked);
        inner.clear_unlock();
        inner.emit(AuditEvent::new(AuditAction::SessionTimedOut, inner.state));
        tracing::info!("session timed out");
        true
    }

    /// Pretend the session was unlocked `by` earlier.
    #[cfg(test)]
    pub(crate) fn backdate_unlock(&self, by: Duration) {
        self.run(|inner| {
            if let Some(at) = inner.unlocked_at {
                inner.unlocked_at = Some(at.checked_sub(by).expect("clock can be backdated"));
            }
        })
    }

    #[cfg(test)]
    pub(crate) fn backdate_last_failure(&self, by: Duration) {
        self.run(|inner| {
            if let Some(at) = inner.last_failure {
                inner.last_failure = Some(at.checked_sub(by).expect("clock can be backdated"));
            }
        })
    }
}

impl std::fmt::Debug for SessionStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.lock();
        let inner = guard.borrow();
        f.debug_struct("SessionStateMachine")
            .field("state", &inner.state)
            .field("failed_attempts", &inner.failed_attempts)
            .field("keystore", &self.keystore)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::InMemoryAuditSink;
    use crate::policy::PasswordPolicy;
    use crate::storage::InMemoryBackend;
    use enclave_core::KdfConfig;

    const PASSWORD: &str = "Sup3r$ecret!";

    fn fast_config() -> SessionConfig {
        SessionConfig::default()
            .with_kdf(KdfConfig::argon2id(1, 256, 1))
            .with_max_attempts(3)
    }

    fn session_with(config: SessionConfig) -> (SessionStateMachine, Arc<InMemoryBackend>, InMemoryAuditSink) {
        let backend = Arc::new(InMemoryBackend::new());
        let audit = InMemoryAuditSink::new();
        let session = SessionStateMachine::with_backend(config, backend.clone())
            .with_audit(Arc::new(audit.clone()));
        (session, backend, audit)
    }

    #[test]
    fn starts_in_setup_required() {
        let (session, _, _) = session_with(fast_config());
        assert!(session.is_setup_required());
        assert!(matches!(session.unlock(PASSWORD), Err(SessionError::SetupRequired)));
        assert!(matches!(session.extend_session(), Err(SessionError::NotUnlocked)));
    }

    #[test]
    fn existing_keystore_starts_locked() {
        let backend = Arc::new(InMemoryBackend::new());
        SessionStateMachine::with_backend(fast_config(), backend.clone())
            .setup(PASSWORD)
            .unwrap();
        let second = SessionStateMachine::with_backend(fast_config(), backend);
        assert_eq!(second.get_state(), SessionState::Locked);
        second.unlock(PASSWORD).unwrap();
        assert!(second.is_unlocked());
    }

    #[test]
    fn setup_unlocks_and_rejects_repeat() {
        let (session, _, audit) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        assert!(session.is_unlocked());
        assert!(session.cipher().is_unlocked());
        assert!(matches!(session.setup(PASSWORD), Err(SessionError::AlreadySetUp)));
        assert_eq!(audit.actions(), vec![AuditAction::SetupCompleted]);
    }

    #[test]
    fn weak_password_leaves_state_unchanged() {
        let (session, backend, _) = session_with(fast_config());
        let err = session.setup("short").unwrap_err();
        assert!(matches!(err, SessionError::WeakPassword(_)));
        assert!(session.is_setup_required());
        assert!(!backend.exists().unwrap());
        assert_eq!(session.derivation_count(), 0);
    }

    #[test]
    fn permissive_policy_accepts_anything_nonempty() {
        let config = fast_config().with_password_policy(PasswordPolicy::permissive());
        let (session, _, _) = session_with(config);
        session.setup("x").unwrap();
        assert!(session.is_unlocked());
    }

    #[test]
    fn setup_write_failure_enters_error() {
        let (session, backend, audit) = session_with(fast_config());
        backend.set_fail_writes(true);
        assert!(matches!(session.setup(PASSWORD), Err(SessionError::Keystore(_))));
        assert_eq!(session.get_state(), SessionState::Error);
        assert!(!session.cipher().is_unlocked());
        assert!(matches!(session.unlock(PASSWORD), Err(SessionError::Unavailable)));
        assert!(audit.actions().contains(&AuditAction::KeystoreFailure));

        backend.set_fail_writes(false);
        session.reset().unwrap();
        assert!(session.is_setup_required());
    }

    #[test]
    fn wrong_password_counts_and_locks_out() {
        let (session, _, audit) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        session.lock();

        for expected in 1..=3 {
            assert!(matches!(session.unlock("wrong"), Err(SessionError::UnlockFailed)));
            assert_eq!(session.status().failed_attempts, expected);
        }
        let derivations = session.derivation_count();
        assert!(matches!(
            session.unlock(PASSWORD),
            Err(SessionError::TooManyAttempts { retry_after: None })
        ));
        assert_eq!(session.derivation_count(), derivations);
        assert!(session.status().is_locked_out());
        assert!(audit
            .actions()
            .contains(&AuditAction::UnlockRejectedLockedOut { failed_attempts: 3 }));
    }

    #[test]
    fn success_resets_failure_count() {
        let (session, _, _) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        session.lock();
        session.unlock("nope").unwrap_err();
        session.unlock("nope again").unwrap_err();
        session.unlock(PASSWORD).unwrap();
        assert_eq!(session.status().failed_attempts, 0);
    }

    #[test]
    fn empty_password_is_a_failed_attempt() {
        let (session, _, _) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        session.lock();
        assert!(matches!(session.unlock(""), Err(SessionError::UnlockFailed)));
        assert_eq!(session.status().failed_attempts, 1);
    }

    #[test]
    fn cooldown_lifts_lockout() {
        let config = fast_config()
            .with_max_attempts(1)
            .with_lockout_cooldown(Duration::from_secs(60));
        let (session, _, _) = session_with(config);
        session.setup(PASSWORD).unwrap();
        session.lock();
        session.unlock("wrong").unwrap_err();
        match session.unlock(PASSWORD) {
            Err(SessionError::TooManyAttempts { retry_after: Some(d) }) => {
                assert!(d <= Duration::from_secs(60))
            }
            other => panic!("expected lockout, got {:?}", other),
        }
        session.backdate_last_failure(Duration::from_secs(61));
        session.unlock(PASSWORD).unwrap();
        assert!(session.is_unlocked());
    }

    #[test]
    fn lock_is_idempotent() {
        let (session, _, audit) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        assert!(session.lock());
        assert!(!session.lock());
        assert_eq!(session.get_state(), SessionState::Locked);
        assert!(!session.cipher().is_unlocked());
        let locks = audit.actions().iter().filter(|a| **a == AuditAction::Locked).count();
        assert_eq!(locks, 1);
    }

    #[test]
    fn timeout_locks_lazily() {
        let config = fast_config().with_session_timeout(Duration::from_secs(10));
        let (session, _, audit) = session_with(config);
        session.setup(PASSWORD).unwrap();
        assert!(!session.check_timeout());

        session.backdate_unlock(Duration::from_secs(11));
        // The cipher still holds the key until someone asks.
        assert!(session.cipher().is_unlocked());
        assert_eq!(session.get_state(), SessionState::Locked);
        assert!(!session.cipher().is_unlocked());
        assert!(audit.actions().contains(&AuditAction::SessionTimedOut));
    }

    #[test]
    fn extend_restarts_window() {
        let config = fast_config().with_session_timeout(Duration::from_secs(10));
        let (session, _, _) = session_with(config);
        session.setup(PASSWORD).unwrap();
        session.backdate_unlock(Duration::from_secs(8));
        session.extend_session().unwrap();
        session.backdate_unlock(Duration::from_secs(8));
        assert!(session.is_unlocked());
        let remaining = session.status().remaining.unwrap();
        assert!(remaining <= Duration::from_secs(2));
    }

    #[test]
    fn corrupted_keystore_enters_error() {
        let (session, backend, _) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        session.lock();
        backend.write("{ not json").unwrap();
        assert!(matches!(session.unlock(PASSWORD), Err(SessionError::UnlockFailed)));
        assert_eq!(session.get_state(), SessionState::Error);
        session.reset().unwrap();
        assert!(session.is_setup_required());
        assert!(!backend.exists().unwrap());
    }

    #[test]
    fn missing_keystore_returns_to_setup() {
        let (session, backend, _) = session_with(fast_config());
        session.setup(PASSWORD).unwrap();
        session.lock();
        backend.remove().unwrap();
        assert!(matches!(session.unlock(PASSWORD), Err(SessionError::SetupRequired)));
        assert!(session.is_setup_required());
    }

    #[test]
    fn status_reports_unlock_time() {
        let (session, _, _) = session_with(fast_config());
        assert_eq!(session.status().unlocked_at, None);
        session.setup(PASSWORD).unwrap();
        let status = session.status();
        assert_eq!(status.state, SessionState::Unlocked);
        assert!(status.unlocked_at.is_some());
        assert_eq!(status.max_attempts, 3);
    }

    /// Reads the session back from inside `record`.
    struct ReadBackSink {
        session: std::sync::OnceLock<std::sync::Weak<SessionStateMachine>>,
        seen: std::sync::Mutex<Vec<(AuditAction, SessionState)>>,
    }

    impl AuditSinkSync for ReadBackSink {
        fn record(&self, event: AuditEvent) {
            if let Some(session) = self.session.get().and_then(|w| w.upgrade()) {
                let state = session.get_state();
                let _ = session.status();
                self.seen.lock().unwrap().push((event.action, state));
            }
        }
    }

    #[test]
    fn sink_can_query_session_while_recording() {
        let sink = Arc::new(ReadBackSink {
            session: std::sync::OnceLock::new(),
            seen: std::sync::Mutex::new(Vec::new()),
        });
        let session = Arc::new(
            SessionStateMachine::with_backend(fast_config(), Arc::new(InMemoryBackend::new()))
                .with_audit(sink.clone()),
        );
        sink.session.set(Arc::downgrade(&session)).unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        let worker = Arc::clone(&session);
        std::thread::spawn(move || {
            worker.setup(PASSWORD).unwrap();
            worker.lock();
            worker.unlock("wrong").unwrap_err();
            worker.unlock(PASSWORD).unwrap();
            tx.send(()).unwrap();
        });
        rx.recv_timeout(Duration::from_secs(30))
            .expect("session calls returned with a reentrant sink");

        assert_eq!(
            *sink.seen.lock().unwrap(),
            vec![
                (AuditAction::SetupCompleted, SessionState::Unlocked),
                (AuditAction::Locked, SessionState::Locked),
                (AuditAction::UnlockFailed { failed_attempts: 1 }, SessionState::Locked),
                (AuditAction::UnlockSucceeded, SessionState::Unlocked),
            ]
        );
    }
}
