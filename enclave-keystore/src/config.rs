//! Session configuration: where the keystore lives, KDF costs, timeout and
//! throttling limits.

use crate::policy::PasswordPolicy;
use directories::ProjectDirs;
use enclave_core::KdfConfig;
use std::path::PathBuf;
use std::time::Duration;

pub const APP_QUALIFIER: &str = "org";
pub const APP_ORG: &str = "enclave";
pub const APP_NAME: &str = "enclave";
pub const KEYSTORE_FILE_NAME: &str = "keystore.json";

pub const DEFAULT_SESSION_TIMEOUT: Duration = Duration::from_secs(3600);
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

pub const ENV_KEYSTORE_PATH: &str = "ENCLAVE_KEYSTORE_PATH";
pub const ENV_SESSION_TIMEOUT_SECS: &str = "ENCLAVE_SESSION_TIMEOUT_SECS";
pub const ENV_MAX_UNLOCK_ATTEMPTS: &str = "ENCLAVE_MAX_UNLOCK_ATTEMPTS";
pub const ENV_KDF_TIME_COST: &str = "ENCLAVE_KDF_TIME_COST";
pub const ENV_KDF_MEMORY_COST: &str = "ENCLAVE_KDF_MEMORY_COST";
pub const ENV_KDF_PARALLELISM: &str = "ENCLAVE_KDF_PARALLELISM";

/// Platform data directory for the keystore, e.g.
/// `~/.local/share/enclave` on Linux.
pub fn data_dir() -> Option<PathBuf> {
    ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME).map(|d| d.data_dir().to_path_buf())
}

#[derive(Clone, Debug, PartialEq)]
pub struct SessionConfig {
    pub keystore_path: PathBuf,
    /// Costs used at setup. Unlock always uses the costs stored in the keystore.
    pub kdf: KdfConfig,
    pub session_timeout: Duration,
    pub max_attempts: u32,
    /// When set, a lockout ends this long after the last failed attempt.
    pub lockout_cooldown: Option<Duration>,
    pub password_policy: PasswordPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let dir = data_dir().unwrap_or_else(|| PathBuf::from("./enclave-data"));
        Self {
            keystore_path: dir.join(KEYSTORE_FILE_NAME),
            kdf: KdfConfig::default(),
            session_timeout: DEFAULT_SESSION_TIMEOUT,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            lockout_cooldown: None,
            password_policy: PasswordPolicy::default(),
        }
    }
}

impl SessionConfig {
    pub fn with_keystore_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.keystore_path = path.into();
        self
    }

    pub fn with_kdf(mut self, kdf: KdfConfig) -> Self {
        self.kdf = kdf;
        self
    }

    pub fn with_session_timeout(mut self, timeout: Duration) -> Self {
        self.session_timeout = timeout;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_lockout_cooldown(mut self, cooldown: Duration) -> Self {
        self.lockout_cooldown = Some(cooldown);
        self
    }

    pub fn with_password_policy(mut self, policy: PasswordPolicy) -> Self {
        self.password_policy = policy;
        self
    }

    /// Defaults overridden by `ENCLAVE_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Defaults overridden by whatever `lookup` returns. Unparseable values
    /// are ignored with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(path) = lookup(ENV_KEYSTORE_PATH).filter(|p| !p.trim().is_empty()) {
            config.keystore_path = PathBuf::from(path.trim());
        }
        if let Some(secs) = parse_var::<u64>(&lookup, ENV_SESSION_TIMEOUT_SECS) {
            config.session_timeout = Duration::from_secs(secs);
        }
        if let Some(n) = parse_var::<u32>(&lookup, ENV_MAX_UNLOCK_ATTEMPTS) {
            config.max_attempts = n;
        }
        if let Some(t) = parse_var::<u32>(&lookup, ENV_KDF_TIME_COST) {
            config.kdf.time_cost = t;
        }
        if let Some(m) = parse_var::<u32>(&lookup, ENV_KDF_MEMORY_COST) {
            config.kdf.memory_cost = m;
        }
        if let Some(p) = parse_var::<u32>(&lookup, ENV_KDF_PARALLELISM) {
            config.kdf.parallelism = p;
        }
        config
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(var = name, "ignoring unparseable value");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| map.get(name).cloned()
    }

    #[test]
    fn defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.session_timeout, Duration::from_secs(3600));
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.lockout_cooldown, None);
        assert_eq!(config.kdf, KdfConfig::default());
        assert!(config.keystore_path.ends_with(KEYSTORE_FILE_NAME));
    }

    #[test]
    fn overrides_apply() {
        let config = SessionConfig::from_lookup(lookup(&[
            (ENV_KEYSTORE_PATH, "/tmp/ks.json"),
            (ENV_SESSION_TIMEOUT_SECS, "60"),
            (ENV_MAX_UNLOCK_ATTEMPTS, " 3 "),
            (ENV_KDF_TIME_COST, "2"),
            (ENV_KDF_MEMORY_COST, "19456"),
            (ENV_KDF_PARALLELISM, "1"),
        ]));
        assert_eq!(config.keystore_path, PathBuf::from("/tmp/ks.json"));
        assert_eq!(config.session_timeout, Duration::from_secs(60));
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.kdf, KdfConfig::argon2id(2, 19456, 1));
    }

    #[test]
    fn bad_values_are_ignored() {
        let config = SessionConfig::from_lookup(lookup(&[
            (ENV_SESSION_TIMEOUT_SECS, "soon"),
            (ENV_MAX_UNLOCK_ATTEMPTS, "-1"),
            (ENV_KEYSTORE_PATH, "  "),
        ]));
        let defaults = SessionConfig::default();
        assert_eq!(config.session_timeout, defaults.session_timeout);
        assert_eq!(config.max_attempts, defaults.max_attempts);
        assert_eq!(config.keystore_path, defaults.keystore_path);
    }

    #[test]
    fn builders() {
        let config = SessionConfig::default()
            .with_keystore_path("ks.json")
            .with_max_attempts(2)
            .with_session_timeout(Duration::from_secs(5))
            .with_lockout_cooldown(Duration::from_secs(30))
            .with_password_policy(PasswordPolicy::permissive());
        assert_eq!(config.keystore_path, PathBuf::from("ks.json"));
        assert_eq!(config.max_attempts, 2);
        assert_eq!(config.lockout_cooldown, Some(Duration::from_secs(30)));
        assert_eq!(config.password_policy.min_length, 1);
    }
}
