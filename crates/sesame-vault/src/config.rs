//! Vault engine configuration: plain JSON, readable before unlock.
//!
//! Persisted to `{dir}/sesame.json`. Every field is defaulted, so a missing,
//! partial or corrupt file still yields a usable configuration.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sesame_keychain::{SecurityLevel, MIN_PBKDF2_ITERATIONS};

const CONFIG_FILE: &str = "sesame.json";
const CONFIG_TMP_FILE: &str = ".sesame.json.tmp";

/// Engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct VaultConfig {
    /// Seconds of key agent inactivity before auto-lock. `0` disables it.
    #[serde(default = "default_auto_lock_timeout")]
    pub auto_lock_timeout_secs: u64,

    /// PBKDF2 iterations for newly wrapped keys (floor 1000).
    #[serde(default = "default_pbkdf2_iterations")]
    pub pbkdf2_iterations: u32,

    /// Security level of new keys and items.
    #[serde(default)]
    pub security_level: SecurityLevel,
}

impl Default for VaultConfig {
    fn default() -> Self {
        Self {
            auto_lock_timeout_secs: default_auto_lock_timeout(),
            pbkdf2_iterations: default_pbkdf2_iterations(),
            security_level: SecurityLevel::default(),
        }
    }
}

const fn default_auto_lock_timeout() -> u64 {
    900
}
const fn default_pbkdf2_iterations() -> u32 {
    10_000
}

impl VaultConfig {
    /// Idle timeout for the key agent, `None` when disabled.
    #[must_use]
    pub const fn auto_lock_timeout(&self) -> Option<Duration> {
        if self.auto_lock_timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.auto_lock_timeout_secs))
        }
    }

    /// Iteration count actually used when wrapping keys.
    #[must_use]
    pub const fn effective_iterations(&self) -> u32 {
        if self.pbkdf2_iterations < MIN_PBKDF2_ITERATIONS {
            MIN_PBKDF2_ITERATIONS
        } else {
            self.pbkdf2_iterations
        }
    }

    /// Load from `{dir}/sesame.json`.
    ///
    /// Returns [`Default::default()`] when the file is missing or contains
    /// invalid JSON.
    #[must_use]
    pub fn load(dir: &Path) -> Self {
        let path = dir.join(CONFIG_FILE);
        fs::read_to_string(&path).map_or_else(
            |_| Self::default(),
            |contents| {
                serde_json::from_str(&contents).unwrap_or_else(|e| {
                    tracing::warn!(path = %path.display(), "ignoring corrupt config: {e}");
                    Self::default()
                })
            },
        )
    }

    /// Persist to `{dir}/sesame.json` (write to `.tmp`, then rename).
    ///
    /// # Errors
    ///
    /// Returns an `io::Error` if the directory does not exist or the
    /// file system rejects the write/rename.
    pub fn save(&self, dir: &Path) -> std::io::Result<()> {
        let path = dir.join(CONFIG_FILE);
        let tmp = dir.join(CONFIG_TMP_FILE);

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;

        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn default_values_are_correct() {
        let config = VaultConfig::default();
        assert_eq!(config.auto_lock_timeout_secs, 900);
        assert_eq!(config.pbkdf2_iterations, 10_000);
        assert_eq!(config.security_level, SecurityLevel::Sl5);
        assert_eq!(config.auto_lock_timeout(), Some(Duration::from_secs(900)));
    }

    #[test]
    fn zero_timeout_disables_auto_lock() {
        let config = VaultConfig {
            auto_lock_timeout_secs: 0,
            ..VaultConfig::default()
        };
        assert_eq!(config.auto_lock_timeout(), None);
    }

    #[test]
    fn low_iterations_are_raised() {
        let config = VaultConfig {
            pbkdf2_iterations: 5,
            ..VaultConfig::default()
        };
        assert_eq!(config.effective_iterations(), MIN_PBKDF2_ITERATIONS);
    }

    #[test]
    fn load_returns_default_on_missing_file() {
        let dir = TempDir::new().unwrap();
        assert_eq!(VaultConfig::load(dir.path()), VaultConfig::default());
    }

    #[test]
    fn save_and_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let config = VaultConfig {
            auto_lock_timeout_secs: 60,
            pbkdf2_iterations: 40_000,
            security_level: SecurityLevel::Sl3,
        };
        config.save(dir.path()).unwrap();
        assert_eq!(VaultConfig::load(dir.path()), config);
        assert!(!dir.path().join(CONFIG_TMP_FILE).exists());
    }

    #[test]
    fn load_handles_partial_and_corrupt_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(CONFIG_FILE);

        fs::write(&path, r#"{"autoLockTimeoutSecs":30}"#).unwrap();
        let config = VaultConfig::load(dir.path());
        assert_eq!(config.auto_lock_timeout_secs, 30);
        assert_eq!(config.pbkdf2_iterations, 10_000);

        fs::write(&path, "{ not json").unwrap();
        assert_eq!(VaultConfig::load(dir.path()), VaultConfig::default());
    }

    #[test]
    fn security_level_uses_keychain_tag() {
        let json = serde_json::to_value(VaultConfig::default()).unwrap();
        assert_eq!(json["securityLevel"], "SL5");
    }
}
