//! Security configuration loaded from YAML.
//!
//! Every field has a default so a partial file (or no file at all) yields a
//! complete configuration. The one default that is deliberately unusable is
//! the secret: until an operator sets a real one, [`SecurityConfig::validate`]
//! refuses the configuration and the admission path never arms.

use crate::validation::{check_secret, SecretWeakness};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

pub const PLACEHOLDER_SECRET: &str = "CHANGE_THIS_SECRET_KEY_NOW";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("weak server secret: {0}")]
    WeakSecret(#[from] SecretWeakness),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config file: {0}")]
    Parse(#[from] serde_yaml::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HandshakeConfig {
    pub secret_key: String,
    pub difficulty: u32,
    pub timeout_ms: u64,
    pub max_failures: u32,
    pub lockout_secs: u64,
    pub verification_secs: u64,
    pub rate_limit_attempts: u32,
    pub rate_limit_window_secs: u64,
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        Self {
            secret_key: PLACEHOLDER_SECRET.to_string(),
            difficulty: 2,
            // 60 server ticks of 50ms
            timeout_ms: 3_000,
            max_failures: 3,
            lockout_secs: 300,
            verification_secs: 600,
            rate_limit_attempts: 30,
            rate_limit_window_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub enforce_ip_lock: bool,
    pub ban_on_swap: bool,
    pub ban_duration_minutes: u64,
    pub grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enforce_ip_lock: true,
            ban_on_swap: true,
            ban_duration_minutes: 60,
            grace_secs: 300,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SecurityConfig {
    pub handshake: HandshakeConfig,
    pub session: SessionConfig,
    pub sweep_interval_secs: u64,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            handshake: HandshakeConfig::default(),
            session: SessionConfig::default(),
            sweep_interval_secs: 300,
        }
    }
}

impl SecurityConfig {
    /// Parses a YAML document; missing keys take their defaults.
    pub fn from_yaml_str(source: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(source)?)
    }

    /// Reads and parses a YAML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let source = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&source)
    }

    /// Rejects configurations the engine must not run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        check_secret(&self.handshake.secret_key)?;

        let nonzero: [(&'static str, u64); 6] = [
            ("handshake.timeout_ms", self.handshake.timeout_ms),
            ("handshake.max_failures", self.handshake.max_failures as u64),
            ("handshake.lockout_secs", self.handshake.lockout_secs),
            ("handshake.verification_secs", self.handshake.verification_secs),
            (
                "handshake.rate_limit_window_secs",
                self.handshake.rate_limit_window_secs,
            ),
            ("sweep_interval_secs", self.sweep_interval_secs),
        ];
        for (field, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.handshake.rate_limit_attempts == 0 {
            return Err(ConfigError::Invalid {
                field: "handshake.rate_limit_attempts",
                reason: "must be greater than zero",
            });
        }
        Ok(())
    }

    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake.timeout_ms)
    }

    pub fn lockout_duration(&self) -> Duration {
        Duration::from_secs(self.handshake.lockout_secs)
    }

    pub fn verification_validity(&self) -> Duration {
        Duration::from_secs(self.handshake.verification_secs)
    }

    pub fn rate_limit_window(&self) -> Duration {
        Duration::from_secs(self.handshake.rate_limit_window_secs)
    }

    /// Ban applied to an origin caught swapping sessions. Saturates on
    /// absurdly large values instead of overflowing.
    pub fn ban_duration(&self) -> Duration {
        Duration::from_secs(self.session.ban_duration_minutes.saturating_mul(60))
    }

    pub fn session_grace(&self) -> Duration {
        Duration::from_secs(self.session.grace_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GOOD_SECRET: &str = "MySecureKey12345!";

    #[test]
    fn test_defaults() {
        let config = SecurityConfig::default();
        assert_eq!(config.handshake.difficulty, 2);
        assert_eq!(config.response_timeout(), Duration::from_millis(3_000));
        assert_eq!(config.handshake.max_failures, 3);
        assert_eq!(config.lockout_duration(), Duration::from_secs(300));
        assert_eq!(config.verification_validity(), Duration::from_secs(600));
        assert!(config.session.enforce_ip_lock);
        assert!(config.session.ban_on_swap);
        assert_eq!(config.ban_duration(), Duration::from_secs(3_600));
        assert_eq!(config.session_grace(), Duration::from_secs(300));
    }

    #[test]
    fn test_default_secret_is_rejected() {
        let err = SecurityConfig::default().validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::WeakSecret(SecretWeakness::KnownDefault)
        ));
    }

    #[test]
    fn test_partial_yaml_fills_defaults() {
        let yaml = format!(
            "handshake:\n  secret_key: \"{}\"\n  max_failures: 5\nsession:\n  ban_on_swap: false\n",
            GOOD_SECRET
        );
        let config = SecurityConfig::from_yaml_str(&yaml).unwrap();
        assert_eq!(config.handshake.secret_key, GOOD_SECRET);
        assert_eq!(config.handshake.max_failures, 5);
        assert_eq!(config.handshake.timeout_ms, 3_000);
        assert!(!config.session.ban_on_swap);
        assert!(config.session.enforce_ip_lock);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_zero_window_rejected() {
        let mut config = SecurityConfig::default();
        config.handshake.secret_key = GOOD_SECRET.to_string();
        config.handshake.timeout_ms = 0;
        match config.validate() {
            Err(ConfigError::Invalid { field, .. }) => assert_eq!(field, "handshake.timeout_ms"),
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[test]
    fn test_huge_ban_duration_saturates() {
        let mut config = SecurityConfig::default();
        config.session.ban_duration_minutes = u64::MAX;
        assert_eq!(config.ban_duration(), Duration::from_secs(u64::MAX));
    }

    #[test]
    fn test_example_file_matches_defaults() {
        let config =
            SecurityConfig::from_yaml_str(include_str!("../warden.example.yml")).unwrap();
        let defaults = SecurityConfig::default();
        assert_eq!(config.handshake.secret_key, PLACEHOLDER_SECRET);
        assert_eq!(config.handshake.timeout_ms, defaults.handshake.timeout_ms);
        assert_eq!(config.handshake.max_failures, defaults.handshake.max_failures);
        assert_eq!(
            config.handshake.rate_limit_attempts,
            defaults.handshake.rate_limit_attempts
        );
        assert_eq!(config.session.grace_secs, defaults.session.grace_secs);
        assert_eq!(config.sweep_interval_secs, defaults.sweep_interval_secs);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_yaml() {
        assert!(matches!(
            SecurityConfig::from_yaml_str("handshake: [1, 2"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_missing_file() {
        assert!(matches!(
            SecurityConfig::load("/nonexistent/warden.yml"),
            Err(ConfigError::Io(_))
        ));
    }
}
