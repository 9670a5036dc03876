//! Engine configuration.
//!
//! ```toml
//! [database]
//! path = "sigtrail.db"
//! busy_timeout_ms = 5000
//!
//! [audit]
//! default_severity = "info"
//! default_module = "signatures"
//! log_successful_verifications = false
//!
//! [schema]
//! cache_negotiated_capability = true
//!
//! [logging]
//! level = "info"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::audit::Severity;
use crate::error::EngineError;

/// Configuration loading errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ConfigError {
    /// The file could not be read.
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    /// The TOML was malformed or had unknown keys.
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    /// The configuration could not be rendered.
    #[error("failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl From<ConfigError> for EngineError {
    fn from(err: ConfigError) -> Self {
        Self::Config(err.to_string())
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub database: DatabaseConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub schema: SchemaConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Loads configuration from a TOML file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// Parses configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns an error if the TOML is invalid or contains unknown keys.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Serializes configuration to TOML.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization fails.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }
}

/// `[database]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabaseConfig {
    /// `SQLite` database file.
    #[serde(default = "default_database_path")]
    pub path: PathBuf,

    /// How long a statement waits on a locked database.
    #[serde(default = "default_busy_timeout_ms")]
    pub busy_timeout_ms: u64,
}

impl DatabaseConfig {
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
            busy_timeout_ms: default_busy_timeout_ms(),
        }
    }
}

/// `[audit]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AuditConfig {
    /// Severity for events written without one.
    #[serde(default)]
    pub default_severity: Severity,

    /// Module recorded on events written without one.
    #[serde(default = "default_module")]
    pub default_module: Option<String>,

    /// Also write `SIG_VERIFY_OK` events for successful verifications.
    #[serde(default)]
    pub log_successful_verifications: bool,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            default_severity: Severity::default(),
            default_module: default_module(),
            log_successful_verifications: false,
        }
    }
}

/// `[schema]` section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaConfig {
    /// Remember the schema level each statement negotiated down to.
    #[serde(default = "default_true")]
    pub cache_negotiated_capability: bool,
}

impl Default for SchemaConfig {
    fn default() -> Self {
        Self {
            cache_negotiated_capability: true,
        }
    }
}

/// `[logging]` section. Read by the CLI only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    /// `tracing` filter directive, e.g. `info` or `sigtrail_core=debug`.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Append logs to this file instead of stderr.
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            file: None,
        }
    }
}

fn default_database_path() -> PathBuf {
    PathBuf::from("sigtrail.db")
}

const fn default_busy_timeout_ms() -> u64 {
    5000
}

#[allow(clippy::unnecessary_wraps)]
fn default_module() -> Option<String> {
    Some("signatures".to_string())
}

const fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_config_uses_defaults() {
        let config = EngineConfig::from_toml("").unwrap();
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.database.busy_timeout(), Duration::from_secs(5));
        assert!(config.schema.cache_negotiated_capability);
        assert_eq!(config.audit.default_module.as_deref(), Some("signatures"));
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = EngineConfig::from_toml(
            r#"
            [audit]
            default_severity = "warning"
            log_successful_verifications = true

            [database]
            path = "/var/lib/sigtrail/audit.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.audit.default_severity, Severity::Warning);
        assert!(config.audit.log_successful_verifications);
        assert_eq!(config.database.path, PathBuf::from("/var/lib/sigtrail/audit.db"));
        assert_eq!(config.database.busy_timeout_ms, 5000);
    }

    #[test]
    fn unknown_keys_are_rejected() {
        let err = EngineConfig::from_toml("[schema]\ncache = false\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn toml_round_trip() {
        let mut config = EngineConfig::default();
        config.logging.file = Some(PathBuf::from("sigtrail.log"));
        config.schema.cache_negotiated_capability = false;

        let text = config.to_toml().unwrap();
        assert_eq!(EngineConfig::from_toml(&text).unwrap(), config);
    }

    #[test]
    fn from_file_reads_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sigtrail.toml");
        std::fs::write(&path, "[logging]\nlevel = \"debug\"\n").unwrap();

        let config = EngineConfig::from_file(&path).unwrap();
        assert_eq!(config.logging.level, "debug");

        let missing = EngineConfig::from_file(&dir.path().join("nope.toml")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io(_)));
    }
}
