//! Ledger configuration.
//!
//! # Environment Variables
//!
//! All optional; defaults are relative to the working directory.
//! - `IDLEDGER_AADHAAR_DB` - Aadhaar store (default: `aadhaar_documents.db`)
//! - `IDLEDGER_PAN_DB` - PAN store (default: `pan_documents.db`)
//! - `IDLEDGER_BACKUP_DIR` - backup directory (default: `database_backups`)
//! - `IDLEDGER_REPORT_DIR` - scan/cleanup report directory (default: `duplicate_reports`)
//! - `IDLEDGER_MIGRATION_LOG` - migration log file (default: `migration_log.json`)
//! - `IDLEDGER_AUDIT_LOG` - duplicate-attempt log, JSON lines (unset: in-memory only)
//! - `IDLEDGER_BUSY_TIMEOUT_MS` - SQLite busy timeout (default: 5000)
//! - `IDLEDGER_SEVERITY_MEDIUM_ABOVE` / `IDLEDGER_SEVERITY_HIGH_ABOVE` - duplicate-group
//!   counts above which a scan is rated MEDIUM / HIGH (defaults: 5 / 10)

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LedgerError;
use crate::identifier::DocumentType;

/// Configuration errors that can occur during loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable could not be parsed: `(name, reason)`.
    #[error("Invalid environment variable {0}: {1}")]
    InvalidEnvVar(String, String),
    /// A setting is out of range: `(name, reason)`.
    #[error("Invalid setting {0}: {1}")]
    InvalidSetting(String, String),
}

impl From<ConfigError> for LedgerError {
    fn from(err: ConfigError) -> Self {
        Self::config(err.to_string())
    }
}

/// Duplicate-group counts that raise scan severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeverityThresholds {
    /// More groups than this in any store rates MEDIUM.
    pub medium_above: usize,
    /// More groups than this in any store rates HIGH.
    pub high_above: usize,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            medium_above: 5,
            high_above: 10,
        }
    }
}

/// Everything the ledger needs to locate its stores and artifacts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// Aadhaar store file.
    pub aadhaar_store: PathBuf,
    /// PAN store file.
    pub pan_store: PathBuf,
    /// Where backups are written.
    pub backup_dir: PathBuf,
    /// Where scan and cleanup reports are written.
    pub report_dir: PathBuf,
    /// Append-only migration log.
    pub migration_log: PathBuf,
    /// Duplicate-attempt audit log; `None` keeps attempts in memory.
    pub audit_log: Option<PathBuf>,
    /// How long a connection waits on a locked store.
    pub busy_timeout_ms: u64,
    /// Attempts at generating a fresh user id before giving up.
    pub max_id_attempts: u32,
    /// Scan severity thresholds.
    pub severity: SeverityThresholds,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            aadhaar_store: PathBuf::from("aadhaar_documents.db"),
            pan_store: PathBuf::from("pan_documents.db"),
            backup_dir: PathBuf::from("database_backups"),
            report_dir: PathBuf::from("duplicate_reports"),
            migration_log: PathBuf::from("migration_log.json"),
            audit_log: None,
            busy_timeout_ms: 5_000,
            max_id_attempts: 3,
            severity: SeverityThresholds::default(),
        }
    }
}

impl LedgerConfig {
    const MIN_BUSY_TIMEOUT_MS: u64 = 10;
    const MAX_ID_ATTEMPTS: u32 = 16;

    /// Default layout rooted at `dir`, with a file-backed audit log.
    ///
    /// # Examples
    ///
    /// ```
    /// use idledger::LedgerConfig;
    ///
    /// let config = LedgerConfig::in_dir("/var/lib/idledger");
    /// assert!(config.aadhaar_store.starts_with("/var/lib/idledger"));
    /// ```
    #[must_use]
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref();
        let defaults = Self::default();
        Self {
            aadhaar_store: dir.join(defaults.aadhaar_store),
            pan_store: dir.join(defaults.pan_store),
            backup_dir: dir.join(defaults.backup_dir),
            report_dir: dir.join(defaults.report_dir),
            migration_log: dir.join(defaults.migration_log),
            audit_log: Some(dir.join("duplicate_attempts.jsonl")),
            ..defaults
        }
    }

    /// Loads configuration from `IDLEDGER_*` environment variables.
    ///
    /// # Errors
    /// Returns `ConfigError` if a numeric variable does not parse or the
    /// result fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self, LedgerError> {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Loads configuration from an arbitrary variable source.
    ///
    /// # Errors
    /// Same as [`from_env`](Self::from_env).
    pub fn from_vars(get: impl Fn(&str) -> Option<String>) -> Result<Self, LedgerError> {
        let mut config = Self::default();

        if let Some(v) = get("IDLEDGER_AADHAAR_DB") {
            config.aadhaar_store = PathBuf::from(v);
        }
        if let Some(v) = get("IDLEDGER_PAN_DB") {
            config.pan_store = PathBuf::from(v);
        }
        if let Some(v) = get("IDLEDGER_BACKUP_DIR") {
            config.backup_dir = PathBuf::from(v);
        }
        if let Some(v) = get("IDLEDGER_REPORT_DIR") {
            config.report_dir = PathBuf::from(v);
        }
        if let Some(v) = get("IDLEDGER_MIGRATION_LOG") {
            config.migration_log = PathBuf::from(v);
        }
        config.audit_log = get("IDLEDGER_AUDIT_LOG")
            .filter(|v| !v.trim().is_empty())
            .map(PathBuf::from);

        if let Some(v) = get("IDLEDGER_BUSY_TIMEOUT_MS") {
            config.busy_timeout_ms = parse_var("IDLEDGER_BUSY_TIMEOUT_MS", &v)?;
        }
        if let Some(v) = get("IDLEDGER_SEVERITY_MEDIUM_ABOVE") {
            config.severity.medium_above = parse_var("IDLEDGER_SEVERITY_MEDIUM_ABOVE", &v)?;
        }
        if let Some(v) = get("IDLEDGER_SEVERITY_HIGH_ABOVE") {
            config.severity.high_above = parse_var("IDLEDGER_SEVERITY_HIGH_ABOVE", &v)?;
        }

        config.validate()
    }

    /// Checks settings for consistency.
    ///
    /// # Errors
    /// Returns an error if the two stores share a path, the busy timeout is
    /// degenerate, the id attempt budget is out of range, or the severity
    /// thresholds are inverted.
    pub fn validate(self) -> Result<Self, LedgerError> {
        if self.aadhaar_store == self.pan_store {
            return Err(ConfigError::InvalidSetting(
                "pan_store".to_string(),
                format!("must differ from aadhaar_store ({})", self.aadhaar_store.display()),
            )
            .into());
        }

        if self.busy_timeout_ms < Self::MIN_BUSY_TIMEOUT_MS {
            return Err(ConfigError::InvalidSetting(
                "busy_timeout_ms".to_string(),
                format!(
                    "must be at least {} (got {})",
                    Self::MIN_BUSY_TIMEOUT_MS,
                    self.busy_timeout_ms
                ),
            )
            .into());
        }

        if self.max_id_attempts == 0 || self.max_id_attempts > Self::MAX_ID_ATTEMPTS {
            return Err(ConfigError::InvalidSetting(
                "max_id_attempts".to_string(),
                format!("must be within 1..={} (got {})", Self::MAX_ID_ATTEMPTS, self.max_id_attempts),
            )
            .into());
        }

        if self.severity.medium_above > self.severity.high_above {
            return Err(ConfigError::InvalidSetting(
                "severity".to_string(),
                format!(
                    "medium_above ({}) exceeds high_above ({})",
                    self.severity.medium_above, self.severity.high_above
                ),
            )
            .into());
        }

        Ok(self)
    }

    /// Store file for a document type.
    #[must_use]
    pub fn store_path(&self, document_type: DocumentType) -> &Path {
        match document_type {
            DocumentType::Aadhaar => &self.aadhaar_store,
            DocumentType::Pan => &self.pan_store,
        }
    }

    /// Busy timeout as a `Duration`.
    #[must_use]
    pub const fn busy_timeout(&self) -> Duration {
        Duration::from_millis(self.busy_timeout_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    raw.trim()
        .parse()
        .map_err(|e: T::Err| ConfigError::InvalidEnvVar(key.to_string(), e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = LedgerConfig::default().validate().unwrap();
        assert_eq!(config.severity.high_above, 10);
        assert!(config.audit_log.is_none());
    }

    #[test]
    fn test_from_vars_overrides() {
        let config = LedgerConfig::from_vars(vars(&[
            ("IDLEDGER_AADHAAR_DB", "/data/a.db"),
            ("IDLEDGER_PAN_DB", "/data/p.db"),
            ("IDLEDGER_BUSY_TIMEOUT_MS", "250"),
            ("IDLEDGER_AUDIT_LOG", "/data/audit.jsonl"),
        ]))
        .unwrap();
        assert_eq!(config.store_path(DocumentType::Pan), Path::new("/data/p.db"));
        assert_eq!(config.busy_timeout(), Duration::from_millis(250));
        assert_eq!(config.audit_log.as_deref(), Some(Path::new("/data/audit.jsonl")));
    }

    #[test]
    fn test_from_vars_rejects_bad_number() {
        let err = LedgerConfig::from_vars(vars(&[("IDLEDGER_BUSY_TIMEOUT_MS", "soon")])).unwrap_err();
        assert!(err.to_string().contains("IDLEDGER_BUSY_TIMEOUT_MS"));
    }

    #[test]
    fn test_validate_rejects_shared_store() {
        let config = LedgerConfig {
            pan_store: PathBuf::from("aadhaar_documents.db"),
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = LedgerConfig {
            severity: SeverityThresholds {
                medium_above: 20,
                high_above: 10,
            },
            ..LedgerConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
