//! Audit pipeline configuration parsing and validation.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::{AppError, Result};

/// Redaction settings layered on top of the built-in denylist.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct RedactionConfig {
    /// Marker written in place of a sensitive value.
    #[serde(default = "default_marker")]
    pub marker: String,
    /// Additional field names treated as sensitive (case-insensitive substring match).
    #[serde(default)]
    pub extra_fields: Vec<String>,
}

impl Default for RedactionConfig {
    fn default() -> Self {
        Self {
            marker: default_marker(),
            extra_fields: Vec::new(),
        }
    }
}

fn default_marker() -> String {
    crate::redact::REDACTION_MARKER.into()
}

fn default_db_path() -> PathBuf {
    PathBuf::from("audit.db")
}

fn default_max_body_bytes() -> usize {
    16 * 1024
}

fn default_max_capture_bytes() -> usize {
    1024 * 1024
}

fn default_write_timeout_ms() -> u64 {
    500
}

fn default_correlation_header() -> String {
    "X-Correlation-ID".into()
}

fn default_trace_header() -> String {
    "traceparent".into()
}

/// Global configuration parsed from `audit.toml`.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub struct AuditConfig {
    /// `SQLite` database file holding the audit trail.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Entity type names that never produce entity-change records.
    #[serde(default)]
    pub excluded_entity_types: Vec<String>,
    /// Redaction settings.
    #[serde(default)]
    pub redaction: RedactionConfig,
    /// Request and response bodies are truncated beyond this many bytes.
    #[serde(default = "default_max_body_bytes")]
    pub max_body_bytes: usize,
    /// Largest body the middleware buffers for recording. Bodies of unknown
    /// length or larger than this are streamed through unrecorded.
    #[serde(default = "default_max_capture_bytes")]
    pub max_capture_bytes: usize,
    /// Upper bound on a single audit write; a write still waiting for the
    /// database after this long is abandoned and logged.
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    /// Inbound header carrying a caller-supplied correlation id.
    #[serde(default = "default_correlation_header")]
    pub correlation_header: String,
    /// Inbound header consulted when no correlation header is present.
    #[serde(default = "default_trace_header")]
    pub trace_header: String,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            excluded_entity_types: Vec::new(),
            redaction: RedactionConfig::default(),
            max_body_bytes: default_max_body_bytes(),
            max_capture_bytes: default_max_capture_bytes(),
            write_timeout_ms: default_write_timeout_ms(),
            correlation_header: default_correlation_header(),
            trace_header: default_trace_header(),
        }
    }
}

impl AuditConfig {
    /// Load and validate configuration from a TOML file path.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if the file cannot be read or contains
    /// invalid TOML, or if validation fails.
    pub fn load_from_path(path: impl AsRef<Path>) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .map_err(|err| AppError::Config(format!("failed to read config: {err}")))?;
        Self::from_toml_str(&raw)
    }

    /// Parse configuration from a TOML string.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Config` if parsing or validation fails.
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Bound applied to each audit write.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }

    fn validate(&self) -> Result<()> {
        if self.redaction.marker.is_empty() {
            return Err(AppError::Config("redaction.marker must not be empty".into()));
        }

        if self.max_body_bytes == 0 {
            return Err(AppError::Config(
                "max_body_bytes must be greater than zero".into(),
            ));
        }

        if self.max_capture_bytes == 0 {
            return Err(AppError::Config(
                "max_capture_bytes must be greater than zero".into(),
            ));
        }

        if self.write_timeout_ms == 0 {
            return Err(AppError::Config(
                "write_timeout_ms must be greater than zero".into(),
            ));
        }

        if self.correlation_header.trim().is_empty() {
            return Err(AppError::Config(
                "correlation_header must not be empty".into(),
            ));
        }

        if self.trace_header.trim().is_empty() {
            return Err(AppError::Config("trace_header must not be empty".into()));
        }

        Ok(())
    }
}
