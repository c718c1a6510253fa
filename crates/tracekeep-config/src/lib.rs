//! Configuration for the tracekeep collector and ingest server.

use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

// ─────────────────────────────────────────────────────────────────────────────
// Error
// ─────────────────────────────────────────────────────────────────────────────

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

// ─────────────────────────────────────────────────────────────────────────────
// Defaults
// ─────────────────────────────────────────────────────────────────────────────

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_FLUSH_INTERVAL_MS: u64 = 30_000;
pub const DEFAULT_UPLOAD_INTERVAL_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_MAX_TRACES: usize = 1000;
pub const DEFAULT_MAX_SPANS_PER_TRACE: usize = 200;
pub const UPLOAD_PATH: &str = "/api/traces";

fn default_base_url() -> String {
    DEFAULT_BASE_URL.to_string()
}

fn default_flush_interval_ms() -> u64 {
    DEFAULT_FLUSH_INTERVAL_MS
}

fn default_upload_interval_ms() -> u64 {
    DEFAULT_UPLOAD_INTERVAL_MS
}

fn default_max_traces() -> usize {
    DEFAULT_MAX_TRACES
}

fn default_max_spans() -> usize {
    DEFAULT_MAX_SPANS_PER_TRACE
}

// ─────────────────────────────────────────────────────────────────────────────
// Auto Upload
// ─────────────────────────────────────────────────────────────────────────────

/// Periodic upload settings. Persisted by the collector so they survive restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AutoUploadConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_upload_interval_ms")]
    pub interval_ms: u64,
}

impl Default for AutoUploadConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_ms: DEFAULT_UPLOAD_INTERVAL_MS,
        }
    }
}

impl AutoUploadConfig {
    pub fn enabled(interval_ms: u64) -> Self {
        Self {
            enabled: true,
            interval_ms,
        }
    }

    /// Parses a stored config, falling back to the default when it is corrupt.
    pub fn parse_or_default(raw: &str) -> Self {
        match serde_json::from_str(raw) {
            Ok(config) => config,
            Err(e) => {
                tracing::warn!("Invalid auto-upload config, using defaults: {}", e);
                Self::default()
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Collector
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for the trace collector and its upload client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectorConfig {
    /// Base URL of the remote collector; uploads go to `<base_url>/api/traces`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Interval between flushes of dirty state to storage.
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_max_traces")]
    pub max_traces: usize,
    #[serde(default = "default_max_spans")]
    pub max_spans_per_trace: usize,
    /// SQLite file for durable snapshots. In-memory storage when unset.
    #[serde(default)]
    pub storage_path: Option<PathBuf>,
    /// Initial auto-upload settings, used until a persisted config exists.
    #[serde(default)]
    pub auto_upload: AutoUploadConfig,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            flush_interval_ms: DEFAULT_FLUSH_INTERVAL_MS,
            max_traces: DEFAULT_MAX_TRACES,
            max_spans_per_trace: DEFAULT_MAX_SPANS_PER_TRACE,
            storage_path: None,
            auto_upload: AutoUploadConfig::default(),
        }
    }
}

impl CollectorConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loads a JSON config file and validates it.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let config: CollectorConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `TRACEKEEP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::default().with_env_overrides()
    }

    pub fn with_env_overrides(mut self) -> Result<Self, ConfigError> {
        if let Ok(url) = env::var("TRACEKEEP_BASE_URL") {
            self.base_url = url;
        }
        if let Ok(raw) = env::var("TRACEKEEP_FLUSH_INTERVAL_MS") {
            self.flush_interval_ms = raw.parse().map_err(|_| {
                ConfigError::Invalid(format!(
                    "TRACEKEEP_FLUSH_INTERVAL_MS is not a number: {}",
                    raw
                ))
            })?;
        }
        if let Ok(path) = env::var("TRACEKEEP_STORAGE_PATH") {
            self.storage_path = Some(PathBuf::from(path));
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Invalid("baseUrl must not be empty".into()));
        }
        if self.flush_interval_ms == 0 {
            return Err(ConfigError::Invalid("flushIntervalMs must be positive".into()));
        }
        if self.max_traces == 0 || self.max_spans_per_trace == 0 {
            return Err(ConfigError::Invalid("retention caps must be positive".into()));
        }
        Ok(())
    }

    /// Full URL of the upload endpoint.
    pub fn upload_endpoint(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), UPLOAD_PATH)
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_flush_interval_ms(mut self, interval_ms: u64) -> Self {
        self.flush_interval_ms = interval_ms;
        self
    }

    pub fn with_max_traces(mut self, max_traces: usize) -> Self {
        self.max_traces = max_traces;
        self
    }

    pub fn with_max_spans_per_trace(mut self, max_spans: usize) -> Self {
        self.max_spans_per_trace = max_spans;
        self
    }

    pub fn with_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.storage_path = Some(path.into());
        self
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

/// Settings for the ingest server binary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub db_path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "0.0.0.0:8000".into(),
            db_path: "data/tracekeep.db".into(),
        }
    }
}

impl ServerConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            bind_addr: env::var("TRACEKEEP_BIND").unwrap_or(defaults.bind_addr),
            db_path: env::var("TRACEKEEP_DB_PATH").unwrap_or(defaults.db_path),
        }
    }
}
