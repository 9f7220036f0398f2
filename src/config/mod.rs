//! Collector configuration
//!
//! [`CollectorConfig`] carries the sink settings handed to
//! `CollectorModule::initialize`; [`CollectorSettings`] is the on-disk TOML
//! document that also lists the providers to enable.

use crate::error::ConfigError;
use crate::request::ListeningRequest;
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Where telemetry records are delivered
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkTarget {
    /// JSON lines on standard output
    #[default]
    Stdout,
    /// JSON lines appended to a file
    File { path: PathBuf },
    /// JSON batches posted to an ingestion endpoint
    Http { endpoint: String },
}

/// Sink settings consumed when the collector builds its sink client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CollectorConfig {
    #[serde(flatten)]
    pub target: SinkTarget,
    /// Key identifying the telemetry resource records are sent to
    #[serde(default)]
    pub instrumentation_key: Option<String>,
    /// Maximum number of records per batch
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Maximum time a record waits in a batch before being sent
    #[serde(default = "default_flush_interval_seconds")]
    pub flush_interval_seconds: u64,
}

fn default_batch_size() -> usize {
    100
}

fn default_flush_interval_seconds() -> u64 {
    5
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            target: SinkTarget::default(),
            instrumentation_key: None,
            batch_size: default_batch_size(),
            flush_interval_seconds: default_flush_interval_seconds(),
        }
    }
}

impl CollectorConfig {
    /// Check values that would make a sink unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.batch_size == 0 {
            return Err(ConfigError::ValidationError(
                "batch_size must be greater than 0".to_string(),
            ));
        }
        if self.flush_interval_seconds == 0 {
            return Err(ConfigError::ValidationError(
                "flush_interval_seconds must be greater than 0".to_string(),
            ));
        }

        match &self.target {
            SinkTarget::Http { endpoint } => {
                if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                    return Err(ConfigError::ValidationError(format!(
                        "endpoint must be an http(s) URL: {}",
                        endpoint
                    )));
                }
                if self
                    .instrumentation_key
                    .as_deref()
                    .map_or(true, |key| key.trim().is_empty())
                {
                    return Err(ConfigError::ValidationError(
                        "instrumentation_key is required for the http sink".to_string(),
                    ));
                }
            }
            SinkTarget::File { path } => {
                if path.as_os_str().is_empty() {
                    return Err(ConfigError::ValidationError(
                        "file sink path must not be empty".to_string(),
                    ));
                }
            }
            SinkTarget::Stdout => {}
        }

        Ok(())
    }
}

/// Complete collector settings as stored in a TOML file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct CollectorSettings {
    #[serde(default)]
    pub sink: CollectorConfig,
    /// Providers to enable, in order
    #[serde(default)]
    pub sources: Vec<ListeningRequest>,
}

impl CollectorSettings {
    /// Load settings from a TOML file
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ReadError` if the file cannot be read, a TOML
    /// error if it cannot be parsed, and `ConfigError::ValidationError` if a
    /// value is out of range.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        debug!("Reading collector settings from {}", path.display());
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("{}: {}", path.display(), e)))?;
        let settings = Self::from_toml_str(&content)?;
        info!(
            "Loaded collector settings from {} ({} sources)",
            path.display(),
            settings.sources.len()
        );
        Ok(settings)
    }

    /// Parse and validate settings from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let settings: Self = toml::from_str(content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Validate the sink settings
    ///
    /// Listening requests are validated individually at enable time so one
    /// bad entry does not reject the whole file.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.sink.validate()
    }
}
