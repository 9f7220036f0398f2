use thiserror::Error;

/// Reasons an `initialize` call is abandoned before any provider is touched
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InitError {
    #[error("Configuration is missing")]
    ConfigurationMissing,

    #[error("Module has been disposed")]
    ModuleDisposed,

    #[error("Process is not elevated or elevation could not be determined")]
    InsufficientPrivilege,

    #[error("Telemetry sink could not be created: {0}")]
    SinkUnavailable(String),
}

/// Per-provider failures; recorded and logged, never abort initialization
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderError {
    #[error("Invalid listening request: {0}")]
    Validation(String),

    #[error("Provider registration failed: {0}")]
    Registration(#[from] SessionError),
}

/// Errors raised by a trace session implementation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("Session has been disposed")]
    Disposed,

    #[error("Provider not found: {0}")]
    ProviderNotFound(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Event processing failed: {0}")]
    Processing(String),
}

/// Errors that can occur in telemetry sinks
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("Invalid sink configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to serialize record: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Sink is closed")]
    Closed,
}

/// Errors that can occur during configuration loading
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(String),

    #[error("Invalid configuration value: {0}")]
    ValidationError(String),

    #[error("TOML parse error: {0}")]
    TomlError(#[from] toml::de::Error),
}
