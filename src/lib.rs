/// Error types for the collector
pub mod error;

/// Raw trace events and telemetry records
pub mod events;

/// Listening requests describing providers to enable
pub mod request;

/// Trace session abstraction and in-process session
pub mod session;

/// Telemetry sinks
pub mod sink;

/// Event to record translation
pub mod translate;

/// Background event consumer
pub mod consumer;

/// Self-diagnostics channel
pub mod diagnostics;

/// Collector module lifecycle
pub mod collector;

/// Configuration management
pub mod config;

// Re-export commonly used types
pub use collector::{CollectorModule, InitializeOutcome, LifecycleState};
pub use error::{ConfigError, InitError, ProviderError, SessionError, SinkError};
