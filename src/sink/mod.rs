//! Telemetry sinks that structured records are forwarded to

/// HTTP batch sink
pub mod http;

/// JSON lines sink for stdout and files
pub mod json_lines;

pub use http::HttpSink;
pub use json_lines::JsonLinesSink;

use crate::config::{CollectorConfig, SinkTarget};
use crate::error::SinkError;
use crate::events::TelemetryRecord;
use log::info;
use std::sync::{Arc, Mutex, PoisonError};

/// Client that accepts structured telemetry records
pub trait SinkClient: Send + Sync {
    /// Queue a record for delivery
    fn track(&self, record: TelemetryRecord) -> Result<(), SinkError>;

    /// Deliver everything queued so far
    fn flush(&self) -> Result<(), SinkError>;

    /// Tag subsequent records with the producing collector's identity
    fn set_sdk_version(&self, version: &str);
}

/// Builds sink clients from collector configuration
pub trait SinkFactory: Send + Sync {
    fn create(&self, config: &CollectorConfig) -> Result<Arc<dyn SinkClient>, SinkError>;
}

impl<F> SinkFactory for F
where
    F: Fn(&CollectorConfig) -> Result<Arc<dyn SinkClient>, SinkError> + Send + Sync,
{
    fn create(&self, config: &CollectorConfig) -> Result<Arc<dyn SinkClient>, SinkError> {
        self(config)
    }
}

/// Factory selecting the sink implementation from [`SinkTarget`]
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultSinkFactory;

impl SinkFactory for DefaultSinkFactory {
    fn create(&self, config: &CollectorConfig) -> Result<Arc<dyn SinkClient>, SinkError> {
        config
            .validate()
            .map_err(|e| SinkError::InvalidConfig(e.to_string()))?;

        let sink: Arc<dyn SinkClient> = match &config.target {
            SinkTarget::Stdout => Arc::new(JsonLinesSink::stdout(config.batch_size)),
            SinkTarget::File { path } => Arc::new(JsonLinesSink::file(path, config.batch_size)?),
            SinkTarget::Http { endpoint } => Arc::new(HttpSink::new(endpoint, config)?),
        };
        info!("Created telemetry sink: {:?}", config.target);
        Ok(sink)
    }
}

#[derive(Debug, Default)]
struct MemorySinkState {
    records: Vec<TelemetryRecord>,
    sdk_version: Option<String>,
    flushes: usize,
}

/// Sink that keeps every record in memory
///
/// Clones share the same storage, so a clone can be handed to a collector
/// while the first handle is used to inspect what was forwarded.
#[derive(Debug, Clone, Default)]
pub struct MemorySink {
    state: Arc<Mutex<MemorySinkState>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, MemorySinkState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn records(&self) -> Vec<TelemetryRecord> {
        self.state().records.clone()
    }

    pub fn len(&self) -> usize {
        self.state().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn sdk_version(&self) -> Option<String> {
        self.state().sdk_version.clone()
    }

    pub fn flush_count(&self) -> usize {
        self.state().flushes
    }
}

impl SinkClient for MemorySink {
    fn track(&self, mut record: TelemetryRecord) -> Result<(), SinkError> {
        let mut state = self.state();
        if record.sdk_version.is_none() {
            record.sdk_version = state.sdk_version.clone();
        }
        state.records.push(record);
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        self.state().flushes += 1;
        Ok(())
    }

    fn set_sdk_version(&self, version: &str) {
        self.state().sdk_version = Some(version.to_string());
    }
}
