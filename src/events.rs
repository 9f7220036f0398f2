//! Core event types for the ETW collector
//!
//! This module defines the raw trace events delivered by a session and the
//! structured telemetry records forwarded to a sink.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Timestamp type for consistent time handling across the crate
pub type Timestamp = DateTime<Utc>;

/// Verbosity level of a trace provider or event
///
/// Ordered from least to most verbose. An event passes a level filter when
/// its level is less than or equal to the requested level.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord, Default,
)]
#[serde(rename_all = "lowercase")]
pub enum TraceLevel {
    /// Always logged regardless of the requested level
    LogAlways = 0,
    /// Abnormal exit or termination
    Critical = 1,
    /// Severe errors
    Error = 2,
    /// Warnings such as allocation failures
    Warning = 3,
    /// Non-error informational events
    #[default]
    #[serde(alias = "info")]
    Informational = 4,
    /// Detailed diagnostic events
    Verbose = 5,
}

impl TraceLevel {
    /// Numeric level as used by the native tracing API
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Convert a native level value; unknown values are treated as verbose
    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => TraceLevel::LogAlways,
            1 => TraceLevel::Critical,
            2 => TraceLevel::Error,
            3 => TraceLevel::Warning,
            4 => TraceLevel::Informational,
            _ => TraceLevel::Verbose,
        }
    }
}

/// Raw event captured from a trace session
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TraceEvent {
    /// When the event was written
    pub timestamp: Timestamp,
    /// Name of the provider that wrote the event
    #[serde(default)]
    pub provider_name: String,
    /// Identifier of the provider that wrote the event
    #[serde(default)]
    pub provider_guid: Uuid,
    /// Provider-scoped event identifier
    #[serde(default)]
    pub event_id: u16,
    /// Event name, empty when the provider does not publish one
    #[serde(default)]
    pub event_name: String,
    /// Event verbosity level
    #[serde(default)]
    pub level: TraceLevel,
    /// Keyword bits the event was written with
    #[serde(default)]
    pub keywords: u64,
    #[serde(default)]
    pub opcode: u8,
    #[serde(default)]
    pub task: u16,
    /// Process that wrote the event
    #[serde(default)]
    pub process_id: u32,
    /// Thread that wrote the event
    #[serde(default)]
    pub thread_id: u32,
    /// Formatted message, if the provider supplies a message template
    #[serde(default)]
    pub formatted_message: Option<String>,
    /// Decoded payload fields
    #[serde(default)]
    pub payload: BTreeMap<String, serde_json::Value>,
}

impl TraceEvent {
    /// Create an event with the given provider name and level, stamped now
    pub fn new(provider_name: impl Into<String>, level: TraceLevel) -> Self {
        Self {
            timestamp: Utc::now(),
            provider_name: provider_name.into(),
            provider_guid: Uuid::nil(),
            event_id: 0,
            event_name: String::new(),
            level,
            keywords: 0,
            opcode: 0,
            task: 0,
            process_id: 0,
            thread_id: 0,
            formatted_message: None,
            payload: BTreeMap::new(),
        }
    }

    pub fn with_guid(mut self, guid: Uuid) -> Self {
        self.provider_guid = guid;
        self
    }

    pub fn with_event_id(mut self, event_id: u16) -> Self {
        self.event_id = event_id;
        self
    }

    pub fn with_keywords(mut self, keywords: u64) -> Self {
        self.keywords = keywords;
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.formatted_message = Some(message.into());
        self
    }

    pub fn with_payload(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.payload.insert(key.into(), value);
        self
    }
}

/// Severity of a forwarded telemetry record
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Verbose,
    Information,
    Warning,
    Error,
    Critical,
}

impl From<TraceLevel> for Severity {
    fn from(level: TraceLevel) -> Self {
        match level {
            TraceLevel::Critical => Severity::Critical,
            TraceLevel::Error => Severity::Error,
            TraceLevel::Warning => Severity::Warning,
            TraceLevel::Informational | TraceLevel::LogAlways => Severity::Information,
            TraceLevel::Verbose => Severity::Verbose,
        }
    }
}

/// Structured key/value record forwarded to a telemetry sink
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TelemetryRecord {
    pub timestamp: Timestamp,
    /// Record name, usually `<provider>/<event>`
    pub name: String,
    pub severity: Severity,
    pub message: String,
    pub properties: BTreeMap<String, String>,
    /// Identity of the collector that produced the record
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdk_version: Option<String>,
}
