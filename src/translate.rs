//! Translation of raw trace events into telemetry records

use crate::events::{Severity, TelemetryRecord, TraceEvent};
use std::collections::BTreeMap;

/// Property keys written by [`DefaultTranslator`]
const RESERVED_KEYS: [&str; 9] = [
    "ProviderName",
    "ProviderGuid",
    "EventId",
    "EventName",
    "Keywords",
    "Level",
    "Opcode",
    "Task",
    "ProcessId",
];

/// Maps one raw trace event to a structured telemetry record
pub trait EventTranslator: Send + Sync {
    fn translate(&self, event: &TraceEvent) -> TelemetryRecord;
}

/// Default event mapping
///
/// Header fields become properties under fixed keys, payload fields are
/// copied as strings. Payload keys that collide with a header key are
/// prefixed with `Payload.`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultTranslator;

impl DefaultTranslator {
    fn record_name(event: &TraceEvent) -> String {
        let provider = if event.provider_name.is_empty() {
            event.provider_guid.to_string()
        } else {
            event.provider_name.clone()
        };

        if event.event_name.is_empty() {
            format!("{}/{}", provider, event.event_id)
        } else {
            format!("{}/{}", provider, event.event_name)
        }
    }

    fn payload_value(value: &serde_json::Value) -> String {
        match value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

impl EventTranslator for DefaultTranslator {
    fn translate(&self, event: &TraceEvent) -> TelemetryRecord {
        let mut properties = BTreeMap::new();
        properties.insert("ProviderName".to_string(), event.provider_name.clone());
        properties.insert("ProviderGuid".to_string(), event.provider_guid.to_string());
        properties.insert("EventId".to_string(), event.event_id.to_string());
        if !event.event_name.is_empty() {
            properties.insert("EventName".to_string(), event.event_name.clone());
        }
        properties.insert("Keywords".to_string(), format!("{:#x}", event.keywords));
        properties.insert("Level".to_string(), format!("{:?}", event.level));
        properties.insert("Opcode".to_string(), event.opcode.to_string());
        properties.insert("Task".to_string(), event.task.to_string());
        properties.insert("ProcessId".to_string(), event.process_id.to_string());

        for (key, value) in &event.payload {
            let key = if RESERVED_KEYS.contains(&key.as_str()) {
                format!("Payload.{}", key)
            } else {
                key.clone()
            };
            properties.insert(key, Self::payload_value(value));
        }

        TelemetryRecord {
            timestamp: event.timestamp,
            name: Self::record_name(event),
            severity: Severity::from(event.level),
            message: event.formatted_message.clone().unwrap_or_default(),
            properties,
            sdk_version: None,
        }
    }
}
