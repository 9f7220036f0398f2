use crate::error::SinkError;
use crate::events::TelemetryRecord;
use crate::sink::SinkClient;
use log::debug;
use std::fs::OpenOptions;
use std::io::{self, BufWriter, Write};
use std::path::Path;
use std::sync::{Mutex, PoisonError};

struct Output {
    writer: BufWriter<Box<dyn Write + Send>>,
    unflushed: usize,
    sdk_version: Option<String>,
}

/// Sink writing one JSON document per record
///
/// Output is buffered and flushed every `batch_size` records or when
/// [`SinkClient::flush`] is called.
pub struct JsonLinesSink {
    output: Mutex<Output>,
    batch_size: usize,
}

impl JsonLinesSink {
    pub fn new(writer: Box<dyn Write + Send>, batch_size: usize) -> Self {
        Self {
            output: Mutex::new(Output {
                writer: BufWriter::new(writer),
                unflushed: 0,
                sdk_version: None,
            }),
            batch_size: batch_size.max(1),
        }
    }

    pub fn stdout(batch_size: usize) -> Self {
        Self::new(Box::new(io::stdout()), batch_size)
    }

    /// Append records to `path`, creating the file if needed
    pub fn file(path: &Path, batch_size: usize) -> Result<Self, SinkError> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        debug!("Writing telemetry records to {}", path.display());
        Ok(Self::new(Box::new(file), batch_size))
    }
}

impl SinkClient for JsonLinesSink {
    fn track(&self, mut record: TelemetryRecord) -> Result<(), SinkError> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        if record.sdk_version.is_none() {
            record.sdk_version = output.sdk_version.clone();
        }

        let line = serde_json::to_string(&record)?;
        writeln!(output.writer, "{}", line)?;
        output.unflushed += 1;

        if output.unflushed >= self.batch_size {
            output.writer.flush()?;
            output.unflushed = 0;
        }
        Ok(())
    }

    fn flush(&self) -> Result<(), SinkError> {
        let mut output = self.output.lock().unwrap_or_else(PoisonError::into_inner);
        output.writer.flush()?;
        output.unflushed = 0;
        Ok(())
    }

    fn set_sdk_version(&self, version: &str) {
        self.output
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sdk_version = Some(version.to_string());
    }
}

impl Drop for JsonLinesSink {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Severity;
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn record(name: &str) -> TelemetryRecord {
        let mut properties = BTreeMap::new();
        properties.insert("EventId".to_string(), "7".to_string());
        TelemetryRecord {
            timestamp: Utc::now(),
            name: name.to_string(),
            severity: Severity::Warning,
            message: "disk almost full".to_string(),
            properties,
            sdk_version: None,
        }
    }

    #[test]
    fn test_file_sink_writes_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        {
            let sink = JsonLinesSink::file(&path, 10).unwrap();
            sink.set_sdk_version("etw:0.1.0");
            sink.track(record("A/1")).unwrap();
            sink.track(record("A/2")).unwrap();
            sink.flush().unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<_> = content.lines().collect();
        assert_eq!(lines.len(), 2);

        let parsed: TelemetryRecord = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.name, "A/2");
        assert_eq!(parsed.sdk_version.as_deref(), Some("etw:0.1.0"));
        assert_eq!(parsed.properties.get("EventId").map(String::as_str), Some("7"));
    }

    #[test]
    fn test_file_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.jsonl");

        for name in ["first", "second"] {
            let sink = JsonLinesSink::file(&path, 1).unwrap();
            sink.track(record(name)).unwrap();
        }

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content.lines().count(), 2);
    }
}
