use crate::config::CollectorConfig;
use crate::error::SinkError;
use crate::events::TelemetryRecord;
use crate::sink::SinkClient;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// How long `flush` waits for the sender thread to acknowledge
const FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Messages sent to the sender thread
enum SinkMessage {
    Record(TelemetryRecord),
    Flush(Sender<()>),
    Shutdown,
}

/// Request body posted to the ingestion endpoint
#[derive(Debug, Serialize)]
struct Batch<'a> {
    #[serde(rename = "iKey")]
    instrumentation_key: &'a str,
    records: &'a [TelemetryRecord],
}

/// Sink posting JSON batches to an HTTP ingestion endpoint
///
/// Records are handed to a dedicated sender thread that owns a tokio
/// runtime and a `reqwest` client. A batch is posted when it reaches
/// `batch_size` records or when `flush_interval_seconds` elapses. Failed
/// batches are logged and dropped.
pub struct HttpSink {
    sender: Sender<SinkMessage>,
    thread_handle: Mutex<Option<JoinHandle<()>>>,
    sdk_version: Mutex<Option<String>>,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

struct SenderState {
    client: Client,
    url: String,
    instrumentation_key: String,
    batch_size: usize,
    flush_interval: Duration,
    sent: Arc<AtomicU64>,
    dropped: Arc<AtomicU64>,
}

impl HttpSink {
    /// Create a sink posting to `endpoint`
    ///
    /// # Errors
    ///
    /// Returns `SinkError::HttpError` if the HTTP client cannot be built and
    /// `SinkError::IoError` if the runtime or sender thread cannot be started.
    pub fn new(endpoint: &str, config: &CollectorConfig) -> Result<Self, SinkError> {
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        let sent = Arc::new(AtomicU64::new(0));
        let dropped = Arc::new(AtomicU64::new(0));
        let state = SenderState {
            client,
            url: endpoint.trim_end_matches('/').to_string(),
            instrumentation_key: config.instrumentation_key.clone().unwrap_or_default(),
            batch_size: config.batch_size.max(1),
            flush_interval: Duration::from_secs(config.flush_interval_seconds.max(1)),
            sent: Arc::clone(&sent),
            dropped: Arc::clone(&dropped),
        };

        let (sender, receiver) = mpsc::channel();
        let handle = thread::Builder::new()
            .name("etw-http-sink".to_string())
            .spawn(move || Self::sender_thread(runtime, state, receiver))?;

        info!("HttpSink started for {}", endpoint);
        Ok(Self {
            sender,
            thread_handle: Mutex::new(Some(handle)),
            sdk_version: Mutex::new(None),
            sent,
            dropped,
        })
    }

    /// Records successfully delivered so far
    pub fn sent_count(&self) -> u64 {
        self.sent.load(Ordering::SeqCst)
    }

    /// Records discarded after a failed delivery
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::SeqCst)
    }

    fn sender_thread(
        runtime: tokio::runtime::Runtime,
        state: SenderState,
        receiver: Receiver<SinkMessage>,
    ) {
        let mut batch: Vec<TelemetryRecord> = Vec::with_capacity(state.batch_size);
        let mut deadline = Instant::now() + state.flush_interval;

        loop {
            let timeout = deadline.saturating_duration_since(Instant::now());
            match receiver.recv_timeout(timeout) {
                Ok(SinkMessage::Record(record)) => {
                    batch.push(record);
                    if batch.len() >= state.batch_size {
                        runtime.block_on(Self::send_batch(&state, &mut batch));
                        deadline = Instant::now() + state.flush_interval;
                    }
                }
                Ok(SinkMessage::Flush(ack)) => {
                    runtime.block_on(Self::send_batch(&state, &mut batch));
                    deadline = Instant::now() + state.flush_interval;
                    let _ = ack.send(());
                }
                Ok(SinkMessage::Shutdown) | Err(RecvTimeoutError::Disconnected) => {
                    runtime.block_on(Self::send_batch(&state, &mut batch));
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {
                    runtime.block_on(Self::send_batch(&state, &mut batch));
                    deadline = Instant::now() + state.flush_interval;
                }
            }
        }

        debug!("HttpSink sender thread finished");
    }

    async fn send_batch(state: &SenderState, batch: &mut Vec<TelemetryRecord>) {
        if batch.is_empty() {
            return;
        }

        let body = Batch {
            instrumentation_key: &state.instrumentation_key,
            records: batch,
        };
        let count = batch.len() as u64;

        let result = state.client.post(&state.url).json(&body).send().await;
        match result.and_then(|response| response.error_for_status()) {
            Ok(_) => {
                debug!("Sent batch of {} records to {}", count, state.url);
                state.sent.fetch_add(count, Ordering::SeqCst);
            }
            Err(e) => {
                warn!("Failed to send {} records to {}: {}", count, state.url, e);
                state.dropped.fetch_add(count, Ordering::SeqCst);
            }
        }
        batch.clear();
    }
}

impl SinkClient for HttpSink {
    fn track(&self, mut record: TelemetryRecord) -> Result<(), SinkError> {
        if record.sdk_version.is_none() {
            record.sdk_version = self
                .sdk_version
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone();
        }
        self.sender
            .send(SinkMessage::Record(record))
            .map_err(|_| SinkError::Closed)
    }

    fn flush(&self) -> Result<(), SinkError> {
        let (ack_sender, ack_receiver) = mpsc::channel();
        self.sender
            .send(SinkMessage::Flush(ack_sender))
            .map_err(|_| SinkError::Closed)?;
        ack_receiver
            .recv_timeout(FLUSH_TIMEOUT)
            .map_err(|_| SinkError::Closed)
    }

    fn set_sdk_version(&self, version: &str) {
        *self
            .sdk_version
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(version.to_string());
    }
}

impl Drop for HttpSink {
    fn drop(&mut self) {
        let _ = self.sender.send(SinkMessage::Shutdown);
        let handle = self
            .thread_handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            if handle.join().is_err() {
                error!("HttpSink sender thread panicked");
            }
        }
    }
}
