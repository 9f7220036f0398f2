//! Background event consumer
//!
//! The consumer drains a trace session on a dedicated thread, translates
//! each event and forwards the resulting record to the sink. The module
//! keeps a [`ConsumerWorker`] handle so the thread can be stopped and
//! waited for.

use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::SessionError;
use crate::events::TraceEvent;
use crate::session::{EventHandler, StopSignal, TraceSession};
use crate::sink::SinkClient;
use crate::translate::{DefaultTranslator, EventTranslator};
use log::{debug, error, info, warn};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Counters reported by a consumer run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumerStats {
    /// Records accepted by the sink
    pub forwarded: u64,
    /// Records the sink rejected
    pub failed: u64,
}

/// Strategy run on the background worker
pub trait EventConsumer: Send + Sync {
    /// Consume `session` until it is disposed or `stop` is raised
    fn consume(
        &self,
        session: &dyn TraceSession,
        sink: Arc<dyn SinkClient>,
        stop: StopSignal,
    ) -> Result<ConsumerStats, SessionError>;
}

/// Consumer translating every event and forwarding it to the sink
pub struct ForwardingConsumer {
    translator: Arc<dyn EventTranslator>,
}

impl Default for ForwardingConsumer {
    fn default() -> Self {
        Self::new(Arc::new(DefaultTranslator))
    }
}

impl ForwardingConsumer {
    pub fn new(translator: Arc<dyn EventTranslator>) -> Self {
        Self { translator }
    }
}

impl EventConsumer for ForwardingConsumer {
    fn consume(
        &self,
        session: &dyn TraceSession,
        sink: Arc<dyn SinkClient>,
        stop: StopSignal,
    ) -> Result<ConsumerStats, SessionError> {
        let forwarded = Arc::new(AtomicU64::new(0));
        let failed = Arc::new(AtomicU64::new(0));

        let handler: EventHandler = {
            let translator = Arc::clone(&self.translator);
            let sink = Arc::clone(&sink);
            let forwarded = Arc::clone(&forwarded);
            let failed = Arc::clone(&failed);
            Box::new(move |event: TraceEvent| {
                let record = translator.translate(&event);
                match sink.track(record) {
                    Ok(()) => {
                        forwarded.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        // Only the first failure is worth a warning; the rest are counted
                        if failed.fetch_add(1, Ordering::Relaxed) == 0 {
                            warn!("Sink rejected telemetry record: {}", e);
                        }
                    }
                }
            })
        };

        let result = session.process(handler, stop);

        if let Err(e) = sink.flush() {
            warn!("Failed to flush sink after consumer run: {}", e);
        }

        result.map(|()| ConsumerStats {
            forwarded: forwarded.load(Ordering::Relaxed),
            failed: failed.load(Ordering::Relaxed),
        })
    }
}

/// Handle to a running consumer thread
pub struct ConsumerWorker {
    stop: StopSignal,
    done: Receiver<ConsumerStats>,
    handle: Option<JoinHandle<()>>,
}

impl ConsumerWorker {
    /// Start `consumer` on a dedicated thread
    ///
    /// # Errors
    ///
    /// Returns the OS error if the thread cannot be spawned.
    pub fn spawn(
        module_name: &str,
        consumer: Arc<dyn EventConsumer>,
        session: Arc<dyn TraceSession>,
        sink: Arc<dyn SinkClient>,
        diagnostics: Arc<Diagnostics>,
    ) -> io::Result<Self> {
        let stop = StopSignal::new();
        let (done_sender, done) = mpsc::channel();
        let thread_stop = stop.clone();
        let module = module_name.to_string();

        let handle = thread::Builder::new()
            .name("etw-consumer".to_string())
            .spawn(move || {
                info!("{}: event consumer started", module);
                let stats = match consumer.consume(session.as_ref(), sink, thread_stop) {
                    Ok(stats) => stats,
                    Err(e) => {
                        diagnostics.emit(Diagnostic::ConsumerFailed {
                            module: module.clone(),
                            error: e.to_string(),
                        });
                        ConsumerStats::default()
                    }
                };
                info!(
                    "{}: event consumer finished ({} forwarded, {} failed)",
                    module, stats.forwarded, stats.failed
                );
                let _ = done_sender.send(stats);
            })?;

        Ok(Self {
            stop,
            done,
            handle: Some(handle),
        })
    }

    /// Ask the consumer to return from its processing loop
    pub fn signal_stop(&self) {
        self.stop.stop();
    }

    /// Wait up to `timeout` for the consumer to finish
    ///
    /// Returns the run's counters, or `None` if the thread did not finish in
    /// time. A worker that timed out keeps running detached.
    pub fn wait(mut self, timeout: Duration) -> Option<ConsumerStats> {
        let stats = match self.done.recv_timeout(timeout) {
            Ok(stats) => stats,
            Err(RecvTimeoutError::Timeout) => {
                warn!("Event consumer did not finish within {:?}", timeout);
                return None;
            }
            Err(RecvTimeoutError::Disconnected) => {
                error!("Event consumer thread exited without reporting");
                ConsumerStats::default()
            }
        };

        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                error!("Event consumer thread panicked");
            }
        }
        debug!("Event consumer joined");
        Some(stats)
    }
}
