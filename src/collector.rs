//! Collector module lifecycle
//!
//! [`CollectorModule`] validates its preconditions, enables the configured
//! providers on a trace session, runs a background consumer that forwards
//! events to a telemetry sink, and tears the session down exactly once.
//! Neither `initialize` nor `dispose` ever fails towards the host: every
//! problem is absorbed, reported through the diagnostic channel and
//! reflected in the returned outcome.

use crate::config::CollectorConfig;
use crate::consumer::{ConsumerStats, ConsumerWorker, EventConsumer, ForwardingConsumer};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::error::{InitError, ProviderError};
use crate::request::{ListeningRequest, ProviderSelector};
use crate::session::TraceSession;
use crate::sink::{DefaultSinkFactory, SinkClient, SinkFactory};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// Name the module reports itself under in diagnostics
pub const MODULE_NAME: &str = "EtwCollector";

/// Identity tag attached to every sink client the module creates
pub const SDK_VERSION: &str = concat!("etw:", env!("CARGO_PKG_VERSION"));

/// How long a re-initialize waits for the previous consumer to return
const REINITIALIZE_WORKER_TIMEOUT: Duration = Duration::from_secs(1);

/// Lifecycle of a collector module
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Uninitialized,
    Initializing,
    Initialized,
    Disposed,
}

/// Providers currently registered with the session
#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct EnabledProviders {
    guids: Vec<Uuid>,
    names: Vec<String>,
}

impl EnabledProviders {
    fn clear(&mut self) {
        self.guids.clear();
        self.names.clear();
    }
}

/// Result of enabling one listening request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderOutcome {
    /// Human-readable provider selector
    pub provider: String,
    pub validation_error: Option<ProviderError>,
    pub registration_error: Option<ProviderError>,
}

impl ProviderOutcome {
    /// Whether the provider ended up registered with the session
    pub fn is_enabled(&self) -> bool {
        self.registration_error.is_none()
    }
}

/// Per-provider results of a successful initialize
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ActivationReport {
    /// One entry per listening request, in configuration order
    pub outcomes: Vec<ProviderOutcome>,
    /// Whether the background consumer thread could be started
    pub worker_started: bool,
}

impl ActivationReport {
    pub fn enabled_count(&self) -> usize {
        self.outcomes.iter().filter(|o| o.is_enabled()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes.len() - self.enabled_count()
    }
}

/// What an `initialize` call did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitializeOutcome {
    /// A precondition failed; nothing was changed
    Aborted(InitError),
    /// No listening requests were configured; the module stays uninitialized
    NoSources,
    /// Providers were enabled (best effort) and the consumer was started
    Started(ActivationReport),
}

impl InitializeOutcome {
    pub fn is_started(&self) -> bool {
        matches!(self, InitializeOutcome::Started(_))
    }
}

/// State guarded by the module lock
struct ModuleInner {
    state: LifecycleState,
    enabled: EnabledProviders,
    sink: Option<Arc<dyn SinkClient>>,
}

/// Telemetry module collecting events from a trace session
///
/// The session is supplied at construction and owned by the module until
/// it is disposed. Listening requests can be changed by the host at any
/// time; they are read when `initialize` runs.
///
/// # Example
///
/// ```
/// use etw_collector::collector::CollectorModule;
/// use etw_collector::config::CollectorConfig;
/// use etw_collector::events::TraceLevel;
/// use etw_collector::request::ListeningRequest;
/// use etw_collector::session::MemorySession;
/// use std::sync::Arc;
///
/// let module = CollectorModule::new(Arc::new(MemorySession::new("demo", Some(true))));
/// module.add_source(ListeningRequest::by_name("Demo-Provider", TraceLevel::Informational, 0));
///
/// let outcome = module.initialize(Some(&CollectorConfig::default()));
/// assert!(outcome.is_started());
/// module.dispose();
/// ```
pub struct CollectorModule {
    /// Session the providers are enabled on; disposed exactly once
    session: Arc<dyn TraceSession>,
    /// Builds a fresh sink client on every initialize
    sink_factory: Arc<dyn SinkFactory>,
    /// Strategy run on the background worker
    consumer: Arc<dyn EventConsumer>,
    /// Where absorbed failures are reported
    diagnostics: Arc<Diagnostics>,
    /// Listening requests read by the next initialize
    sources: Mutex<Vec<ListeningRequest>>,
    /// One-shot dispose flag, never guarded by the module lock
    disposed: AtomicBool,
    /// Lifecycle state, provider bookkeeping and the current sink
    inner: Mutex<ModuleInner>,
    /// Consumer started by the last successful initialize
    worker: Mutex<Option<ConsumerWorker>>,
}

impl CollectorModule {
    /// Create a module owning `session`, with the default sink factory and
    /// forwarding consumer
    pub fn new(session: Arc<dyn TraceSession>) -> Self {
        Self {
            session,
            sink_factory: Arc::new(DefaultSinkFactory),
            consumer: Arc::new(ForwardingConsumer::default()),
            diagnostics: Arc::new(Diagnostics::new()),
            sources: Mutex::new(Vec::new()),
            disposed: AtomicBool::new(false),
            inner: Mutex::new(ModuleInner {
                state: LifecycleState::Uninitialized,
                enabled: EnabledProviders::default(),
                sink: None,
            }),
            worker: Mutex::new(None),
        }
    }

    pub fn with_sink_factory(mut self, sink_factory: Arc<dyn SinkFactory>) -> Self {
        self.sink_factory = sink_factory;
        self
    }

    pub fn with_consumer(mut self, consumer: Arc<dyn EventConsumer>) -> Self {
        self.consumer = consumer;
        self
    }

    pub fn with_sources(self, sources: Vec<ListeningRequest>) -> Self {
        self.set_sources(sources);
        self
    }

    /// Forward diagnostics to `sender` in addition to the log
    pub fn subscribe_diagnostics(&self, sender: Sender<Diagnostic>) {
        self.diagnostics.subscribe(sender);
    }

    pub fn sources(&self) -> Vec<ListeningRequest> {
        self.lock_sources().clone()
    }

    /// Replace the listening requests used by the next `initialize`
    pub fn set_sources(&self, sources: Vec<ListeningRequest>) {
        *self.lock_sources() = sources;
    }

    pub fn add_source(&self, request: ListeningRequest) {
        self.lock_sources().push(request);
    }

    pub fn state(&self) -> LifecycleState {
        if self.is_disposed() {
            return LifecycleState::Disposed;
        }
        self.lock_inner().state
    }

    pub fn is_initialized(&self) -> bool {
        self.state() == LifecycleState::Initialized
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Provider GUIDs enabled by the last initialize, in registration order
    pub fn enabled_provider_guids(&self) -> Vec<Uuid> {
        self.lock_inner().enabled.guids.clone()
    }

    /// Provider names enabled by the last initialize, in registration order
    pub fn enabled_provider_names(&self) -> Vec<String> {
        self.lock_inner().enabled.names.clone()
    }

    /// Initialize (or re-initialize) the module
    ///
    /// Preconditions are checked in order: a configuration must be supplied,
    /// the module must not be disposed, and the process must be elevated.
    /// The remaining steps run under the module lock: a fresh sink client is
    /// built, providers enabled by a previous call are disabled, every
    /// configured listening request is enabled, and the background consumer
    /// is started. Individual provider failures do not prevent activation.
    ///
    /// # Arguments
    ///
    /// * `config` - Sink configuration; `None` aborts with `ConfigurationMissing`
    pub fn initialize(&self, config: Option<&CollectorConfig>) -> InitializeOutcome {
        let Some(config) = config else {
            return self.abort(InitError::ConfigurationMissing);
        };
        if self.is_disposed() {
            return self.abort(InitError::ModuleDisposed);
        }
        if self.session.is_elevated() != Some(true) {
            return self.abort(InitError::InsufficientPrivilege);
        }

        let mut inner = self.lock_inner();

        // Dispose may have won the race while we were checking preconditions
        if self.is_disposed() {
            return self.abort(InitError::ModuleDisposed);
        }

        let sink = match self.sink_factory.create(config) {
            Ok(sink) => sink,
            Err(e) => {
                self.diagnostics.emit(Diagnostic::SinkUnavailable {
                    module: MODULE_NAME.to_string(),
                    error: e.to_string(),
                });
                return self.abort(InitError::SinkUnavailable(e.to_string()));
            }
        };
        sink.set_sdk_version(SDK_VERSION);
        let previous_sink = inner.sink.replace(Arc::clone(&sink));

        let outcome = self.activate(&mut inner, sink);
        drop(inner);

        // Outside the lock: an HTTP flush can block for seconds
        if let Some(previous) = previous_sink {
            if let Err(e) = previous.flush() {
                warn!("{}: failed to flush replaced sink: {}", MODULE_NAME, e);
            }
        }
        outcome
    }

    /// Reset a previous activation, then enable providers and start the consumer
    fn activate(&self, inner: &mut ModuleInner, sink: Arc<dyn SinkClient>) -> InitializeOutcome {
        if inner.state == LifecycleState::Initialized {
            info!("{}: re-initializing, resetting enabled providers", MODULE_NAME);
            self.stop_worker();
            self.disable_providers(&inner.enabled);
            inner.enabled.clear();
        }
        inner.state = LifecycleState::Initializing;

        let sources = self.sources();
        if sources.is_empty() {
            self.diagnostics.emit(Diagnostic::NoSourcesConfigured {
                module: MODULE_NAME.to_string(),
            });
            inner.state = LifecycleState::Uninitialized;
            return InitializeOutcome::NoSources;
        }

        let outcomes = self.enable_providers(&sources, &mut inner.enabled);
        let worker_started = self.start_worker(sink);
        inner.state = LifecycleState::Initialized;

        let report = ActivationReport {
            outcomes,
            worker_started,
        };
        info!(
            "{}: initialized with {} of {} providers enabled",
            MODULE_NAME,
            report.enabled_count(),
            report.outcomes.len()
        );
        InitializeOutcome::Started(report)
    }

    /// Dispose the session; later calls do nothing
    ///
    /// Providers are not disabled one by one: releasing the session releases
    /// its registrations. The consumer is signalled but not waited for; use
    /// [`CollectorModule::dispose_and_wait`] for that.
    pub fn dispose(&self) {
        if self
            .disposed
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("{}: already disposed", MODULE_NAME);
            return;
        }

        info!("{}: disposing trace session", MODULE_NAME);
        self.session.dispose();

        if let Some(worker) = self.lock_worker().as_ref() {
            worker.signal_stop();
        }
    }

    /// Dispose and wait up to `timeout` for the consumer to finish
    ///
    /// Returns `true` when no consumer is left running.
    pub fn dispose_and_wait(&self, timeout: Duration) -> bool {
        self.dispose();

        let worker = self.lock_worker().take();
        match worker {
            Some(worker) => match worker.wait(timeout) {
                Some(stats) => {
                    info!(
                        "{}: consumer stopped after forwarding {} records",
                        MODULE_NAME, stats.forwarded
                    );
                    true
                }
                None => false,
            },
            None => true,
        }
    }

    fn abort(&self, error: InitError) -> InitializeOutcome {
        self.diagnostics.emit(Diagnostic::ModuleInitializationFailed {
            module: MODULE_NAME.to_string(),
            reason: error.to_string(),
        });
        InitializeOutcome::Aborted(error)
    }

    fn enable_providers(
        &self,
        sources: &[ListeningRequest],
        enabled: &mut EnabledProviders,
    ) -> Vec<ProviderOutcome> {
        sources
            .iter()
            .map(|request| self.enable_provider(request, enabled))
            .collect()
    }

    /// Validate and register one provider
    ///
    /// Registration is attempted even when validation fails; each failure
    /// is reported on its own.
    fn enable_provider(
        &self,
        request: &ListeningRequest,
        enabled: &mut EnabledProviders,
    ) -> ProviderOutcome {
        let provider = request.display_selector();

        let validation_error = request.validate().err();
        if let Some(e) = &validation_error {
            self.report_enable_failure(&provider, e);
        }

        // An unusable request is still handed to the session under its raw name
        let selector = request
            .selector()
            .unwrap_or_else(|| ProviderSelector::Name(request.provider_name().unwrap_or_default()));
        let registration = match selector {
            ProviderSelector::Guid(guid) => self
                .session
                .enable_provider_by_guid(guid, request.level(), request.keywords())
                .map(|()| enabled.guids.push(guid)),
            ProviderSelector::Name(name) => self
                .session
                .enable_provider_by_name(name, request.level(), request.keywords())
                .map(|()| enabled.names.push(name.to_string())),
        };

        let registration_error = registration.err().map(ProviderError::from);
        match &registration_error {
            Some(e) => self.report_enable_failure(&provider, e),
            None => debug!("{}: enabled provider {}", MODULE_NAME, request),
        }

        ProviderOutcome {
            provider,
            validation_error,
            registration_error,
        }
    }

    fn report_enable_failure(&self, provider: &str, error: &ProviderError) {
        self.diagnostics.emit(Diagnostic::FailedToEnableProviders {
            module: MODULE_NAME.to_string(),
            provider: provider.to_string(),
            error: error.to_string(),
        });
    }

    fn disable_providers(&self, enabled: &EnabledProviders) {
        for guid in &enabled.guids {
            if let Err(e) = self.session.disable_provider_by_guid(*guid) {
                self.report_disable_failure(&guid.to_string(), &e.to_string());
            }
        }
        for name in &enabled.names {
            if let Err(e) = self.session.disable_provider_by_name(name) {
                self.report_disable_failure(name, &e.to_string());
            }
        }
    }

    fn report_disable_failure(&self, provider: &str, error: &str) {
        self.diagnostics.emit(Diagnostic::FailedToDisableProvider {
            module: MODULE_NAME.to_string(),
            provider: provider.to_string(),
            error: error.to_string(),
        });
    }

    fn start_worker(&self, sink: Arc<dyn SinkClient>) -> bool {
        if self.is_disposed() {
            debug!("{}: disposed during initialize, consumer not started", MODULE_NAME);
            return false;
        }

        let spawned = ConsumerWorker::spawn(
            MODULE_NAME,
            Arc::clone(&self.consumer),
            Arc::clone(&self.session),
            sink,
            Arc::clone(&self.diagnostics),
        );

        match spawned {
            Ok(worker) => {
                if self.is_disposed() {
                    worker.signal_stop();
                }
                *self.lock_worker() = Some(worker);
                true
            }
            Err(e) => {
                self.diagnostics.emit(Diagnostic::ConsumerFailed {
                    module: MODULE_NAME.to_string(),
                    error: e.to_string(),
                });
                false
            }
        }
    }

    /// Stop the consumer of a previous initialize before providers are reset
    fn stop_worker(&self) -> Option<ConsumerStats> {
        let worker = self.lock_worker().take()?;
        worker.signal_stop();
        let stats = worker.wait(REINITIALIZE_WORKER_TIMEOUT);
        if stats.is_none() {
            warn!(
                "{}: previous consumer still running, continuing re-initialize",
                MODULE_NAME
            );
        }
        stats
    }

    fn lock_inner(&self) -> MutexGuard<'_, ModuleInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_sources(&self) -> MutexGuard<'_, Vec<ListeningRequest>> {
        self.sources.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_worker(&self) -> MutexGuard<'_, Option<ConsumerWorker>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CollectorModule {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{SessionError, SinkError};
    use crate::events::{TelemetryRecord, TraceLevel};
    use crate::session::{MockTraceSession, StopSignal};
    use crate::sink::MemorySink;
    use mockall::predicate::eq;
    use mockall::Sequence;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc::{self, Receiver};
    use std::sync::{OnceLock, Weak};

    const G: Uuid = Uuid::from_u128(0x5f6e_7d8c_0000_4000_8000_0000_0000_00f1);

    /// Session mock that is elevated, processes nothing and expects one dispose
    fn elevated_session() -> MockTraceSession {
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().return_const(Some(true));
        session.expect_process().returning(|_, _| Ok(()));
        session.expect_dispose().times(1).return_const(());
        session
    }

    fn memory_factory(sink: MemorySink, created: Arc<AtomicUsize>) -> Arc<dyn SinkFactory> {
        Arc::new(
            move |_: &CollectorConfig| -> Result<Arc<dyn SinkClient>, SinkError> {
                created.fetch_add(1, Ordering::SeqCst);
                Ok(Arc::new(sink.clone()))
            },
        )
    }

    fn module_with(session: MockTraceSession) -> (CollectorModule, Receiver<Diagnostic>) {
        let module = CollectorModule::new(Arc::new(session)).with_sink_factory(memory_factory(
            MemorySink::new(),
            Arc::new(AtomicUsize::new(0)),
        ));
        let (tx, rx) = mpsc::channel();
        module.subscribe_diagnostics(tx);
        (module, rx)
    }

    fn failure_reason(rx: &Receiver<Diagnostic>) -> String {
        match rx.try_recv().unwrap() {
            Diagnostic::ModuleInitializationFailed { reason, .. } => reason,
            other => panic!("Expected ModuleInitializationFailed, got {:?}", other),
        }
    }

    /// Late-bound handle letting collaborators reach the module under test
    type ModuleSlot = Arc<OnceLock<Weak<CollectorModule>>>;

    /// Consumer that returns immediately without touching the sink
    struct IdleConsumer;

    impl EventConsumer for IdleConsumer {
        fn consume(
            &self,
            _session: &dyn TraceSession,
            _sink: Arc<dyn SinkClient>,
            _stop: StopSignal,
        ) -> Result<ConsumerStats, SessionError> {
            Ok(ConsumerStats::default())
        }
    }

    /// Sink recording, for every flush, whether the module lock was free
    #[derive(Clone)]
    struct LockCheckingSink {
        module: ModuleSlot,
        unlocked_flushes: Arc<Mutex<Vec<bool>>>,
    }

    impl SinkClient for LockCheckingSink {
        fn track(&self, _record: TelemetryRecord) -> Result<(), SinkError> {
            Ok(())
        }

        fn flush(&self) -> Result<(), SinkError> {
            if let Some(module) = self.module.get().and_then(Weak::upgrade) {
                let unlocked = module.inner.try_lock().is_ok();
                self.unlocked_flushes.lock().unwrap().push(unlocked);
            }
            Ok(())
        }

        fn set_sdk_version(&self, _version: &str) {}
    }

    #[test]
    fn test_missing_configuration() {
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().times(0);
        session.expect_dispose().times(1).return_const(());

        let (module, rx) = module_with(session);
        module.add_source(ListeningRequest::by_name("A", TraceLevel::Informational, 0));

        let outcome = module.initialize(None);
        assert_eq!(
            outcome,
            InitializeOutcome::Aborted(InitError::ConfigurationMissing)
        );
        assert!(!module.is_initialized());
        assert_eq!(failure_reason(&rx), "Configuration is missing");
    }

    #[test]
    fn test_initialize_after_dispose() {
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().times(0);
        session.expect_enable_provider_by_name().times(0);
        session.expect_dispose().times(1).return_const(());

        let (module, rx) = module_with(session);
        module.add_source(ListeningRequest::by_name("A", TraceLevel::Informational, 0));
        module.dispose();

        let outcome = module.initialize(Some(&CollectorConfig::default()));
        assert_eq!(outcome, InitializeOutcome::Aborted(InitError::ModuleDisposed));
        assert_eq!(module.state(), LifecycleState::Disposed);
        assert_eq!(failure_reason(&rx), "Module has been disposed");
    }

    #[test]
    fn test_elevation_unknown_or_false_aborts() {
        for elevated in [None, Some(false)] {
            let mut session = MockTraceSession::new();
            session.expect_is_elevated().return_const(elevated);
            session.expect_enable_provider_by_name().times(0);
            session.expect_enable_provider_by_guid().times(0);
            session.expect_dispose().times(1).return_const(());

            let (module, rx) = module_with(session);
            module.add_source(ListeningRequest::by_name("A", TraceLevel::Informational, 0));

            let outcome = module.initialize(Some(&CollectorConfig::default()));
            assert_eq!(
                outcome,
                InitializeOutcome::Aborted(InitError::InsufficientPrivilege)
            );
            assert_eq!(module.state(), LifecycleState::Uninitialized);
            assert!(failure_reason(&rx).contains("not elevated"));
        }
    }

    #[test]
    fn test_empty_sources() {
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().return_const(Some(true));
        session.expect_process().times(0);
        session.expect_dispose().times(1).return_const(());

        let (module, rx) = module_with(session);
        let outcome = module.initialize(Some(&CollectorConfig::default()));

        assert_eq!(outcome, InitializeOutcome::NoSources);
        assert!(!module.is_initialized());
        assert_eq!(
            rx.try_recv().unwrap(),
            Diagnostic::NoSourcesConfigured {
                module: MODULE_NAME.to_string()
            }
        );
        assert!(module.lock_worker().is_none());
    }

    #[test]
    fn test_name_and_guid_requests_are_tracked_in_order() {
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_name()
            .with(eq("A"), eq(TraceLevel::Informational), eq(0))
            .times(1)
            .returning(|_, _, _| Ok(()));
        session
            .expect_enable_provider_by_guid()
            .with(eq(G), eq(TraceLevel::Verbose), eq(0xF))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (module, _rx) = module_with(session);
        module.set_sources(vec![
            ListeningRequest::by_name("A", TraceLevel::Informational, 0),
            ListeningRequest::by_guid(G, TraceLevel::Verbose, 0xF),
        ]);

        let outcome = module.initialize(Some(&CollectorConfig::default()));
        assert!(outcome.is_started());
        assert!(module.is_initialized());
        assert_eq!(module.enabled_provider_names(), vec!["A".to_string()]);
        assert_eq!(module.enabled_provider_guids(), vec![G]);
    }

    #[test]
    fn test_reinitialize_disables_previous_providers_first() {
        let mut seq = Sequence::new();
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().return_const(Some(true));
        session.expect_process().returning(|_, _| Ok(()));
        session.expect_dispose().times(1).return_const(());

        session
            .expect_enable_provider_by_name()
            .with(eq("A"), eq(TraceLevel::Informational), eq(0))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        session
            .expect_disable_provider_by_name()
            .with(eq("A"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));
        session
            .expect_enable_provider_by_name()
            .with(eq("B"), eq(TraceLevel::Warning), eq(0x3))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));

        let sink = MemorySink::new();
        let created = Arc::new(AtomicUsize::new(0));
        let module = CollectorModule::new(Arc::new(session))
            .with_sink_factory(memory_factory(sink.clone(), Arc::clone(&created)));

        module.set_sources(vec![ListeningRequest::by_name("A", TraceLevel::Informational, 0)]);
        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());

        module.set_sources(vec![ListeningRequest::by_name("B", TraceLevel::Warning, 0x3)]);
        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());

        assert_eq!(module.enabled_provider_names(), vec!["B".to_string()]);
        assert!(module.enabled_provider_guids().is_empty());
        assert_eq!(created.load(Ordering::SeqCst), 2);
        assert_eq!(sink.sdk_version().as_deref(), Some(SDK_VERSION));
    }

    #[test]
    fn test_invalid_request_still_attempts_registration() {
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_name()
            .with(eq(""), eq(TraceLevel::Verbose), eq(0))
            .times(1)
            .returning(|name, _, _| Err(SessionError::ProviderNotFound(name.to_string())));
        session
            .expect_enable_provider_by_name()
            .with(eq("C"), eq(TraceLevel::Verbose), eq(0))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (module, rx) = module_with(session);
        module.set_sources(vec![
            ListeningRequest::new(None, None, TraceLevel::Verbose, 0),
            ListeningRequest::by_name("C", TraceLevel::Verbose, 0),
        ]);

        let report = match module.initialize(Some(&CollectorConfig::default())) {
            InitializeOutcome::Started(report) => report,
            other => panic!("Expected Started, got {:?}", other),
        };

        assert!(matches!(
            report.outcomes[0].validation_error,
            Some(ProviderError::Validation(_))
        ));
        assert!(matches!(
            report.outcomes[0].registration_error,
            Some(ProviderError::Registration(_))
        ));
        assert!(report.outcomes[1].is_enabled());
        assert_eq!(report.enabled_count(), 1);
        assert_eq!(report.failed_count(), 1);

        // Best effort: partial failure still initializes
        assert!(module.is_initialized());
        assert_eq!(module.enabled_provider_names(), vec!["C".to_string()]);

        let diagnostics: Vec<_> = rx.try_iter().collect();
        let enable_failures = diagnostics
            .iter()
            .filter(|d| matches!(d, Diagnostic::FailedToEnableProviders { .. }))
            .count();
        assert_eq!(enable_failures, 2);
    }

    #[test]
    fn test_registration_failure_does_not_stop_remaining_requests() {
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_guid()
            .times(1)
            .returning(|_, _, _| Err(SessionError::AccessDenied("denied".to_string())));
        session
            .expect_enable_provider_by_name()
            .with(eq("D"), eq(TraceLevel::Error), eq(0))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (module, rx) = module_with(session);
        module.set_sources(vec![
            ListeningRequest::by_guid(G, TraceLevel::Verbose, 0),
            ListeningRequest::by_name("D", TraceLevel::Error, 0),
        ]);

        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());
        assert!(module.enabled_provider_guids().is_empty());
        assert_eq!(module.enabled_provider_names(), vec!["D".to_string()]);
        assert_eq!(
            rx.try_recv().unwrap(),
            Diagnostic::FailedToEnableProviders {
                module: MODULE_NAME.to_string(),
                provider: G.to_string(),
                error: "Provider registration failed: Access denied: denied".to_string(),
            }
        );
    }

    #[test]
    fn test_disable_failure_is_logged_and_reinitialize_continues() {
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_name()
            .times(2)
            .returning(|_, _, _| Ok(()));
        session
            .expect_disable_provider_by_name()
            .times(1)
            .returning(|name| Err(SessionError::ProviderNotFound(name.to_string())));

        let (module, rx) = module_with(session);
        module.set_sources(vec![ListeningRequest::by_name("A", TraceLevel::Verbose, 0)]);

        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());
        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());

        assert!(rx
            .try_iter()
            .any(|d| matches!(d, Diagnostic::FailedToDisableProvider { .. })));
        assert_eq!(module.enabled_provider_names(), vec!["A".to_string()]);
    }

    #[test]
    fn test_sink_factory_failure_aborts() {
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().return_const(Some(true));
        session.expect_enable_provider_by_name().times(0);
        session.expect_dispose().times(1).return_const(());

        let module = CollectorModule::new(Arc::new(session)).with_sink_factory(Arc::new(
            |_: &CollectorConfig| -> Result<Arc<dyn SinkClient>, SinkError> {
                Err(SinkError::InvalidConfig("no endpoint".to_string()))
            },
        ));
        let (tx, rx) = mpsc::channel();
        module.subscribe_diagnostics(tx);
        module.add_source(ListeningRequest::by_name("A", TraceLevel::Verbose, 0));

        assert!(matches!(
            module.initialize(Some(&CollectorConfig::default())),
            InitializeOutcome::Aborted(InitError::SinkUnavailable(_))
        ));
        assert!(!module.is_initialized());

        match rx.try_recv().unwrap() {
            Diagnostic::SinkUnavailable { module, error } => {
                assert_eq!(module, MODULE_NAME);
                assert!(error.contains("no endpoint"));
            }
            other => panic!("Expected SinkUnavailable, got {:?}", other),
        }
        assert!(failure_reason(&rx).contains("no endpoint"));
    }

    #[test]
    fn test_reinitialize_with_no_sources_resets_previous_activation() {
        let mut seq = Sequence::new();
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_name()
            .with(eq("A"), eq(TraceLevel::Informational), eq(0))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _, _| Ok(()));
        session
            .expect_disable_provider_by_name()
            .with(eq("A"))
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(()));

        let (module, rx) = module_with(session);
        module.set_sources(vec![ListeningRequest::by_name("A", TraceLevel::Informational, 0)]);
        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());

        module.set_sources(vec![]);
        let outcome = module.initialize(Some(&CollectorConfig::default()));

        assert_eq!(outcome, InitializeOutcome::NoSources);
        assert_eq!(module.state(), LifecycleState::Uninitialized);
        assert!(module.enabled_provider_names().is_empty());
        assert!(module.lock_worker().is_none());
        assert!(rx
            .try_iter()
            .any(|d| matches!(d, Diagnostic::NoSourcesConfigured { .. })));
    }

    #[test]
    fn test_request_with_name_and_guid_registers_by_guid() {
        let mut session = elevated_session();
        session.expect_enable_provider_by_name().times(0);
        session
            .expect_enable_provider_by_guid()
            .with(eq(G), eq(TraceLevel::Warning), eq(0))
            .times(1)
            .returning(|_, _, _| Ok(()));

        let (module, _rx) = module_with(session);
        module.add_source(ListeningRequest::new(
            Some("Named-Provider".to_string()),
            Some(G),
            TraceLevel::Warning,
            0,
        ));

        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());
        assert_eq!(module.enabled_provider_guids(), vec![G]);
        assert!(module.enabled_provider_names().is_empty());
    }

    #[test]
    fn test_replaced_sink_is_flushed_outside_module_lock() {
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_name()
            .returning(|_, _, _| Ok(()));
        session
            .expect_disable_provider_by_name()
            .returning(|_| Ok(()));

        let slot: ModuleSlot = Arc::new(OnceLock::new());
        let sink = LockCheckingSink {
            module: Arc::clone(&slot),
            unlocked_flushes: Arc::new(Mutex::new(Vec::new())),
        };
        let factory_sink = sink.clone();
        let module = Arc::new(
            CollectorModule::new(Arc::new(session))
                .with_consumer(Arc::new(IdleConsumer))
                .with_sink_factory(Arc::new(
                    move |_: &CollectorConfig| -> Result<Arc<dyn SinkClient>, SinkError> {
                        Ok(Arc::new(factory_sink.clone()))
                    },
                ))
                .with_sources(vec![ListeningRequest::by_name("A", TraceLevel::Verbose, 0)]),
        );
        assert!(slot.set(Arc::downgrade(&module)).is_ok());

        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());
        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());

        assert_eq!(*sink.unlocked_flushes.lock().unwrap(), vec![true]);
    }

    #[test]
    fn test_dispose_during_initialize_does_not_start_consumer() {
        let mut session = MockTraceSession::new();
        session.expect_is_elevated().return_const(Some(true));
        session
            .expect_enable_provider_by_name()
            .returning(|_, _, _| Ok(()));
        session.expect_process().times(0);
        session.expect_dispose().times(1).return_const(());

        let slot: ModuleSlot = Arc::new(OnceLock::new());
        let factory_slot = Arc::clone(&slot);
        let module = Arc::new(
            CollectorModule::new(Arc::new(session))
                .with_sink_factory(Arc::new(
                    move |_: &CollectorConfig| -> Result<Arc<dyn SinkClient>, SinkError> {
                        // Dispose lands after the re-check under the lock
                        if let Some(module) = factory_slot.get().and_then(Weak::upgrade) {
                            module.dispose();
                        }
                        Ok(Arc::new(MemorySink::new()))
                    },
                ))
                .with_sources(vec![ListeningRequest::by_name("A", TraceLevel::Verbose, 0)]),
        );
        assert!(slot.set(Arc::downgrade(&module)).is_ok());
        let (tx, rx) = mpsc::channel();
        module.subscribe_diagnostics(tx);

        match module.initialize(Some(&CollectorConfig::default())) {
            InitializeOutcome::Started(report) => assert!(!report.worker_started),
            other => panic!("Expected Started, got {:?}", other),
        }
        assert!(module.lock_worker().is_none());
        assert_eq!(module.state(), LifecycleState::Disposed);
        assert!(!rx
            .try_iter()
            .any(|d| matches!(d, Diagnostic::ConsumerFailed { .. })));
    }

    #[test]
    fn test_dispose_is_idempotent() {
        let (module, _rx) = module_with(elevated_session());

        module.dispose();
        module.dispose();
        assert!(module.dispose_and_wait(Duration::from_secs(1)));
        assert!(module.is_disposed());
        // Dropping the module must not dispose the session a second time
        drop(module);
    }

    #[test]
    fn test_dispose_from_many_threads() {
        let module = Arc::new(module_with(elevated_session()).0);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let module = Arc::clone(&module);
                std::thread::spawn(move || module.dispose())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(module.state(), LifecycleState::Disposed);
    }

    #[test]
    fn test_dispose_and_wait_joins_consumer() {
        let mut session = elevated_session();
        session
            .expect_enable_provider_by_name()
            .returning(|_, _, _| Ok(()));

        let (module, _rx) = module_with(session);
        module.add_source(ListeningRequest::by_name("A", TraceLevel::Verbose, 0));
        assert!(module.initialize(Some(&CollectorConfig::default())).is_started());

        assert!(module.dispose_and_wait(Duration::from_secs(5)));
        assert!(module.lock_worker().is_none());
    }
}
