use crate::error::SessionError;
use crate::events::{TraceEvent, TraceLevel};
use crate::session::{EventHandler, StopSignal, TraceSession};
use log::{debug, info, warn};
use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

/// How often a blocked processing loop re-checks its stop signal
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Provider registered on a memory session
#[derive(Debug, Clone, PartialEq, Eq)]
enum Registration {
    Guid(Uuid),
    Name(String),
}

#[derive(Debug, Clone)]
struct EnabledProvider {
    registration: Registration,
    level: TraceLevel,
    keywords: u64,
}

impl EnabledProvider {
    fn matches(&self, event: &TraceEvent) -> bool {
        let provider_matches = match &self.registration {
            Registration::Guid(guid) => event.provider_guid == *guid,
            Registration::Name(name) => event.provider_name.eq_ignore_ascii_case(name),
        };

        // Events written without keywords, or sessions enabled with none, are not masked
        let keywords_match =
            self.keywords == 0 || event.keywords == 0 || event.keywords & self.keywords != 0;

        provider_matches && keywords_match && event.level <= self.level
    }
}

#[derive(Debug)]
struct Shared {
    name: String,
    elevated: Option<bool>,
    denied: HashSet<String>,
    providers: Mutex<Vec<EnabledProvider>>,
    queue: Mutex<VecDeque<TraceEvent>>,
    available: Condvar,
    disposed: AtomicBool,
    delivered: AtomicU64,
    filtered: AtomicU64,
}

impl Shared {
    fn providers(&self) -> MutexGuard<'_, Vec<EnabledProvider>> {
        self.providers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<TraceEvent>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    fn accepts(&self, event: &TraceEvent) -> bool {
        self.providers().iter().any(|provider| provider.matches(event))
    }

    fn enable(&self, registration: Registration, level: TraceLevel, keywords: u64) {
        let mut providers = self.providers();
        match providers
            .iter_mut()
            .find(|provider| provider.registration == registration)
        {
            // Re-enabling an active provider updates its filter in place
            Some(existing) => {
                existing.level = level;
                existing.keywords = keywords;
            }
            None => providers.push(EnabledProvider {
                registration,
                level,
                keywords,
            }),
        }
    }

    fn disable(&self, registration: &Registration) -> bool {
        let mut providers = self.providers();
        let before = providers.len();
        providers.retain(|provider| provider.registration != *registration);
        providers.len() != before
    }
}

/// In-process trace session
///
/// Behaves like a real-time tracing session: providers are enabled by GUID
/// or name with a level and keyword mask, and only events matching an
/// enabled provider are delivered to the processing loop. Events are fed in
/// through an [`EventInjector`], which makes this session suitable for
/// replaying captured traces and for tests.
#[derive(Debug, Clone)]
pub struct MemorySession {
    shared: Arc<Shared>,
}

/// Handle used to push events into a [`MemorySession`] from any thread
#[derive(Debug, Clone)]
pub struct EventInjector {
    shared: Arc<Shared>,
}

impl MemorySession {
    /// Create a session that reports the given elevation state
    ///
    /// # Example
    ///
    /// ```
    /// use etw_collector::session::{MemorySession, TraceSession};
    ///
    /// let session = MemorySession::new("replay", Some(true));
    /// assert_eq!(session.is_elevated(), Some(true));
    /// ```
    pub fn new(name: impl Into<String>, elevated: Option<bool>) -> Self {
        Self::with_denied_providers(name, elevated, Vec::<String>::new())
    }

    /// Create a session that refuses to enable the listed providers
    ///
    /// Entries are provider names or GUID strings.
    pub fn with_denied_providers<I, S>(name: impl Into<String>, elevated: Option<bool>, denied: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            shared: Arc::new(Shared {
                name: name.into(),
                elevated,
                denied: denied
                    .into_iter()
                    .map(|entry| entry.into().to_lowercase())
                    .collect(),
                providers: Mutex::new(Vec::new()),
                queue: Mutex::new(VecDeque::new()),
                available: Condvar::new(),
                disposed: AtomicBool::new(false),
                delivered: AtomicU64::new(0),
                filtered: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn injector(&self) -> EventInjector {
        EventInjector {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.shared.is_disposed()
    }

    /// Number of providers currently enabled
    pub fn enabled_provider_count(&self) -> usize {
        self.shared.providers().len()
    }

    /// Number of events handed to a processing loop so far
    pub fn delivered_count(&self) -> u64 {
        self.shared.delivered.load(Ordering::SeqCst)
    }

    /// Number of events dropped because no enabled provider matched
    pub fn filtered_count(&self) -> u64 {
        self.shared.filtered.load(Ordering::SeqCst)
    }

    fn check_usable(&self, selector: &str) -> Result<(), SessionError> {
        if self.shared.is_disposed() {
            return Err(SessionError::Disposed);
        }
        if selector.trim().is_empty() || self.shared.denied.contains(&selector.to_lowercase()) {
            return Err(SessionError::ProviderNotFound(selector.to_string()));
        }
        Ok(())
    }
}

impl TraceSession for MemorySession {
    fn is_elevated(&self) -> Option<bool> {
        self.shared.elevated
    }

    fn enable_provider_by_guid(
        &self,
        guid: Uuid,
        level: TraceLevel,
        keywords: u64,
    ) -> Result<(), SessionError> {
        self.check_usable(&guid.to_string())?;
        self.shared
            .enable(Registration::Guid(guid), level, keywords);
        debug!(
            "Session '{}' enabled provider {} (level {:?}, keywords {:#x})",
            self.shared.name, guid, level, keywords
        );
        Ok(())
    }

    fn enable_provider_by_name(
        &self,
        name: &str,
        level: TraceLevel,
        keywords: u64,
    ) -> Result<(), SessionError> {
        self.check_usable(name)?;
        self.shared
            .enable(Registration::Name(name.to_string()), level, keywords);
        debug!(
            "Session '{}' enabled provider '{}' (level {:?}, keywords {:#x})",
            self.shared.name, name, level, keywords
        );
        Ok(())
    }

    fn disable_provider_by_guid(&self, guid: Uuid) -> Result<(), SessionError> {
        if self.shared.is_disposed() {
            return Err(SessionError::Disposed);
        }
        if !self.shared.disable(&Registration::Guid(guid)) {
            return Err(SessionError::ProviderNotFound(guid.to_string()));
        }
        Ok(())
    }

    fn disable_provider_by_name(&self, name: &str) -> Result<(), SessionError> {
        if self.shared.is_disposed() {
            return Err(SessionError::Disposed);
        }
        if !self.shared.disable(&Registration::Name(name.to_string())) {
            return Err(SessionError::ProviderNotFound(name.to_string()));
        }
        Ok(())
    }

    fn process(&self, mut on_event: EventHandler, stop: StopSignal) -> Result<(), SessionError> {
        if self.shared.is_disposed() {
            return Err(SessionError::Disposed);
        }
        debug!("Session '{}' processing started", self.shared.name);

        let mut queue = self.shared.queue();
        loop {
            if self.shared.is_disposed() || stop.is_stopped() {
                break;
            }

            match queue.pop_front() {
                Some(event) => {
                    // Never hold the queue lock while user code runs
                    drop(queue);
                    if self.shared.accepts(&event) {
                        self.shared.delivered.fetch_add(1, Ordering::SeqCst);
                        on_event(event);
                    } else {
                        self.shared.filtered.fetch_add(1, Ordering::SeqCst);
                    }
                    queue = self.shared.queue();
                }
                None => {
                    queue = self
                        .shared
                        .available
                        .wait_timeout(queue, POLL_INTERVAL)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0;
                }
            }
        }

        debug!("Session '{}' processing finished", self.shared.name);
        Ok(())
    }

    fn dispose(&self) {
        if self.shared.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        self.shared.providers().clear();
        let dropped = {
            let mut queue = self.shared.queue();
            let dropped = queue.len();
            queue.clear();
            dropped
        };
        self.shared.available.notify_all();

        if dropped > 0 {
            warn!(
                "Session '{}' disposed with {} undelivered events",
                self.shared.name, dropped
            );
        }
        info!("Session '{}' disposed", self.shared.name);
    }
}

impl EventInjector {
    /// Queue an event for delivery
    ///
    /// # Errors
    ///
    /// Returns `SessionError::Disposed` once the session has been disposed.
    pub fn inject(&self, event: TraceEvent) -> Result<(), SessionError> {
        if self.shared.is_disposed() {
            return Err(SessionError::Disposed);
        }
        self.shared.queue().push_back(event);
        self.shared.available.notify_one();
        Ok(())
    }

    /// Number of events queued but not yet processed
    pub fn pending(&self) -> usize {
        self.shared.queue().len()
    }
}
