//! Trace session abstraction
//!
//! A trace session owns the native subscription to one or more event
//! providers. The collector module only talks to sessions through the
//! [`TraceSession`] trait so the backend can be swapped (or mocked).

/// In-process session used for replay and testing
pub mod memory;

pub use memory::{EventInjector, MemorySession};

use crate::error::SessionError;
use crate::events::{TraceEvent, TraceLevel};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use uuid::Uuid;

/// A tracing session that providers can be enabled on and events read from
#[cfg_attr(test, mockall::automock)]
pub trait TraceSession: Send + Sync {
    /// Whether the current process has the privilege to enable providers
    ///
    /// `None` means the check could not be performed.
    fn is_elevated(&self) -> Option<bool>;

    fn enable_provider_by_guid(
        &self,
        guid: Uuid,
        level: TraceLevel,
        keywords: u64,
    ) -> Result<(), SessionError>;

    fn enable_provider_by_name(
        &self,
        name: &str,
        level: TraceLevel,
        keywords: u64,
    ) -> Result<(), SessionError>;

    fn disable_provider_by_guid(&self, guid: Uuid) -> Result<(), SessionError>;

    fn disable_provider_by_name(&self, name: &str) -> Result<(), SessionError>;

    /// Deliver events to `on_event` until the session is disposed or `stop` is raised
    ///
    /// This call blocks the calling thread for the lifetime of the session.
    fn process(&self, on_event: EventHandler, stop: StopSignal) -> Result<(), SessionError>;

    /// Release the session and every provider registration it holds
    ///
    /// Must cause a blocked `process` call to return.
    fn dispose(&self);
}

/// Callback receiving each event delivered by a session
pub type EventHandler = Box<dyn FnMut(TraceEvent) + Send>;

/// Shared flag used to ask a processing loop to return
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
