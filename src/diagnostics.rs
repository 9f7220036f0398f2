//! Self-diagnostics of the collector module
//!
//! Every failure the module absorbs is reported here. Diagnostics are always
//! written through the `log` facade and can additionally be forwarded to a
//! channel for hosts (and tests) that want to observe them.

use log::{error, warn};
use std::fmt;
use std::sync::mpsc::Sender;
use std::sync::{Mutex, PoisonError};

/// Named diagnostic events emitted by the collector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    ModuleInitializationFailed {
        module: String,
        reason: String,
    },
    NoSourcesConfigured {
        module: String,
    },
    FailedToEnableProviders {
        module: String,
        provider: String,
        error: String,
    },
    FailedToDisableProvider {
        module: String,
        provider: String,
        error: String,
    },
    ConsumerFailed {
        module: String,
        error: String,
    },
    /// The sink factory could not build a telemetry client
    SinkUnavailable {
        module: String,
        error: String,
    },
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Diagnostic::ModuleInitializationFailed { module, reason } => {
                write!(f, "{}: module initialization failed: {}", module, reason)
            }
            Diagnostic::NoSourcesConfigured { module } => {
                write!(f, "{}: no sources configured, nothing to collect", module)
            }
            Diagnostic::FailedToEnableProviders {
                module,
                provider,
                error,
            } => write!(
                f,
                "{}: failed to enable provider '{}': {}",
                module, provider, error
            ),
            Diagnostic::FailedToDisableProvider {
                module,
                provider,
                error,
            } => write!(
                f,
                "{}: failed to disable provider '{}': {}",
                module, provider, error
            ),
            Diagnostic::ConsumerFailed { module, error } => {
                write!(f, "{}: event consumer stopped with error: {}", module, error)
            }
            Diagnostic::SinkUnavailable { module, error } => {
                write!(f, "{}: telemetry sink unavailable: {}", module, error)
            }
        }
    }
}

/// Write-only diagnostic channel
#[derive(Debug, Default)]
pub struct Diagnostics {
    listener: Mutex<Option<Sender<Diagnostic>>>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forward every subsequent diagnostic to `sender`
    pub fn subscribe(&self, sender: Sender<Diagnostic>) {
        *self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(sender);
    }

    pub fn emit(&self, diagnostic: Diagnostic) {
        match &diagnostic {
            Diagnostic::NoSourcesConfigured { .. } | Diagnostic::FailedToDisableProvider { .. } => {
                warn!("{}", diagnostic)
            }
            _ => error!("{}", diagnostic),
        }

        let mut listener = self.listener.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(sender) = listener.as_ref() {
            // A dropped receiver just means nobody is listening any more
            if sender.send(diagnostic).is_err() {
                *listener = None;
            }
        }
    }
}
