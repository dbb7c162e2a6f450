//! Pluggable sink for resolver failure messages.

use std::sync::Arc;

/// Receives messages about failures the resolver recovers from on its own,
/// such as a watch that ended with an error or a contained panic.
///
/// Any `Fn(&str) + Send + Sync` closure is a `Logger`.
pub trait Logger: Send + Sync {
    /// Records one message.
    fn log(&self, message: &str);
}

impl<F> Logger for F
where
    F: Fn(&str) + Send + Sync,
{
    fn log(&self, message: &str) {
        self(message);
    }
}

/// Default [`Logger`] emitting messages as `tracing` error events.
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingLogger;

impl Logger for TracingLogger {
    fn log(&self, message: &str) {
        tracing::error!("{message}");
    }
}

/// Shared handle to a [`Logger`].
pub type SharedLogger = Arc<dyn Logger>;
