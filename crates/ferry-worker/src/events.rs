//! Lifecycle and dispatch hooks.

use crate::error::WorkerError;

/// Callbacks fired by the launcher and managers. Every hook defaults to a no-op.
///
/// Hooks run inline on the dispatcher or processor task and should return quickly.
pub trait ConsumerEvents: Send + Sync {
    /// Every manager has started
    fn on_startup(&self) {}

    /// A dispatch cycle selected a queue in `group`
    fn on_dispatch(&self, _group: &str) {}

    fn on_processor_done(&self, _queue: &str) {}

    fn on_processor_failure(&self, _queue: &str, _error: &WorkerError) {}

    /// Dispatching stopped without waiting for in-flight work
    fn on_quiet(&self) {}

    /// A manager's stop began
    fn on_stop(&self) {}

    /// Every manager has stopped
    fn on_shutdown(&self) {}
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopEvents;

impl ConsumerEvents for NoopEvents {}
