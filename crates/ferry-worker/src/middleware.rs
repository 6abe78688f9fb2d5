//! Middleware chain
//!
//! Ordered, named interceptors wrapped around every handler call. Each entry
//! decides whether to call [`Next::run`]; not calling it skips the handler.
//! Entries are identified by [`Middleware::name`].

use async_trait::async_trait;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use ferry_common::Unit;
use ferry_queue::Queue;
use crate::body::Payload;
use crate::error::WorkerError;
use crate::metrics;
use crate::worker::WorkerDescriptor;

/// Longest visibility timeout the transport accepts (12 hours)
const MAX_VISIBILITY_TIMEOUT: u64 = 43_200;

/// Everything a middleware can see about one handler call
pub struct Invocation<'a> {
    pub queue: &'a Queue,
    pub unit: &'a Unit,
    pub body: &'a Payload,
    pub worker: &'a WorkerDescriptor,
}

impl Invocation<'_> {
    pub fn queue_name(&self) -> &str {
        self.queue.name()
    }
}

#[async_trait]
pub trait Middleware: Send + Sync {
    fn name(&self) -> &str;

    async fn call(&self, invocation: &Invocation<'_>, next: Next<'_>) -> Result<(), WorkerError>;
}

/// The rest of the chain, ending in the worker's handler
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
}

impl Next<'_> {
    pub async fn run(self, invocation: &Invocation<'_>) -> Result<(), WorkerError> {
        match self.chain.split_first() {
            Some((head, rest)) => head.call(invocation, Next { chain: rest }).await,
            None => {
                invocation
                    .worker
                    .handler
                    .perform(invocation.unit, invocation.body)
                    .await
            }
        }
    }
}

#[derive(Clone, Default)]
pub struct MiddlewareChain {
    entries: Vec<Arc<dyn Middleware>>,
}

impl MiddlewareChain {
    pub fn new() -> Self {
        Self::default()
    }

    /// `timing`, `exponential_backoff_retry`, `auto_delete`, outermost first
    pub fn default_server() -> Self {
        let mut chain = Self::new();
        chain.add(Timing);
        chain.add(ExponentialBackoffRetry);
        chain.add(AutoDelete);
        chain
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries.iter().position(|m| m.name() == name)
    }

    /// Append, replacing any entry with the same name
    pub fn add(&mut self, middleware: impl Middleware + 'static) {
        self.add_arc(Arc::new(middleware));
    }

    pub fn add_arc(&mut self, middleware: Arc<dyn Middleware>) {
        self.remove(middleware.name());
        self.entries.push(middleware);
    }

    pub fn prepend(&mut self, middleware: impl Middleware + 'static) {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        self.remove(middleware.name());
        self.entries.insert(0, middleware);
    }

    /// Insert before `existing`, or at the front when it is absent
    pub fn insert_before(&mut self, existing: &str, middleware: impl Middleware + 'static) {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        self.remove(middleware.name());
        let index = self.position(existing).unwrap_or(0);
        self.entries.insert(index, middleware);
    }

    /// Insert after `existing`, or at the back when it is absent
    pub fn insert_after(&mut self, existing: &str, middleware: impl Middleware + 'static) {
        let middleware: Arc<dyn Middleware> = Arc::new(middleware);
        self.remove(middleware.name());
        let index = self
            .position(existing)
            .map(|i| i + 1)
            .unwrap_or(self.entries.len());
        self.entries.insert(index, middleware);
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.entries.len();
        self.entries.retain(|m| m.name() != name);
        self.entries.len() != before
    }

    pub fn exists(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Entry names in call order
    pub fn entries(&self) -> Vec<String> {
        self.entries.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Run the chain around the worker's handler
    pub async fn invoke(&self, invocation: &Invocation<'_>) -> Result<(), WorkerError> {
        Next { chain: &self.entries }.run(invocation).await
    }
}

impl fmt::Debug for MiddlewareChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries()).finish()
    }
}

// ============================================================================
// Stock middleware
// ============================================================================

/// Logs start, completion and duration; warns when a unit outlives the
/// queue's visibility timeout
#[derive(Debug, Default, Clone, Copy)]
pub struct Timing;

#[async_trait]
impl Middleware for Timing {
    fn name(&self) -> &str {
        "timing"
    }

    async fn call(&self, invocation: &Invocation<'_>, next: Next<'_>) -> Result<(), WorkerError> {
        let queue = invocation.queue_name();
        let unit_id = invocation.unit.id();
        let worker = invocation.worker.name.as_str();
        let started = Instant::now();
        info!(queue = %queue, worker = %worker, unit_id = %unit_id, "Started");

        let result = next.run(invocation).await;
        let elapsed = started.elapsed();
        metrics::record_unit_duration(queue, elapsed);

        match &result {
            Ok(()) => {
                if let Ok(timeout) = invocation.queue.visibility_timeout().await {
                    let timeout = Duration::from_secs(timeout as u64);
                    if elapsed > timeout {
                        warn!(
                            queue = %queue,
                            unit_id = %unit_id,
                            exceeded_by_ms = (elapsed - timeout).as_millis() as u64,
                            "Exceeded the queue visibility timeout"
                        );
                    }
                }
                info!(
                    queue = %queue,
                    worker = %worker,
                    unit_id = %unit_id,
                    duration_ms = elapsed.as_millis() as u64,
                    "Completed"
                );
            }
            Err(_) => info!(
                queue = %queue,
                worker = %worker,
                unit_id = %unit_id,
                duration_ms = elapsed.as_millis() as u64,
                "Failed"
            ),
        }

        result
    }
}

/// Deletes the unit's messages once the handler succeeds, for workers with `auto_delete`
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDelete;

#[async_trait]
impl Middleware for AutoDelete {
    fn name(&self) -> &str {
        "auto_delete"
    }

    async fn call(&self, invocation: &Invocation<'_>, next: Next<'_>) -> Result<(), WorkerError> {
        next.run(invocation).await?;

        if invocation.worker.auto_delete {
            let handles = invocation.unit.receipt_handles();
            let outcome = invocation.queue.delete_messages(&handles).await?;
            metrics::record_messages_deleted(invocation.queue_name(), outcome.successful.len());
            debug!(
                queue = %invocation.queue_name(),
                unit_id = %invocation.unit.id(),
                deleted = outcome.successful.len(),
                failed = outcome.failed.len(),
                "Deleted processed messages"
            );
        }

        Ok(())
    }
}

/// On handler failure, delays redelivery by the worker's next retry interval
/// (chosen by delivery count) instead of propagating the error
#[derive(Debug, Default, Clone, Copy)]
pub struct ExponentialBackoffRetry;

impl ExponentialBackoffRetry {
    fn interval_for(intervals: &[u32], attempts: u32) -> Option<u32> {
        if attempts == 0 {
            return None;
        }
        intervals
            .get(attempts as usize - 1)
            .or_else(|| intervals.last())
            .copied()
    }
}

#[async_trait]
impl Middleware for ExponentialBackoffRetry {
    fn name(&self) -> &str {
        "exponential_backoff_retry"
    }

    async fn call(&self, invocation: &Invocation<'_>, next: Next<'_>) -> Result<(), WorkerError> {
        let Some(intervals) = invocation.worker.retry_intervals.as_deref() else {
            return next.run(invocation).await;
        };

        let Unit::Single(message) = invocation.unit else {
            warn!(
                queue = %invocation.queue_name(),
                worker = %invocation.worker.name,
                "Exponential backoff isn't supported for batch workers"
            );
            return next.run(invocation).await;
        };

        let started = Instant::now();
        let error = match next.run(invocation).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };

        let Some(attempts) = message.delivery_count() else {
            return Err(error);
        };
        let Some(interval) = Self::interval_for(intervals, attempts) else {
            return Err(error);
        };

        let max_timeout = MAX_VISIBILITY_TIMEOUT
            .saturating_sub(started.elapsed().as_secs_f64().ceil() as u64)
            .saturating_sub(1);
        let timeout = (interval as u64).min(max_timeout) as u32;

        invocation
            .queue
            .change_visibility(&message.receipt_handle, timeout)
            .await?;

        warn!(
            queue = %invocation.queue_name(),
            message_id = %message.message_id,
            attempt = attempts,
            retry_in_secs = timeout,
            error = %error,
            "Message will attempt retry due to error"
        );
        Ok(())
    }
}
