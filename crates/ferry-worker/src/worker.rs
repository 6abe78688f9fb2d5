//! Worker handlers and the queue -> worker registry.

use async_trait::async_trait;
use dashmap::DashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use ferry_common::Unit;
use crate::body::{BodyParser, ParseFailurePolicy, Payload};
use crate::error::{ConsumerError, WorkerError};
use crate::middleware::MiddlewareChain;

/// Message attribute naming the worker a message was enqueued for
pub const WORKER_ATTRIBUTE: &str = "ferry_worker";

/// Application code run for each unit of work
#[async_trait]
pub trait Worker: Send + Sync {
    /// `body` holds one parsed body per message of the unit (`None` if parsing failed)
    async fn perform(&self, unit: &Unit, body: &Payload) -> Result<(), WorkerError>;
}

/// Registration of a worker and its options. Immutable once registered.
#[derive(Clone)]
pub struct WorkerDescriptor {
    pub name: String,
    pub handler: Arc<dyn Worker>,
    /// Receive up to ten messages and hand them over as one unit
    pub batch: bool,
    pub body_parser: BodyParser,
    pub parse_failure: ParseFailurePolicy,
    /// Renew visibility while the unit runs
    pub auto_visibility_timeout: bool,
    /// Heartbeat cadence; defaults to the queue's visibility timeout minus five seconds
    pub heartbeat_interval: Option<Duration>,
    /// Timeout applied at each heartbeat; defaults to the queue's visibility timeout
    pub extended_visibility_timeout: Option<u32>,
    /// Delete the unit's messages after the handler succeeds
    pub auto_delete: bool,
    /// Per-attempt visibility delays for `exponential_backoff_retry`
    pub retry_intervals: Option<Vec<u32>>,
    /// Replaces the consumer-wide chain for this worker
    pub middleware: Option<MiddlewareChain>,
}

impl WorkerDescriptor {
    pub fn new(name: impl Into<String>, handler: Arc<dyn Worker>) -> Self {
        Self {
            name: name.into(),
            handler,
            batch: false,
            body_parser: BodyParser::default(),
            parse_failure: ParseFailurePolicy::default(),
            auto_visibility_timeout: false,
            heartbeat_interval: None,
            extended_visibility_timeout: None,
            auto_delete: false,
            retry_intervals: None,
            middleware: None,
        }
    }

    pub fn with_batch(mut self, batch: bool) -> Self {
        self.batch = batch;
        self
    }

    pub fn with_body_parser(mut self, parser: BodyParser) -> Self {
        self.body_parser = parser;
        self
    }

    pub fn with_parse_failure(mut self, policy: ParseFailurePolicy) -> Self {
        self.parse_failure = policy;
        self
    }

    pub fn with_auto_visibility_timeout(mut self, enabled: bool) -> Self {
        self.auto_visibility_timeout = enabled;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn with_extended_visibility_timeout(mut self, seconds: u32) -> Self {
        self.extended_visibility_timeout = Some(seconds);
        self
    }

    pub fn with_auto_delete(mut self, enabled: bool) -> Self {
        self.auto_delete = enabled;
        self
    }

    pub fn with_retry_intervals(mut self, intervals: Vec<u32>) -> Self {
        self.retry_intervals = Some(intervals);
        self
    }

    pub fn with_middleware(mut self, chain: MiddlewareChain) -> Self {
        self.middleware = Some(chain);
        self
    }
}

impl fmt::Debug for WorkerDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerDescriptor")
            .field("name", &self.name)
            .field("batch", &self.batch)
            .field("body_parser", &self.body_parser)
            .field("parse_failure", &self.parse_failure)
            .field("auto_visibility_timeout", &self.auto_visibility_timeout)
            .field("auto_delete", &self.auto_delete)
            .field("retry_intervals", &self.retry_intervals)
            .finish()
    }
}

/// Workers keyed by queue name, plus a by-name index for executors
#[derive(Default)]
pub struct WorkerRegistry {
    by_queue: DashMap<String, Arc<WorkerDescriptor>>,
    by_name: DashMap<String, (String, Arc<WorkerDescriptor>)>,
}

impl WorkerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `descriptor` as the worker for `queue`. A queue has at most one worker.
    pub fn register(&self, queue: impl Into<String>, descriptor: WorkerDescriptor) -> Result<(), ConsumerError> {
        let queue = queue.into();
        let descriptor = Arc::new(descriptor);

        match self.by_queue.entry(queue.clone()) {
            dashmap::mapref::entry::Entry::Occupied(existing) => Err(ConsumerError::DuplicateWorker {
                queue,
                worker: descriptor.name.clone(),
                existing: existing.get().name.clone(),
            }),
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(descriptor.clone());
                self.by_name
                    .entry(descriptor.name.clone())
                    .or_insert_with(|| (queue, descriptor));
                Ok(())
            }
        }
    }

    pub fn lookup(&self, queue: &str) -> Option<Arc<WorkerDescriptor>> {
        self.by_queue.get(queue).map(|entry| entry.value().clone())
    }

    /// Worker for one unit: a single message naming a registered worker in its
    /// `ferry_worker` attribute goes to that worker, everything else to the queue's
    pub fn lookup_for(&self, queue: &str, unit: &Unit) -> Option<Arc<WorkerDescriptor>> {
        if let Unit::Single(message) = unit {
            if let Some(name) = message.string_attribute(WORKER_ATTRIBUTE) {
                if let Some(entry) = self.by_name.get(name) {
                    if !entry.value().1.batch {
                        return Some(entry.value().1.clone());
                    }
                }
            }
        }
        self.lookup(queue)
    }

    /// Registered worker by name with the queue it was registered for
    pub fn find_by_name(&self, name: &str) -> Option<(String, Arc<WorkerDescriptor>)> {
        self.by_name.get(name).map(|entry| entry.value().clone())
    }

    pub fn is_batch_mode(&self, queue: &str) -> bool {
        self.by_queue.get(queue).is_some_and(|entry| entry.value().batch)
    }

    pub fn has_worker(&self, queue: &str) -> bool {
        self.by_queue.contains_key(queue)
    }

    /// Queues that have a worker
    pub fn queues(&self) -> Vec<String> {
        let mut queues: Vec<String> = self.by_queue.iter().map(|entry| entry.key().clone()).collect();
        queues.sort();
        queues
    }

    pub fn clear(&self) {
        self.by_queue.clear();
        self.by_name.clear();
    }
}
