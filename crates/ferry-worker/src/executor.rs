//! Enqueueing work for registered workers.
//!
//! [`QueueExecutor`] sends through the transport; [`InlineExecutor`] runs the
//! worker in-process, which suits tests and one-off scripts.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use ferry_common::{Message, MessageAttributeValue, Unit, RECEIVE_COUNT_ATTRIBUTE};
use ferry_queue::{QueueRegistry, SendMessage, MAX_DELAY_SECONDS};
use crate::body::parse_unit;
use crate::error::WorkerError;
use crate::worker::{WorkerDescriptor, WorkerRegistry, WORKER_ATTRIBUTE};

/// Per-call overrides for enqueued work
#[derive(Debug, Clone, Default)]
pub struct PerformOptions {
    /// Send to this queue instead of the one the worker was registered for
    pub queue: Option<String>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    pub message_group_id: Option<String>,
}

impl PerformOptions {
    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: MessageAttributeValue) -> Self {
        self.message_attributes.insert(name.into(), value);
        self
    }

    pub fn with_message_group_id(mut self, group_id: impl Into<String>) -> Self {
        self.message_group_id = Some(group_id.into());
        self
    }
}

#[async_trait]
pub trait WorkerExecutor: Send + Sync {
    /// Enqueue `body` for `worker`; returns the message id
    async fn perform_async(
        &self,
        worker: &str,
        body: SendMessage,
        options: PerformOptions,
    ) -> Result<String, WorkerError>;

    /// Enqueue with a delivery delay of at most fifteen minutes
    async fn perform_in(
        &self,
        worker: &str,
        delay: Duration,
        body: SendMessage,
        options: PerformOptions,
    ) -> Result<String, WorkerError> {
        let seconds = delay.as_secs();
        if seconds > MAX_DELAY_SECONDS as u64 {
            return Err(WorkerError::InvalidMessage(
                "The maximum allowed delay is 15 minutes".to_string(),
            ));
        }
        self.perform_async(worker, body.with_delay_seconds(seconds as u32), options)
            .await
    }
}

fn resolve_worker(workers: &WorkerRegistry, worker: &str) -> Result<(String, Arc<WorkerDescriptor>), WorkerError> {
    workers
        .find_by_name(worker)
        .ok_or_else(|| WorkerError::UnknownWorker(worker.to_string()))
}

fn apply_options(worker: &str, mut body: SendMessage, options: PerformOptions) -> SendMessage {
    body.message_attributes.extend(options.message_attributes);
    body.message_attributes.insert(
        WORKER_ATTRIBUTE.to_string(),
        MessageAttributeValue::String(worker.to_string()),
    );
    if options.message_group_id.is_some() {
        body.message_group_id = options.message_group_id;
    }
    body
}

/// Sends work through the queue transport
pub struct QueueExecutor {
    workers: Arc<WorkerRegistry>,
    queues: Arc<QueueRegistry>,
}

impl QueueExecutor {
    pub fn new(workers: Arc<WorkerRegistry>, queues: Arc<QueueRegistry>) -> Self {
        Self { workers, queues }
    }
}

#[async_trait]
impl WorkerExecutor for QueueExecutor {
    async fn perform_async(
        &self,
        worker: &str,
        body: SendMessage,
        options: PerformOptions,
    ) -> Result<String, WorkerError> {
        let (registered_queue, descriptor) = resolve_worker(&self.workers, worker)?;
        let queue_name = options.queue.clone().unwrap_or(registered_queue);
        let message = apply_options(&descriptor.name, body, options);

        let queue = self.queues.queue(&queue_name).await?;
        let message_id = queue.send_message(message).await?;
        debug!(queue = %queue_name, worker = %worker, message_id = %message_id, "Enqueued");
        Ok(message_id)
    }
}

/// Runs the worker immediately, skipping transport and middleware
pub struct InlineExecutor {
    workers: Arc<WorkerRegistry>,
}

impl InlineExecutor {
    pub fn new(workers: Arc<WorkerRegistry>) -> Self {
        Self { workers }
    }
}

#[async_trait]
impl WorkerExecutor for InlineExecutor {
    async fn perform_async(
        &self,
        worker: &str,
        body: SendMessage,
        options: PerformOptions,
    ) -> Result<String, WorkerError> {
        let (_, descriptor) = resolve_worker(&self.workers, worker)?;
        let body = apply_options(&descriptor.name, body, options);
        let message_id = uuid::Uuid::new_v4().to_string();

        let message = Message {
            message_id: message_id.clone(),
            receipt_handle: format!("inline-{}", message_id),
            body: body.body,
            attributes: HashMap::from([(RECEIVE_COUNT_ATTRIBUTE.to_string(), "1".to_string())]),
            message_attributes: body.message_attributes,
            md5_of_body: None,
        };
        let unit = if descriptor.batch {
            Unit::batch(vec![message])
        } else {
            Unit::single(message)
        };

        let payload = parse_unit(&descriptor.body_parser, descriptor.parse_failure, &unit)?;
        descriptor.handler.perform(&unit, &payload).await?;
        Ok(message_id)
    }
}
