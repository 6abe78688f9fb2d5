//! Processor - runs one unit of work against its registered worker.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

use ferry_common::ProcessingUnit;
use ferry_queue::{Queue, QueueRegistry};
use crate::body::parse_unit;
use crate::error::WorkerError;
use crate::middleware::{Invocation, MiddlewareChain};
use crate::visibility::{default_heartbeat, VisibilityExtender};
use crate::worker::{WorkerDescriptor, WorkerRegistry};

/// Shared by every processor task of every manager; holds no per-unit state
pub struct Processor {
    workers: Arc<WorkerRegistry>,
    queues: Arc<QueueRegistry>,
    middleware: MiddlewareChain,
}

impl Processor {
    pub fn new(workers: Arc<WorkerRegistry>, queues: Arc<QueueRegistry>, middleware: MiddlewareChain) -> Self {
        Self {
            workers,
            queues,
            middleware,
        }
    }

    pub fn middleware(&self) -> &MiddlewareChain {
        &self.middleware
    }

    /// Process one unit. The visibility heartbeat, when requested, starts
    /// before the body is parsed and is cancelled on every exit path. Every
    /// failure, including a missing worker or queue, is logged here.
    pub async fn process(&self, processing: &ProcessingUnit) -> Result<(), WorkerError> {
        let result = self.run(processing).await;
        if let Err(e) = &result {
            error!(
                queue = %processing.queue_name,
                unit_id = %processing.id(),
                error = %e,
                "Processor failed"
            );
        }
        result
    }

    async fn run(&self, processing: &ProcessingUnit) -> Result<(), WorkerError> {
        let queue_name = processing.queue_name.as_str();
        let descriptor = self
            .workers
            .lookup_for(queue_name, &processing.unit)
            .ok_or_else(|| WorkerError::NoWorker(queue_name.to_string()))?;
        let queue = self.queues.queue(queue_name).await?;

        debug!(
            queue = %queue_name,
            worker = %descriptor.name,
            unit_id = %processing.id(),
            "Processing unit"
        );

        let extender = if descriptor.auto_visibility_timeout {
            Some(self.start_extender(&queue, &descriptor, processing).await?)
        } else {
            None
        };

        let result = self.invoke(&queue, &descriptor, processing).await;

        if let Some(extender) = extender {
            extender.cancel().await;
        }
        result
    }

    async fn start_extender(
        &self,
        queue: &Arc<Queue>,
        descriptor: &WorkerDescriptor,
        processing: &ProcessingUnit,
    ) -> Result<VisibilityExtender, WorkerError> {
        let visibility_timeout = queue.visibility_timeout().await?;
        let interval = descriptor
            .heartbeat_interval
            .unwrap_or_else(|| default_heartbeat(visibility_timeout))
            .max(Duration::from_secs(1));
        let new_timeout = descriptor
            .extended_visibility_timeout
            .unwrap_or(visibility_timeout);

        Ok(VisibilityExtender::start(
            queue.clone(),
            &processing.unit,
            interval,
            new_timeout,
        ))
    }

    async fn invoke(
        &self,
        queue: &Queue,
        descriptor: &WorkerDescriptor,
        processing: &ProcessingUnit,
    ) -> Result<(), WorkerError> {
        let body = parse_unit(&descriptor.body_parser, descriptor.parse_failure, &processing.unit)?;

        let invocation = Invocation {
            queue,
            unit: &processing.unit,
            body: &body,
            worker: descriptor,
        };

        let chain = descriptor.middleware.as_ref().unwrap_or(&self.middleware);
        chain.invoke(&invocation).await
    }
}
