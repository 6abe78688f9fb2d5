//! Launcher - validates the setup and owns one manager per group

use futures::future::join_all;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use ferry_common::LauncherConfig;
use ferry_queue::{QueueClient, QueueError, QueueRegistry};
use crate::error::ConsumerError;
use crate::events::{ConsumerEvents, NoopEvents};
use crate::manager::{Manager, ManagerContext, ShutdownState, StopMode};
use crate::middleware::MiddlewareChain;
use crate::processor::Processor;
use crate::worker::WorkerRegistry;

pub struct Launcher {
    config: LauncherConfig,
    queues: Arc<QueueRegistry>,
    workers: Arc<WorkerRegistry>,
    events: Arc<dyn ConsumerEvents>,
    middleware: MiddlewareChain,
    managers: Mutex<Vec<Arc<Manager>>>,
}

impl Launcher {
    pub fn new(config: LauncherConfig, client: Arc<dyn QueueClient>, workers: Arc<WorkerRegistry>) -> Self {
        Self {
            config,
            queues: Arc::new(QueueRegistry::new(client)),
            workers,
            events: Arc::new(NoopEvents),
            middleware: MiddlewareChain::default_server(),
            managers: Mutex::new(Vec::new()),
        }
    }

    pub fn with_events(mut self, events: Arc<dyn ConsumerEvents>) -> Self {
        self.events = events;
        self
    }

    /// Replace the consumer-wide middleware chain
    pub fn with_middleware(mut self, middleware: MiddlewareChain) -> Self {
        self.middleware = middleware;
        self
    }

    pub fn queues(&self) -> &Arc<QueueRegistry> {
        &self.queues
    }

    pub fn config(&self) -> &LauncherConfig {
        &self.config
    }

    pub fn managers(&self) -> Vec<Arc<Manager>> {
        self.managers.lock().clone()
    }

    /// Check that every configured queue exists and warn about queues nobody consumes.
    pub async fn validate(&self) -> Result<(), ConsumerError> {
        let names = self.config.queue_names();
        if names.is_empty() {
            warn!("No queues supplied");
            return Ok(());
        }

        let mut missing = Vec::new();
        for name in &names {
            match self.queues.queue(name).await {
                Ok(_) => {}
                Err(QueueError::NonExistentQueue(_)) => missing.push(name.clone()),
                Err(e) => return Err(e.into()),
            }
        }
        if !missing.is_empty() {
            return Err(ConsumerError::NonExistentQueues(missing.join(", ")));
        }

        for name in &names {
            if !self.workers.has_worker(name) {
                warn!(queue = %name, "No worker supplied for {}", name);
            }
        }
        Ok(())
    }

    /// Validate, then start one manager per group
    pub async fn start(&self) -> Result<(), ConsumerError> {
        if !self.managers.lock().is_empty() {
            return Err(ConsumerError::AlreadyStarted);
        }

        self.validate().await?;

        let context = ManagerContext {
            queues: self.queues.clone(),
            workers: self.workers.clone(),
            processor: Arc::new(Processor::new(
                self.workers.clone(),
                self.queues.clone(),
                self.middleware.clone(),
            )),
            events: self.events.clone(),
        };

        let mut managers = Vec::with_capacity(self.config.groups.len());
        for group in &self.config.groups {
            let manager = Manager::new(group, self.config.manager.clone(), context.clone())?;
            managers.push(Arc::new(manager));
        }

        {
            let mut started = self.managers.lock();
            if !started.is_empty() {
                return Err(ConsumerError::AlreadyStarted);
            }
            for manager in &managers {
                manager.start();
            }
            *started = managers;
        }

        info!(groups = self.config.groups.len(), "Consumer started");
        self.events.on_startup();
        Ok(())
    }

    /// Stop dispatching in every group; in-flight units keep running
    pub fn quiet(&self) {
        info!("Quieting consumer");
        for manager in self.managers() {
            manager.quiet();
        }
        self.events.on_quiet();
    }

    /// Soft stop: wait for every in-flight unit
    pub async fn stop(&self) -> Vec<ShutdownState> {
        self.stop_all(StopMode::Soft).await
    }

    /// Hard stop: wait up to `timeout`, then abort what is still running
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Vec<ShutdownState> {
        self.stop_all(StopMode::Hard { timeout }).await
    }

    async fn stop_all(&self, mode: StopMode) -> Vec<ShutdownState> {
        let managers = self.managers();
        let outcomes = join_all(managers.iter().map(|manager| manager.stop(mode))).await;

        info!(outcomes = ?outcomes, "Consumer stopped");
        self.events.on_shutdown();
        outcomes
    }
}
