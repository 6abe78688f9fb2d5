//! Manager - dispatch loop and bounded processor pool for one group
//!
//! One tokio task runs the control loop:
//! - waits while every slot is busy or no queue is eligible
//! - asks the polling strategy for a queue and fetches from it
//! - assigns each message (or the whole batch) to its own processor task
//!
//! Slots are counted with an atomic; a guard owned by each processor task
//! releases its slot on completion, failure or abort.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{watch, Notify};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use chrono::{DateTime, Utc};
use ferry_common::{GroupConfig, ManagerConfig, ProcessingUnit, Unit, UnitState, BATCH_LIMIT};
use ferry_queue::QueueRegistry;
use crate::error::{ConsumerError, WorkerError};
use crate::events::ConsumerEvents;
use crate::fetcher::Fetcher;
use crate::metrics;
use crate::polling::{PollingStrategy, Rotation, WeightedRoundRobin};
use crate::processor::Processor;
use crate::worker::WorkerRegistry;

/// Shutdown lifecycle of a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownState {
    Running,
    Stopping,
    /// Every processor finished before the deadline (or without one)
    Drained,
    /// Processors were aborted at the deadline
    Forced,
    Stopped,
}

/// How to stop a manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopMode {
    /// Wait for every in-flight unit
    Soft,
    /// Wait up to `timeout`, then abort what is still running
    Hard { timeout: Duration },
}

/// Snapshot of a unit held by the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InFlightUnit {
    pub queue_name: String,
    pub unit_id: String,
    pub state: UnitState,
    pub assigned_at: DateTime<Utc>,
}

struct InFlight {
    abort: AbortHandle,
    processing: ProcessingUnit,
}

/// Releases one busy slot when dropped
struct SlotGuard {
    busy: Arc<AtomicUsize>,
    freed: Arc<Notify>,
    group: Arc<str>,
}

impl SlotGuard {
    fn acquire(busy: Arc<AtomicUsize>, freed: Arc<Notify>, group: Arc<str>) -> Self {
        let now_busy = busy.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_busy_processors(&group, now_busy);
        Self { busy, freed, group }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        let now_busy = self.busy.fetch_sub(1, Ordering::SeqCst) - 1;
        metrics::set_busy_processors(&self.group, now_busy);
        self.freed.notify_waiters();
    }
}

/// Dependencies shared by every manager of a launcher
#[derive(Clone)]
pub struct ManagerContext {
    pub queues: Arc<QueueRegistry>,
    pub workers: Arc<WorkerRegistry>,
    pub processor: Arc<Processor>,
    pub events: Arc<dyn ConsumerEvents>,
}

pub struct Manager {
    group: Arc<str>,
    concurrency: usize,
    config: ManagerConfig,
    context: ManagerContext,
    fetcher: Fetcher,
    strategy: Arc<Mutex<Box<dyn PollingStrategy>>>,

    busy: Arc<AtomicUsize>,
    slot_freed: Arc<Notify>,

    /// Spawned processor tasks, pruned as they finish
    tasks: DashMap<u64, InFlight>,
    next_task_id: AtomicU64,

    stop_tx: watch::Sender<bool>,
    state: Mutex<ShutdownState>,
    loop_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Manager {
    /// Manager with a weighted round-robin over the group's queues
    pub fn new(group: &GroupConfig, config: ManagerConfig, context: ManagerContext) -> Result<Self, ConsumerError> {
        let strategy = WeightedRoundRobin::new(&group.queues, config.pause_delay, config.rebalance);
        Self::with_strategy(group, config, context, Box::new(strategy))
    }

    pub fn with_strategy(
        group: &GroupConfig,
        config: ManagerConfig,
        context: ManagerContext,
        strategy: Box<dyn PollingStrategy>,
    ) -> Result<Self, ConsumerError> {
        if group.concurrency == 0 {
            return Err(ConsumerError::InvalidConcurrency(group.concurrency));
        }

        let (stop_tx, _) = watch::channel(false);

        Ok(Self {
            group: Arc::from(group.name.as_str()),
            concurrency: group.concurrency,
            fetcher: Fetcher::new(config.wait_time_seconds),
            config,
            context,
            strategy: Arc::new(Mutex::new(strategy)),
            busy: Arc::new(AtomicUsize::new(0)),
            slot_freed: Arc::new(Notify::new()),
            tasks: DashMap::new(),
            next_task_id: AtomicU64::new(0),
            stop_tx,
            state: Mutex::new(ShutdownState::Running),
            loop_handle: Mutex::new(None),
        })
    }

    pub fn group(&self) -> &str {
        &self.group
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn busy(&self) -> usize {
        self.busy.load(Ordering::SeqCst)
    }

    /// Free slots; `ready() + busy() == concurrency()`
    pub fn ready(&self) -> usize {
        self.concurrency.saturating_sub(self.busy())
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    pub fn is_stopping(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Units whose processor task has not been pruned yet, oldest first
    pub fn in_flight(&self) -> Vec<InFlightUnit> {
        let mut units: Vec<(u64, InFlightUnit)> = self
            .tasks
            .iter()
            .map(|entry| {
                let processing = &entry.value().processing;
                (
                    *entry.key(),
                    InFlightUnit {
                        queue_name: processing.queue_name.clone(),
                        unit_id: processing.id().to_string(),
                        state: processing.state(),
                        assigned_at: processing.assigned_at,
                    },
                )
            })
            .collect();
        units.sort_by_key(|(id, _)| *id);
        units.into_iter().map(|(_, unit)| unit).collect()
    }

    pub fn active_queues(&self) -> Vec<(String, u32)> {
        self.strategy.lock().active_queues()
    }

    /// Spawn the dispatch loop
    pub fn start(self: &Arc<Self>) {
        let mut handle = self.loop_handle.lock();
        if handle.is_some() {
            return;
        }

        info!(group = %self.group, concurrency = self.concurrency, "Starting");
        let manager = self.clone();
        *handle = Some(tokio::spawn(async move { manager.dispatch_loop().await }));
    }

    async fn dispatch_loop(self: Arc<Self>) {
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            if *stop_rx.borrow() {
                break;
            }
            self.dispatch_once(&mut stop_rx).await;
        }

        debug!(group = %self.group, "Dispatch loop stopped");
    }

    /// Sleep one dispatch interval, waking early on stop
    async fn back_off(&self, stop_rx: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(self.config.min_dispatch_interval) => {}
            _ = stop_rx.changed() => {}
        }
    }

    async fn dispatch_once(self: &Arc<Self>, stop_rx: &mut watch::Receiver<bool>) {
        let ready = self.ready();
        if ready == 0 {
            self.back_off(stop_rx).await;
            return;
        }

        let queue_name = self.strategy.lock().next_queue();
        let Some(queue_name) = queue_name else {
            self.back_off(stop_rx).await;
            return;
        };

        self.context.events.on_dispatch(&self.group);
        metrics::record_dispatch_cycle(&self.group);
        debug!(
            group = %self.group,
            ready,
            busy = self.busy(),
            active_queues = ?self.active_queues(),
            "Dispatching"
        );

        if !self.context.workers.has_worker(&queue_name) {
            warn!(queue = %queue_name, "No worker registered for queue, pausing it");
            self.pause_queue(&queue_name);
            self.back_off(stop_rx).await;
            return;
        }

        let queue = tokio::select! {
            queue = self.context.queues.queue(&queue_name) => queue,
            _ = stop_rx.changed() => return,
        };
        let queue = match queue {
            Ok(queue) => queue,
            Err(e) => {
                error!(queue = %queue_name, error = %e, "Could not resolve queue, pausing it");
                self.pause_queue(&queue_name);
                self.back_off(stop_rx).await;
                return;
            }
        };

        let limit = if self.context.workers.is_batch_mode(&queue_name) {
            BATCH_LIMIT
        } else {
            ready
        };

        let messages = tokio::select! {
            messages = self.fetcher.fetch(&queue, limit) => messages,
            _ = stop_rx.changed() => return,
        };

        self.messages_found(&queue_name, messages.len());

        if messages.is_empty() {
            self.back_off(stop_rx).await;
            return;
        }

        if self.context.workers.is_batch_mode(&queue_name) {
            self.assign(&queue_name, Unit::batch(messages));
        } else {
            for message in messages {
                self.assign(&queue_name, Unit::single(message));
            }
        }
    }

    fn messages_found(&self, queue: &str, count: usize) {
        let rotation = self.strategy.lock().messages_found(queue, count);
        if rotation == Rotation::Paused {
            metrics::record_queue_paused(queue);
            self.schedule_restart(queue);
        }
    }

    fn pause_queue(&self, queue: &str) {
        self.strategy.lock().pause(queue);
        metrics::record_queue_paused(queue);
        self.schedule_restart(queue);
    }

    /// Timer that puts a paused queue back into rotation
    fn schedule_restart(&self, queue: &str) {
        let strategy = self.strategy.clone();
        let delay = strategy.lock().pause_delay();
        let queue = queue.to_string();
        let mut stop_rx = self.stop_tx.subscribe();

        tokio::spawn(async move {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    strategy.lock().restart(&queue);
                    debug!(queue = %queue, "Restarted paused queue");
                }
                _ = stop_rx.changed() => {}
            }
        });
    }

    /// Claim a slot and spawn a processor task for the unit
    fn assign(&self, queue_name: &str, unit: Unit) {
        let slot = SlotGuard::acquire(self.busy.clone(), self.slot_freed.clone(), self.group.clone());
        let processing = ProcessingUnit::new(queue_name, unit);
        debug!(queue = %queue_name, unit_id = %processing.id(), "Assigning");

        let processor = self.context.processor.clone();
        let events = self.context.events.clone();
        let task_unit = processing.clone();
        let handle = tokio::spawn(async move {
            let _slot = slot;
            task_unit.mark_running();
            let result = processor.process(&task_unit).await;
            task_unit.finish(result.is_ok());

            let queue = task_unit.queue_name.as_str();
            metrics::record_unit_processed(queue, result.is_ok());
            match result {
                Ok(()) => {
                    debug!(queue = %queue, "Process done");
                    events.on_processor_done(queue);
                }
                Err(e) => events.on_processor_failure(queue, &e),
            }
        });

        self.tasks.retain(|_, task| !task.abort.is_finished());
        let id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        self.tasks.insert(
            id,
            InFlight {
                abort: handle.abort_handle(),
                processing: processing.clone(),
            },
        );
        self.watch_for_panic(handle, processing);
    }

    /// Report a panicking processor as a failure of its unit
    fn watch_for_panic(&self, handle: JoinHandle<()>, processing: ProcessingUnit) {
        let events = self.context.events.clone();
        tokio::spawn(async move {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    processing.finish(false);
                    let queue = processing.queue_name.as_str();
                    let error = WorkerError::Panicked(e.to_string());
                    error!(queue = %queue, unit_id = %processing.id(), error = %error, "Processor failed");
                    metrics::record_unit_processed(queue, false);
                    events.on_processor_failure(queue, &error);
                }
            }
        });
    }

    /// Stop dispatching without waiting for in-flight work
    pub fn quiet(&self) {
        let already = self.stop_tx.send_replace(true);
        if !already {
            let mut state = self.state.lock();
            if *state == ShutdownState::Running {
                *state = ShutdownState::Stopping;
            }
            info!(group = %self.group, "Quieting dispatcher");
        }
    }

    /// Stop the manager and wait according to `mode`
    pub async fn stop(&self, mode: StopMode) -> ShutdownState {
        self.quiet();

        info!(group = %self.group, "Calling on_stop callback");
        self.context.events.on_stop();
        info!(group = %self.group, "Shutting down workers");

        let outcome = match mode {
            StopMode::Soft => {
                self.wait_for_drain().await;
                ShutdownState::Drained
            }
            StopMode::Hard { timeout } => {
                if self.busy() > 0 {
                    info!(
                        group = %self.group,
                        seconds = timeout.as_secs_f64(),
                        "Pausing up to {} seconds to allow workers to finish...",
                        timeout.as_secs_f64()
                    );
                }
                match tokio::time::timeout(timeout, self.wait_for_drain()).await {
                    Ok(()) => ShutdownState::Drained,
                    Err(_) => {
                        let busy = self.busy();
                        info!(group = %self.group, busy, "Hard shutting down {} busy workers", busy);
                        self.abort_all();
                        metrics::record_forced_cancellations(&self.group, busy);
                        ShutdownState::Forced
                    }
                }
            }
        };
        *self.state.lock() = outcome;

        let handle = self.loop_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    error!(group = %self.group, error = %e, "Dispatch loop panicked");
                }
            }
        }

        *self.state.lock() = ShutdownState::Stopped;
        info!(group = %self.group, outcome = ?outcome, "Stopped");
        outcome
    }

    /// Wait until every slot is free, checking at the drain cadence
    async fn wait_for_drain(&self) {
        loop {
            let freed = self.slot_freed.notified();
            if self.busy() == 0 {
                return;
            }
            tokio::select! {
                _ = freed => {}
                _ = tokio::time::sleep(self.config.drain_poll_interval) => {}
            }
        }
    }

    fn abort_all(&self) {
        for task in self.tasks.iter() {
            let task = task.value();
            task.abort.abort();
            task.processing.finish(false);
        }
        self.tasks.clear();
    }
}
