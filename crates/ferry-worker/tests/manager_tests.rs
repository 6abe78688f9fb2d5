//! Manager Tests
//!
//! Dispatch and shutdown behaviour against the in-memory transport:
//! - Slot accounting stays within the concurrency limit
//! - Batch workers receive one unit per fetch
//! - Soft shutdown drains, hard shutdown forces after its deadline
//! - Failures, including panics, are reported against the unit's queue

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;
use tokio::time::Instant;

use ferry_common::{GroupConfig, LauncherConfig, ManagerConfig, Unit, UnitState, WeightedQueue};
use ferry_queue::memory::InMemoryQueueClient;
use ferry_worker::{
    ConsumerEvents, Launcher, Payload, ShutdownState, Worker, WorkerDescriptor, WorkerError,
    WorkerRegistry,
};

/// Worker that sleeps, counts, and tracks peak concurrency
struct SlowWorker {
    delay: Duration,
    running: AtomicUsize,
    peak: AtomicUsize,
    completed: AtomicUsize,
    unit_ids: parking_lot::Mutex<Vec<String>>,
}

impl SlowWorker {
    fn new(delay: Duration) -> Self {
        Self {
            delay,
            running: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            unit_ids: parking_lot::Mutex::new(Vec::new()),
        }
    }

    fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Worker for SlowWorker {
    async fn perform(&self, unit: &Unit, _body: &Payload) -> Result<(), WorkerError> {
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        self.unit_ids.lock().push(unit.id().to_string());

        tokio::time::sleep(self.delay).await;

        self.running.fetch_sub(1, Ordering::SeqCst);
        self.completed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Worker that never returns
struct StuckWorker;

#[async_trait]
impl Worker for StuckWorker {
    async fn perform(&self, _unit: &Unit, _body: &Payload) -> Result<(), WorkerError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}

struct FailingWorker;

#[async_trait]
impl Worker for FailingWorker {
    async fn perform(&self, _unit: &Unit, _body: &Payload) -> Result<(), WorkerError> {
        Err(WorkerError::handler("boom"))
    }
}

struct PanickingWorker;

#[async_trait]
impl Worker for PanickingWorker {
    async fn perform(&self, _unit: &Unit, _body: &Payload) -> Result<(), WorkerError> {
        panic!("kaboom");
    }
}

/// Worker that holds each unit until released
#[derive(Default)]
struct GatedWorker {
    gate: tokio::sync::Notify,
}

#[async_trait]
impl Worker for GatedWorker {
    async fn perform(&self, _unit: &Unit, _body: &Payload) -> Result<(), WorkerError> {
        self.gate.notified().await;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingEvents {
    calls: parking_lot::Mutex<Vec<String>>,
}

impl RecordingEvents {
    fn calls(&self) -> Vec<String> {
        self.calls.lock().clone()
    }

    fn count(&self, name: &str) -> usize {
        self.calls.lock().iter().filter(|c| c.as_str() == name).count()
    }
}

impl ConsumerEvents for RecordingEvents {
    fn on_startup(&self) {
        self.calls.lock().push("startup".to_string());
    }

    fn on_processor_done(&self, queue: &str) {
        self.calls.lock().push(format!("done:{}", queue));
    }

    fn on_processor_failure(&self, queue: &str, _error: &WorkerError) {
        self.calls.lock().push(format!("failure:{}", queue));
    }

    fn on_stop(&self) {
        self.calls.lock().push("stop".to_string());
    }

    fn on_shutdown(&self) {
        self.calls.lock().push("shutdown".to_string());
    }
}

fn config(concurrency: usize, queues: &[(&str, u32)]) -> LauncherConfig {
    group_config("default", concurrency, queues)
}

fn group_config(group: &str, concurrency: usize, queues: &[(&str, u32)]) -> LauncherConfig {
    LauncherConfig {
        groups: vec![GroupConfig {
            name: group.to_string(),
            concurrency,
            queues: queues.iter().map(|(name, weight)| WeightedQueue::new(*name, *weight)).collect(),
        }],
        manager: ManagerConfig::default(),
        shutdown_timeout: Duration::from_secs(8),
    }
}

async fn wait_until(condition: impl Fn() -> bool) {
    for _ in 0..10_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

#[tokio::test(start_paused = true)]
async fn test_processes_all_queues_within_concurrency() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("a", 30);
    client.create_queue("b", 30);
    for i in 0..20 {
        client.push("a", format!("a-{}", i)).unwrap();
    }
    for i in 0..10 {
        client.push("b", format!("b-{}", i)).unwrap();
    }

    let worker = Arc::new(SlowWorker::new(Duration::from_millis(50)));
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("a", WorkerDescriptor::new("A", worker.clone()).with_auto_delete(true))
        .unwrap();
    workers
        .register("b", WorkerDescriptor::new("B", worker.clone()).with_auto_delete(true))
        .unwrap();

    let launcher = Launcher::new(config(3, &[("a", 2), ("b", 1)]), client.clone(), workers);
    launcher.start().await.unwrap();
    let manager = launcher.managers()[0].clone();

    for _ in 0..10_000 {
        assert_eq!(manager.ready() + manager.busy(), 3);
        if worker.completed() == 30 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(worker.completed(), 30);
    assert!(worker.peak.load(Ordering::SeqCst) <= 3);

    let outcomes = launcher.stop().await;
    assert_eq!(outcomes, vec![ShutdownState::Drained]);
    assert_eq!(client.depth("a"), (0, 0));
    assert_eq!(client.depth("b"), (0, 0));
    assert_eq!(manager.state(), ShutdownState::Stopped);
}

#[tokio::test(start_paused = true)]
async fn test_batch_worker_gets_one_unit() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("bulk", 30);
    for i in 0..4 {
        client.push("bulk", i.to_string()).unwrap();
    }

    let worker = Arc::new(SlowWorker::new(Duration::ZERO));
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register(
            "bulk",
            WorkerDescriptor::new("Bulk", worker.clone())
                .with_batch(true)
                .with_auto_delete(true),
        )
        .unwrap();

    let launcher = Launcher::new(config(2, &[("bulk", 1)]), client.clone(), workers);
    launcher.start().await.unwrap();

    wait_until(|| worker.completed() == 1).await;
    launcher.stop().await;

    assert_eq!(worker.unit_ids.lock().clone(), vec!["batch-with-4-messages"]);
    assert_eq!(client.depth("bulk"), (0, 0));
}

#[tokio::test(start_paused = true)]
async fn test_soft_shutdown_waits_for_busy_units() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 60);
    for i in 0..3 {
        client.push("default", i.to_string()).unwrap();
    }

    let worker = Arc::new(SlowWorker::new(Duration::from_secs(5)));
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Slow", worker.clone()))
        .unwrap();

    let events = Arc::new(RecordingEvents::default());
    let launcher = Launcher::new(config(3, &[("default", 1)]), client.clone(), workers)
        .with_events(events.clone());
    launcher.start().await.unwrap();

    let manager = launcher.managers()[0].clone();
    wait_until(|| manager.busy() == 3).await;
    assert_eq!(worker.completed(), 0);

    let outcomes = launcher.stop().await;

    assert_eq!(outcomes, vec![ShutdownState::Drained]);
    assert_eq!(worker.completed(), 3);
    assert_eq!(manager.busy(), 0);
    assert_eq!(events.count("done:default"), 3);
    assert_eq!(events.calls().last().map(String::as_str), Some("shutdown"));
}

#[tokio::test(start_paused = true)]
async fn test_hard_shutdown_forces_after_timeout() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 60);
    client.push("default", "forever").unwrap();

    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Stuck", Arc::new(StuckWorker)))
        .unwrap();

    let events = Arc::new(RecordingEvents::default());
    let launcher = Launcher::new(config(2, &[("default", 1)]), client.clone(), workers)
        .with_events(events.clone());
    launcher.start().await.unwrap();

    let manager = launcher.managers()[0].clone();
    wait_until(|| manager.busy() == 1).await;

    let started = Instant::now();
    let outcomes = launcher.stop_with_timeout(Duration::from_secs(2)).await;
    let elapsed = started.elapsed();

    assert_eq!(outcomes, vec![ShutdownState::Forced]);
    assert!(elapsed >= Duration::from_secs(2));
    assert!(elapsed < Duration::from_millis(2500));

    wait_until(|| manager.busy() == 0).await;
    assert_eq!(events.count("stop"), 1);
    assert_eq!(events.count("shutdown"), 1);
    // Never acknowledged, so the message stays in flight
    assert_eq!(client.depth("default"), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_hard_shutdown_drains_when_idle() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 30);

    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Slow", Arc::new(SlowWorker::new(Duration::ZERO))))
        .unwrap();

    let launcher = Launcher::new(config(1, &[("default", 1)]), client, workers);
    launcher.start().await.unwrap();

    let outcomes = launcher.stop_with_timeout(Duration::from_secs(2)).await;
    assert_eq!(outcomes, vec![ShutdownState::Drained]);
}

#[tokio::test(start_paused = true)]
async fn test_failures_reported_and_messages_kept() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 300);
    client.push("default", "x").unwrap();

    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register(
            "default",
            WorkerDescriptor::new("Failing", Arc::new(FailingWorker)).with_auto_delete(true),
        )
        .unwrap();

    let events = Arc::new(RecordingEvents::default());
    let launcher = Launcher::new(config(1, &[("default", 1)]), client.clone(), workers)
        .with_events(events.clone());
    launcher.start().await.unwrap();

    wait_until(|| events.count("failure:default") == 1).await;
    launcher.stop().await;

    assert_eq!(events.count("done:default"), 0);
    assert_eq!(client.depth("default"), (0, 1));
}

#[tokio::test(start_paused = true)]
async fn test_quiet_stops_fetching() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 30);

    let worker = Arc::new(SlowWorker::new(Duration::ZERO));
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Slow", worker.clone()).with_auto_delete(true))
        .unwrap();

    let launcher = Launcher::new(config(1, &[("default", 1)]), client.clone(), workers);
    launcher.start().await.unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    launcher.quiet();
    tokio::time::sleep(Duration::from_millis(200)).await;
    let receives = client.receive_calls();

    client.push("default", "late").unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;

    assert_eq!(client.receive_calls(), receives);
    assert_eq!(worker.completed(), 0);
    assert_eq!(client.depth("default"), (1, 0));

    launcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_panic_reported_against_queue() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("a", 300);
    client.push("a", "x").unwrap();

    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("a", WorkerDescriptor::new("Panicking", Arc::new(PanickingWorker)))
        .unwrap();

    let events = Arc::new(RecordingEvents::default());
    let launcher = Launcher::new(group_config("grp", 1, &[("a", 1)]), client.clone(), workers)
        .with_events(events.clone());
    launcher.start().await.unwrap();
    let manager = launcher.managers()[0].clone();

    wait_until(|| events.count("failure:a") == 1).await;
    assert_eq!(events.count("failure:grp"), 0);
    assert_eq!(manager.in_flight()[0].state, UnitState::Failed);

    // The slot is released and the message stays in flight
    wait_until(|| manager.busy() == 0).await;
    assert_eq!(client.depth("a"), (0, 1));

    launcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_unit_moves_from_running_to_completed() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 300);
    client.push("default", "x").unwrap();

    let worker = Arc::new(GatedWorker::default());
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Gated", worker.clone()))
        .unwrap();

    let launcher = Launcher::new(config(1, &[("default", 1)]), client, workers);
    launcher.start().await.unwrap();
    let manager = launcher.managers()[0].clone();

    wait_until(|| {
        manager
            .in_flight()
            .first()
            .map_or(false, |unit| unit.state == UnitState::Running)
    })
    .await;
    let running = manager.in_flight();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].queue_name, "default");
    assert_eq!(manager.busy(), 1);

    worker.gate.notify_one();
    wait_until(|| manager.busy() == 0).await;
    let finished = manager.in_flight();
    assert_eq!(finished[0].unit_id, running[0].unit_id);
    assert_eq!(finished[0].state, UnitState::Completed);

    launcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_in_flight_unit_marked_failed() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 300);
    client.push("default", "x").unwrap();

    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Failing", Arc::new(FailingWorker)))
        .unwrap();

    let events = Arc::new(RecordingEvents::default());
    let launcher = Launcher::new(config(1, &[("default", 1)]), client, workers)
        .with_events(events.clone());
    launcher.start().await.unwrap();
    let manager = launcher.managers()[0].clone();

    wait_until(|| events.count("failure:default") == 1).await;
    assert_eq!(manager.in_flight()[0].state, UnitState::Failed);

    launcher.stop().await;
}
