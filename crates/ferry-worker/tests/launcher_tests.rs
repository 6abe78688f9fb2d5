//! Launcher and Executor Tests
//!
//! Startup validation and enqueueing through the queue executor.

use std::sync::Arc;
use std::time::Duration;
use async_trait::async_trait;

use ferry_common::{GroupConfig, LauncherConfig, MessageAttributeValue, Unit, WeightedQueue};
use ferry_queue::memory::InMemoryQueueClient;
use ferry_queue::{QueueRegistry, SendMessage};
use ferry_worker::{
    ConsumerError, Launcher, Payload, PerformOptions, QueueExecutor, Worker, WorkerDescriptor,
    WorkerError, WorkerExecutor, WorkerRegistry, WORKER_ATTRIBUTE,
};

struct NoopWorker;

#[async_trait]
impl Worker for NoopWorker {
    async fn perform(&self, _unit: &Unit, _body: &Payload) -> Result<(), WorkerError> {
        Ok(())
    }
}

fn single_group(queues: &[&str]) -> LauncherConfig {
    LauncherConfig {
        groups: vec![GroupConfig {
            name: "default".to_string(),
            concurrency: 2,
            queues: queues.iter().map(|name| WeightedQueue::new(*name, 1)).collect(),
        }],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_start_rejects_missing_queues() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("present", 30);

    let launcher = Launcher::new(
        single_group(&["present", "gone", "lost"]),
        client,
        Arc::new(WorkerRegistry::new()),
    );
    let err = launcher.start().await.unwrap_err();

    assert!(matches!(err, ConsumerError::NonExistentQueues(_)));
    assert_eq!(err.to_string(), "The specified queue(s) gone, lost do not exist");
    assert!(launcher.managers().is_empty());
}

#[tokio::test]
async fn test_start_rejects_zero_concurrency() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 30);

    let mut config = single_group(&["default"]);
    config.groups[0].concurrency = 0;

    let launcher = Launcher::new(config, client, Arc::new(WorkerRegistry::new()));
    let err = launcher.start().await.unwrap_err();
    assert!(matches!(err, ConsumerError::InvalidConcurrency(0)));
}

#[tokio::test(start_paused = true)]
async fn test_queue_without_worker_is_left_alone() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("orphan", 30);
    client.push("orphan", "nobody home").unwrap();

    let launcher = Launcher::new(single_group(&["orphan"]), client.clone(), Arc::new(WorkerRegistry::new()));
    launcher.start().await.unwrap();

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.receive_calls(), 0);
    assert_eq!(client.depth("orphan"), (1, 0));

    launcher.stop().await;
}

#[tokio::test(start_paused = true)]
async fn test_second_start_rejected() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("default", 30);
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("default", WorkerDescriptor::new("Noop", Arc::new(NoopWorker)))
        .unwrap();

    let launcher = Launcher::new(single_group(&["default"]), client, workers);
    launcher.start().await.unwrap();

    assert!(matches!(launcher.start().await, Err(ConsumerError::AlreadyStarted)));
    assert_eq!(launcher.managers().len(), 1);

    launcher.stop().await;
}

#[tokio::test]
async fn test_queue_executor_tags_worker() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("mail", 30);
    client.create_queue("priority-mail", 30);

    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("mail", WorkerDescriptor::new("Mailer", Arc::new(NoopWorker)))
        .unwrap();
    let executor = QueueExecutor::new(workers, Arc::new(QueueRegistry::new(client.clone())));

    executor
        .perform_async("Mailer", SendMessage::new("hi"), PerformOptions::default())
        .await
        .unwrap();
    executor
        .perform_in(
            "Mailer",
            Duration::from_secs(60),
            SendMessage::new("later"),
            PerformOptions::default().with_queue("priority-mail"),
        )
        .await
        .unwrap();

    let sent = client.sent_messages("mail");
    assert_eq!(sent.len(), 1);
    assert_eq!(
        sent[0].message_attributes.get(WORKER_ATTRIBUTE),
        Some(&MessageAttributeValue::String("Mailer".to_string()))
    );
    assert_eq!(sent[0].delay_seconds, None);

    let delayed = client.sent_messages("priority-mail");
    assert_eq!(delayed.len(), 1);
    assert_eq!(delayed[0].body, "later");
    assert_eq!(delayed[0].delay_seconds, Some(60));
}

#[tokio::test]
async fn test_queue_executor_limits() {
    let client = Arc::new(InMemoryQueueClient::new());
    client.create_queue("mail", 30);
    let workers = Arc::new(WorkerRegistry::new());
    workers
        .register("mail", WorkerDescriptor::new("Mailer", Arc::new(NoopWorker)))
        .unwrap();
    let executor = QueueExecutor::new(workers, Arc::new(QueueRegistry::new(client.clone())));

    let too_late = executor
        .perform_in(
            "Mailer",
            Duration::from_secs(16 * 60),
            SendMessage::new("x"),
            PerformOptions::default(),
        )
        .await;
    assert!(matches!(too_late, Err(WorkerError::InvalidMessage(_))));

    let unknown = executor
        .perform_async("Nobody", SendMessage::new("x"), PerformOptions::default())
        .await;
    assert!(matches!(unknown, Err(WorkerError::UnknownWorker(_))));
    assert!(client.sent_messages("mail").is_empty());
}
