//! SQS Transport Integration Tests
//!
//! These tests require LocalStack to be running:
//! docker run -d -p 4566:4566 localstack/localstack
//!
//! Tests for:
//! - Queue URL resolution and the non-existent queue error
//! - Visibility timeout lookup
//! - Send, receive and batch delete round trip

#![cfg(feature = "sqs")]

use std::sync::Arc;
use std::time::Duration;

use ferry_queue::sqs::{client_from_env, SqsQueueClient};
use ferry_queue::{QueueError, QueueRegistry, ReceiveOptions, SendMessage};

const LOCALSTACK_ENDPOINT: &str = "http://localhost:4566";
const TEST_QUEUE_NAME: &str = "ferry-test-queue";

async fn setup_test_queue() -> Arc<SqsQueueClient> {
    let client = client_from_env(Some("us-east-1"), Some(LOCALSTACK_ENDPOINT)).await;

    let _ = client
        .delete_queue()
        .queue_url(format!("{}/000000000000/{}", LOCALSTACK_ENDPOINT, TEST_QUEUE_NAME))
        .send()
        .await;
    tokio::time::sleep(Duration::from_millis(500)).await;

    client
        .create_queue()
        .queue_name(TEST_QUEUE_NAME)
        .attributes(aws_sdk_sqs::types::QueueAttributeName::VisibilityTimeout, "45")
        .send()
        .await
        .expect("Failed to create queue");

    Arc::new(SqsQueueClient::new(client))
}

#[tokio::test]
#[ignore = "requires LocalStack"]
async fn test_missing_queue() {
    let client = Arc::new(SqsQueueClient::new(
        client_from_env(Some("us-east-1"), Some(LOCALSTACK_ENDPOINT)).await,
    ));
    let registry = QueueRegistry::new(client);

    let err = registry.queue("ferry-does-not-exist").await.unwrap_err();
    assert!(matches!(err, QueueError::NonExistentQueue(_)));
}

#[tokio::test]
#[ignore = "requires LocalStack"]
async fn test_send_receive_delete() {
    let client = setup_test_queue().await;
    let registry = QueueRegistry::new(client);
    let queue = registry.queue(TEST_QUEUE_NAME).await.unwrap();

    assert_eq!(queue.visibility_timeout().await.unwrap(), 45);

    queue.send_message(SendMessage::new("hello")).await.unwrap();

    let received = queue
        .receive_messages(&ReceiveOptions::new(10).with_wait_time_seconds(Some(2)))
        .await
        .unwrap();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].body, "hello");
    assert_eq!(received[0].delivery_count(), Some(1));

    let handles: Vec<String> = received.into_iter().map(|m| m.receipt_handle).collect();
    let outcome = queue.delete_messages(&handles).await.unwrap();
    assert_eq!(outcome.successful, vec!["0"]);
}
