//! In-memory transport for development and tests.
//!
//! Emulates the visibility semantics of the real service: a received message is
//! hidden until its visibility timeout elapses, then handed out again with a
//! fresh receipt handle and an incremented receive count. Uses the tokio clock so
//! paused-time tests behave.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use ferry_common::{Message, MessageAttributeValue, RECEIVE_COUNT_ATTRIBUTE};
use crate::{
    BatchFailure, DeleteBatchOutcome, QueueAttributes, QueueClient, QueueError, ReceiveOptions,
    Result, SendBatchOutcome, SendMessage, SendMessageEntry,
};

const URL_PREFIX: &str = "memory://";

struct StoredMessage {
    message_id: String,
    body: String,
    message_attributes: HashMap<String, MessageAttributeValue>,
    receive_count: u32,
    visible_at: Instant,
    receipt_handle: Option<String>,
}

struct MemoryQueue {
    visibility_timeout: u32,
    messages: Vec<StoredMessage>,
    sent: Vec<SendMessage>,
}

/// Record of one visibility change request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VisibilityChange {
    pub queue: String,
    pub receipt_handle: String,
    pub visibility_timeout: u32,
    pub at: Instant,
}

#[derive(Default)]
pub struct InMemoryQueueClient {
    queues: Mutex<HashMap<String, MemoryQueue>>,
    visibility_changes: Mutex<Vec<VisibilityChange>>,
    url_calls: AtomicUsize,
    attribute_calls: AtomicUsize,
    receive_calls: AtomicUsize,
}

impl InMemoryQueueClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create (or reset the timeout of) a queue and return its URL
    pub fn create_queue(&self, name: &str, visibility_timeout: u32) -> String {
        let mut queues = self.queues.lock();
        queues
            .entry(name.to_string())
            .and_modify(|q| q.visibility_timeout = visibility_timeout)
            .or_insert_with(|| MemoryQueue {
                visibility_timeout,
                messages: Vec::new(),
                sent: Vec::new(),
            });
        format!("{}{}", URL_PREFIX, name)
    }

    /// Enqueue a raw body directly, bypassing sanitization
    pub fn push(&self, name: &str, body: impl Into<String>) -> Result<String> {
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;
        let message_id = uuid::Uuid::new_v4().to_string();
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: body.into(),
            message_attributes: HashMap::new(),
            receive_count: 0,
            visible_at: Instant::now(),
            receipt_handle: None,
        });
        Ok(message_id)
    }

    /// (visible, in flight) message counts
    pub fn depth(&self, name: &str) -> (usize, usize) {
        let now = Instant::now();
        let queues = self.queues.lock();
        match queues.get(name) {
            Some(queue) => {
                let visible = queue.messages.iter().filter(|m| m.visible_at <= now).count();
                (visible, queue.messages.len() - visible)
            }
            None => (0, 0),
        }
    }

    /// Every message accepted through `send_message`/`send_message_batch`
    pub fn sent_messages(&self, name: &str) -> Vec<SendMessage> {
        self.queues
            .lock()
            .get(name)
            .map(|q| q.sent.clone())
            .unwrap_or_default()
    }

    pub fn visibility_changes(&self) -> Vec<VisibilityChange> {
        self.visibility_changes.lock().clone()
    }

    pub fn url_calls(&self) -> usize {
        self.url_calls.load(Ordering::SeqCst)
    }

    pub fn attribute_calls(&self) -> usize {
        self.attribute_calls.load(Ordering::SeqCst)
    }

    pub fn receive_calls(&self) -> usize {
        self.receive_calls.load(Ordering::SeqCst)
    }

    fn queue_name(url: &str) -> Result<&str> {
        url.strip_prefix(URL_PREFIX)
            .ok_or_else(|| QueueError::Config(format!("Not an in-memory queue URL: {}", url)))
    }

    fn enqueue(queue: &mut MemoryQueue, message: &SendMessage) -> String {
        let message_id = uuid::Uuid::new_v4().to_string();
        let delay = Duration::from_secs(message.delay_seconds.unwrap_or(0) as u64);
        queue.messages.push(StoredMessage {
            message_id: message_id.clone(),
            body: message.body.clone(),
            message_attributes: message.message_attributes.clone(),
            receive_count: 0,
            visible_at: Instant::now() + delay,
            receipt_handle: None,
        });
        queue.sent.push(message.clone());
        message_id
    }
}

#[async_trait]
impl QueueClient for InMemoryQueueClient {
    async fn get_queue_url(&self, name: &str) -> Result<String> {
        self.url_calls.fetch_add(1, Ordering::SeqCst);
        // Yield so concurrent callers genuinely overlap in tests
        tokio::task::yield_now().await;

        if self.queues.lock().contains_key(name) {
            Ok(format!("{}{}", URL_PREFIX, name))
        } else {
            Err(QueueError::NonExistentQueue(name.to_string()))
        }
    }

    async fn get_queue_attributes(&self, url: &str) -> Result<QueueAttributes> {
        self.attribute_calls.fetch_add(1, Ordering::SeqCst);
        let name = Self::queue_name(url)?;
        let queues = self.queues.lock();
        let queue = queues
            .get(name)
            .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;
        Ok(QueueAttributes {
            visibility_timeout: queue.visibility_timeout,
        })
    }

    async fn receive_messages(&self, url: &str, options: &ReceiveOptions) -> Result<Vec<Message>> {
        self.receive_calls.fetch_add(1, Ordering::SeqCst);
        let name = Self::queue_name(url)?;
        let now = Instant::now();

        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;

        let timeout = options
            .visibility_timeout
            .map(|t| t.max(0) as u64)
            .unwrap_or(queue.visibility_timeout as u64);

        let mut received = Vec::new();
        for stored in queue.messages.iter_mut() {
            if received.len() >= options.max_messages {
                break;
            }
            if stored.visible_at > now {
                continue;
            }

            let receipt_handle = uuid::Uuid::new_v4().to_string();
            stored.receive_count += 1;
            stored.visible_at = now + Duration::from_secs(timeout);
            stored.receipt_handle = Some(receipt_handle.clone());

            let mut attributes = HashMap::new();
            attributes.insert(RECEIVE_COUNT_ATTRIBUTE.to_string(), stored.receive_count.to_string());

            received.push(Message {
                message_id: stored.message_id.clone(),
                body: stored.body.clone(),
                receipt_handle,
                attributes,
                message_attributes: stored.message_attributes.clone(),
                md5_of_body: None,
            });
        }

        if !received.is_empty() {
            debug!(queue = %name, count = received.len(), "Received messages from memory queue");
        }
        Ok(received)
    }

    async fn change_message_visibility(
        &self,
        url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<()> {
        let name = Self::queue_name(url)?;
        let now = Instant::now();

        {
            let mut queues = self.queues.lock();
            let queue = queues
                .get_mut(name)
                .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;
            let stored = queue
                .messages
                .iter_mut()
                .find(|m| m.receipt_handle.as_deref() == Some(receipt_handle))
                .ok_or_else(|| QueueError::InvalidReceiptHandle(receipt_handle.to_string()))?;
            stored.visible_at = now + Duration::from_secs(visibility_timeout as u64);
        }

        self.visibility_changes.lock().push(VisibilityChange {
            queue: name.to_string(),
            receipt_handle: receipt_handle.to_string(),
            visibility_timeout,
            at: now,
        });
        Ok(())
    }

    async fn delete_message_batch(&self, url: &str, receipt_handles: &[String]) -> Result<DeleteBatchOutcome> {
        let name = Self::queue_name(url)?;
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;

        let mut outcome = DeleteBatchOutcome::default();
        for (index, handle) in receipt_handles.iter().enumerate() {
            let position = queue
                .messages
                .iter()
                .position(|m| m.receipt_handle.as_deref() == Some(handle.as_str()));
            match position {
                Some(position) => {
                    queue.messages.remove(position);
                    outcome.successful.push(index.to_string());
                }
                None => outcome.failed.push(BatchFailure {
                    id: index.to_string(),
                    code: "ReceiptHandleIsInvalid".to_string(),
                    message: Some(format!("Unknown receipt handle {}", handle)),
                }),
            }
        }
        Ok(outcome)
    }

    async fn send_message(&self, url: &str, message: &SendMessage) -> Result<String> {
        let name = Self::queue_name(url)?;
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;
        Ok(Self::enqueue(queue, message))
    }

    async fn send_message_batch(&self, url: &str, entries: &[SendMessageEntry]) -> Result<SendBatchOutcome> {
        let name = Self::queue_name(url)?;
        let mut queues = self.queues.lock();
        let queue = queues
            .get_mut(name)
            .ok_or_else(|| QueueError::NonExistentQueue(name.to_string()))?;

        let mut outcome = SendBatchOutcome::default();
        for entry in entries {
            let message_id = Self::enqueue(queue, &entry.message);
            outcome.successful.push((entry.id.clone(), message_id));
        }
        Ok(outcome)
    }
}
