use async_trait::async_trait;
use ferry_common::{Message, MessageAttributeValue};
use std::collections::HashMap;

pub mod error;
pub mod memory;
pub mod queue;
pub mod registry;

#[cfg(feature = "sqs")]
pub mod sqs;

pub use error::QueueError;
pub use queue::Queue;
pub use registry::QueueRegistry;

pub type Result<T> = std::result::Result<T, QueueError>;

/// Longest delay the transport accepts for a message, in seconds (15 minutes)
pub const MAX_DELAY_SECONDS: u32 = 900;

/// Cached queue metadata
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueAttributes {
    pub visibility_timeout: u32,
}

/// Options for a single receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiveOptions {
    pub max_messages: usize,
    pub wait_time_seconds: Option<i32>,
    /// Override the queue's visibility timeout for the received messages
    pub visibility_timeout: Option<i32>,
}

impl ReceiveOptions {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            wait_time_seconds: None,
            visibility_timeout: None,
        }
    }

    pub fn with_wait_time_seconds(mut self, seconds: Option<i32>) -> Self {
        self.wait_time_seconds = seconds.map(|s| s.clamp(0, 20));
        self
    }
}

/// A message to be sent. Built from a `&str`/`String`, or from a JSON value
/// through `TryFrom` (only strings and objects are accepted).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SendMessage {
    pub body: String,
    pub delay_seconds: Option<u32>,
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    /// Required by FIFO queues; filled in by the queue handle when absent
    pub message_group_id: Option<String>,
    pub message_deduplication_id: Option<String>,
}

impl SendMessage {
    pub fn new(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            ..Default::default()
        }
    }

    pub fn with_delay_seconds(mut self, delay_seconds: u32) -> Self {
        self.delay_seconds = Some(delay_seconds);
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

impl From<&str> for SendMessage {
    fn from(body: &str) -> Self {
        SendMessage::new(body)
    }
}

impl From<String> for SendMessage {
    fn from(body: String) -> Self {
        SendMessage::new(body)
    }
}

impl TryFrom<serde_json::Value> for SendMessage {
    type Error = QueueError;

    fn try_from(value: serde_json::Value) -> Result<Self> {
        match value {
            serde_json::Value::String(body) => Ok(SendMessage::new(body)),
            serde_json::Value::Object(_) => Ok(SendMessage::new(serde_json::to_string(&value)?)),
            other => Err(QueueError::InvalidMessage(format!(
                "The message body must be a String or a JSON object and you passed {}",
                json_kind(&other)
            ))),
        }
    }
}

fn json_kind(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "a boolean",
        serde_json::Value::Number(_) => "a number",
        serde_json::Value::String(_) => "a string",
        serde_json::Value::Array(_) => "an array",
        serde_json::Value::Object(_) => "an object",
    }
}

/// One entry of a batch send
#[derive(Debug, Clone, PartialEq)]
pub struct SendMessageEntry {
    pub id: String,
    pub message: SendMessage,
}

/// A failed entry of a batch call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub id: String,
    pub code: String,
    pub message: Option<String>,
}

/// Result of a batch delete
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeleteBatchOutcome {
    pub successful: Vec<String>,
    pub failed: Vec<BatchFailure>,
}

/// Result of a batch send: entry id -> broker message id, plus failures
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SendBatchOutcome {
    pub successful: Vec<(String, String)>,
    pub failed: Vec<BatchFailure>,
}

/// Transport operations the consumer relies on.
///
/// Implementations: [`sqs::SqsQueueClient`] (feature `sqs`) and
/// [`memory::InMemoryQueueClient`].
#[async_trait]
pub trait QueueClient: Send + Sync {
    /// Resolve a queue name to its URL
    async fn get_queue_url(&self, name: &str) -> Result<String>;

    async fn get_queue_attributes(&self, url: &str) -> Result<QueueAttributes>;

    async fn receive_messages(&self, url: &str, options: &ReceiveOptions) -> Result<Vec<Message>>;

    async fn change_message_visibility(
        &self,
        url: &str,
        receipt_handle: &str,
        visibility_timeout: u32,
    ) -> Result<()>;

    /// Delete up to ten messages; entry ids are positional indexes
    async fn delete_message_batch(&self, url: &str, receipt_handles: &[String]) -> Result<DeleteBatchOutcome>;

    /// Returns the broker message id
    async fn send_message(&self, url: &str, message: &SendMessage) -> Result<String>;

    async fn send_message_batch(&self, url: &str, entries: &[SendMessageEntry]) -> Result<SendBatchOutcome>;
}
