use serde::{Deserialize, Serialize};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

pub mod logging;

/// System attribute carrying the transport's delivery counter.
pub const RECEIVE_COUNT_ATTRIBUTE: &str = "ApproximateReceiveCount";

/// Largest number of messages a single receive call may return.
pub const BATCH_LIMIT: usize = 10;

// ============================================================================
// Core Message Types
// ============================================================================

/// A message received from a queue.
///
/// Immutable once received; the only side-channel is changing its visibility
/// through the owning queue handle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub message_id: String,
    pub body: String,
    pub receipt_handle: String,
    /// System attributes (SentTimestamp, ApproximateReceiveCount, ...)
    #[serde(default)]
    pub attributes: HashMap<String, String>,
    /// User supplied message attributes
    #[serde(default)]
    pub message_attributes: HashMap<String, MessageAttributeValue>,
    #[serde(default)]
    pub md5_of_body: Option<String>,
}

impl Message {
    /// How many times the transport has handed this message out, if it told us.
    pub fn delivery_count(&self) -> Option<u32> {
        self.attributes
            .get(RECEIVE_COUNT_ATTRIBUTE)
            .and_then(|v| v.parse().ok())
    }

    /// Read a string-typed message attribute.
    pub fn string_attribute(&self, name: &str) -> Option<&str> {
        match self.message_attributes.get(name) {
            Some(MessageAttributeValue::String(value)) => Some(value.as_str()),
            _ => None,
        }
    }
}

/// Typed user attribute attached to a message
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "dataType", content = "value")]
pub enum MessageAttributeValue {
    String(String),
    Number(String),
    Binary(Vec<u8>),
}

impl MessageAttributeValue {
    pub fn data_type(&self) -> &'static str {
        match self {
            MessageAttributeValue::String(_) => "String",
            MessageAttributeValue::Number(_) => "Number",
            MessageAttributeValue::Binary(_) => "Binary",
        }
    }
}

/// One unit of work handed to a processor: a single message or a whole batch.
///
/// The display identifier is computed once when the unit is built.
#[derive(Debug, Clone, PartialEq)]
pub enum Unit {
    Single(Message),
    Batch { id: String, messages: Vec<Message> },
}

impl Unit {
    pub fn single(message: Message) -> Self {
        Unit::Single(message)
    }

    pub fn batch(messages: Vec<Message>) -> Self {
        Unit::Batch {
            id: format!("batch-with-{}-messages", messages.len()),
            messages,
        }
    }

    /// Identifier used in logs: the message id, or `batch-with-<N>-messages`
    pub fn id(&self) -> &str {
        match self {
            Unit::Single(message) => &message.message_id,
            Unit::Batch { id, .. } => id,
        }
    }

    pub fn messages(&self) -> &[Message] {
        match self {
            Unit::Single(message) => std::slice::from_ref(message),
            Unit::Batch { messages, .. } => messages,
        }
    }

    pub fn len(&self) -> usize {
        self.messages().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages().is_empty()
    }

    pub fn is_batch(&self) -> bool {
        matches!(self, Unit::Batch { .. })
    }

    pub fn receipt_handles(&self) -> Vec<String> {
        self.messages().iter().map(|m| m.receipt_handle.clone()).collect()
    }
}

// ============================================================================
// Processing Unit Tracking
// ============================================================================

/// Lifecycle of a unit inside the pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitState {
    Pending,
    Running,
    Completed,
    Failed,
}

impl UnitState {
    pub fn is_terminal(self) -> bool {
        matches!(self, UnitState::Completed | UnitState::Failed)
    }
}

/// The handle passed from the dispatcher to a processor.
///
/// Clones share one lifecycle state: `pending -> running -> {completed | failed}`.
#[derive(Debug, Clone)]
pub struct ProcessingUnit {
    pub queue_name: String,
    pub unit: Unit,
    pub assigned_at: DateTime<Utc>,
    state: Arc<Mutex<UnitState>>,
}

impl ProcessingUnit {
    pub fn new(queue_name: impl Into<String>, unit: Unit) -> Self {
        Self {
            queue_name: queue_name.into(),
            unit,
            assigned_at: Utc::now(),
            state: Arc::new(Mutex::new(UnitState::Pending)),
        }
    }

    pub fn id(&self) -> &str {
        self.unit.id()
    }

    pub fn state(&self) -> UnitState {
        *self.state.lock()
    }

    /// `pending -> running`; false if the unit already left `pending`
    pub fn mark_running(&self) -> bool {
        let mut state = self.state.lock();
        if *state != UnitState::Pending {
            return false;
        }
        *state = UnitState::Running;
        true
    }

    /// Move to `completed` or `failed`; false if the unit already finished
    pub fn finish(&self, success: bool) -> bool {
        let mut state = self.state.lock();
        if state.is_terminal() {
            return false;
        }
        *state = if success {
            UnitState::Completed
        } else {
            UnitState::Failed
        };
        true
    }
}

// ============================================================================
// Configuration Types
// ============================================================================

/// A queue name with its relative polling weight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedQueue {
    pub name: String,
    pub weight: u32,
}

impl WeightedQueue {
    /// Weights below one are coerced to one.
    pub fn new(name: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            weight: weight.max(1),
        }
    }
}

/// A set of queues sharing one worker pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupConfig {
    pub name: String,
    pub concurrency: usize,
    pub queues: Vec<WeightedQueue>,
}

/// How the polling strategy adapts weights to fetch results
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RebalanceConfig {
    /// Grow a queue's active weight by one after each non-empty fetch, up to its configured weight
    pub grow_on_messages: bool,
    /// Consecutive empty fetches before a queue is paused (0 disables pausing)
    pub pause_after_empty: u32,
}

impl Default for RebalanceConfig {
    fn default() -> Self {
        Self {
            grow_on_messages: true,
            pause_after_empty: 1,
        }
    }
}

/// Dispatcher tuning shared by every group
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManagerConfig {
    /// Back-off when there is no capacity or no eligible queue
    pub min_dispatch_interval: Duration,
    /// How long a paused queue stays out of rotation
    pub pause_delay: Duration,
    /// Cadence at which shutdown checks the busy count
    pub drain_poll_interval: Duration,
    /// Long-poll wait passed to receive calls (None = short polling)
    pub wait_time_seconds: Option<i32>,
    pub rebalance: RebalanceConfig,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            min_dispatch_interval: Duration::from_millis(100),
            pause_delay: Duration::ZERO,
            drain_poll_interval: Duration::from_millis(100),
            wait_time_seconds: None,
            rebalance: RebalanceConfig::default(),
        }
    }
}

/// Everything the launcher needs to start all groups
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LauncherConfig {
    pub groups: Vec<GroupConfig>,
    pub manager: ManagerConfig,
    /// Deadline for hard shutdown
    pub shutdown_timeout: Duration,
}

impl LauncherConfig {
    /// Distinct queue names across every group, in declaration order
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for group in &self.groups {
            for queue in &group.queues {
                if !names.contains(&queue.name) {
                    names.push(queue.name.clone());
                }
            }
        }
        names
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            groups: Vec::new(),
            manager: ManagerConfig::default(),
            shutdown_timeout: Duration::from_secs(8),
        }
    }
}
