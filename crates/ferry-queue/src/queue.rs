//! Queue handle: a named remote queue with its resolved URL and cached
//! visibility timeout.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use ferry_common::{Message, BATCH_LIMIT};
use crate::{
    DeleteBatchOutcome, QueueClient, QueueError, ReceiveOptions, Result, SendBatchOutcome,
    SendMessage, SendMessageEntry, MAX_DELAY_SECONDS,
};

const FIFO_SUFFIX: &str = ".fifo";
const DEFAULT_MESSAGE_GROUP: &str = "ferry";

pub struct Queue {
    name: String,
    url: String,
    client: Arc<dyn QueueClient>,
    visibility_timeout: OnceCell<u32>,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name)
            .field("url", &self.url)
            .field("visibility_timeout", &self.visibility_timeout.get())
            .finish()
    }
}

impl Queue {
    /// Look the queue up by name (one `get_queue_url` call).
    pub async fn resolve(client: Arc<dyn QueueClient>, name: &str) -> Result<Self> {
        let url = client.get_queue_url(name).await?;
        debug!(queue = %name, url = %url, "Resolved queue URL");
        Ok(Self::new(client, name, url))
    }

    pub fn new(client: Arc<dyn QueueClient>, name: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            url: url.into(),
            client,
            visibility_timeout: OnceCell::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_fifo(&self) -> bool {
        self.name.ends_with(FIFO_SUFFIX)
    }

    /// Visibility timeout in seconds, fetched once and cached for the process lifetime
    pub async fn visibility_timeout(&self) -> Result<u32> {
        self.visibility_timeout
            .get_or_try_init(|| async {
                let attributes = self.client.get_queue_attributes(&self.url).await?;
                debug!(
                    queue = %self.name,
                    visibility_timeout = attributes.visibility_timeout,
                    "Cached queue visibility timeout"
                );
                Ok::<u32, QueueError>(attributes.visibility_timeout)
            })
            .await
            .copied()
    }

    pub async fn receive_messages(&self, options: &ReceiveOptions) -> Result<Vec<Message>> {
        let mut options = options.clone();
        options.max_messages = options.max_messages.clamp(1, BATCH_LIMIT);
        self.client.receive_messages(&self.url, &options).await
    }

    pub async fn change_visibility(&self, receipt_handle: &str, visibility_timeout: u32) -> Result<()> {
        self.client
            .change_message_visibility(&self.url, receipt_handle, visibility_timeout)
            .await
    }

    /// Delete messages by receipt handle, in chunks the transport accepts.
    /// Per-entry failures are logged and returned, not raised.
    pub async fn delete_messages(&self, receipt_handles: &[String]) -> Result<DeleteBatchOutcome> {
        let mut outcome = DeleteBatchOutcome::default();

        for (chunk_index, chunk) in receipt_handles.chunks(BATCH_LIMIT).enumerate() {
            let result = self.client.delete_message_batch(&self.url, chunk).await?;
            let offset = chunk_index * BATCH_LIMIT;

            for failure in &result.failed {
                warn!(
                    queue = %self.name,
                    entry = %failure.id,
                    code = %failure.code,
                    error = ?failure.message,
                    "Could not delete message"
                );
            }

            outcome.successful.extend(result.successful.into_iter().map(|id| shift_id(&id, offset)));
            outcome.failed.extend(result.failed.into_iter().map(|mut f| {
                f.id = shift_id(&f.id, offset);
                f
            }));
        }

        Ok(outcome)
    }

    pub async fn send_message(&self, message: impl Into<SendMessage>) -> Result<String> {
        let message = self.sanitize(message.into())?;
        self.client.send_message(&self.url, &message).await
    }

    /// Send several messages; entry ids are their positions ("0", "1", ...)
    pub async fn send_messages<I, M>(&self, messages: I) -> Result<SendBatchOutcome>
    where
        I: IntoIterator<Item = M>,
        M: Into<SendMessage>,
    {
        let entries = messages
            .into_iter()
            .enumerate()
            .map(|(index, message)| {
                Ok(SendMessageEntry {
                    id: index.to_string(),
                    message: self.sanitize(message.into())?,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        if entries.len() > BATCH_LIMIT {
            return Err(QueueError::InvalidMessage(format!(
                "A batch can hold at most {} messages, got {}",
                BATCH_LIMIT,
                entries.len()
            )));
        }

        self.client.send_message_batch(&self.url, &entries).await
    }

    fn sanitize(&self, mut message: SendMessage) -> Result<SendMessage> {
        if let Some(delay) = message.delay_seconds {
            if delay > MAX_DELAY_SECONDS {
                return Err(QueueError::InvalidMessage(
                    "The maximum allowed delay is 15 minutes".to_string(),
                ));
            }
        }

        if self.is_fifo() {
            if message.message_group_id.is_none() {
                message.message_group_id = Some(DEFAULT_MESSAGE_GROUP.to_string());
            }
            if message.message_deduplication_id.is_none() {
                message.message_deduplication_id = Some(uuid::Uuid::new_v4().to_string());
            }
        }

        Ok(message)
    }
}

fn shift_id(id: &str, offset: usize) -> String {
    match id.parse::<usize>() {
        Ok(index) => (index + offset).to_string(),
        Err(_) => id.to_string(),
    }
}
