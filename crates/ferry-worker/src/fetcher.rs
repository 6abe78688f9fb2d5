use tracing::{debug, error, warn};

use ferry_common::{Message, BATCH_LIMIT};
use ferry_queue::{Queue, ReceiveOptions};
use crate::metrics;

/// Bounded receive from one queue. Transport errors are logged and reported
/// as an empty fetch; the dispatcher retries on a later cycle.
#[derive(Debug, Clone, Default)]
pub struct Fetcher {
    wait_time_seconds: Option<i32>,
}

impl Fetcher {
    pub fn new(wait_time_seconds: Option<i32>) -> Self {
        Self { wait_time_seconds }
    }

    pub async fn fetch(&self, queue: &Queue, limit: usize) -> Vec<Message> {
        let limit = limit.clamp(1, BATCH_LIMIT);
        debug!(queue = %queue.name(), limit, "Looking for new messages");

        let options = ReceiveOptions::new(limit).with_wait_time_seconds(self.wait_time_seconds);
        match queue.receive_messages(&options).await {
            Ok(messages) => {
                if !messages.is_empty() {
                    debug!(queue = %queue.name(), count = messages.len(), "Found messages");
                    metrics::record_messages_fetched(queue.name(), messages.len());
                }
                messages
            }
            Err(e) if e.is_transient() => {
                warn!(queue = %queue.name(), error = %e, "Error fetching messages, retrying next cycle");
                Vec::new()
            }
            Err(e) => {
                error!(queue = %queue.name(), error = %e, "Error fetching messages");
                Vec::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_queue::memory::InMemoryQueueClient;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_fetch_respects_limit() {
        let client = Arc::new(InMemoryQueueClient::new());
        client.create_queue("default", 30);
        for i in 0..5 {
            client.push("default", i.to_string()).unwrap();
        }
        let queue = Queue::resolve(client.clone(), "default").await.unwrap();

        let fetcher = Fetcher::default();
        assert_eq!(fetcher.fetch(&queue, 3).await.len(), 3);
        assert_eq!(fetcher.fetch(&queue, 0).await.len(), 1);
    }

    #[tokio::test]
    async fn test_fetch_error_is_empty() {
        let client = Arc::new(InMemoryQueueClient::new());
        let queue = Queue::new(client, "gone", "memory://gone");

        assert!(Fetcher::default().fetch(&queue, 10).await.is_empty());
    }
}
