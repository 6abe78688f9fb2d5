//! Visibility heartbeat for long-running units.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error};

use ferry_common::Unit;
use ferry_queue::Queue;
use crate::metrics;

/// Seconds subtracted from the queue's visibility timeout to get the default heartbeat
pub const HEARTBEAT_MARGIN_SECS: u32 = 5;

/// Default heartbeat: the visibility timeout minus the margin, at least one second
pub fn default_heartbeat(visibility_timeout: u32) -> Duration {
    Duration::from_secs(visibility_timeout.saturating_sub(HEARTBEAT_MARGIN_SECS).max(1) as u64)
}

/// A repeating timer that renews the visibility of every message of one unit.
///
/// The timer is aborted when the handle is dropped.
pub struct VisibilityExtender {
    handle: JoinHandle<()>,
    cancelled: Arc<RwLock<bool>>,
}

impl VisibilityExtender {
    pub fn start(queue: Arc<Queue>, unit: &Unit, interval: Duration, new_timeout: u32) -> Self {
        let cancelled = Arc::new(RwLock::new(false));
        let receipts: Vec<(String, String)> = unit
            .messages()
            .iter()
            .map(|m| (m.message_id.clone(), m.receipt_handle.clone()))
            .collect();
        let unit_id = unit.id().to_string();

        let flag = cancelled.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                // Held for the whole tick so cancel() waits for it to finish
                let cancelled = flag.read().await;
                if *cancelled {
                    break;
                }

                debug!(
                    queue = %queue.name(),
                    unit_id = %unit_id,
                    visibility_timeout = new_timeout,
                    "Extending message visibility timeout"
                );

                for (message_id, receipt_handle) in &receipts {
                    match queue.change_visibility(receipt_handle, new_timeout).await {
                        Ok(()) => metrics::record_visibility_extended(queue.name()),
                        Err(e) => error!(
                            queue = %queue.name(),
                            message_id = %message_id,
                            error = %e,
                            "Could not auto extend the message visibility timeout"
                        ),
                    }
                }
            }
        });

        Self { handle, cancelled }
    }

    /// Stop the timer. Once this returns no tick is running and none will start.
    pub async fn cancel(self) {
        let mut cancelled = self.cancelled.write().await;
        *cancelled = true;
        drop(cancelled);
        self.handle.abort();
    }
}

impl Drop for VisibilityExtender {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_queue::memory::InMemoryQueueClient;
    use ferry_queue::{QueueRegistry, ReceiveOptions};

    #[test]
    fn test_default_heartbeat() {
        assert_eq!(default_heartbeat(30), Duration::from_secs(25));
        assert_eq!(default_heartbeat(5), Duration::from_secs(1));
        assert_eq!(default_heartbeat(0), Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ticks_until_cancelled() {
        let client = Arc::new(InMemoryQueueClient::new());
        client.create_queue("default", 30);
        client.push("default", "work").unwrap();
        let registry = QueueRegistry::new(client.clone());
        let queue = registry.queue("default").await.unwrap();

        let messages = queue.receive_messages(&ReceiveOptions::new(1)).await.unwrap();
        let unit = Unit::single(messages[0].clone());

        let extender = VisibilityExtender::start(queue.clone(), &unit, Duration::from_secs(25), 30);

        tokio::time::sleep(Duration::from_secs(24)).await;
        assert!(client.visibility_changes().is_empty());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(client.visibility_changes().len(), 1);
        assert_eq!(client.visibility_changes()[0].visibility_timeout, 30);

        tokio::time::sleep(Duration::from_secs(25)).await;
        assert_eq!(client.visibility_changes().len(), 2);

        extender.cancel().await;
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert_eq!(client.visibility_changes().len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_aborts_timer() {
        let client = Arc::new(InMemoryQueueClient::new());
        client.create_queue("default", 30);
        client.push("default", "work").unwrap();
        let registry = QueueRegistry::new(client.clone());
        let queue = registry.queue("default").await.unwrap();
        let messages = queue.receive_messages(&ReceiveOptions::new(1)).await.unwrap();

        let extender =
            VisibilityExtender::start(queue.clone(), &Unit::single(messages[0].clone()), Duration::from_secs(1), 30);
        drop(extender);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(client.visibility_changes().is_empty());
    }
}
