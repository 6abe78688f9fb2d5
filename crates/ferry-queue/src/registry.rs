//! Process-wide queue handle cache.
//!
//! One [`Queue`] per name, created on first reference. Racing first callers
//! share a single `get_queue_url` lookup; a failed lookup is not cached.

use std::sync::Arc;
use dashmap::DashMap;
use tokio::sync::OnceCell;

use crate::{Queue, QueueClient, Result};

pub struct QueueRegistry {
    client: Arc<dyn QueueClient>,
    queues: DashMap<String, Arc<OnceCell<Arc<Queue>>>>,
}

impl QueueRegistry {
    pub fn new(client: Arc<dyn QueueClient>) -> Self {
        Self {
            client,
            queues: DashMap::new(),
        }
    }

    pub fn client(&self) -> &Arc<dyn QueueClient> {
        &self.client
    }

    /// Get the handle for `name`, resolving it on first use.
    pub async fn queue(&self, name: &str) -> Result<Arc<Queue>> {
        // Clone the cell out so the map shard lock is not held across the lookup
        let cell = self
            .queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(OnceCell::new()))
            .clone();

        cell.get_or_try_init(|| async {
            Queue::resolve(self.client.clone(), name).await.map(Arc::new)
        })
        .await
        .cloned()
    }

    /// Handle for `name` if it has already been resolved
    pub fn cached(&self, name: &str) -> Option<Arc<Queue>> {
        self.queues.get(name).and_then(|cell| cell.get().cloned())
    }

    pub fn len(&self) -> usize {
        self.queues.iter().filter(|entry| entry.value().initialized()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
