//! Task queue carrying job ids from admission to the worker pool.
//!
//! Delivery is at-least-once. A dequeued task is leased; unless it is acked
//! before the lease expires it becomes visible again. Consumers must
//! therefore tolerate seeing the same job id more than once.

mod memory;
mod sqlite;

pub use memory::MemoryTaskQueue;
pub use sqlite::SqliteTaskQueue;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// A leased task handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Queue-internal task id, used to ack.
    pub task_id: i64,
    pub job_id: String,
    /// How many times this task has been handed out, including this one.
    pub delivery_count: u32,
}

impl Delivery {
    pub fn is_redelivery(&self) -> bool {
        self.delivery_count > 1
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),
}

impl From<rusqlite::Error> for QueueError {
    fn from(e: rusqlite::Error) -> Self {
        QueueError::Backend(e.to_string())
    }
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    /// Enqueue a job id, visible to consumers after `delay`.
    async fn enqueue(&self, job_id: &str, delay: Duration) -> Result<(), QueueError>;

    /// Take the next visible task, if any. Never blocks waiting for work.
    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError>;

    /// Acknowledge a delivery, removing its task permanently.
    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError>;

    /// Number of tasks not yet acked, leased or not.
    async fn len(&self) -> Result<usize, QueueError>;

    async fn is_empty(&self) -> Result<bool, QueueError> {
        Ok(self.len().await? == 0)
    }
}
