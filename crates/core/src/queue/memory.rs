//! In-process task queue.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{Delivery, QueueError, TaskQueue};

#[derive(Debug)]
struct Task {
    id: i64,
    job_id: String,
    visible_at: Instant,
    leased_until: Option<Instant>,
    delivery_count: u32,
}

impl Task {
    fn is_available(&self, now: Instant) -> bool {
        self.visible_at <= now && self.leased_until.is_none_or(|until| until <= now)
    }
}

#[derive(Debug, Default)]
struct Inner {
    next_id: i64,
    tasks: Vec<Task>,
}

/// Task queue held in memory, for single-process use and tests.
#[derive(Debug)]
pub struct MemoryTaskQueue {
    lease: Duration,
    inner: Mutex<Inner>,
}

impl MemoryTaskQueue {
    pub fn new(lease: Duration) -> Self {
        Self {
            lease,
            inner: Mutex::new(Inner::default()),
        }
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Expire every outstanding lease, as if all consumers had crashed
    /// before acking. Returns the number of tasks made visible again.
    pub fn redeliver(&self) -> usize {
        let mut inner = self.inner();
        let mut count = 0;
        for task in inner.tasks.iter_mut() {
            if task.leased_until.take().is_some() {
                count += 1;
            }
        }
        count
    }

    /// Job ids of all unacked tasks, in enqueue order.
    pub fn job_ids(&self) -> Vec<String> {
        self.inner().tasks.iter().map(|t| t.job_id.clone()).collect()
    }
}

impl Default for MemoryTaskQueue {
    fn default() -> Self {
        Self::new(Duration::from_secs(360))
    }
}

#[async_trait]
impl TaskQueue for MemoryTaskQueue {
    async fn enqueue(&self, job_id: &str, delay: Duration) -> Result<(), QueueError> {
        let mut inner = self.inner();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.tasks.push(Task {
            id,
            job_id: job_id.to_string(),
            visible_at: Instant::now() + delay,
            leased_until: None,
            delivery_count: 0,
        });
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Instant::now();
        let lease = self.lease;
        let mut inner = self.inner();

        let next = inner
            .tasks
            .iter_mut()
            .filter(|t| t.is_available(now))
            .min_by_key(|t| (t.visible_at, t.id));

        Ok(next.map(|task| {
            task.leased_until = Some(now + lease);
            task.delivery_count += 1;
            Delivery {
                task_id: task.id,
                job_id: task.job_id.clone(),
                delivery_count: task.delivery_count,
            }
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.inner().tasks.retain(|t| t.id != delivery.task_id);
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.inner().tasks.len())
    }
}
