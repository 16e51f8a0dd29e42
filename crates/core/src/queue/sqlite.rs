//! Durable task queue in SQLite, shareable between processes.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use super::{Delivery, QueueError, TaskQueue};

pub struct SqliteTaskQueue {
    conn: Mutex<Connection>,
    lease: Duration,
}

impl SqliteTaskQueue {
    pub fn new(path: &Path, lease: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease,
        })
    }

    pub fn in_memory(lease: Duration) -> Result<Self, QueueError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            lease,
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), QueueError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS job_tasks (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                job_id TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                leased_until INTEGER,
                delivery_count INTEGER NOT NULL DEFAULT 0
            );

            CREATE INDEX IF NOT EXISTS idx_job_tasks_visible ON job_tasks(visible_at, id);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn millis(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

#[async_trait]
impl TaskQueue for SqliteTaskQueue {
    async fn enqueue(&self, job_id: &str, delay: Duration) -> Result<(), QueueError> {
        let visible_at = Utc::now().timestamp_millis().saturating_add(millis(delay));
        self.conn().execute(
            "INSERT INTO job_tasks (job_id, visible_at) VALUES (?, ?)",
            params![job_id, visible_at],
        )?;
        Ok(())
    }

    async fn dequeue(&self) -> Result<Option<Delivery>, QueueError> {
        let now = Utc::now().timestamp_millis();
        let leased_until = now.saturating_add(millis(self.lease));

        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let next = tx
            .query_row(
                "SELECT id, job_id, delivery_count FROM job_tasks \
                 WHERE visible_at <= ?1 AND (leased_until IS NULL OR leased_until <= ?1) \
                 ORDER BY visible_at ASC, id ASC LIMIT 1",
                params![now],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, u32>(2)?,
                    ))
                },
            )
            .optional()?;

        let Some((task_id, job_id, count)) = next else {
            return Ok(None);
        };

        tx.execute(
            "UPDATE job_tasks SET leased_until = ?, delivery_count = delivery_count + 1 WHERE id = ?",
            params![leased_until, task_id],
        )?;
        tx.commit()?;

        Ok(Some(Delivery {
            task_id,
            job_id,
            delivery_count: count + 1,
        }))
    }

    async fn ack(&self, delivery: &Delivery) -> Result<(), QueueError> {
        self.conn().execute(
            "DELETE FROM job_tasks WHERE id = ?",
            params![delivery.task_id],
        )?;
        Ok(())
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM job_tasks", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;
    use tokio_test::assert_ok;

    #[tokio::test]
    async fn test_enqueue_dequeue_ack() {
        let queue = SqliteTaskQueue::in_memory(Duration::from_secs(60)).unwrap();
        queue.enqueue("job-1", Duration::ZERO).await.unwrap();
        queue.enqueue("job-2", Duration::ZERO).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.job_id, "job-1");
        assert_eq!(first.delivery_count, 1);

        assert_ok!(queue.ack(&first).await);
        assert_eq!(queue.len().await.unwrap(), 1);
        // Acking twice is harmless
        assert_ok!(queue.ack(&first).await);
    }

    #[tokio::test]
    async fn test_leased_task_hidden_until_expiry() {
        let queue = SqliteTaskQueue::in_memory(Duration::ZERO).unwrap();
        queue.enqueue("job-1", Duration::ZERO).await.unwrap();

        let first = queue.dequeue().await.unwrap().unwrap();
        // Zero lease expires immediately
        let second = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(first.task_id, second.task_id);
        assert!(second.is_redelivery());
    }

    #[tokio::test]
    async fn test_lease_blocks_second_consumer() {
        let queue = SqliteTaskQueue::in_memory(Duration::from_secs(60)).unwrap();
        queue.enqueue("job-1", Duration::ZERO).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_some());
        assert!(queue.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_task_not_visible() {
        let queue = SqliteTaskQueue::in_memory(Duration::from_secs(60)).unwrap();
        queue.enqueue("job-1", Duration::from_secs(3600)).await.unwrap();

        assert!(queue.dequeue().await.unwrap().is_none());
        assert_eq!(queue.len().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_shared_file_between_handles() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("queue.db");

        let producer = SqliteTaskQueue::new(&path, Duration::from_secs(60)).unwrap();
        let consumer = SqliteTaskQueue::new(&path, Duration::from_secs(60)).unwrap();

        producer.enqueue("job-1", Duration::ZERO).await.unwrap();
        let delivery = consumer.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.job_id, "job-1");

        assert_ok!(consumer.ack(&delivery).await);
        assert_eq!(producer.len().await.unwrap(), 0);
    }
}
