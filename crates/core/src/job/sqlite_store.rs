//! SQLite-backed job store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use uuid::Uuid;

use super::{CreateJobRequest, Job, JobError, JobFilter, JobStatus, JobStore, JobTransition, JobUpdate};

const JOB_COLUMNS: &str = "id, owner, input_filename, output_filename, input_format, output_format, \
     status, progress, file_size, error_message, tool_used, attempts, created_at, started_at, \
     completed_at, updated_at";

/// SQLite-backed job store.
pub struct SqliteJobStore {
    conn: Mutex<Connection>,
}

impl SqliteJobStore {
    /// Open (or create) the database file and its tables.
    pub fn new(path: &Path) -> Result<Self, JobError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, JobError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), JobError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                owner TEXT NOT NULL,
                input_filename TEXT NOT NULL,
                output_filename TEXT NOT NULL,
                input_format TEXT NOT NULL,
                output_format TEXT NOT NULL,
                status TEXT NOT NULL,
                progress INTEGER NOT NULL DEFAULT 0,
                file_size INTEGER NOT NULL,
                error_message TEXT,
                tool_used TEXT,
                attempts INTEGER NOT NULL DEFAULT 0,
                created_at TEXT NOT NULL,
                started_at TEXT,
                completed_at TEXT,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_owner ON jobs(owner);
            CREATE INDEX IF NOT EXISTS idx_jobs_status ON jobs(status);
            CREATE INDEX IF NOT EXISTS idx_jobs_completed_at ON jobs(completed_at);
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn build_where_clause(filter: &JobFilter) -> (String, Vec<Box<dyn rusqlite::ToSql>>) {
        let mut conditions = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            conditions.push("status = ?");
            params.push(Box::new(status.as_str()));
        }

        if let Some(ref owner) = filter.owner {
            conditions.push("owner = ?");
            params.push(Box::new(owner.clone()));
        }

        if let Some(cutoff) = filter.completed_before {
            conditions.push("completed_at IS NOT NULL AND completed_at < ?");
            params.push(Box::new(timestamp(cutoff)));
        }

        let where_clause = if conditions.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", conditions.join(" AND "))
        };

        (where_clause, params)
    }

    fn row_to_job(row: &rusqlite::Row) -> rusqlite::Result<Job> {
        let status_str: String = row.get(6)?;
        let status = status_str.parse::<JobStatus>().map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, e.into())
        })?;
        let file_size: i64 = row.get(8)?;

        Ok(Job {
            id: row.get(0)?,
            owner: row.get(1)?,
            input_filename: row.get(2)?,
            output_filename: row.get(3)?,
            input_format: row.get(4)?,
            output_format: row.get(5)?,
            status,
            progress: row.get(7)?,
            file_size: file_size.max(0) as u64,
            error_message: row.get(9)?,
            tool_used: row.get(10)?,
            attempts: row.get(11)?,
            created_at: parse_timestamp(12, &row.get::<_, String>(12)?)?,
            started_at: row
                .get::<_, Option<String>>(13)?
                .map(|s| parse_timestamp(13, &s))
                .transpose()?,
            completed_at: row
                .get::<_, Option<String>>(14)?
                .map(|s| parse_timestamp(14, &s))
                .transpose()?,
            updated_at: parse_timestamp(15, &row.get::<_, String>(15)?)?,
        })
    }

    fn fetch(conn: &Connection, id: &str) -> Result<Option<Job>, JobError> {
        let sql = format!("SELECT {} FROM jobs WHERE id = ?", JOB_COLUMNS);
        let job = conn
            .query_row(&sql, params![id], Self::row_to_job)
            .optional()?;
        Ok(job)
    }

    /// Persist every mutable column of `job`.
    fn write(conn: &Connection, job: &Job) -> Result<(), JobError> {
        conn.execute(
            "UPDATE jobs SET status = ?, progress = ?, error_message = ?, tool_used = ?, \
             attempts = ?, started_at = ?, completed_at = ?, updated_at = ? WHERE id = ?",
            params![
                job.status.as_str(),
                job.progress,
                job.error_message,
                job.tool_used,
                job.attempts,
                job.started_at.map(timestamp),
                job.completed_at.map(timestamp),
                timestamp(job.updated_at),
                job.id,
            ],
        )?;
        Ok(())
    }
}

/// Fixed-width UTC timestamps so that string comparison in SQL orders correctly.
fn timestamp(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(idx: usize, s: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, e.into())
        })
}

impl JobStore for SqliteJobStore {
    fn create(&self, request: CreateJobRequest) -> Result<Job, JobError> {
        let conn = self.conn();

        let now = Utc::now();
        let job = Job {
            id: Uuid::new_v4().to_string(),
            owner: request.owner,
            output_filename: Job::output_filename_for(
                &request.input_filename,
                &request.output_format,
            ),
            input_filename: request.input_filename,
            input_format: request.input_format,
            output_format: request.output_format,
            status: JobStatus::Pending,
            progress: 0,
            file_size: request.file_size,
            error_message: None,
            tool_used: None,
            attempts: 0,
            created_at: now,
            started_at: None,
            completed_at: None,
            updated_at: now,
        };

        conn.execute(
            &format!(
                "INSERT INTO jobs ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                JOB_COLUMNS
            ),
            params![
                job.id,
                job.owner,
                job.input_filename,
                job.output_filename,
                job.input_format,
                job.output_format,
                job.status.as_str(),
                job.progress,
                job.file_size as i64,
                job.error_message,
                job.tool_used,
                job.attempts,
                timestamp(job.created_at),
                Option::<String>::None,
                Option::<String>::None,
                timestamp(job.updated_at),
            ],
        )?;

        Ok(job)
    }

    fn get(&self, id: &str) -> Result<Option<Job>, JobError> {
        let conn = self.conn();
        Self::fetch(&conn, id)
    }

    fn update(&self, id: &str, update: JobUpdate) -> Result<Job, JobError> {
        let mut conn = self.conn();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut job = Self::fetch(&tx, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
        let mut changed = false;
        if let Some(progress) = update.progress {
            changed |= job.record_progress(progress, Utc::now())?;
        }

        if changed {
            Self::write(&tx, &job)?;
        }
        tx.commit()?;
        Ok(job)
    }

    fn transition(&self, id: &str, transition: JobTransition) -> Result<Job, JobError> {
        let mut conn = self.conn();
        // IMMEDIATE takes the write lock up front so another process sharing
        // the file cannot interleave between the read and the write.
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let mut job = Self::fetch(&tx, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
        job.apply(transition, Utc::now())?;
        Self::write(&tx, &job)?;
        tx.commit()?;

        Ok(job)
    }

    fn delete(&self, id: &str) -> Result<Job, JobError> {
        let conn = self.conn();

        let job = Self::fetch(&conn, id)?.ok_or_else(|| JobError::NotFound(id.to_string()))?;
        conn.execute("DELETE FROM jobs WHERE id = ?", params![id])?;

        Ok(job)
    }

    fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        let conn = self.conn();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!(
            "SELECT {} FROM jobs {} ORDER BY created_at DESC, id ASC LIMIT ? OFFSET ?",
            JOB_COLUMNS, where_clause
        );

        let mut stmt = conn.prepare(&sql)?;

        let mut all_params = params;
        all_params.push(Box::new(filter.limit));
        all_params.push(Box::new(filter.offset));
        let param_refs: Vec<&dyn rusqlite::ToSql> = all_params.iter().map(|p| p.as_ref()).collect();

        let rows = stmt.query_map(param_refs.as_slice(), Self::row_to_job)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?);
        }
        Ok(jobs)
    }

    fn count(&self, filter: &JobFilter) -> Result<i64, JobError> {
        let conn = self.conn();

        let (where_clause, params) = Self::build_where_clause(filter);
        let sql = format!("SELECT COUNT(*) FROM jobs {}", where_clause);
        let param_refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|p| p.as_ref()).collect();

        let count = conn.query_row(&sql, param_refs.as_slice(), |row| row.get(0))?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_store() -> SqliteJobStore {
        SqliteJobStore::in_memory().unwrap()
    }

    fn request(owner: &str) -> CreateJobRequest {
        CreateJobRequest {
            owner: owner.to_string(),
            input_filename: "song.wav".to_string(),
            input_format: "wav".to_string(),
            output_format: "mp3".to_string(),
            file_size: 4096,
        }
    }

    #[test]
    fn test_create_job() {
        let store = create_test_store();
        let job = store.create(request("alice")).unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.output_filename, "song.mp3");
        assert_eq!(job.progress, 0);
        assert_eq!(job.attempts, 0);
        assert!(Uuid::parse_str(&job.id).is_ok());
    }

    #[test]
    fn test_get_job() {
        let store = create_test_store();
        let created = store.create(request("alice")).unwrap();
        let fetched = store.get(&created.id).unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.file_size, 4096);
        assert_eq!(fetched.status, JobStatus::Pending);
    }

    #[test]
    fn test_get_nonexistent_job() {
        let store = create_test_store();
        assert!(store.get("missing").unwrap().is_none());
    }

    #[test]
    fn test_transition_persists() {
        let store = create_test_store();
        let job = store.create(request("alice")).unwrap();

        store.transition(&job.id, JobTransition::Start).unwrap();
        let done = store
            .transition(
                &job.id,
                JobTransition::Complete {
                    tool_used: "ffmpeg".to_string(),
                },
            )
            .unwrap();
        assert_eq!(done.status, JobStatus::Completed);

        let fetched = store.get(&job.id).unwrap().unwrap();
        assert_eq!(fetched.status, JobStatus::Completed);
        assert_eq!(fetched.progress, 100);
        assert_eq!(fetched.tool_used.as_deref(), Some("ffmpeg"));
        assert!(fetched.started_at.is_some());
        assert!(fetched.completed_at.is_some());
    }

    #[test]
    fn test_duplicate_start_rejected() {
        let store = create_test_store();
        let job = store.create(request("alice")).unwrap();

        store.transition(&job.id, JobTransition::Start).unwrap();
        let err = store.transition(&job.id, JobTransition::Start).unwrap_err();
        assert!(err.is_state_conflict());
    }

    #[test]
    fn test_transition_nonexistent_job() {
        let store = create_test_store();
        let err = store.transition("missing", JobTransition::Cancel).unwrap_err();
        assert!(matches!(err, JobError::NotFound(_)));
    }

    #[test]
    fn test_update_progress() {
        let store = create_test_store();
        let job = store.create(request("alice")).unwrap();

        // Progress is only recorded while processing
        assert!(store.update(&job.id, JobUpdate::progress(10)).is_err());

        store.transition(&job.id, JobTransition::Start).unwrap();
        store.update(&job.id, JobUpdate::progress(42)).unwrap();
        store.update(&job.id, JobUpdate::progress(12)).unwrap();

        let fetched = store.get(&job.id).unwrap().unwrap();
        assert_eq!(fetched.progress, 42);
    }

    #[test]
    fn test_list_with_filters() {
        let store = create_test_store();
        let a = store.create(request("alice")).unwrap();
        store.create(request("alice")).unwrap();
        store.create(request("bob")).unwrap();
        store.transition(&a.id, JobTransition::Cancel).unwrap();

        assert_eq!(store.list(&JobFilter::new()).unwrap().len(), 3);
        assert_eq!(
            store.list(&JobFilter::new().with_owner("alice")).unwrap().len(),
            2
        );
        let cancelled = store
            .list(&JobFilter::new().with_status(JobStatus::Cancelled))
            .unwrap();
        assert_eq!(cancelled.len(), 1);
        assert_eq!(cancelled[0].id, a.id);
    }

    #[test]
    fn test_list_pagination() {
        let store = create_test_store();
        for _ in 0..5 {
            store.create(request("alice")).unwrap();
        }

        let page1 = store.list(&JobFilter::new().with_limit(2)).unwrap();
        let page2 = store
            .list(&JobFilter::new().with_limit(2).with_offset(2))
            .unwrap();
        assert_eq!(page1.len(), 2);
        assert_eq!(page2.len(), 2);
        assert!(page1.iter().all(|j| page2.iter().all(|k| k.id != j.id)));
    }

    #[test]
    fn test_completed_before_filter() {
        let store = create_test_store();
        let old = store.create(request("alice")).unwrap();
        let pending = store.create(request("alice")).unwrap();
        store.transition(&old.id, JobTransition::Cancel).unwrap();

        let future = Utc::now() + chrono::Duration::seconds(60);
        let past = Utc::now() - chrono::Duration::days(1);

        let expired = store
            .list(&JobFilter::new().with_completed_before(future))
            .unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, old.id);
        assert_ne!(expired[0].id, pending.id);

        assert_eq!(
            store
                .count(&JobFilter::new().with_completed_before(past))
                .unwrap(),
            0
        );
    }

    #[test]
    fn test_count_jobs() {
        let store = create_test_store();
        store.create(request("alice")).unwrap();
        store.create(request("bob")).unwrap();

        assert_eq!(store.count(&JobFilter::new()).unwrap(), 2);
        assert_eq!(store.count(&JobFilter::new().with_owner("bob")).unwrap(), 1);
    }

    #[test]
    fn test_delete_job() {
        let store = create_test_store();
        let job = store.create(request("alice")).unwrap();

        let deleted = store.delete(&job.id).unwrap();
        assert_eq!(deleted.id, job.id);
        assert!(store.get(&job.id).unwrap().is_none());
        assert!(matches!(
            store.delete(&job.id).unwrap_err(),
            JobError::NotFound(_)
        ));
    }

    #[test]
    fn test_corrupt_timestamp_is_an_error() {
        let store = create_test_store();
        let job = store.create(request("alice")).unwrap();
        store
            .conn()
            .execute(
                "UPDATE jobs SET created_at = 'yesterday' WHERE id = ?",
                params![job.id],
            )
            .unwrap();

        assert!(matches!(store.get(&job.id), Err(JobError::Database(_))));
    }

    #[test]
    fn test_file_based_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("jobs.db");

        let id = {
            let store = SqliteJobStore::new(&path).unwrap();
            store.create(request("alice")).unwrap().id
        };

        let store = SqliteJobStore::new(&path).unwrap();
        let job = store.get(&id).unwrap().unwrap();
        assert_eq!(job.owner, "alice");
    }
}
