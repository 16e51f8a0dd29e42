//! Conversion jobs: data model, lifecycle state machine and storage.
//!
//! [`Job::apply`] is the only way status and lifecycle timestamps change.
//! Stores call it inside their own critical section so a transition is a
//! single read-check-write.

mod sqlite_store;
mod state;
mod store;
mod types;

pub use sqlite_store::SqliteJobStore;
pub use state::JobTransition;
pub use store::{CreateJobRequest, JobError, JobFilter, JobStore, JobUpdate};
pub use types::{Job, JobStatus};
