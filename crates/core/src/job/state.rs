//! Job lifecycle state machine.
//!
//! ```text
//! pending ──Start──▶ processing ──Complete──▶ completed
//!    ▲                  │   │
//!    └──────Retry───────┘   └──Fail──▶ failed
//! pending | processing ──Cancel──▶ cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::store::JobError;
use super::types::{Job, JobStatus};

/// A requested status change.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobTransition {
    /// A worker acquired a slot and begins executing.
    Start,
    /// The adapter produced a valid output.
    Complete { tool_used: String },
    /// The adapter failed and the retry budget allows another attempt.
    Retry {
        error: String,
        tool_used: Option<String>,
    },
    /// The adapter failed and the retry budget is exhausted.
    Fail {
        error: String,
        tool_used: Option<String>,
    },
    /// External cancellation request.
    Cancel,
}

impl JobTransition {
    pub fn name(&self) -> &'static str {
        match self {
            JobTransition::Start => "start",
            JobTransition::Complete { .. } => "complete",
            JobTransition::Retry { .. } => "retry",
            JobTransition::Fail { .. } => "fail",
            JobTransition::Cancel => "cancel",
        }
    }

    /// Status the job must be in for this transition to apply.
    fn allowed_from(&self, status: JobStatus) -> bool {
        match self {
            JobTransition::Start => status == JobStatus::Pending,
            JobTransition::Complete { .. }
            | JobTransition::Retry { .. }
            | JobTransition::Fail { .. } => status == JobStatus::Processing,
            JobTransition::Cancel => status.can_cancel(),
        }
    }

    /// Status the job ends up in.
    pub fn target(&self) -> JobStatus {
        match self {
            JobTransition::Start => JobStatus::Processing,
            JobTransition::Complete { .. } => JobStatus::Completed,
            JobTransition::Retry { .. } => JobStatus::Pending,
            JobTransition::Fail { .. } => JobStatus::Failed,
            JobTransition::Cancel => JobStatus::Cancelled,
        }
    }
}

impl Job {
    /// Applies a transition, or fails with [`JobError::InvalidTransition`]
    /// leaving the job untouched.
    pub fn apply(&mut self, transition: JobTransition, now: DateTime<Utc>) -> Result<(), JobError> {
        if !transition.allowed_from(self.status) {
            return Err(JobError::InvalidTransition {
                job_id: self.id.clone(),
                from: self.status,
                transition: transition.name(),
            });
        }

        self.status = transition.target();
        self.updated_at = now;

        match transition {
            JobTransition::Start => {
                self.started_at = Some(now);
                self.progress = 0;
            }
            JobTransition::Complete { tool_used } => {
                self.progress = 100;
                self.tool_used = Some(tool_used);
                self.error_message = None;
                self.completed_at = Some(now);
            }
            JobTransition::Retry { error, tool_used } => {
                self.attempts += 1;
                self.progress = 0;
                self.started_at = None;
                self.error_message = Some(error);
                if tool_used.is_some() {
                    self.tool_used = tool_used;
                }
            }
            JobTransition::Fail { error, tool_used } => {
                self.attempts += 1;
                self.error_message = Some(error);
                if tool_used.is_some() {
                    self.tool_used = tool_used;
                }
                self.completed_at = Some(now);
            }
            JobTransition::Cancel => {
                self.completed_at = Some(now);
            }
        }

        Ok(())
    }

    /// Records execution progress. Values are clamped below 100 (reserved for
    /// completion) and never move backwards. Returns whether the stored value
    /// changed.
    pub fn record_progress(&mut self, percent: u8, now: DateTime<Utc>) -> Result<bool, JobError> {
        if self.status != JobStatus::Processing {
            return Err(JobError::InvalidState {
                job_id: self.id.clone(),
                status: self.status,
                operation: "record progress",
            });
        }

        let percent = percent.min(99);
        if percent <= self.progress {
            return Ok(false);
        }

        self.progress = percent;
        self.updated_at = now;
        Ok(true)
    }
}
