use serde::{Deserialize, Serialize};

use crate::job::{Job, JobFilter};

/// Identity on whose behalf an operation runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requester {
    pub user_id: String,
    pub admin: bool,
}

impl Requester {
    pub fn user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: false,
        }
    }

    pub fn admin(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            admin: true,
        }
    }

    pub fn can_access(&self, job: &Job) -> bool {
        self.admin || job.owner == self.user_id
    }

    /// Restrict a listing to what this requester may see.
    pub fn scope(&self, filter: JobFilter) -> JobFilter {
        if self.admin {
            filter
        } else {
            filter.with_owner(self.user_id.clone())
        }
    }
}
