//! Per-job cancellation tokens for in-flight executions.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio_util::sync::CancellationToken;

type Tokens = Arc<Mutex<HashMap<String, CancellationToken>>>;

/// Tokens of the jobs currently executing in this process.
#[derive(Debug, Clone, Default)]
pub struct CancellationRegistry {
    tokens: Tokens,
}

/// Keeps a job's token registered; unregisters on drop.
#[derive(Debug)]
pub struct CancellationGuard {
    job_id: String,
    token: CancellationToken,
    tokens: Tokens,
}

impl CancellationGuard {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }
}

impl Drop for CancellationGuard {
    fn drop(&mut self) {
        lock(&self.tokens).remove(&self.job_id);
    }
}

fn lock(tokens: &Tokens) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
    tokens.lock().unwrap_or_else(PoisonError::into_inner)
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the job as executing here. Returns `None` if it already is.
    pub fn claim(&self, job_id: &str) -> Option<CancellationGuard> {
        let token = CancellationToken::new();
        let mut tokens = lock(&self.tokens);
        if tokens.contains_key(job_id) {
            return None;
        }
        tokens.insert(job_id.to_string(), token.clone());
        Some(CancellationGuard {
            job_id: job_id.to_string(),
            token,
            tokens: self.tokens.clone(),
        })
    }

    /// Cancel the job's execution if it runs here. Returns whether it did.
    pub fn cancel(&self, job_id: &str) -> bool {
        match lock(&self.tokens).get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        lock(&self.tokens).contains_key(job_id)
    }

    pub fn active(&self) -> usize {
        lock(&self.tokens).len()
    }
}
