//! Per-user storage accounting.
//!
//! Admission compares an account's `used_bytes + file_size` against its
//! quota; completed conversions grow `used_bytes` by the output size.

mod sqlite_store;

pub use sqlite_store::SqliteAccountStore;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Storage ledger entry for one user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageAccount {
    pub owner: String,
    pub quota_bytes: u64,
    pub used_bytes: u64,
}

impl StorageAccount {
    /// Bytes still available before the quota is reached.
    pub fn remaining_bytes(&self) -> u64 {
        self.quota_bytes.saturating_sub(self.used_bytes)
    }

    /// Whether an additional `bytes` would still fit in the quota.
    pub fn can_store(&self, bytes: u64) -> bool {
        self.used_bytes
            .checked_add(bytes)
            .is_some_and(|total| total <= self.quota_bytes)
    }
}

#[derive(Debug, Error)]
pub enum AccountError {
    #[error("account not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(String),
}

impl From<rusqlite::Error> for AccountError {
    fn from(e: rusqlite::Error) -> Self {
        AccountError::Database(e.to_string())
    }
}

/// Trait for account storage backends.
pub trait AccountStore: Send + Sync {
    /// Fetch the account, creating it with `default_quota` if absent.
    fn get_or_create(&self, owner: &str, default_quota: u64) -> Result<StorageAccount, AccountError>;

    fn get(&self, owner: &str) -> Result<Option<StorageAccount>, AccountError>;

    fn set_quota(&self, owner: &str, quota_bytes: u64) -> Result<StorageAccount, AccountError>;

    /// Add to the account's used bytes. Usage is never decreased.
    fn add_usage(&self, owner: &str, bytes: u64) -> Result<StorageAccount, AccountError>;
}
