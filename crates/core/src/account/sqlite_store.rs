//! SQLite-backed account store.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};

use super::{AccountError, AccountStore, StorageAccount};

pub struct SqliteAccountStore {
    conn: Mutex<Connection>,
}

impl SqliteAccountStore {
    pub fn new(path: &Path) -> Result<Self, AccountError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, AccountError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), AccountError> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS storage_accounts (
                owner TEXT PRIMARY KEY,
                quota_bytes INTEGER NOT NULL,
                used_bytes INTEGER NOT NULL DEFAULT 0
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn fetch(conn: &Connection, owner: &str) -> Result<Option<StorageAccount>, AccountError> {
        let account = conn
            .query_row(
                "SELECT owner, quota_bytes, used_bytes FROM storage_accounts WHERE owner = ?",
                params![owner],
                |row| {
                    let quota: i64 = row.get(1)?;
                    let used: i64 = row.get(2)?;
                    Ok(StorageAccount {
                        owner: row.get(0)?,
                        quota_bytes: quota.max(0) as u64,
                        used_bytes: used.max(0) as u64,
                    })
                },
            )
            .optional()?;
        Ok(account)
    }
}

fn to_sql_bytes(bytes: u64) -> i64 {
    i64::try_from(bytes).unwrap_or(i64::MAX)
}

impl AccountStore for SqliteAccountStore {
    fn get_or_create(&self, owner: &str, default_quota: u64) -> Result<StorageAccount, AccountError> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO storage_accounts (owner, quota_bytes, used_bytes) VALUES (?, ?, 0)",
            params![owner, to_sql_bytes(default_quota)],
        )?;
        Self::fetch(&conn, owner)?.ok_or_else(|| AccountError::NotFound(owner.to_string()))
    }

    fn get(&self, owner: &str) -> Result<Option<StorageAccount>, AccountError> {
        let conn = self.conn();
        Self::fetch(&conn, owner)
    }

    fn set_quota(&self, owner: &str, quota_bytes: u64) -> Result<StorageAccount, AccountError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE storage_accounts SET quota_bytes = ? WHERE owner = ?",
            params![to_sql_bytes(quota_bytes), owner],
        )?;
        if changed == 0 {
            return Err(AccountError::NotFound(owner.to_string()));
        }
        Self::fetch(&conn, owner)?.ok_or_else(|| AccountError::NotFound(owner.to_string()))
    }

    fn add_usage(&self, owner: &str, bytes: u64) -> Result<StorageAccount, AccountError> {
        let conn = self.conn();
        let changed = conn.execute(
            "UPDATE storage_accounts SET used_bytes = MIN(used_bytes + ?, 9223372036854775807) WHERE owner = ?",
            params![to_sql_bytes(bytes), owner],
        )?;
        if changed == 0 {
            return Err(AccountError::NotFound(owner.to_string()));
        }
        Self::fetch(&conn, owner)?.ok_or_else(|| AccountError::NotFound(owner.to_string()))
    }
}
