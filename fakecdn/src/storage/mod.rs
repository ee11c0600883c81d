//! Record persistence.
//!
//! The [`Storage`] trait is what the scheduler and validator see. Two implementations ship:
//! [`SqliteStorage`] for on-disk runs (and real-time resumption across restarts) and
//! [`MemoryStorage`] for runs with persistence disabled and for tests.
//!
//! Appends are idempotent per `(timestamp, domain, region)`: re-appending a record that is
//! already stored leaves the stored one untouched.

pub mod memory;
pub mod sqlite;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::config::StorageConfig;
use crate::types::{LogRecord, TimeRange};

pub use memory::MemoryStorage;
pub use sqlite::SqliteStorage;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("Storage I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A stored row could not be turned back into a record
    #[error("Corrupt record: {0}")]
    Corrupt(String),
}

/// Optional narrowing of a range query.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecordFilter {
    pub domain: Option<String>,
    pub region: Option<String>,
}

impl RecordFilter {
    pub fn domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            region: None,
        }
    }

    pub fn region(region: impl Into<String>) -> Self {
        Self {
            domain: None,
            region: Some(region.into()),
        }
    }

    pub fn matches(&self, record: &LogRecord) -> bool {
        self.domain.as_deref().is_none_or(|d| d == record.domain)
            && self.region.as_deref().is_none_or(|r| r == record.region)
    }
}

#[async_trait]
pub trait Storage: Send + Sync {
    /// Persist records atomically. Returns how many were newly stored.
    async fn append(&self, records: &[LogRecord]) -> Result<u64, StorageError>;

    /// Records with timestamps in `range`, ordered by timestamp.
    async fn query(&self, range: TimeRange, filter: &RecordFilter) -> Result<Vec<LogRecord>, StorageError>;

    /// Latest stored interval start, if any record exists.
    async fn max_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError>;

    async fn record_count(&self) -> Result<u64, StorageError>;

    /// Distinct domains, sorted.
    async fn domains(&self) -> Result<Vec<String>, StorageError>;
}

/// Open the configured store: SQLite when persistence is enabled, memory otherwise.
pub async fn open(config: &StorageConfig) -> Result<Arc<dyn Storage>, StorageError> {
    if config.enabled {
        Ok(Arc::new(SqliteStorage::connect(&config.url).await?))
    } else {
        Ok(Arc::new(MemoryStorage::new()))
    }
}
