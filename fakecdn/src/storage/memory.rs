use std::collections::{BTreeSet, HashSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use super::{RecordFilter, Storage, StorageError};
use crate::types::{LogRecord, TimeRange};

type RecordKey = (DateTime<Utc>, String, String);

#[derive(Debug, Default)]
struct Inner {
    records: Vec<LogRecord>,
    keys: HashSet<RecordKey>,
}

/// In-process store.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    inner: RwLock<Inner>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn append(&self, records: &[LogRecord]) -> Result<u64, StorageError> {
        let mut inner = self.inner.write().await;
        let mut inserted = 0;
        for record in records {
            let key = (record.timestamp, record.domain.clone(), record.region.clone());
            if inner.keys.insert(key) {
                inner.records.push(record.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn query(&self, range: TimeRange, filter: &RecordFilter) -> Result<Vec<LogRecord>, StorageError> {
        let inner = self.inner.read().await;
        let mut out: Vec<LogRecord> = inner
            .records
            .iter()
            .filter(|r| range.contains(r.timestamp) && filter.matches(r))
            .cloned()
            .collect();
        out.sort_by_key(|r| r.timestamp);
        Ok(out)
    }

    async fn max_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        Ok(self.inner.read().await.records.iter().map(|r| r.timestamp).max())
    }

    async fn record_count(&self) -> Result<u64, StorageError> {
        Ok(self.inner.read().await.records.len() as u64)
    }

    async fn domains(&self) -> Result<Vec<String>, StorageError> {
        let inner = self.inner.read().await;
        let domains: BTreeSet<&String> = inner.records.iter().map(|r| &r.domain).collect();
        Ok(domains.into_iter().cloned().collect())
    }
}
