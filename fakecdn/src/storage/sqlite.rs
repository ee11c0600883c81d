use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{FromRow, QueryBuilder, Sqlite};
use tracing::{debug, info, instrument};

use super::{RecordFilter, Storage, StorageError};
use crate::anomaly::AnomalyKind;
use crate::types::{LogRecord, StatusDistribution, TimeRange};

/// Rows per INSERT statement, 19 binds each, well under SQLite's variable limit.
const INSERT_CHUNK: usize = 500;

/// Run the embedded migrations.
pub fn migrator() -> sqlx::migrate::Migrator {
    sqlx::migrate!("./migrations")
}

/// SQLite-backed store.
#[derive(Clone, Debug)]
pub struct SqliteStorage {
    pool: SqlitePool,
}

#[derive(Debug, FromRow)]
struct LogRow {
    start_time: i64,
    tenant_id: String,
    domain: String,
    region: String,
    country: String,
    interval_secs: i64,
    bandwidth_bps: f64,
    traffic_bytes: i64,
    request_count: i64,
    cache_hit_rate: f64,
    hit_count: i64,
    origin_traffic_bytes: i64,
    origin_request_count: i64,
    origin_fail_count: i64,
    status_2xx: f64,
    status_3xx: f64,
    status_4xx: f64,
    status_5xx: f64,
    anomaly_kind: Option<String>,
}

impl TryFrom<LogRow> for LogRecord {
    type Error = StorageError;

    fn try_from(row: LogRow) -> Result<Self, Self::Error> {
        let timestamp = DateTime::from_timestamp_millis(row.start_time)
            .ok_or_else(|| StorageError::Corrupt(format!("start_time {} out of range", row.start_time)))?;
        let anomaly_kind = match row.anomaly_kind.as_deref() {
            None => None,
            Some(kind) => Some(
                AnomalyKind::from_str_opt(kind)
                    .ok_or_else(|| StorageError::Corrupt(format!("unknown anomaly kind '{kind}'")))?,
            ),
        };
        let count = |name: &str, v: i64| {
            u64::try_from(v).map_err(|_| StorageError::Corrupt(format!("negative {name}: {v}")))
        };

        Ok(LogRecord {
            timestamp,
            tenant_id: row.tenant_id,
            domain: row.domain,
            region: row.region,
            country: row.country,
            interval_secs: count("interval_secs", row.interval_secs)?,
            bandwidth_bps: row.bandwidth_bps,
            traffic_bytes: count("traffic_bytes", row.traffic_bytes)?,
            request_count: count("request_count", row.request_count)?,
            cache_hit_rate: row.cache_hit_rate,
            hit_count: count("hit_count", row.hit_count)?,
            origin_traffic_bytes: count("origin_traffic_bytes", row.origin_traffic_bytes)?,
            origin_request_count: count("origin_request_count", row.origin_request_count)?,
            origin_fail_count: count("origin_fail_count", row.origin_fail_count)?,
            status_codes: StatusDistribution {
                success: row.status_2xx,
                redirect: row.status_3xx,
                client_error: row.status_4xx,
                server_error: row.status_5xx,
            },
            anomaly_kind,
        })
    }
}

impl SqliteStorage {
    /// Connect to `url`, creating the database file (and its directory) if needed, and migrate.
    #[instrument(err)]
    pub async fn connect(url: &str) -> Result<Self, StorageError> {
        let options = SqliteConnectOptions::from_str(url)?.create_if_missing(true);

        let filename = options.get_filename();
        if filename != Path::new(":memory:") {
            if let Some(dir) = filename.parent().filter(|d| !d.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(dir).await?;
            }
        }

        // A single connection keeps writes serialized and lets `sqlite::memory:` share one database.
        let pool = SqlitePoolOptions::new().max_connections(1).connect_with(options).await?;
        migrator().run(&pool).await?;
        info!(url, "Opened record store");

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl Storage for SqliteStorage {
    #[instrument(skip(self, records), fields(count = records.len()), err)]
    async fn append(&self, records: &[LogRecord]) -> Result<u64, StorageError> {
        let mut tx = self.pool.begin().await?;
        let mut inserted = 0;

        for chunk in records.chunks(INSERT_CHUNK) {
            let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
                "INSERT INTO cdn_logs (start_time, tenant_id, domain, region, country, interval_secs, \
                 bandwidth_bps, traffic_bytes, request_count, cache_hit_rate, hit_count, origin_traffic_bytes, \
                 origin_request_count, origin_fail_count, status_2xx, status_3xx, status_4xx, status_5xx, anomaly_kind) ",
            );
            query.push_values(chunk, |mut row, r| {
                row.push_bind(r.timestamp.timestamp_millis())
                    .push_bind(&r.tenant_id)
                    .push_bind(&r.domain)
                    .push_bind(&r.region)
                    .push_bind(&r.country)
                    .push_bind(r.interval_secs as i64)
                    .push_bind(r.bandwidth_bps)
                    .push_bind(r.traffic_bytes as i64)
                    .push_bind(r.request_count as i64)
                    .push_bind(r.cache_hit_rate)
                    .push_bind(r.hit_count as i64)
                    .push_bind(r.origin_traffic_bytes as i64)
                    .push_bind(r.origin_request_count as i64)
                    .push_bind(r.origin_fail_count as i64)
                    .push_bind(r.status_codes.success)
                    .push_bind(r.status_codes.redirect)
                    .push_bind(r.status_codes.client_error)
                    .push_bind(r.status_codes.server_error)
                    .push_bind(r.anomaly_kind.map(|k| k.as_str()));
            });
            query.push(" ON CONFLICT (start_time, domain, region) DO NOTHING");

            inserted += query.build().execute(&mut *tx).await?.rows_affected();
        }

        tx.commit().await?;
        debug!(inserted, "Appended records");
        Ok(inserted)
    }

    #[instrument(skip(self, filter), fields(start = %range.start, end = %range.end), err)]
    async fn query(&self, range: TimeRange, filter: &RecordFilter) -> Result<Vec<LogRecord>, StorageError> {
        let mut query: QueryBuilder<Sqlite> = QueryBuilder::new("SELECT * FROM cdn_logs WHERE start_time >= ");
        query.push_bind(range.start.timestamp_millis());
        query.push(" AND start_time < ");
        query.push_bind(range.end.timestamp_millis());

        if let Some(ref domain) = filter.domain {
            query.push(" AND domain = ");
            query.push_bind(domain);
        }
        if let Some(ref region) = filter.region {
            query.push(" AND region = ");
            query.push_bind(region);
        }
        query.push(" ORDER BY start_time, region, domain");

        let rows = query.build_query_as::<LogRow>().fetch_all(&self.pool).await?;
        rows.into_iter().map(LogRecord::try_from).collect()
    }

    async fn max_timestamp(&self) -> Result<Option<DateTime<Utc>>, StorageError> {
        let max: Option<i64> = sqlx::query_scalar("SELECT MAX(start_time) FROM cdn_logs")
            .fetch_one(&self.pool)
            .await?;
        max.map(|ms| {
            DateTime::from_timestamp_millis(ms).ok_or_else(|| StorageError::Corrupt(format!("start_time {ms} out of range")))
        })
        .transpose()
    }

    async fn record_count(&self) -> Result<u64, StorageError> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM cdn_logs").fetch_one(&self.pool).await?;
        Ok(count.max(0) as u64)
    }

    async fn domains(&self) -> Result<Vec<String>, StorageError> {
        Ok(sqlx::query_scalar("SELECT DISTINCT domain FROM cdn_logs ORDER BY domain")
            .fetch_all(&self.pool)
            .await?)
    }
}
