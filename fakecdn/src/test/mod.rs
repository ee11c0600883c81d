//! End-to-end scenarios: scheduler → storage/transport → validator.

use std::sync::Arc;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use tokio_util::sync::CancellationToken;
use tracing::info;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use crate::billing::BillingReport;
use crate::config::Config;
use crate::export::{CURVE_FILE, LocalExport, RECORDS_FILE, STATS_FILE};
use crate::pipeline::GenerationStats;
use crate::scheduler::{RunMode, Scheduler};
use crate::storage::{MemoryStorage, RecordFilter, SqliteStorage, Storage};
use crate::test_utils::{FlakyTransport, PausedClock, test_config};
use crate::transport::{self, DryRunTransport};
use crate::types::TimeRange;
use crate::validator::{validate_file, validate_storage};

fn jan1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap()
}

fn minutes(n: i64) -> TimeDelta {
    TimeDelta::minutes(n)
}

async fn sqlite_store(dir: &tempfile::TempDir) -> Arc<SqliteStorage> {
    let url = format!("sqlite://{}", dir.path().join("cdn_logs.db").display());
    Arc::new(SqliteStorage::connect(&url).await.unwrap())
}

/// Thirty days at five minutes with the default shape, read back and validated.
#[test_log::test(tokio::test)]
async fn test_thirty_day_simulation_round_trip() {
    let mut config = Config::default();
    config.seed = Some(2025);
    config.storage.enabled = false;

    let storage = Arc::new(MemoryStorage::new());
    let mut scheduler =
        Scheduler::new(config.clone(), storage.clone(), Arc::new(DryRunTransport), CancellationToken::new()).unwrap();
    let summary = scheduler.run_simulation().await.unwrap();
    assert_eq!(summary.intervals, 8640);
    assert_eq!(summary.records_emitted, 8640 * 15);

    let window = config.time.window().unwrap();
    let result = validate_storage(storage.as_ref(), TimeRange::from(&window), &config.target)
        .await
        .unwrap();
    info!(p95 = result.p95_gbps, mean = result.mean_gbps, "Round trip");

    assert_eq!(result.sample_count, 8640);
    assert!(result.pass, "deviation {}", result.deviation);
    assert!(result.deviation < 1e-3);

    let ratio = result.p95_gbps / result.mean_gbps;
    assert!((1.2..=1.7).contains(&ratio), "p95/mean = {ratio}");

    // Mean daily traffic follows mean bandwidth × 86400 / 8.
    let daily_bytes = result.total_traffic_bytes as f64 / 30.0;
    let expected = result.mean_gbps * 1e9 * 86_400.0 / 8.0;
    assert!((daily_bytes - expected).abs() / expected < 1e-3);

    assert_eq!(result.by_region.len(), 5);
    assert_eq!(result.by_domain.len(), 3);

    let billing = BillingReport::from_validation(&result, &config.billing);
    assert!((billing.percentile_cost - 1500.0).abs() < 1.5);
    assert!(billing.traffic_cost > 0.0);
}

#[test_log::test(tokio::test)]
async fn test_catchup_one_day_yields_288_samples() {
    let storage = Arc::new(MemoryStorage::new());
    let mut scheduler =
        Scheduler::new(test_config(), storage.clone(), Arc::new(DryRunTransport), CancellationToken::new()).unwrap();

    let end = jan1() + TimeDelta::days(1);
    let summary = scheduler.run_catchup(jan1(), end).await.unwrap();
    assert_eq!(summary.mode, RunMode::Catchup);
    assert_eq!(summary.intervals, 288);

    let result = validate_storage(storage.as_ref(), TimeRange::new(jan1(), end), &test_config().target)
        .await
        .unwrap();
    assert_eq!(result.sample_count, 288);
    assert_eq!(result.record_count, 288 * 4);
    assert!(result.pass, "deviation {}", result.deviation);
}

/// Backfilling single days in the middle of the configured window still hits the target.
#[test_log::test(tokio::test)]
async fn test_catchup_days_inside_a_long_window_pass_validation() {
    let mut config = Config::default();
    config.seed = Some(7);
    config.storage.enabled = false;

    for day in [1, 5, 10, 20] {
        let start = jan1() + TimeDelta::days(day);
        let end = start + TimeDelta::days(1);
        let storage = Arc::new(MemoryStorage::new());
        let mut scheduler =
            Scheduler::new(config.clone(), storage.clone(), Arc::new(DryRunTransport), CancellationToken::new()).unwrap();
        scheduler.run_catchup(start, end).await.unwrap();

        let result = validate_storage(storage.as_ref(), TimeRange::new(start, end), &config.target)
            .await
            .unwrap();
        info!(day, p95 = result.p95_gbps, deviation = result.deviation, "Catchup day");
        assert_eq!(result.sample_count, 288);
        assert!(result.pass, "day {day}: deviation {}", result.deviation);
    }
}

/// A real-time run against a store that already holds the first ten intervals.
#[test_log::test(tokio::test(start_paused = true))]
async fn test_realtime_restart_resumes_without_reemitting() {
    let storage = Arc::new(MemoryStorage::new());
    let mut config = test_config();
    config.push.dry_run = false;

    // First run: catch up the first ten intervals, then stop.
    let mut first =
        Scheduler::new(config.clone(), storage.clone(), Arc::new(DryRunTransport), CancellationToken::new()).unwrap();
    let summary = first.run_catchup(jan1(), jan1() + minutes(50)).await.unwrap();
    assert_eq!(summary.intervals, 10);
    drop(first);
    assert_eq!(storage.max_timestamp().await.unwrap(), Some(jan1() + minutes(45)));

    // Restart with the wall clock at 01:00:30.
    let transport = Arc::new(FlakyTransport::new(0));
    let clock = Arc::new(PausedClock::starting_at(jan1() + minutes(60) + TimeDelta::seconds(30)));
    let mut second = Scheduler::new(config, storage.clone(), transport.clone(), CancellationToken::new())
        .unwrap()
        .with_clock(clock);

    let summary = second.run_realtime(false, Some(jan1() + minutes(70))).await.unwrap();

    // 00:50, 00:55 and 01:00 are past due; 01:05 is waited for.
    assert_eq!(summary.intervals, 4);
    assert_eq!(summary.first_interval, Some(jan1() + minutes(50)));
    assert_eq!(summary.last_interval, Some(jan1() + minutes(65)));
    assert_eq!(summary.records_stored, summary.records_emitted);
    assert_eq!(summary.pushed, 16);

    let delivered = transport.delivered();
    assert_eq!(delivered.len(), 16);
    assert!(delivered.iter().all(|r| r.timestamp >= jan1() + minutes(50)));

    assert_eq!(storage.record_count().await.unwrap(), 14 * 4);
    let all = storage
        .query(TimeRange::new(jan1(), jan1() + minutes(70)), &RecordFilter::default())
        .await
        .unwrap();
    let mut timestamps: Vec<_> = all.iter().map(|r| r.timestamp).collect();
    timestamps.dedup();
    assert_eq!(timestamps.len(), 14);
}

#[test_log::test(tokio::test)]
async fn test_pushes_reach_collector_with_retries() {
    let server = MockServer::start().await;
    // The first four requests are rejected, everything after is accepted.
    Mock::given(method("POST"))
        .and(path("/cdn/logs"))
        .respond_with(ResponseTemplate::new(503))
        .up_to_n_times(4)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/cdn/logs"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.push.dry_run = false;
    config.push.endpoint = Some(Url::parse(&format!("{}/cdn/logs", server.uri())).unwrap());

    let transport = transport::from_config(&config.push).unwrap();
    let storage = Arc::new(MemoryStorage::new());
    let mut scheduler = Scheduler::new(config, storage, transport, CancellationToken::new()).unwrap();

    let summary = scheduler.run_catchup(jan1(), jan1() + minutes(60)).await.unwrap();
    assert_eq!(summary.intervals, 12);
    assert_eq!(summary.pushed, 48);
    assert_eq!(summary.push_failures, 0);
    assert_eq!(summary.retries, 4);
    assert_eq!(server.received_requests().await.unwrap().len(), 52);
}

#[test_log::test(tokio::test)]
async fn test_simulation_persists_to_sqlite() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();

    {
        let storage = sqlite_store(&dir).await;
        let mut scheduler =
            Scheduler::new(config.clone(), storage, Arc::new(DryRunTransport), CancellationToken::new()).unwrap();
        let summary = scheduler.run_simulation().await.unwrap();
        assert_eq!(summary.records_stored, 576 * 4);
    }

    let reopened = sqlite_store(&dir).await;
    let window = config.time.window().unwrap();
    let result = validate_storage(reopened.as_ref(), TimeRange::from(&window), &config.target)
        .await
        .unwrap();
    assert_eq!(result.sample_count, 576);
    assert!(result.pass, "deviation {}", result.deviation);
    assert_eq!(reopened.domains().await.unwrap().len(), 2);

    // Running the same seed again stores nothing new.
    let mut again =
        Scheduler::new(config, reopened.clone(), Arc::new(DryRunTransport), CancellationToken::new()).unwrap();
    let summary = again.run_simulation().await.unwrap();
    assert_eq!(summary.records_stored, 0);
    assert_eq!(reopened.record_count().await.unwrap(), 576 * 4);
}

/// A catchup run exported to an output directory validates offline from its record file.
#[test_log::test(tokio::test)]
async fn test_exported_catchup_validates_from_record_file() {
    let dir = tempfile::tempdir().unwrap();
    let config = test_config();
    let storage = Arc::new(MemoryStorage::new());
    let mut scheduler =
        Scheduler::new(config.clone(), storage.clone(), Arc::new(DryRunTransport), CancellationToken::new()).unwrap();

    let start = jan1() + TimeDelta::hours(6);
    let end = start + TimeDelta::hours(12);
    let summary = scheduler.run_catchup(start, end).await.unwrap();
    assert_eq!(summary.intervals, 144);

    let range = TimeRange::new(start, end);
    let records = storage.query(range, &RecordFilter::default()).await.unwrap();
    let generator = scheduler.last_generator().unwrap();
    let export = LocalExport::create(dir.path().join("output")).await.unwrap();
    export
        .write_run(&records, &generator.stats(), generator.samples())
        .await
        .unwrap();

    for name in [RECORDS_FILE, STATS_FILE, CURVE_FILE] {
        assert!(export.dir().join(name).exists(), "{name} missing");
    }
    let stats: GenerationStats =
        serde_json::from_slice(&tokio::fs::read(export.dir().join(STATS_FILE)).await.unwrap()).unwrap();
    assert_eq!(stats.intervals, 144);

    let from_file = validate_file(&export.dir().join(RECORDS_FILE), &config.target).await.unwrap();
    let from_store = validate_storage(storage.as_ref(), range, &config.target).await.unwrap();
    assert!(from_file.pass, "deviation {}", from_file.deviation);
    assert_eq!(from_file.sample_count, 144);
    assert_eq!(from_file.record_count, from_store.record_count);
    assert!((from_file.p95_gbps - from_store.p95_gbps).abs() < 1e-9);
}
