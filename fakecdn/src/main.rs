use anyhow::Context;
use chrono::TimeDelta;
use clap::Parser;
use fakecdn::billing::BillingReport;
use fakecdn::config::{Args, Mode, date_start};
use fakecdn::scheduler::{RunMode, Scheduler};
use fakecdn::types::TimeRange;
use fakecdn::export::LocalExport;
use fakecdn::{Config, storage, telemetry, transport, validator};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Wait for shutdown signal (SIGTERM or Ctrl+C)
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, stopping after the current interval...");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, stopping after the current interval...");
        },
    }
}

fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;

    if args.validate {
        println!("Configuration is valid.");
        return Ok(());
    }

    telemetry::init_telemetry(config.enable_otel_export)?;
    tracing::debug!("{:?}", args);

    let result = run(&args, config).await;
    telemetry::shutdown_telemetry();
    result
}

/// Validate stored records in `range` and print the result with its billing report.
async fn report(store: &dyn storage::Storage, range: TimeRange, config: &Config) -> anyhow::Result<()> {
    let result = validator::validate_storage(store, range, &config.target).await?;
    print_json(&result)?;
    print_json(&BillingReport::from_validation(&result, &config.billing))
}

async fn run(args: &Args, config: Config) -> anyhow::Result<()> {
    if let (Mode::Validate, Some(path)) = (args.mode, &args.log_file) {
        let result = validator::validate_file(path, &config.target).await?;
        print_json(&result)?;
        return print_json(&BillingReport::from_validation(&result, &config.billing));
    }

    let store = storage::open(&config.storage).await.context("failed to open record store")?;
    let window = config.time.window()?;
    let start = args.start.map(date_start).unwrap_or_else(|| window.start());
    let end = args.end.map(date_start).unwrap_or_else(|| window.end());

    if args.mode == Mode::Validate {
        return report(store.as_ref(), TimeRange::new(start, end), &config).await;
    }

    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        stop.cancel();
    });

    let transport = transport::from_config(&config.push)?;
    let mut scheduler = Scheduler::new(config.clone(), store.clone(), transport, shutdown)?;

    let summary = match args.mode {
        Mode::Simulation => scheduler.run_simulation().await?,
        Mode::Catchup => scheduler.run_catchup(start, end).await?,
        Mode::Realtime => scheduler.run_realtime(args.once, args.end.map(date_start)).await?,
        Mode::Validate => return Ok(()),
    };
    print_json(&summary)?;

    if summary.mode != RunMode::Realtime
        && let (Some(first), Some(last)) = (summary.first_interval, summary.last_interval)
    {
        let step = TimeDelta::from_std(window.interval())?;
        let range = TimeRange::new(first, last + step);
        report(store.as_ref(), range, &config).await?;

        if let (Some(dir), Some(generator)) = (&args.output_dir, scheduler.last_generator()) {
            let records = store.query(range, &storage::RecordFilter::default()).await?;
            LocalExport::create(dir)
                .await?
                .write_run(&records, &generator.stats(), generator.samples())
                .await?;
        }
    }
    Ok(())
}
