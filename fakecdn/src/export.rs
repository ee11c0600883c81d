//! Local run artifacts written next to the record store.
//!
//! An output directory receives three files per run:
//!
//! - `logs.jsonl`: every emitted [`LogRecord`], one JSON object per line
//! - `stats.json`: the [`GenerationStats`] of the generator that produced the run
//! - `bandwidth_curve.json`: the aggregate calibrated curve as `{timestamp, bps}` samples
//!
//! `logs.jsonl` can be fed back through [`read_records`] for offline validation.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Serialize;
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tracing::{debug, info};

use crate::errors::Result;
use crate::pipeline::GenerationStats;
use crate::types::{BandwidthSample, LogRecord};

pub const RECORDS_FILE: &str = "logs.jsonl";
pub const STATS_FILE: &str = "stats.json";
pub const CURVE_FILE: &str = "bandwidth_curve.json";

/// Output directory for the artifacts of one run.
#[derive(Debug, Clone)]
pub struct LocalExport {
    dir: PathBuf,
}

impl LocalExport {
    /// Create `dir` (and parents) if missing.
    pub async fn create(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("failed to create output directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write `records` as JSON lines, replacing any previous file.
    pub async fn write_records(&self, records: &[LogRecord]) -> Result<PathBuf> {
        let path = self.dir.join(RECORDS_FILE);
        let file = fs::File::create(&path)
            .await
            .with_context(|| format!("failed to create {}", path.display()))?;
        let mut writer = BufWriter::new(file);
        for record in records {
            let mut line = serde_json::to_vec(record).context("failed to serialize record")?;
            line.push(b'\n');
            writer.write_all(&line).await.context("failed to write record")?;
        }
        writer.flush().await.context("failed to flush records")?;

        debug!(path = %path.display(), records = records.len(), "Wrote records");
        Ok(path)
    }

    pub async fn write_stats(&self, stats: &GenerationStats) -> Result<PathBuf> {
        self.write_json(STATS_FILE, stats).await
    }

    pub async fn write_curve(&self, samples: &[BandwidthSample]) -> Result<PathBuf> {
        self.write_json(CURVE_FILE, samples).await
    }

    async fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> Result<PathBuf> {
        let path = self.dir.join(name);
        let body = serde_json::to_vec_pretty(value).with_context(|| format!("failed to serialize {name}"))?;
        fs::write(&path, body)
            .await
            .with_context(|| format!("failed to write {}", path.display()))?;
        Ok(path)
    }

    /// Write all three artifacts.
    pub async fn write_run(&self, records: &[LogRecord], stats: &GenerationStats, curve: &[BandwidthSample]) -> Result<()> {
        self.write_records(records).await?;
        self.write_stats(stats).await?;
        self.write_curve(curve).await?;
        info!(dir = %self.dir.display(), records = records.len(), "Exported run artifacts");
        Ok(())
    }
}

/// Load records from a JSON-lines file. Blank lines are skipped.
pub async fn read_records(path: &Path) -> Result<Vec<LogRecord>> {
    let file = fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();

    let mut records = Vec::new();
    let mut line_no = 0usize;
    while let Some(line) = lines.next_line().await.context("failed to read record file")? {
        line_no += 1;
        if line.trim().is_empty() {
            continue;
        }
        let record: LogRecord = serde_json::from_str(&line)
            .with_context(|| format!("malformed record at {}:{line_no}", path.display()))?;
        records.push(record);
    }
    Ok(records)
}
