//! On-disk run artifacts: per-request JSONL, summary CSV and device
//! statistics JSON.

use chrono::{DateTime, Utc};
use rateburn_core::{DeviceStatistics, RateBurnError, RequestOutcome, Result, SummaryRecord};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::info;

/// `bench_<target>_<model>_<workload>_<YYYYmmdd_HHMMSS>`
pub fn result_stem(target: &str, model: &str, workload: &str, at: DateTime<Utc>) -> String {
    format!(
        "bench_{}_{}_{}_{}",
        sanitize(target),
        sanitize(model),
        sanitize(workload),
        at.format("%Y%m%d_%H%M%S")
    )
}

/// Paths for every artifact of one run, derived from a shared stem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResultPaths {
    pub outcomes: PathBuf,
    pub summary: PathBuf,
    pub devices: PathBuf,
}

impl ResultPaths {
    pub fn new(dir: &Path, stem: &str) -> Self {
        Self {
            outcomes: dir.join(format!("{}.jsonl", stem)),
            summary: dir.join(format!("{}_summary.csv", stem)),
            devices: dir.join(format!("{}_gpu.json", stem)),
        }
    }
}

/// Default summary location for an existing outcomes file:
/// `<dir>/<stem>_summary.csv`.
pub fn summary_path_for(outcomes: &Path, dir: &Path) -> PathBuf {
    let stem = outcomes
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "results".to_string());
    dir.join(format!("{}_summary.csv", stem))
}

// Model names like `llama3.1:8b` or `org/model` must stay one path segment.
fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | ' ' => '-',
            c => c,
        })
        .collect()
}

fn create(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)?;
    }
    Ok(BufWriter::new(File::create(path)?))
}

/// Writes one JSON object per line.
pub fn write_outcomes(path: &Path, outcomes: &[RequestOutcome]) -> Result<()> {
    let mut out = create(path)?;
    for outcome in outcomes {
        serde_json::to_writer(&mut out, outcome)?;
        out.write_all(b"\n")?;
    }
    out.flush()?;
    info!("Wrote {} outcomes to {}", outcomes.len(), path.display());
    Ok(())
}

/// Reads a JSONL outcomes file. Blank lines are skipped; any other line
/// that fails to parse is an error naming its line number.
pub fn read_outcomes(path: &Path) -> Result<Vec<RequestOutcome>> {
    let reader = BufReader::new(File::open(path)?);
    let mut outcomes = Vec::new();

    for (idx, line) in reader.lines().enumerate() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let outcome = serde_json::from_str(&line).map_err(|source| RateBurnError::Record {
            path: path.display().to_string(),
            line: idx + 1,
            source,
        })?;
        outcomes.push(outcome);
    }
    Ok(outcomes)
}

pub fn write_summary_csv(path: &Path, record: &SummaryRecord) -> Result<()> {
    let mut writer = csv::Writer::from_writer(create(path)?);
    writer
        .serialize(record)
        .map_err(|e| RateBurnError::Csv(e.to_string()))?;
    writer.flush()?;
    info!("Wrote summary to {}", path.display());
    Ok(())
}

/// Pretty JSON object keyed `gpu_<id>`. Skipped when there are no devices.
pub fn write_device_stats(
    path: &Path,
    stats: &BTreeMap<String, DeviceStatistics>,
) -> Result<bool> {
    if stats.is_empty() {
        return Ok(false);
    }
    let mut out = create(path)?;
    serde_json::to_writer_pretty(&mut out, stats)?;
    out.write_all(b"\n")?;
    out.flush()?;
    info!("Wrote GPU statistics to {}", path.display());
    Ok(true)
}
