//! Reduction of request outcomes and telemetry samples into summary statistics.
//!
//! Percentiles use the nearest-rank rule: for `n` ascending values the
//! P-th percentile is the value at index `floor(n * P / 100)`, clamped to
//! `n - 1`. No interpolation.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

use crate::outcome::RequestOutcome;
use crate::telemetry::{device_key, DeviceStatistics, TelemetrySample};

const UNKNOWN_LABEL: &str = "unknown";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StatsError {
    #[error("No successful requests ({total} total)")]
    NoSuccessfulRequests { total: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencySummary {
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
    pub p99: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThroughputSummary {
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
}

/// Statistics over one completed run. Distributions cover successful
/// outcomes only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatistics {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,
    /// `None` when no successful request observed a first chunk.
    pub time_to_first_chunk: Option<LatencySummary>,
    pub total_duration: LatencySummary,
    pub throughput: ThroughputSummary,
    pub total_units_generated: u64,
    pub target: String,
    pub model: String,
    pub workload: String,
}

/// Flat form of [`RunStatistics`], one CSV row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryRecord {
    pub total_requests: usize,
    pub successful_requests: usize,
    pub failed_requests: usize,
    pub success_rate: f64,
    pub ttft_mean: Option<f64>,
    pub ttft_median: Option<f64>,
    pub ttft_p95: Option<f64>,
    pub ttft_p99: Option<f64>,
    pub total_time_mean: f64,
    pub total_time_median: f64,
    pub total_time_p95: f64,
    pub total_time_p99: f64,
    pub tokens_per_sec_mean: f64,
    pub tokens_per_sec_median: f64,
    pub tokens_per_sec_p95: f64,
    pub total_tokens_generated: u64,
    pub target: String,
    pub model: String,
    pub workload: String,
}

impl From<&RunStatistics> for SummaryRecord {
    fn from(stats: &RunStatistics) -> Self {
        let ttft = stats.time_to_first_chunk.as_ref();
        Self {
            total_requests: stats.total_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            success_rate: stats.success_rate,
            ttft_mean: ttft.map(|t| t.mean),
            ttft_median: ttft.map(|t| t.median),
            ttft_p95: ttft.map(|t| t.p95),
            ttft_p99: ttft.map(|t| t.p99),
            total_time_mean: stats.total_duration.mean,
            total_time_median: stats.total_duration.median,
            total_time_p95: stats.total_duration.p95,
            total_time_p99: stats.total_duration.p99,
            tokens_per_sec_mean: stats.throughput.mean,
            tokens_per_sec_median: stats.throughput.median,
            tokens_per_sec_p95: stats.throughput.p95,
            total_tokens_generated: stats.total_units_generated,
            target: stats.target.clone(),
            model: stats.model.clone(),
            workload: stats.workload.clone(),
        }
    }
}

/// Nearest-rank percentile of an ascending slice.
pub fn percentile_sorted(sorted: &[f64], percentile: f64) -> Option<f64> {
    if sorted.is_empty() {
        return None;
    }
    let index = (sorted.len() as f64 * percentile / 100.0).floor() as usize;
    Some(sorted[index.min(sorted.len() - 1)])
}

/// Nearest-rank percentile of unordered values.
pub fn percentile(values: &[f64], percentile: f64) -> Option<f64> {
    percentile_sorted(&sorted(values.iter().copied()), percentile)
}

pub fn mean(values: &[f64]) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    Some(values.iter().sum::<f64>() / values.len() as f64)
}

/// Median of an ascending slice; the two middle values are averaged for
/// even lengths.
pub fn median_sorted(sorted: &[f64]) -> Option<f64> {
    let n = sorted.len();
    match n {
        0 => None,
        _ if n % 2 == 1 => Some(sorted[n / 2]),
        _ => Some((sorted[n / 2 - 1] + sorted[n / 2]) / 2.0),
    }
}

fn sorted(values: impl Iterator<Item = f64>) -> Vec<f64> {
    let mut v: Vec<f64> = values.collect();
    v.sort_by(f64::total_cmp);
    v
}

// Series are sorted before summing so the result does not depend on
// completion order.
fn latency_summary(sorted: &[f64]) -> Option<LatencySummary> {
    Some(LatencySummary {
        mean: mean(sorted)?,
        median: median_sorted(sorted)?,
        p95: percentile_sorted(sorted, 95.0)?,
        p99: percentile_sorted(sorted, 99.0)?,
    })
}

fn throughput_summary(sorted: &[f64]) -> Option<ThroughputSummary> {
    Some(ThroughputSummary {
        mean: mean(sorted)?,
        median: median_sorted(sorted)?,
        p95: percentile_sorted(sorted, 95.0)?,
    })
}

/// Reduces a finished run into [`RunStatistics`].
///
/// Returns [`StatsError::NoSuccessfulRequests`] rather than a record of
/// zeros when nothing succeeded, so "no data" stays distinguishable from
/// "every latency was zero".
pub fn summarize(outcomes: &[RequestOutcome]) -> Result<RunStatistics, StatsError> {
    let successful: Vec<&RequestOutcome> = outcomes.iter().filter(|o| o.success).collect();
    let Some(first) = successful.first() else {
        return Err(StatsError::NoSuccessfulRequests {
            total: outcomes.len(),
        });
    };

    let ttfts = sorted(successful.iter().filter_map(|o| o.time_to_first_chunk));
    let totals = sorted(successful.iter().map(|o| o.total_duration));
    let rates = sorted(successful.iter().map(|o| o.throughput));

    let label = |l: &Option<String>| l.clone().unwrap_or_else(|| UNKNOWN_LABEL.to_string());

    Ok(RunStatistics {
        total_requests: outcomes.len(),
        successful_requests: successful.len(),
        failed_requests: outcomes.len() - successful.len(),
        success_rate: successful.len() as f64 / outcomes.len() as f64 * 100.0,
        time_to_first_chunk: latency_summary(&ttfts),
        total_duration: latency_summary(&totals).ok_or(StatsError::NoSuccessfulRequests {
            total: outcomes.len(),
        })?,
        throughput: throughput_summary(&rates).ok_or(StatsError::NoSuccessfulRequests {
            total: outcomes.len(),
        })?,
        total_units_generated: successful.iter().map(|o| o.chunks_received).sum(),
        target: label(&first.target),
        model: label(&first.model),
        workload: label(&first.workload),
    })
}

/// Per-device summaries keyed `gpu_<id>`. Empty input gives an empty map.
pub fn device_statistics(samples: &[TelemetrySample]) -> BTreeMap<String, DeviceStatistics> {
    let mut by_device: BTreeMap<u32, Vec<&TelemetrySample>> = BTreeMap::new();
    for sample in samples {
        by_device.entry(sample.device_id).or_default().push(sample);
    }

    by_device
        .into_iter()
        .map(|(device_id, group)| (device_key(device_id), summarize_device(&group)))
        .collect()
}

fn summarize_device(group: &[&TelemetrySample]) -> DeviceStatistics {
    let n = group.len() as f64;
    let avg = |f: fn(&TelemetrySample) -> f64| group.iter().map(|s| f(*s)).sum::<f64>() / n;
    let max = |f: fn(&TelemetrySample) -> f64| {
        group.iter().map(|s| f(*s)).fold(f64::NEG_INFINITY, f64::max)
    };
    let first = group[0];

    DeviceStatistics {
        name: first.device_name.clone(),
        avg_utilization: avg(|s| s.utilization_pct),
        max_utilization: max(|s| s.utilization_pct),
        avg_memory_used: avg(|s| s.memory_used),
        max_memory_used: max(|s| s.memory_used),
        memory_total: first.memory_total,
        avg_power: avg(|s| s.power_draw),
        max_power: max(|s| s.power_draw),
        power_limit: first.power_limit,
        avg_temperature: avg(|s| s.temperature),
        max_temperature: max(|s| s.temperature),
        sample_count: group.len(),
    }
}
