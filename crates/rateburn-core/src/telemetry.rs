//! Hardware telemetry types shared between the sampler and the aggregator.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One device reading from one sampling tick.
///
/// Metrics the hardware does not report are stored as `0.0` so that
/// aggregation never has to special-case missing fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub timestamp: DateTime<Utc>,
    pub device_id: u32,
    pub device_name: String,
    pub utilization_pct: f64,
    /// GiB
    pub memory_used: f64,
    /// GiB
    pub memory_total: f64,
    pub memory_percent: f64,
    /// Watts
    pub power_draw: f64,
    /// Watts
    pub power_limit: f64,
    /// Degrees Celsius
    pub temperature: f64,
}

/// Per-device summary over every sample of a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceStatistics {
    pub name: String,
    pub avg_utilization: f64,
    pub max_utilization: f64,
    pub avg_memory_used: f64,
    pub max_memory_used: f64,
    pub memory_total: f64,
    pub avg_power: f64,
    pub max_power: f64,
    pub power_limit: f64,
    pub avg_temperature: f64,
    pub max_temperature: f64,
    pub sample_count: usize,
}

pub fn device_key(device_id: u32) -> String {
    format!("gpu_{}", device_id)
}

/// Most recent sample per device id, ordered by device id.
pub fn latest_per_device(samples: &[TelemetrySample]) -> Vec<TelemetrySample> {
    let mut latest: BTreeMap<u32, &TelemetrySample> = BTreeMap::new();
    for sample in samples.iter().rev() {
        latest.entry(sample.device_id).or_insert(sample);
    }
    latest.into_values().cloned().collect()
}

/// One-line console status, e.g. `GPU0 (H200): 87% │ 40.1/141GB │ 550W │ 61°C`.
pub fn status_line(latest: &[TelemetrySample]) -> String {
    latest
        .iter()
        .map(|s| {
            let short_name = s.device_name.replace("NVIDIA ", "").replace("Tesla ", "");
            format!(
                "GPU{} ({}): {:.0}% │ {:.1}/{:.0}GB │ {:.0}W │ {:.0}°C",
                s.device_id,
                short_name,
                s.utilization_pct,
                s.memory_used,
                s.memory_total,
                s.power_draw,
                s.temperature
            )
        })
        .collect::<Vec<_>>()
        .join(" | ")
}
