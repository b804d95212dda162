use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Terminal result of one streamed request.
///
/// Durations are seconds measured from `issued_at`. The serialized keys
/// are the ones written to the raw `.jsonl` result files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestOutcome {
    pub request_id: String,
    #[serde(rename = "timestamp")]
    pub issued_at: DateTime<Utc>,
    pub success: bool,
    #[serde(rename = "ttft", default)]
    pub time_to_first_chunk: Option<f64>,
    #[serde(rename = "total_time")]
    pub total_duration: f64,
    #[serde(rename = "tokens_generated")]
    pub chunks_received: u64,
    #[serde(rename = "tokens_per_sec")]
    pub throughput: f64,
    pub prompt_length: usize,
    #[serde(rename = "error", default)]
    pub error_detail: Option<String>,
    #[serde(default)]
    pub workload: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub target: Option<String>,
}

impl RequestOutcome {
    pub fn succeeded(
        request_id: String,
        issued_at: DateTime<Utc>,
        time_to_first_chunk: Option<f64>,
        total_duration: f64,
        chunks_received: u64,
        prompt_length: usize,
    ) -> Self {
        let total_duration = total_duration.max(0.0);
        // First chunk can never land after the stream ended.
        let time_to_first_chunk = time_to_first_chunk.map(|t| t.clamp(0.0, total_duration));

        Self {
            request_id,
            issued_at,
            success: true,
            time_to_first_chunk,
            total_duration,
            chunks_received,
            throughput: throughput(chunks_received, total_duration),
            prompt_length,
            error_detail: None,
            workload: None,
            model: None,
            target: None,
        }
    }

    /// A failed request never reports a first chunk or generated units.
    pub fn failed(
        request_id: String,
        issued_at: DateTime<Utc>,
        total_duration: f64,
        prompt_length: usize,
        error: impl Into<String>,
    ) -> Self {
        Self {
            request_id,
            issued_at,
            success: false,
            time_to_first_chunk: None,
            total_duration: total_duration.max(0.0),
            chunks_received: 0,
            throughput: 0.0,
            prompt_length,
            error_detail: Some(error.into()),
            workload: None,
            model: None,
            target: None,
        }
    }

    pub fn with_labels(mut self, target: &str, model: &str, workload: &str) -> Self {
        self.target = Some(target.to_string());
        self.model = Some(model.to_string());
        self.workload = Some(workload.to_string());
        self
    }
}

pub fn throughput(chunks: u64, total_duration: f64) -> f64 {
    if total_duration > 0.0 {
        chunks as f64 / total_duration
    } else {
        0.0
    }
}

/// Identifier derived from the issue time plus the dispatcher's sequence
/// number, so two requests issued in the same microsecond stay distinct.
pub fn request_id(issued_at: DateTime<Utc>, sequence: u64) -> String {
    format!("{}-{}", issued_at.timestamp_micros(), sequence)
}
