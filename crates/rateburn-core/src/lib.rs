pub mod config;
pub mod error;
pub mod outcome;
pub mod stats;
pub mod telemetry;

pub use config::{
    BenchConfig, ExecutorConfig, ModelConfig, SamplerConfig, TargetConfig, WorkloadConfig,
    WorkloadOverrides,
};
pub use error::{RateBurnError, Result};
pub use outcome::RequestOutcome;
pub use stats::{
    device_statistics, summarize, LatencySummary, RunStatistics, StatsError, SummaryRecord,
    ThroughputSummary,
};
pub use telemetry::{latest_per_device, status_line, DeviceStatistics, TelemetrySample};
