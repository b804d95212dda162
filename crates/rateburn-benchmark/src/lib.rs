pub mod client;
pub mod results;
pub mod runner;
pub mod sse;
pub mod telemetry;

pub use client::ChatClient;
pub use results::{
    read_outcomes, result_stem, summary_path_for, write_device_stats, write_outcomes,
    write_summary_csv, ResultPaths,
};
pub use runner::{
    GenerationRequest, LoadResult, LoadRunner, RequestExecutor, RunLabels, RunPhase,
};
pub use telemetry::{
    DeviceInfo, DeviceReading, DeviceSource, NvidiaSmi, TelemetryError, TelemetrySampler,
};
