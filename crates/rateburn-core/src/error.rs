use thiserror::Error;

use crate::stats::StatsError;

#[derive(Error, Debug)]
pub enum RateBurnError {
    #[error("Target not found: {name} (available: {available})")]
    TargetNotFound { name: String, available: String },

    #[error("Model not found: {name} (available: {available})")]
    ModelNotFound { name: String, available: String },

    #[error("Workload not found: {name} (available: {available})")]
    WorkloadNotFound { name: String, available: String },

    #[error("Config error: {0}")]
    Config(String),

    #[error("HTTP error: {0}")]
    Http(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Malformed record in {path} line {line}: {source}")]
    Record {
        path: String,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("CSV error: {0}")]
    Csv(String),

    #[error(transparent)]
    Stats(#[from] StatsError),
}

pub type Result<T> = std::result::Result<T, RateBurnError>;
