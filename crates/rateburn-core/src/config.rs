use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use crate::error::{RateBurnError, Result};

pub const TARGETS_FILE: &str = "targets.yaml";
pub const MODELS_FILE: &str = "models.yaml";
pub const WORKLOADS_FILE: &str = "workloads.yaml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetConfig {
    pub name: String,
    pub base_url: String,
    pub api_key: String,
    #[serde(default)]
    pub description: Option<String>,
}

impl TargetConfig {
    /// The API key, with a `${VAR}` value looked up in the environment.
    pub fn resolved_api_key(&self) -> Result<String> {
        let key = self.api_key.trim();
        match key.strip_prefix("${").and_then(|k| k.strip_suffix('}')) {
            Some(var) => std::env::var(var).map_err(|_| {
                RateBurnError::Config(format!(
                    "target '{}' api_key references unset variable {}",
                    self.name, var
                ))
            }),
            None => Ok(key.to_string()),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub name: String,
    /// Identifier sent as `model` on the wire.
    pub full_name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadConfig {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    /// Seconds
    pub duration: u64,
    pub rps: f64,
    /// Maximum in-flight requests; unbounded when absent.
    #[serde(default)]
    pub concurrency: Option<usize>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub prompt_type: String,
}

#[derive(Debug, Clone, Default)]
pub struct WorkloadOverrides {
    pub duration: Option<u64>,
    pub rps: Option<f64>,
    pub concurrency: Option<usize>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    pub prompt_type: Option<String>,
}

impl WorkloadConfig {
    pub fn custom(duration: u64, rps: f64) -> Self {
        Self {
            name: "custom".to_string(),
            description: Some("Ad hoc CLI workload".to_string()),
            duration,
            rps,
            concurrency: None,
            max_tokens: 2048,
            temperature: 0.7,
            prompt_type: "medium".to_string(),
        }
    }

    pub fn apply(&mut self, overrides: &WorkloadOverrides) {
        if let Some(duration) = overrides.duration {
            self.duration = duration;
        }
        if let Some(rps) = overrides.rps {
            self.rps = rps;
        }
        if let Some(concurrency) = overrides.concurrency {
            self.concurrency = Some(concurrency);
        }
        if let Some(max_tokens) = overrides.max_tokens {
            self.max_tokens = max_tokens;
        }
        if let Some(temperature) = overrides.temperature {
            self.temperature = temperature;
        }
        if let Some(prompt_type) = &overrides.prompt_type {
            self.prompt_type = prompt_type.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.rps.is_finite() && self.rps > 0.0) {
            return Err(RateBurnError::Config(format!(
                "workload '{}': rps must be positive, got {}",
                self.name, self.rps
            )));
        }
        if self.duration == 0 {
            return Err(RateBurnError::Config(format!(
                "workload '{}': duration must be at least 1 second",
                self.name
            )));
        }
        if self.concurrency == Some(0) {
            return Err(RateBurnError::Config(format!(
                "workload '{}': concurrency must be at least 1",
                self.name
            )));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::from_secs(self.duration)
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.rps)
    }

    pub fn expected_requests(&self) -> u64 {
        (self.duration as f64 * self.rps).floor() as u64
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ExecutorConfig {
    pub timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SamplerConfig {
    pub interval: Duration,
    /// Upper bound on how long `stop()` waits for the sampling thread.
    pub join_timeout: Duration,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            join_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TargetsFile {
    targets: Vec<TargetConfig>,
}

#[derive(Debug, Deserialize)]
struct ModelsFile {
    models: Vec<ModelConfig>,
}

#[derive(Debug, Deserialize)]
struct WorkloadsFile {
    workloads: Vec<WorkloadConfig>,
    #[serde(default)]
    prompt_templates: HashMap<String, Vec<String>>,
}

/// Targets, models and workloads loaded from a config directory.
#[derive(Debug, Clone)]
pub struct BenchConfig {
    pub targets: Vec<TargetConfig>,
    pub models: Vec<ModelConfig>,
    pub workloads: Vec<WorkloadConfig>,
    pub prompt_templates: HashMap<String, Vec<String>>,
}

fn read_yaml<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path).map_err(|e| {
        RateBurnError::Config(format!("failed to read {}: {}", path.display(), e))
    })?;
    Ok(serde_yaml::from_str(&text)?)
}

fn names<'a>(it: impl Iterator<Item = &'a str>) -> String {
    it.collect::<Vec<_>>().join(", ")
}

impl BenchConfig {
    pub fn load(dir: &Path) -> Result<Self> {
        let targets: TargetsFile = read_yaml(&dir.join(TARGETS_FILE))?;
        let models: ModelsFile = read_yaml(&dir.join(MODELS_FILE))?;
        let workloads: WorkloadsFile = read_yaml(&dir.join(WORKLOADS_FILE))?;

        Ok(Self {
            targets: targets.targets,
            models: models.models,
            workloads: workloads.workloads,
            prompt_templates: workloads.prompt_templates,
        })
    }

    pub fn target(&self, name: &str) -> Result<&TargetConfig> {
        self.targets
            .iter()
            .find(|t| t.name == name)
            .ok_or_else(|| RateBurnError::TargetNotFound {
                name: name.to_string(),
                available: names(self.targets.iter().map(|t| t.name.as_str())),
            })
    }

    pub fn model(&self, name: &str) -> Result<&ModelConfig> {
        self.models
            .iter()
            .find(|m| m.name == name)
            .ok_or_else(|| RateBurnError::ModelNotFound {
                name: name.to_string(),
                available: names(self.models.iter().map(|m| m.name.as_str())),
            })
    }

    pub fn workload(&self, name: &str) -> Result<&WorkloadConfig> {
        self.workloads
            .iter()
            .find(|w| w.name == name)
            .ok_or_else(|| RateBurnError::WorkloadNotFound {
                name: name.to_string(),
                available: names(self.workloads.iter().map(|w| w.name.as_str())),
            })
    }

    pub fn prompts(&self, prompt_type: &str) -> Result<&[String]> {
        match self.prompt_templates.get(prompt_type) {
            Some(prompts) if !prompts.is_empty() => Ok(prompts),
            Some(_) => Err(RateBurnError::Config(format!(
                "prompt type '{}' has no prompts",
                prompt_type
            ))),
            None => Err(RateBurnError::Config(format!(
                "unknown prompt type '{}' (available: {})",
                prompt_type,
                names(self.prompt_templates.keys().map(String::as_str))
            ))),
        }
    }
}
