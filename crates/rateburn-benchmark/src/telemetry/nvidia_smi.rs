use std::process::Command;
use tracing::{debug, error};

use super::{DeviceInfo, DeviceReading, DeviceSource, TelemetryError};

const QUERY_FIELDS: &str =
    "index,name,utilization.gpu,memory.used,memory.total,power.draw,power.limit,temperature.gpu";
const FIELD_COUNT: usize = 8;
const MIB_PER_GIB: f64 = 1024.0;

/// Reads NVIDIA device state through `nvidia-smi`'s CSV query mode.
#[derive(Debug, Clone)]
pub struct NvidiaSmi {
    binary: String,
}

impl NvidiaSmi {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    fn query(&self) -> Result<String, TelemetryError> {
        debug!("Querying GPU state via {}", self.binary);

        let output = Command::new(&self.binary)
            .arg(format!("--query-gpu={}", QUERY_FIELDS))
            .arg("--format=csv,noheader,nounits")
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TelemetryError::NotFound(self.binary.clone()),
                _ => {
                    error!("{} execution failed: {}", self.binary, e);
                    TelemetryError::ExecutionFailed(e)
                }
            })?;

        if !output.status.success() {
            return Err(TelemetryError::CommandFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

impl Default for NvidiaSmi {
    fn default() -> Self {
        Self::new("nvidia-smi")
    }
}

impl DeviceSource for NvidiaSmi {
    fn discover(&self) -> Result<Vec<DeviceInfo>, TelemetryError> {
        Ok(self
            .read()?
            .into_iter()
            .map(|r| DeviceInfo {
                id: r.id,
                name: r.name,
            })
            .collect())
    }

    fn read(&self) -> Result<Vec<DeviceReading>, TelemetryError> {
        parse_readings(&self.query()?)
    }
}

/// Parses `nvidia-smi --format=csv,noheader,nounits` output, one device
/// per line. `[N/A]` and `[Not Supported]` become `None`.
pub fn parse_readings(text: &str) -> Result<Vec<DeviceReading>, TelemetryError> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(parse_line)
        .collect()
}

fn parse_line(line: &str) -> Result<DeviceReading, TelemetryError> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() != FIELD_COUNT {
        return Err(TelemetryError::Parse(format!(
            "expected {} fields, got {}: {}",
            FIELD_COUNT,
            fields.len(),
            line
        )));
    }

    let id = fields[0]
        .parse()
        .map_err(|_| TelemetryError::Parse(format!("bad device index: {}", fields[0])))?;

    Ok(DeviceReading {
        id,
        name: fields[1].to_string(),
        utilization_pct: metric(fields[2]),
        memory_used_gib: metric(fields[3]).map(|m| m / MIB_PER_GIB),
        memory_total_gib: metric(fields[4]).map(|m| m / MIB_PER_GIB),
        power_draw: metric(fields[5]),
        power_limit: metric(fields[6]),
        temperature: metric(fields[7]),
    })
}

fn metric(field: &str) -> Option<f64> {
    field.parse::<f64>().ok().filter(|v| v.is_finite())
}
