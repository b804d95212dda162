//! Background hardware sampling on its own thread, independent of request
//! traffic.

mod nvidia_smi;

pub use nvidia_smi::{parse_readings, NvidiaSmi};

use chrono::Utc;
use rateburn_core::{
    device_statistics, status_line, DeviceStatistics, SamplerConfig, TelemetrySample,
};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("{0} not found - are the GPU drivers installed?")]
    NotFound(String),
    #[error("Failed to execute device query: {0}")]
    ExecutionFailed(#[from] std::io::Error),
    #[error("Device query failed: {0}")]
    CommandFailed(String),
    #[error("Failed to parse device query output: {0}")]
    Parse(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub id: u32,
    pub name: String,
}

/// Raw metrics for one device. `None` means the hardware does not report it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceReading {
    pub id: u32,
    pub name: String,
    pub utilization_pct: Option<f64>,
    pub memory_used_gib: Option<f64>,
    pub memory_total_gib: Option<f64>,
    pub power_draw: Option<f64>,
    pub power_limit: Option<f64>,
    pub temperature: Option<f64>,
}

/// A device-management interface the sampler can poll.
pub trait DeviceSource: Send + Sync + 'static {
    fn discover(&self) -> Result<Vec<DeviceInfo>, TelemetryError>;
    fn read(&self) -> Result<Vec<DeviceReading>, TelemetryError>;
}

impl DeviceReading {
    fn into_sample(self, devices: &[DeviceInfo]) -> TelemetrySample {
        let device_name = match self.name.is_empty() {
            true => devices
                .iter()
                .find(|d| d.id == self.id)
                .map(|d| d.name.clone())
                .unwrap_or_default(),
            false => self.name,
        };

        // Memory is all-or-nothing so that used never exceeds total.
        let (memory_used, memory_total) = match (self.memory_used_gib, self.memory_total_gib) {
            (Some(used), Some(total)) if total > 0.0 => (used.clamp(0.0, total), total),
            _ => (0.0, 0.0),
        };
        let memory_percent = match memory_total > 0.0 {
            true => memory_used / memory_total * 100.0,
            false => 0.0,
        };

        TelemetrySample {
            timestamp: Utc::now(),
            device_id: self.id,
            device_name,
            utilization_pct: self.utilization_pct.unwrap_or(0.0),
            memory_used,
            memory_total,
            memory_percent,
            power_draw: self.power_draw.unwrap_or(0.0),
            power_limit: self.power_limit.unwrap_or(0.0),
            temperature: self.temperature.unwrap_or(0.0),
        }
    }
}

/// Append-only sample log plus a latest-per-device view.
///
/// Both are updated under the log lock, so a reader of either never sees a
/// tick half applied. Each `reset` opens a new generation; appends from an
/// older generation, or after `close`, are refused.
#[derive(Default)]
struct SampleLog {
    inner: Mutex<LogInner>,
    latest: RwLock<BTreeMap<u32, TelemetrySample>>,
}

#[derive(Default)]
struct LogInner {
    samples: Vec<TelemetrySample>,
    generation: u64,
    closed: bool,
}

impl SampleLog {
    fn lock(&self) -> MutexGuard<'_, LogInner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn reset(&self) -> u64 {
        let mut inner = self.lock();
        inner.samples.clear();
        inner.closed = false;
        inner.generation += 1;
        if let Ok(mut latest) = self.latest.write() {
            latest.clear();
        }
        inner.generation
    }

    fn append(&self, generation: u64, batch: Vec<TelemetrySample>) -> bool {
        let mut inner = self.lock();
        if inner.closed || inner.generation != generation {
            return false;
        }
        if let Ok(mut latest) = self.latest.write() {
            for sample in &batch {
                latest.insert(sample.device_id, sample.clone());
            }
        }
        inner.samples.extend(batch);
        true
    }

    fn close(&self) {
        self.lock().closed = true;
    }

    fn samples(&self) -> Vec<TelemetrySample> {
        self.lock().samples.clone()
    }

    fn latest(&self) -> Vec<TelemetrySample> {
        self.latest
            .read()
            .map(|latest| latest.values().cloned().collect())
            .unwrap_or_default()
    }
}

struct Worker {
    handle: JoinHandle<()>,
    stop_tx: mpsc::Sender<()>,
    done_rx: mpsc::Receiver<()>,
}

pub struct ActiveSampler {
    source: Arc<dyn DeviceSource>,
    devices: Arc<Vec<DeviceInfo>>,
    config: SamplerConfig,
    log: Arc<SampleLog>,
    worker: Mutex<Option<Worker>>,
}

impl ActiveSampler {
    fn worker(&self) -> MutexGuard<'_, Option<Worker>> {
        self.worker.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn start(&self) {
        let mut worker = self.worker();
        if worker.is_some() {
            warn!("GPU monitoring is already running");
            return;
        }

        let generation = self.log.reset();
        let (stop_tx, stop_rx) = mpsc::channel();
        let (done_tx, done_rx) = mpsc::channel();
        let source = Arc::clone(&self.source);
        let devices = Arc::clone(&self.devices);
        let log = Arc::clone(&self.log);
        let interval = self.config.interval;

        let handle = thread::spawn(move || {
            loop {
                match source.read() {
                    Ok(readings) => {
                        let batch = readings
                            .into_iter()
                            .map(|r| r.into_sample(&devices))
                            .collect();
                        if !log.append(generation, batch) {
                            break;
                        }
                    }
                    Err(e) => warn!("GPU sampling tick failed: {}", e),
                }

                // The stop signal doubles as the tick sleep.
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => continue,
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            let _ = done_tx.send(());
        });

        *worker = Some(Worker {
            handle,
            stop_tx,
            done_rx,
        });
        info!("GPU monitoring started ({} devices)", self.devices.len());
    }

    fn stop(&self) {
        let Some(worker) = self.worker().take() else {
            return;
        };

        let _ = worker.stop_tx.send(());
        match worker.done_rx.recv_timeout(self.config.join_timeout) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if worker.handle.join().is_err() {
                    warn!("GPU sampling thread panicked");
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                warn!(
                    "GPU sampling thread did not stop within {:?}; detaching",
                    self.config.join_timeout
                );
            }
        }
        self.log.close();
        info!(
            "GPU monitoring stopped ({} samples collected)",
            self.log.samples().len()
        );
    }

    fn is_running(&self) -> bool {
        self.worker().is_some()
    }
}

/// Hardware sampler, chosen at construction time.
///
/// `Disabled` is a valid no-op: it reports zero devices and empty
/// statistics, and `start`/`stop` do nothing.
pub enum TelemetrySampler {
    Active(ActiveSampler),
    Disabled,
}

impl TelemetrySampler {
    /// Probes `nvidia-smi`, falling back to `Disabled` when it is missing
    /// or reports no devices.
    pub fn detect(config: SamplerConfig) -> Self {
        Self::from_source(NvidiaSmi::default(), config)
    }

    #[instrument(skip_all)]
    pub fn from_source(source: impl DeviceSource, config: SamplerConfig) -> Self {
        match source.discover() {
            Ok(devices) if devices.is_empty() => {
                info!("No GPUs found; telemetry disabled");
                Self::Disabled
            }
            Ok(devices) => {
                info!("GPU monitoring initialised: {} GPUs detected", devices.len());
                debug!(?devices, "Discovered devices");
                Self::Active(ActiveSampler {
                    source: Arc::new(source),
                    devices: Arc::new(devices),
                    config,
                    log: Arc::new(SampleLog::default()),
                    worker: Mutex::new(None),
                })
            }
            Err(e) => {
                warn!("GPU monitoring unavailable: {}", e);
                Self::Disabled
            }
        }
    }

    pub fn disabled() -> Self {
        Self::Disabled
    }

    pub fn device_count(&self) -> usize {
        match self {
            Self::Active(s) => s.devices.len(),
            Self::Disabled => 0,
        }
    }

    /// Clears previous samples and starts the sampling thread.
    #[instrument(skip(self))]
    pub fn start(&self) {
        if let Self::Active(s) = self {
            s.start();
        }
    }

    /// Stops sampling. Idempotent; waits at most the configured join
    /// timeout, and no sample is appended after it returns.
    #[instrument(skip(self))]
    pub fn stop(&self) {
        if let Self::Active(s) = self {
            s.stop();
        }
    }

    pub fn is_running(&self) -> bool {
        match self {
            Self::Active(s) => s.is_running(),
            Self::Disabled => false,
        }
    }

    pub fn samples(&self) -> Vec<TelemetrySample> {
        match self {
            Self::Active(s) => s.log.samples(),
            Self::Disabled => Vec::new(),
        }
    }

    /// Most recent sample per device, ordered by device id.
    pub fn latest(&self) -> Vec<TelemetrySample> {
        match self {
            Self::Active(s) => s.log.latest(),
            Self::Disabled => Vec::new(),
        }
    }

    pub fn status_line(&self) -> String {
        status_line(&self.latest())
    }

    pub fn statistics(&self) -> BTreeMap<String, DeviceStatistics> {
        device_statistics(&self.samples())
    }
}

impl Drop for ActiveSampler {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct FakeSource {
        devices: usize,
        reads: Arc<AtomicUsize>,
        read_delay: Duration,
    }

    impl FakeSource {
        fn new(devices: usize) -> Self {
            Self {
                devices,
                reads: Arc::new(AtomicUsize::new(0)),
                read_delay: Duration::ZERO,
            }
        }
    }

    impl DeviceSource for FakeSource {
        fn discover(&self) -> Result<Vec<DeviceInfo>, TelemetryError> {
            Ok((0..self.devices as u32)
                .map(|id| DeviceInfo {
                    id,
                    name: format!("NVIDIA Test {}", id),
                })
                .collect())
        }

        fn read(&self) -> Result<Vec<DeviceReading>, TelemetryError> {
            thread::sleep(self.read_delay);
            let n = self.reads.fetch_add(1, Ordering::SeqCst) as f64;
            Ok((0..self.devices as u32)
                .map(|id| DeviceReading {
                    id,
                    name: String::new(),
                    utilization_pct: Some(10.0 + n),
                    memory_used_gib: Some(8.0),
                    memory_total_gib: Some(80.0),
                    // Device 1 reports no power or temperature.
                    power_draw: (id == 0).then_some(250.0),
                    power_limit: (id == 0).then_some(400.0),
                    temperature: (id == 0).then_some(55.0),
                })
                .collect())
        }
    }

    struct FailingSource;

    impl DeviceSource for FailingSource {
        fn discover(&self) -> Result<Vec<DeviceInfo>, TelemetryError> {
            Err(TelemetryError::NotFound("nvidia-smi".to_string()))
        }

        fn read(&self) -> Result<Vec<DeviceReading>, TelemetryError> {
            Err(TelemetryError::NotFound("nvidia-smi".to_string()))
        }
    }

    fn fast() -> SamplerConfig {
        SamplerConfig {
            interval: Duration::from_millis(10),
            join_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_unavailable_source_is_disabled_no_op() {
        let sampler = TelemetrySampler::from_source(FailingSource, fast());
        assert!(matches!(sampler, TelemetrySampler::Disabled));
        assert_eq!(sampler.device_count(), 0);

        sampler.start();
        assert!(!sampler.is_running());
        sampler.stop();
        assert!(sampler.samples().is_empty());
        assert!(sampler.statistics().is_empty());
        assert_eq!(sampler.status_line(), "");
    }

    #[test]
    fn test_zero_devices_is_disabled() {
        let sampler = TelemetrySampler::from_source(FakeSource::new(0), fast());
        assert!(matches!(sampler, TelemetrySampler::Disabled));
        assert!(sampler.statistics().is_empty());
    }

    #[test]
    fn test_samples_every_device_each_tick() {
        let sampler = TelemetrySampler::from_source(FakeSource::new(2), fast());
        assert_eq!(sampler.device_count(), 2);

        sampler.start();
        assert!(sampler.is_running());
        thread::sleep(Duration::from_millis(100));
        sampler.stop();
        assert!(!sampler.is_running());

        let samples = sampler.samples();
        assert!(samples.len() >= 2);
        assert_eq!(samples.len() % 2, 0);

        let stats = sampler.statistics();
        assert_eq!(stats.len(), 2);
        assert_eq!(stats["gpu_0"].sample_count, stats["gpu_1"].sample_count);
        assert_eq!(stats["gpu_0"].name, "NVIDIA Test 0");
        assert_eq!(stats["gpu_0"].max_power, 250.0);
        // Unsupported metrics default to zero without dropping the device.
        assert_eq!(stats["gpu_1"].max_power, 0.0);
        assert_eq!(stats["gpu_1"].avg_temperature, 0.0);
        assert_eq!(stats["gpu_1"].memory_total, 80.0);
    }

    #[test]
    fn test_latest_tracks_most_recent_tick() {
        let sampler = TelemetrySampler::from_source(FakeSource::new(2), fast());
        sampler.start();
        thread::sleep(Duration::from_millis(60));
        sampler.stop();

        let samples = sampler.samples();
        let latest = sampler.latest();
        assert_eq!(latest.len(), 2);
        assert_eq!(latest, rateburn_core::latest_per_device(&samples));
        assert!(sampler.status_line().starts_with("GPU0 (Test 0)"));
    }

    #[test]
    fn test_no_samples_after_stop_and_stop_is_idempotent() {
        let sampler = TelemetrySampler::from_source(FakeSource::new(1), fast());
        sampler.start();
        thread::sleep(Duration::from_millis(50));
        sampler.stop();

        let count = sampler.samples().len();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sampler.samples().len(), count);

        sampler.stop();
        assert_eq!(sampler.samples().len(), count);
    }

    #[test]
    fn test_restart_clears_previous_samples() {
        let sampler = TelemetrySampler::from_source(FakeSource::new(1), fast());
        sampler.start();
        thread::sleep(Duration::from_millis(50));
        sampler.stop();

        let restarted = Utc::now();
        sampler.start();
        sampler.stop();
        assert!(sampler.samples().iter().all(|s| s.timestamp >= restarted));
    }

    #[test]
    fn test_wedged_thread_is_detached_within_timeout() {
        let mut source = FakeSource::new(1);
        source.read_delay = Duration::from_millis(500);
        let sampler = TelemetrySampler::from_source(
            source,
            SamplerConfig {
                interval: Duration::from_millis(10),
                join_timeout: Duration::from_millis(50),
            },
        );

        sampler.start();
        thread::sleep(Duration::from_millis(20));
        let began = Instant::now();
        sampler.stop();
        assert!(began.elapsed() < Duration::from_millis(400));

        // The blocked read finishes later; its samples must be refused.
        thread::sleep(Duration::from_millis(600));
        assert!(sampler.samples().is_empty());
    }

    #[test]
    fn test_detached_thread_cannot_leak_into_next_run() {
        let mut source = FakeSource::new(1);
        source.read_delay = Duration::from_millis(300);
        let sampler = TelemetrySampler::from_source(
            source,
            SamplerConfig {
                interval: Duration::from_millis(10),
                join_timeout: Duration::from_millis(20),
            },
        );

        // First run is detached mid-read; its read completes as the first
        // reading (utilization 10) while the second run is live.
        sampler.start();
        thread::sleep(Duration::from_millis(20));
        sampler.stop();
        sampler.start();
        thread::sleep(Duration::from_millis(500));
        sampler.stop();

        let samples = sampler.samples();
        assert!(!samples.is_empty());
        assert!(
            samples.iter().all(|s| s.utilization_pct != 10.0),
            "{:?}",
            samples
        );
    }

    #[test]
    fn test_memory_is_clamped_to_total() {
        let reading = DeviceReading {
            id: 0,
            name: "x".to_string(),
            memory_used_gib: Some(90.0),
            memory_total_gib: Some(80.0),
            ..Default::default()
        };
        let sample = reading.into_sample(&[]);
        assert_eq!(sample.memory_used, 80.0);
        assert_eq!(sample.memory_percent, 100.0);

        let partial = DeviceReading {
            memory_used_gib: Some(5.0),
            ..Default::default()
        };
        let sample = partial.into_sample(&[]);
        assert_eq!((sample.memory_used, sample.memory_total), (0.0, 0.0));
    }
}
