use async_trait::async_trait;
use chrono::Utc;
use futures::FutureExt;
use rateburn_core::outcome::request_id;
use rateburn_core::{
    DeviceStatistics, RateBurnError, RequestOutcome, Result, TelemetrySample, WorkloadConfig,
};
use serde::Serialize;
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::{mpsc, watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::{JoinError, JoinSet};
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::telemetry::TelemetrySampler;

const PROGRESS_EVERY: u64 = 50;

/// One request handed to an executor.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub request_id: String,
    pub prompt: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Issues one request and reports how it went.
///
/// Implementations must not fail: every transport or protocol problem is
/// returned as a failed [`RequestOutcome`].
#[async_trait]
pub trait RequestExecutor: Send + Sync + 'static {
    async fn execute(&self, request: &GenerationRequest) -> RequestOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RunPhase {
    Idle,
    Ramping,
    Draining,
    Done,
}

/// Labels attached to every outcome of a run.
#[derive(Debug, Clone)]
pub struct RunLabels {
    pub target: String,
    pub model: String,
    pub workload: String,
}

#[derive(Debug, Clone)]
pub struct LoadResult {
    pub outcomes: Vec<RequestOutcome>,
    pub issued: u64,
    /// Seconds spent in the issuance loop.
    pub issue_secs: f64,
    /// Seconds from the first issue until the last outcome drained.
    pub total_secs: f64,
    pub telemetry: Vec<TelemetrySample>,
    pub device_stats: BTreeMap<String, DeviceStatistics>,
}

#[derive(Debug)]
struct WorkItem {
    sequence: u64,
    request_id: String,
    prompt: String,
}

struct RequestContext {
    labels: RunLabels,
    max_tokens: u32,
    temperature: f32,
}

/// Paces requests at a fixed rate for a fixed duration, then drains.
///
/// Issuance never waits on completion: the pacing loop only enqueues work,
/// and a pool spawns executions gated by the workload's concurrency limit.
pub struct LoadRunner<E: RequestExecutor> {
    executor: Arc<E>,
    sampler: Arc<TelemetrySampler>,
    phase: watch::Sender<RunPhase>,
}

impl<E: RequestExecutor> LoadRunner<E> {
    pub fn new(executor: E) -> Self {
        let (phase, _) = watch::channel(RunPhase::Idle);
        Self {
            executor: Arc::new(executor),
            sampler: Arc::new(TelemetrySampler::disabled()),
            phase,
        }
    }

    pub fn with_sampler(mut self, sampler: TelemetrySampler) -> Self {
        self.sampler = Arc::new(sampler);
        self
    }

    pub fn sampler(&self) -> &TelemetrySampler {
        &self.sampler
    }

    pub fn phase(&self) -> RunPhase {
        *self.phase.borrow()
    }

    pub fn subscribe_phase(&self) -> watch::Receiver<RunPhase> {
        self.phase.subscribe()
    }

    pub async fn run(
        &self,
        labels: RunLabels,
        workload: &WorkloadConfig,
        prompts: &[String],
    ) -> Result<LoadResult> {
        workload.validate()?;
        if prompts.is_empty() {
            return Err(RateBurnError::Config(format!(
                "workload '{}' has an empty prompt pool",
                workload.name
            )));
        }

        info!(
            "Starting workload {}: target={}, model={}, duration={}s, rps={}, concurrency={}",
            workload.name,
            labels.target,
            labels.model,
            workload.duration,
            workload.rps,
            workload
                .concurrency
                .map_or_else(|| "unbounded".to_string(), |c| c.to_string())
        );

        let ctx = Arc::new(RequestContext {
            labels,
            max_tokens: workload.max_tokens,
            temperature: workload.temperature,
        });
        let limit = workload.concurrency.map(|c| Arc::new(Semaphore::new(c)));
        let (tx, rx) = mpsc::unbounded_channel();

        self.sampler.start();
        let started = Instant::now();

        let ((issued, issue_secs), outcomes) = tokio::join!(
            self.issue(workload, prompts, tx),
            drain_pool(Arc::clone(&self.executor), rx, limit, ctx)
        );

        let total_secs = started.elapsed().as_secs_f64();
        self.stop_sampler().await;
        self.phase.send_replace(RunPhase::Done);

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!(
            "Completed: {}, Success: {} ({:.1}s)",
            outcomes.len(),
            succeeded,
            total_secs
        );

        Ok(LoadResult {
            outcomes,
            issued,
            issue_secs,
            total_secs,
            telemetry: self.sampler.samples(),
            device_stats: self.sampler.statistics(),
        })
    }

    /// Joining the sampling thread can block for up to its join timeout,
    /// so it runs off the async workers.
    async fn stop_sampler(&self) {
        let sampler = Arc::clone(&self.sampler);
        if let Err(e) = tokio::task::spawn_blocking(move || sampler.stop()).await {
            warn!("Stopping the GPU sampler failed: {}", e);
        }
    }

    async fn issue(
        &self,
        workload: &WorkloadConfig,
        prompts: &[String],
        tx: mpsc::UnboundedSender<WorkItem>,
    ) -> (u64, f64) {
        self.phase.send_replace(RunPhase::Ramping);

        let duration = workload.duration();
        let mut ticker = time::interval(workload.interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Burst);

        let start = Instant::now();
        let mut issued: u64 = 0;

        loop {
            ticker.tick().await;
            if start.elapsed() >= duration {
                break;
            }

            let item = WorkItem {
                sequence: issued,
                request_id: request_id(Utc::now(), issued),
                prompt: prompts[(issued % prompts.len() as u64) as usize].clone(),
            };
            if tx.send(item).is_err() {
                error!("Request pool closed early; stopping issuance");
                break;
            }
            issued += 1;

            if issued % PROGRESS_EVERY == 0 {
                let status = self.sampler.status_line();
                match status.is_empty() {
                    true => info!("Requests launched: {}", issued),
                    false => info!("Requests launched: {} | {}", issued, status),
                }
            }
        }

        let issue_secs = start.elapsed().as_secs_f64();
        self.phase.send_replace(RunPhase::Draining);
        info!("Waiting for all {} requests to complete...", issued);
        (issued, issue_secs)
    }
}

async fn drain_pool<E: RequestExecutor>(
    executor: Arc<E>,
    mut rx: mpsc::UnboundedReceiver<WorkItem>,
    limit: Option<Arc<Semaphore>>,
    ctx: Arc<RequestContext>,
) -> Vec<RequestOutcome> {
    let mut tasks = JoinSet::new();
    let mut outcomes = Vec::new();

    loop {
        tokio::select! {
            item = rx.recv() => {
                let Some(item) = item else { break };
                // Waiting for a permit only delays execution; the pacing
                // loop keeps enqueueing meanwhile.
                let permit = match &limit {
                    Some(semaphore) => Arc::clone(semaphore).acquire_owned().await.ok(),
                    None => None,
                };
                tasks.spawn(execute_item(
                    Arc::clone(&executor),
                    item,
                    Arc::clone(&ctx),
                    permit,
                ));
            }
            Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                outcomes.push(collect(joined, &ctx));
            }
        }
    }

    while let Some(joined) = tasks.join_next().await {
        outcomes.push(collect(joined, &ctx));
    }
    outcomes
}

async fn execute_item<E: RequestExecutor>(
    executor: Arc<E>,
    item: WorkItem,
    ctx: Arc<RequestContext>,
    _permit: Option<OwnedSemaphorePermit>,
) -> RequestOutcome {
    let request = GenerationRequest {
        request_id: item.request_id,
        prompt: item.prompt,
        max_tokens: ctx.max_tokens,
        temperature: ctx.temperature,
    };
    let issued_at = Utc::now();
    let start = StdInstant::now();
    debug!(sequence = item.sequence, request_id = %request.request_id, "Executing request");

    let outcome = AssertUnwindSafe(executor.execute(&request))
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            RequestOutcome::failed(
                request.request_id.clone(),
                issued_at,
                start.elapsed().as_secs_f64(),
                request.prompt.chars().count(),
                format!("request task panicked: {}", panic_message(panic.as_ref())),
            )
        });

    let labels = &ctx.labels;
    outcome.with_labels(&labels.target, &labels.model, &labels.workload)
}

fn collect(joined: std::result::Result<RequestOutcome, JoinError>, ctx: &RequestContext) -> RequestOutcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Request task lost: {}", e);
            let labels = &ctx.labels;
            RequestOutcome::failed("unknown".to_string(), Utc::now(), 0.0, 0, e.to_string())
                .with_labels(&labels.target, &labels.model, &labels.workload)
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return s.to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
