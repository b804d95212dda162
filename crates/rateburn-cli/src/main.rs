use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use rateburn_benchmark::{
    read_outcomes, result_stem, summary_path_for, write_device_stats, write_outcomes,
    write_summary_csv, ChatClient, GenerationRequest, LoadRunner, RequestExecutor, ResultPaths,
    RunLabels, TelemetrySampler,
};
use rateburn_core::{
    summarize, BenchConfig, DeviceStatistics, ExecutorConfig, RunStatistics, SamplerConfig,
    SummaryRecord, WorkloadConfig, WorkloadOverrides,
};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;
use tracing_subscriber::EnvFilter;

const PROBE_PROMPT: &str = "Say hello in one short sentence.";

#[derive(Parser)]
#[command(name = "rateburn")]
#[command(about = "RateBurn - LLM Serving Load Generator", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a paced load test against a target
    Run {
        /// Target name from targets.yaml
        #[arg(short, long)]
        target: String,

        /// Model name from models.yaml
        #[arg(short, long)]
        model: String,

        /// Workload name from workloads.yaml (omit for a custom workload)
        #[arg(short, long)]
        workload: Option<String>,

        /// Duration in seconds
        #[arg(short, long)]
        duration: Option<u64>,

        /// Requests per second
        #[arg(short, long)]
        rps: Option<f64>,

        /// Maximum in-flight requests
        #[arg(short, long)]
        concurrency: Option<usize>,

        /// Max tokens to generate
        #[arg(long)]
        max_tokens: Option<u32>,

        /// Temperature for generation
        #[arg(long)]
        temperature: Option<f32>,

        /// Prompt pool to draw from (short, medium, long, ...)
        #[arg(short, long)]
        prompt_type: Option<String>,

        /// Directory holding targets.yaml, models.yaml and workloads.yaml
        #[arg(long, default_value = "configs")]
        config_dir: PathBuf,

        /// Directory for raw results and summaries
        #[arg(short, long, default_value = "results")]
        output_dir: PathBuf,

        /// Skip GPU sampling
        #[arg(long)]
        no_telemetry: bool,

        /// Per-request timeout in seconds
        #[arg(long, default_value = "300")]
        timeout_secs: u64,
    },

    /// Aggregate a raw .jsonl results file into a summary
    Summarize {
        /// Raw results file
        file: PathBuf,

        /// Summary CSV path (default: results/summary/<stem>_summary.csv)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send one streamed request to check connectivity
    Probe {
        #[arg(short, long)]
        target: String,

        #[arg(short, long)]
        model: String,

        #[arg(long, default_value = "configs")]
        config_dir: PathBuf,
    },

    /// List models served by a target
    Models {
        #[arg(short, long)]
        target: String,

        #[arg(long, default_value = "configs")]
        config_dir: PathBuf,
    },

    /// Sample GPU telemetry without sending traffic
    Gpu {
        #[arg(short, long, default_value = "10")]
        seconds: u64,

        #[arg(short, long, default_value = "1000")]
        interval_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // API keys in targets.yaml may reference variables kept in .env
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            target,
            model,
            workload,
            duration,
            rps,
            concurrency,
            max_tokens,
            temperature,
            prompt_type,
            config_dir,
            output_dir,
            no_telemetry,
            timeout_secs,
        } => {
            let overrides = WorkloadOverrides {
                duration,
                rps,
                concurrency,
                max_tokens,
                temperature,
                prompt_type,
            };
            let opts = RunOptions {
                target,
                model,
                workload,
                overrides,
                config_dir,
                output_dir,
                telemetry: !no_telemetry,
                executor: ExecutorConfig {
                    timeout: Duration::from_secs(timeout_secs),
                },
            };
            cmd_run(opts).await?
        }
        Commands::Summarize { file, output } => cmd_summarize(&file, output)?,
        Commands::Probe {
            target,
            model,
            config_dir,
        } => cmd_probe(&target, &model, &config_dir).await?,
        Commands::Models { target, config_dir } => cmd_models(&target, &config_dir).await?,
        Commands::Gpu {
            seconds,
            interval_ms,
        } => cmd_gpu(seconds, interval_ms).await?,
    }

    Ok(())
}

struct RunOptions {
    target: String,
    model: String,
    workload: Option<String>,
    overrides: WorkloadOverrides,
    config_dir: PathBuf,
    output_dir: PathBuf,
    telemetry: bool,
    executor: ExecutorConfig,
}

fn resolve_workload(config: &BenchConfig, opts: &RunOptions) -> Result<WorkloadConfig> {
    let mut workload = match &opts.workload {
        Some(name) => config.workload(name)?.clone(),
        None => {
            let (Some(duration), Some(rps)) = (opts.overrides.duration, opts.overrides.rps) else {
                bail!("--duration and --rps are required when no --workload is given");
            };
            WorkloadConfig::custom(duration, rps)
        }
    };
    workload.apply(&opts.overrides);
    workload.validate()?;
    Ok(workload)
}

async fn cmd_run(opts: RunOptions) -> Result<()> {
    let config = BenchConfig::load(&opts.config_dir)
        .with_context(|| format!("loading config from {}", opts.config_dir.display()))?;
    let target = config.target(&opts.target)?;
    let model = config.model(&opts.model)?;
    let workload = resolve_workload(&config, &opts)?;
    let prompts = config.prompts(&workload.prompt_type)?;

    let client = ChatClient::for_target(target, &model.full_name, opts.executor)?;
    let sampler = match opts.telemetry {
        true => TelemetrySampler::detect(SamplerConfig::default()),
        false => TelemetrySampler::disabled(),
    };

    println!();
    println!("Load Test Plan:");
    println!("{:-<50}", "");
    println!("  Target:       {} ({})", target.name, target.base_url);
    println!("  Model:        {}", model.full_name);
    println!("  Workload:     {}", workload.name);
    println!("  Duration:     {}s", workload.duration);
    println!("  RPS:          {}", workload.rps);
    println!(
        "  Concurrency:  {}",
        workload
            .concurrency
            .map_or_else(|| "unbounded".to_string(), |c| c.to_string())
    );
    println!("  Max tokens:   {}", workload.max_tokens);
    println!("  Temperature:  {}", workload.temperature);
    println!("  Prompt type:  {} ({} prompts)", workload.prompt_type, prompts.len());
    println!("  Expected:     ~{} requests", workload.expected_requests());
    println!("  GPUs:         {}", sampler.device_count());
    println!();

    let labels = RunLabels {
        target: target.name.clone(),
        model: model.name.clone(),
        workload: workload.name.clone(),
    };
    let stem = result_stem(&labels.target, &labels.model, &labels.workload, Utc::now());
    let paths = ResultPaths::new(&opts.output_dir, &stem);

    let runner = LoadRunner::new(client).with_sampler(sampler);
    let result = runner.run(labels, &workload, prompts).await?;

    write_outcomes(&paths.outcomes, &result.outcomes)?;
    write_device_stats(&paths.devices, &result.device_stats)?;

    println!();
    println!("  Issued:       {} requests in {:.1}s", result.issued, result.issue_secs);
    println!("  Wall time:    {:.1}s", result.total_secs);
    println!("  Raw results:  {}", paths.outcomes.display());

    match summarize(&result.outcomes) {
        Ok(stats) => {
            write_summary_csv(&paths.summary, &SummaryRecord::from(&stats))?;
            print_statistics(&stats);
            println!("  Summary:      {}", paths.summary.display());
        }
        Err(e) => {
            warn!("No summary written: {}", e);
            println!("  {}", e);
        }
    }
    print_device_statistics(&result.device_stats);
    println!();

    Ok(())
}

fn cmd_summarize(file: &Path, output: Option<PathBuf>) -> Result<()> {
    let outcomes =
        read_outcomes(file).with_context(|| format!("reading {}", file.display()))?;
    let stats = summarize(&outcomes)?;
    let output =
        output.unwrap_or_else(|| summary_path_for(file, &Path::new("results").join("summary")));

    write_summary_csv(&output, &SummaryRecord::from(&stats))?;
    print_statistics(&stats);
    println!("  Summary:      {}", output.display());
    println!();

    Ok(())
}

async fn cmd_probe(target: &str, model: &str, config_dir: &Path) -> Result<()> {
    let config = BenchConfig::load(config_dir)?;
    let target = config.target(target)?;
    let model = config.model(model)?;
    let client = ChatClient::for_target(target, &model.full_name, ExecutorConfig::default())?;

    println!();
    println!("Probing {} with {}...", target.base_url, model.full_name);

    let request = GenerationRequest {
        request_id: rateburn_core::outcome::request_id(Utc::now(), 0),
        prompt: PROBE_PROMPT.to_string(),
        max_tokens: 32,
        temperature: 0.0,
    };
    let outcome = client.execute(&request).await;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    println!();

    if !outcome.success {
        bail!(
            "probe failed: {}",
            outcome.error_detail.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

async fn cmd_models(target: &str, config_dir: &Path) -> Result<()> {
    let config = BenchConfig::load(config_dir)?;
    let target = config.target(target)?;
    let client = ChatClient::for_target(target, "", ExecutorConfig::default())?;
    let models = client.list_models().await?;

    println!();
    println!("Models served by {}:", target.name);
    println!("{:-<65}", "");
    println!("  {:<4} {}", "#", "ID");
    println!("{:-<65}", "");
    for (i, id) in models.iter().enumerate() {
        println!("  {:<4} {}", i + 1, id);
    }
    println!();

    Ok(())
}

async fn cmd_gpu(seconds: u64, interval_ms: u64) -> Result<()> {
    let sampler = TelemetrySampler::detect(SamplerConfig {
        interval: Duration::from_millis(interval_ms.max(1)),
        ..SamplerConfig::default()
    });
    if sampler.device_count() == 0 {
        bail!("no GPUs available for sampling");
    }

    let sampler = Arc::new(sampler);
    sampler.start();
    for _ in 0..seconds {
        tokio::time::sleep(Duration::from_secs(1)).await;
        println!("{}", sampler.status_line());
    }
    let stopping = Arc::clone(&sampler);
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    print_device_statistics(&sampler.statistics());
    println!();
    Ok(())
}

fn print_statistics(stats: &RunStatistics) {
    println!();
    println!("Results: {} / {} / {}", stats.target, stats.model, stats.workload);
    println!("{:-<50}", "");
    println!("  Requests:     {}", stats.total_requests);
    println!(
        "  Succeeded:    {} ({:.1}%)",
        stats.successful_requests, stats.success_rate
    );
    println!("  Failed:       {}", stats.failed_requests);
    match &stats.time_to_first_chunk {
        Some(ttft) => println!(
            "  TTFT:         mean {:.3}s  p50 {:.3}s  p95 {:.3}s  p99 {:.3}s",
            ttft.mean, ttft.median, ttft.p95, ttft.p99
        ),
        None => println!("  TTFT:         n/a"),
    }
    let total = &stats.total_duration;
    println!(
        "  Total time:   mean {:.3}s  p50 {:.3}s  p95 {:.3}s  p99 {:.3}s",
        total.mean, total.median, total.p95, total.p99
    );
    let tput = &stats.throughput;
    println!(
        "  Tokens/sec:   mean {:.1}  p50 {:.1}  p95 {:.1}",
        tput.mean, tput.median, tput.p95
    );
    println!("  Tokens:       {}", stats.total_units_generated);
}

fn print_device_statistics(stats: &BTreeMap<String, DeviceStatistics>) {
    for (key, dev) in stats {
        println!();
        println!("{} ({}):", key, dev.name);
        println!("{:-<50}", "");
        println!(
            "  Utilization:  avg {:.1}%  max {:.1}%",
            dev.avg_utilization, dev.max_utilization
        );
        println!(
            "  Memory:       avg {:.1}GB  max {:.1}GB  of {:.0}GB",
            dev.avg_memory_used, dev.max_memory_used, dev.memory_total
        );
        println!(
            "  Power:        avg {:.0}W  max {:.0}W  limit {:.0}W",
            dev.avg_power, dev.max_power, dev.power_limit
        );
        println!(
            "  Temperature:  avg {:.0}°C  max {:.0}°C",
            dev.avg_temperature, dev.max_temperature
        );
        println!("  Samples:      {}", dev.sample_count);
    }
}
