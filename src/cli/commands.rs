//! CLI command definitions for pageforge.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::analysis::{OpenAiClient, ResultSink, WebhookSink};
use crate::engine::{plan_batches, EngineConfig, Orchestrator};
use crate::metrics::{export_metrics, init_metrics};
use crate::model::{FailurePolicy, JobSubmission, PageInput};
use crate::scheduler::{
    Channel, InMemoryWorkQueue, RedisWorkQueue, WorkQueue, WorkerPoolConfig,
};

/// Default Redis namespace for queue keys.
const DEFAULT_NAMESPACE: &str = "pageforge";

/// Image extensions picked up from an input directory.
const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "webp", "gif"];

/// Batch orchestration for large multi-page document analysis.
#[derive(Parser)]
#[command(name = "pageforge")]
#[command(about = "Split large document analysis jobs into batches and run them across worker pools")]
#[command(version)]
#[command(
    long_about = "pageforge decomposes a multi-page document into batches of page tasks, runs them through a vision model with retries, and reassembles the ordered result.\n\nExample usage:\n  pageforge plan --pages 60\n  pageforge run --input ./pages --doc-type pdf --output result.json"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Print the batch plan for a page count.
    Plan(PlanArgs),

    /// Analyze a directory of page images (or a text) end to end.
    Run(RunArgs),

    /// Show depth and dead letters of the Redis queue channels.
    Stats(StatsArgs),
}

/// Arguments for `pageforge plan`.
#[derive(Parser, Debug)]
pub struct PlanArgs {
    /// Number of pages in the document.
    #[arg(short, long)]
    pub pages: usize,

    /// Pages per batch (defaults to PAGEFORGE_BATCH_SIZE or 25).
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Largest page count processed as a single batch.
    #[arg(short, long)]
    pub threshold: Option<usize>,
}

/// Arguments for `pageforge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Directory of page images, read in file-name order.
    #[arg(short, long, conflicts_with = "text")]
    pub input: Option<PathBuf>,

    /// Analyze this text as a single page instead of images.
    #[arg(long)]
    pub text: Option<String>,

    /// Document type shown to the model (pdf, pptx, ...).
    #[arg(short, long, default_value = "pdf")]
    pub doc_type: String,

    /// Opaque owner identifier carried into the report.
    #[arg(long, default_value = "cli")]
    pub owner: String,

    /// Pages per batch.
    #[arg(short, long)]
    pub batch_size: Option<usize>,

    /// Failure policy: fail-fast or best-effort.
    #[arg(long)]
    pub policy: Option<FailurePolicy>,

    /// Comma-separated 1-based page numbers to analyze, e.g. 3,1,7.
    #[arg(long, value_delimiter = ',', requires = "input")]
    pub select: Option<Vec<usize>>,

    /// Page analysis workers.
    #[arg(short = 'w', long, default_value = "8")]
    pub workers: usize,

    /// Use a Redis queue instead of the in-memory one.
    #[arg(long, env = "PAGEFORGE_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Key namespace of the Redis queue.
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,

    /// POST the job report to this URL.
    #[arg(long, env = "PAGEFORGE_WEBHOOK_URL")]
    pub webhook_url: Option<String>,

    /// Write the final result here instead of stdout.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub metrics: bool,
}

/// Arguments for `pageforge stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Redis connection URL.
    #[arg(long, env = "PAGEFORGE_REDIS_URL")]
    pub redis_url: String,

    /// Key namespace of the Redis queue.
    #[arg(long, default_value = DEFAULT_NAMESPACE)]
    pub namespace: String,
}

/// Parse CLI arguments.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Plan(args) => run_plan_command(args),
        Commands::Run(args) => run_run_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
    }
}

#[derive(Debug, Serialize)]
struct PlanEntry {
    batch_index: usize,
    start: usize,
    end: usize,
    pages: usize,
}

fn run_plan_command(args: PlanArgs) -> anyhow::Result<()> {
    let config = EngineConfig::from_env()?;
    let batch_size = args.batch_size.unwrap_or(config.batch_size);
    let threshold = args.threshold.unwrap_or(config.batching_threshold);

    let plan: Vec<PlanEntry> = plan_batches(args.pages, batch_size, threshold)
        .into_iter()
        .enumerate()
        .map(|(batch_index, range)| PlanEntry {
            batch_index,
            start: range.start,
            end: range.end,
            pages: range.len(),
        })
        .collect();

    println!("{}", serde_json::to_string_pretty(&plan)?);
    Ok(())
}

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    if args.metrics {
        init_metrics().context("Failed to initialize metrics")?;
    }

    let mut submission = JobSubmission::new(args.owner.clone(), args.doc_type.clone());
    match (&args.input, &args.text) {
        (Some(dir), _) => {
            let pages = load_page_images(dir)?;
            info!(pages = pages.len(), input = %dir.display(), "Loaded page images");
            submission = submission.with_pages(pages);
        }
        (None, Some(text)) => submission = submission.with_fallback_text(text.clone()),
        (None, None) => anyhow::bail!("Either --input or --text is required"),
    }
    if let Some(policy) = args.policy {
        submission = submission.with_policy(policy);
    }
    if let Some(batch_size) = args.batch_size {
        submission = submission.with_batch_size(batch_size);
    }
    if let Some(selection) = &args.select {
        submission = submission.with_selected_pages(selection.clone());
    }

    let queue: Arc<dyn WorkQueue> = match &args.redis_url {
        Some(url) => Arc::new(
            RedisWorkQueue::connect(url, &args.namespace)
                .await
                .context("Failed to connect to Redis")?,
        ),
        None => Arc::new(InMemoryWorkQueue::new()),
    };

    let config = EngineConfig::from_env()?;
    let client = Arc::new(OpenAiClient::from_env()?);
    let mut orchestrator = Orchestrator::new(config, queue, client.clone(), client);
    if let Some(url) = &args.webhook_url {
        let sink: Arc<dyn ResultSink> = Arc::new(WebhookSink::new(url.clone()));
        orchestrator = orchestrator.with_sink(sink);
    }
    let orchestrator = Arc::new(orchestrator);

    let mut pool = orchestrator.worker_pool(
        WorkerPoolConfig::default()
            .with_workers(Channel::PageAnalysis, args.workers)
            .with_poll_interval(Duration::from_millis(200)),
    );
    pool.start().await?;

    let job_id = orchestrator.submit_job(submission).await?;
    let status = orchestrator
        .wait_for_terminal(&job_id, Duration::from_millis(500))
        .await?;
    info!(job_id = %job_id, status = %status, "Job finished");

    if let Err(e) = pool.shutdown().await {
        warn!(error = %e, "Worker pool did not shut down cleanly");
    }

    let result = orchestrator.get_job_result(&job_id)?;
    let json = serde_json::to_string_pretty(&result)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write {}", path.display()))?;
            info!(output = %path.display(), "Result written");
        }
        None => println!("{}", json),
    }

    if args.metrics {
        println!("{}", export_metrics());
    }
    Ok(())
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let queue = RedisWorkQueue::connect(&args.redis_url, &args.namespace)
        .await
        .context("Failed to connect to Redis")?;

    let mut stats = Vec::with_capacity(Channel::ALL.len());
    for channel in Channel::ALL {
        stats.push(queue.stats(channel).await?);
    }
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

/// Reads every image below `dir`, sorted by path.
fn load_page_images(dir: &Path) -> anyhow::Result<Vec<PageInput>> {
    if !dir.is_dir() {
        anyhow::bail!("Input directory does not exist: {}", dir.display());
    }

    let mut paths: Vec<PathBuf> = WalkDir::new(dir)
        .follow_links(true)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| image_mime(path).is_some())
        .collect();
    paths.sort();

    paths
        .into_iter()
        .map(|path| {
            let data = std::fs::read(&path)
                .with_context(|| format!("Failed to read {}", path.display()))?;
            let mime = image_mime(&path).unwrap_or("image/png").to_string();
            Ok(PageInput::Image { data, mime })
        })
        .collect()
}

fn image_mime(path: &Path) -> Option<&'static str> {
    let extension = path.extension()?.to_str()?.to_ascii_lowercase();
    if !IMAGE_EXTENSIONS.contains(&extension.as_str()) {
        return None;
    }
    Some(match extension.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "webp" => "image/webp",
        "gif" => "image/gif",
        _ => "image/png",
    })
}
