use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use artsearch::{
    run_generation, DatasetFilter, EmbedderArgs, GenerateControls, HttpImageFetcher, IndexArgs,
    JsonlSource, PgVectorIndex, StopSignal,
};
use clap::Parser;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "artsearch-generate",
    about = "Embed artwork images with CLIP and store the vectors in pgvector"
)]
struct GenerateCli {
    /// Directory of normalized `<dataset>.jsonl` files
    #[arg(long, env = "ARTSEARCH_DATA_DIR", default_value = "data")]
    data_dir: PathBuf,

    /// Datasets to embed (repeatable); all datasets when omitted
    #[arg(long = "dataset", env = "ARTSEARCH_DATASETS", value_delimiter = ',')]
    datasets: Vec<String>,

    /// Maximum artworks read per dataset
    #[arg(long, env = "ARTSEARCH_LIMIT")]
    limit: Option<usize>,

    /// Images per embedding call
    #[arg(long, env = "ARTSEARCH_BATCH_SIZE", default_value_t = 16)]
    batch_size: usize,

    /// Vectors per upsert transaction
    #[arg(long, env = "ARTSEARCH_UPSERT_BATCH_SIZE", default_value_t = 100)]
    upsert_batch_size: usize,

    /// Concurrent image downloads
    #[arg(long, env = "ARTSEARCH_MAX_WORKERS", default_value_t = 8)]
    max_workers: usize,

    /// Per-image download timeout in seconds
    #[arg(long, env = "ARTSEARCH_FETCH_TIMEOUT_SECS", default_value_t = 10)]
    fetch_timeout_secs: u64,

    /// Drop the collection before writing
    #[arg(long, env = "ARTSEARCH_RESET", default_value_t = false)]
    reset: bool,

    /// Skip artworks recorded as succeeded in the output directory
    #[arg(long, env = "ARTSEARCH_RESUME", default_value_t = false)]
    resume: bool,

    /// Directory for the success/failure artifacts
    #[arg(long, env = "ARTSEARCH_OUTPUT_DIR", default_value = "embeddings")]
    output_dir: PathBuf,

    #[command(flatten)]
    index: IndexArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "generation failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = GenerateCli::parse();
    let collection = cli.index.collection_name()?;
    let controls = GenerateControls::new(collection)
        .with_datasets(DatasetFilter::only(cli.datasets.iter().cloned()))
        .with_limit(cli.limit)
        .with_batch_size(cli.batch_size)
        .with_upsert_batch_size(cli.upsert_batch_size)
        .with_max_workers(cli.max_workers)
        .with_full_precision(cli.embedder.full_precision)
        .with_reset(cli.reset)
        .with_resume(cli.resume)
        .with_output_dir(Some(cli.output_dir.clone()));

    let source = JsonlSource::open(&cli.data_dir)
        .with_context(|| format!("failed to open dataset directory {:?}", cli.data_dir))?;
    let backend = cli
        .embedder
        .connect(controls.batch_size())
        .context("failed to initialise embedding backend")?;
    let fetcher = HttpImageFetcher::new(
        Duration::from_secs(cli.fetch_timeout_secs.max(1)),
        backend.input_resolution(),
    )?;
    let index = PgVectorIndex::connect(&cli.index.database_url)
        .context("failed to connect to vector index")?;

    let stop = StopSignal::new();
    install_ctrl_c(stop.clone());

    let report = run_generation(&source, Arc::new(fetcher), backend, index, &controls, &stop)
        .context("embedding run aborted")?;
    info!(
        succeeded = report.outcome.succeeded.len(),
        failed = report.outcome.failed.len(),
        "run complete"
    );
    println!("{report}");
    Ok(())
}

fn install_ctrl_c(stop: StopSignal) {
    let spawned = thread::Builder::new()
        .name("artsearch-ctrl-c".to_string())
        .spawn(move || {
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(err) => {
                    warn!(error = %err, "ctrl-c handler unavailable");
                    return;
                }
            };
            while runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                if stop.request() {
                    warn!("second ctrl-c received; exiting without finishing in-flight work");
                    std::process::exit(130);
                }
                warn!("ctrl-c received; finishing in-flight work (press again to force exit)");
            }
        });
    if let Err(err) = spawned {
        warn!(error = %err, "failed to start ctrl-c watcher");
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
