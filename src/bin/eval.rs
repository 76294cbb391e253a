use std::fs::{self, File};
use std::io::BufReader;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use artsearch::evaluation::{
    default_consistency_sets, evaluate_consistency, evaluate_known_items, write_consistency_csv,
    write_known_items_json, ConsistencyScore, KnownItemSummary, QueryGroups,
};
use artsearch::{CacheArgs, EmbedderArgs, IndexArgs, PgVectorIndex, QueryEngine};
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    /// Paraphrase consistency only
    Consistency,
    /// Known-item retrieval only
    Synthetic,
    /// Both evaluations
    Both,
}

#[derive(Parser, Debug)]
#[command(
    name = "artsearch-eval",
    about = "Evaluate text-to-image retrieval quality over an embedded collection"
)]
struct EvalCli {
    /// Which evaluation to run
    #[arg(value_enum, default_value_t = Mode::Both)]
    mode: Mode,

    /// Results fetched per query
    #[arg(long, env = "ARTSEARCH_EVAL_TOP_K", default_value_t = 100)]
    top_k: usize,

    /// Directory for `retrieval_consistency.csv` and `synthetic_queries.json`
    #[arg(long, env = "ARTSEARCH_EVAL_OUTPUT_DIR", default_value = "evaluation_results")]
    output_dir: PathBuf,

    /// JSON object mapping set names to paraphrased queries (built-in sets when omitted)
    #[arg(long, env = "ARTSEARCH_CONSISTENCY_FILE")]
    consistency_file: Option<PathBuf>,

    /// JSON object mapping artwork ids to queries written for them
    #[arg(long, env = "ARTSEARCH_SYNTHETIC_QUERIES_FILE")]
    synthetic_queries_file: Option<PathBuf>,

    #[command(flatten)]
    cache: CacheArgs,

    #[command(flatten)]
    index: IndexArgs,

    #[command(flatten)]
    embedder: EmbedderArgs,
}

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "evaluation failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = EvalCli::parse();
    let top_k = cli.top_k.max(1);
    let consistency = match cli.mode {
        Mode::Synthetic => None,
        Mode::Consistency | Mode::Both => Some(match &cli.consistency_file {
            Some(path) => load_groups(path)?,
            None => default_consistency_sets(),
        }),
    };
    let synthetic = match (&cli.synthetic_queries_file, cli.mode) {
        (Some(path), Mode::Synthetic | Mode::Both) => Some(load_groups(path)?),
        (None, Mode::Synthetic) => {
            anyhow::bail!("synthetic evaluation needs --synthetic-queries-file")
        }
        (None, Mode::Both) => {
            warn!("no --synthetic-queries-file given; skipping known-item evaluation");
            None
        }
        (_, Mode::Consistency) => None,
    };

    fs::create_dir_all(&cli.output_dir)
        .with_context(|| format!("failed to create {:?}", cli.output_dir))?;
    let collection = cli.index.collection_name()?;
    let backend = cli
        .embedder
        .connect(1)
        .context("failed to initialise embedding backend")?;
    let index = PgVectorIndex::connect(&cli.index.database_url)
        .context("failed to connect to vector index")?;
    let mut engine = QueryEngine::new(backend, index, collection, cli.embedder.full_precision)
        .with_cache(cli.cache.embedding_cache_size);

    if let Some(groups) = &consistency {
        let scores = evaluate_consistency(&mut engine, groups, top_k)
            .context("consistency evaluation failed")?;
        render_consistency(&scores);
        let path = cli.output_dir.join("retrieval_consistency.csv");
        write_consistency_csv(&path, &scores)
            .with_context(|| format!("failed to write {:?}", path))?;
        info!(path = %path.display(), "consistency results written");
    }
    if let Some(targets) = &synthetic {
        let report = evaluate_known_items(&mut engine, targets, top_k)
            .context("known-item evaluation failed")?;
        render_known_items(&report.overall);
        let path = cli.output_dir.join("synthetic_queries.json");
        write_known_items_json(&path, &report)
            .with_context(|| format!("failed to write {:?}", path))?;
        info!(path = %path.display(), "known-item results written");
    }
    engine.release();
    Ok(())
}

fn load_groups(path: &Path) -> Result<QueryGroups> {
    let file = File::open(path).with_context(|| format!("failed to open {:?}", path))?;
    let groups: QueryGroups = serde_json::from_reader(BufReader::new(file))
        .with_context(|| format!("invalid query file {:?}", path))?;
    anyhow::ensure!(!groups.is_empty(), "query file {:?} is empty", path);
    Ok(groups)
}

fn render_consistency(scores: &[ConsistencyScore]) {
    println!("--- Retrieval Consistency ---");
    for score in scores {
        println!(
            "{}: {:.4} mean Jaccard over {} queries",
            score.set, score.mean_jaccard, score.queries
        );
    }
    if !scores.is_empty() {
        let mean = scores.iter().map(|s| s.mean_jaccard).sum::<f64>() / scores.len() as f64;
        println!("overall: {mean:.4}");
    }
}

fn render_known_items(summary: &KnownItemSummary) {
    println!("--- Known-Item Retrieval ---");
    println!("artworks: {}", summary.total_artworks);
    println!("queries: {}", summary.total_queries);
    println!("top_k: {}", summary.top_k);
    println!("mean reciprocal rank: {:.4}", summary.mrr);
    for (k, rate) in &summary.success_at_k {
        println!("success@{k}: {rate:.4}");
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
