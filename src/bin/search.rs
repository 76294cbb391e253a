use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use artsearch::query::{render_results, save_results, QueryResults};
use artsearch::{CacheArgs, EmbedderArgs, IndexArgs, PgVectorIndex, QueryEngine};
use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "artsearch-search",
    about = "Search embedded artworks with natural-language queries"
)]
struct SearchCli {
    /// Query text, e.g. "portrait of a woman with a pearl earring" (repeatable)
    queries: Vec<String>,

    /// File with one query per line; blank lines and `#` comments are skipped
    #[arg(long, env = "ARTSEARCH_QUERIES_FILE")]
    queries_file: Option<PathBuf>,

    /// Number of results to return per query
    #[arg(long, env = "ARTSEARCH_TOP_K", default_value_t = 5)]
    top_k: usize,

    /// Write the ranked results as JSON to this path
    #[arg(long, env = "ARTSEARCH_SAVE_RESULTS")]
    save_results: Option<PathBuf>,

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
        error!(error = %err, "search failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = SearchCli::parse();
    let mut queries = cli.queries.clone();
    if let Some(path) = &cli.queries_file {
        queries.extend(load_queries(path)?);
    }
    anyhow::ensure!(
        !queries.is_empty(),
        "no queries given; pass query text or --queries-file"
    );

    let collection = cli.index.collection_name()?;
    let backend = cli
        .embedder
        .connect(1)
        .context("failed to initialise embedding backend")?;
    let index = PgVectorIndex::connect(&cli.index.database_url)
        .context("failed to connect to vector index")?;

    let mut engine = QueryEngine::new(backend, index, collection, cli.embedder.full_precision)
        .with_cache(cli.cache.embedding_cache_size);
    let mut runs = Vec::with_capacity(queries.len());
    for query in queries {
        let results = engine
            .search(&query, cli.top_k)
            .with_context(|| format!("query {:?} failed", query))?;
        println!("{}", render_results(&query, &results));
        runs.push(QueryResults { query, results });
    }
    engine.release();

    if let Some(path) = &cli.save_results {
        save_results(path, &runs)
            .with_context(|| format!("failed to save results to {:?}", path))?;
        info!(path = %path.display(), queries = runs.len(), "results saved");
    }
    Ok(())
}

fn load_queries(path: &Path) -> Result<Vec<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("failed to read {:?}", path))?;
    Ok(text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
