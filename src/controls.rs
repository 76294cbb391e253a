//! Run controls and the flag groups shared by the binaries.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use clap::Args;

use crate::embedder::clip_http::ClipHttpBackend;
use crate::embedder::DeviceRequest;
use crate::source::DatasetFilter;
use crate::vector_store::CollectionName;

/// Tunable knobs of a generation run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerateControls {
    collection: CollectionName,
    datasets: DatasetFilter,
    limit: Option<usize>,
    batch_size: usize,
    upsert_batch_size: usize,
    max_workers: usize,
    force_full_precision: bool,
    reset: bool,
    resume: bool,
    output_dir: Option<PathBuf>,
}

impl GenerateControls {
    /// Controls with default sizing for `collection`.
    pub fn new(collection: CollectionName) -> Self {
        Self {
            collection,
            datasets: DatasetFilter::all(),
            limit: None,
            batch_size: 16,
            upsert_batch_size: 100,
            max_workers: 8,
            force_full_precision: false,
            reset: false,
            resume: false,
            output_dir: None,
        }
    }

    /// Restricts the run to some datasets.
    pub fn with_datasets(mut self, datasets: DatasetFilter) -> Self {
        self.datasets = datasets;
        self
    }

    /// Caps the records read per dataset.
    pub fn with_limit(mut self, limit: Option<usize>) -> Self {
        self.limit = limit;
        self
    }

    /// Images per embedding call (at least 1).
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Vectors per upsert call (at least 1).
    pub fn with_upsert_batch_size(mut self, upsert_batch_size: usize) -> Self {
        self.upsert_batch_size = upsert_batch_size.max(1);
        self
    }

    /// Concurrent image fetches (at least 1).
    pub fn with_max_workers(mut self, max_workers: usize) -> Self {
        self.max_workers = max_workers.max(1);
        self
    }

    /// Disables fp16 even on capable GPUs.
    pub fn with_full_precision(mut self, force: bool) -> Self {
        self.force_full_precision = force;
        self
    }

    /// Drops the collection before writing.
    pub fn with_reset(mut self, reset: bool) -> Self {
        self.reset = reset;
        self
    }

    /// Skips ids recorded as succeeded by a previous run.
    pub fn with_resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    /// Directory receiving the ledger artifacts.
    pub fn with_output_dir(mut self, dir: Option<PathBuf>) -> Self {
        self.output_dir = dir;
        self
    }

    /// Target collection.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Dataset filter.
    pub fn datasets(&self) -> &DatasetFilter {
        &self.datasets
    }

    /// Per-dataset record cap.
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Images per embedding call.
    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// Vectors per upsert call.
    pub fn upsert_batch_size(&self) -> usize {
        self.upsert_batch_size
    }

    /// Concurrent image fetches.
    pub fn max_workers(&self) -> usize {
        self.max_workers
    }

    /// Whether fp16 is disabled.
    pub fn force_full_precision(&self) -> bool {
        self.force_full_precision
    }

    /// Whether the collection is dropped first.
    pub fn reset(&self) -> bool {
        self.reset
    }

    /// Whether previous successes are skipped.
    pub fn resume(&self) -> bool {
        self.resume
    }

    /// Artifact directory, if any.
    pub fn output_dir(&self) -> Option<&Path> {
        self.output_dir.as_deref()
    }
}

/// Vector index location flags.
#[derive(Args, Debug, Clone)]
pub struct IndexArgs {
    /// Postgres connection string (postgres://...)
    #[arg(long, env = "DATABASE_URL")]
    pub database_url: String,

    /// Schema holding the collection tables
    #[arg(long, env = "ARTSEARCH_SCHEMA", default_value = "public")]
    pub schema: String,

    /// Collection (table) name
    #[arg(long, env = "ARTSEARCH_COLLECTION", default_value = "artwork_clip_embeddings")]
    pub collection: String,
}

impl IndexArgs {
    /// Validated collection name.
    pub fn collection_name(&self) -> Result<CollectionName> {
        CollectionName::new(self.schema.clone(), self.collection.clone())
    }
}

/// Embedding server flags.
#[derive(Args, Debug, Clone)]
pub struct EmbedderArgs {
    /// Base URL of the CLIP inference server
    #[arg(long, env = "ARTSEARCH_EMBED_URL", default_value = "http://127.0.0.1:8500")]
    pub embed_url: String,

    /// Optional bearer token for the inference server
    #[arg(long, env = "ARTSEARCH_EMBED_API_KEY")]
    pub embed_api_key: Option<String>,

    /// Force CPU inference even when a GPU is available
    #[arg(long, env = "ARTSEARCH_CPU", default_value_t = false)]
    pub cpu: bool,

    /// Compute at fp32 even on GPUs with fp16 support
    #[arg(long, env = "ARTSEARCH_FULL_PRECISION", default_value_t = false)]
    pub full_precision: bool,

    /// Per-request timeout for inference calls in seconds
    #[arg(long, env = "ARTSEARCH_EMBED_TIMEOUT_SECS", default_value_t = 120)]
    pub embed_timeout_secs: u64,

    /// Attempts per inference request on transient errors
    #[arg(long, env = "ARTSEARCH_EMBED_MAX_RETRIES", default_value_t = 3)]
    pub embed_max_retries: usize,
}

impl EmbedderArgs {
    /// Device preference from `--cpu`.
    pub fn device_request(&self) -> DeviceRequest {
        if self.cpu {
            DeviceRequest::Cpu
        } else {
            DeviceRequest::Auto
        }
    }

    /// Connects to the inference server.
    pub fn connect(&self, batch_size: usize) -> Result<ClipHttpBackend> {
        ClipHttpBackend::connect(
            self.embed_url.clone(),
            self.embed_api_key.clone(),
            self.device_request(),
            Duration::from_secs(self.embed_timeout_secs.max(1)),
            self.embed_max_retries,
            batch_size,
        )
    }
}

/// Query embedding cache flags.
#[derive(Args, Debug, Clone)]
pub struct CacheArgs {
    /// Max cached query embeddings kept in memory (0 disables caching)
    #[arg(long, env = "ARTSEARCH_EMBEDDING_CACHE_SIZE", default_value_t = 1024)]
    pub embedding_cache_size: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[derive(Parser, Debug)]
    struct CacheCli {
        #[command(flatten)]
        cache: CacheArgs,
    }

    #[test]
    fn embedding_cache_size_flag() {
        let defaults = CacheCli::try_parse_from(["artsearch"]).expect("defaults");
        assert_eq!(defaults.cache.embedding_cache_size, 1024);
        let disabled = CacheCli::try_parse_from(["artsearch", "--embedding-cache-size", "0"])
            .expect("disabled");
        assert_eq!(disabled.cache.embedding_cache_size, 0);
    }

    #[test]
    fn sizes_are_clamped_to_one() {
        let controls = GenerateControls::new(
            CollectionName::new("public", "artworks").expect("collection"),
        )
        .with_batch_size(0)
        .with_upsert_batch_size(0)
        .with_max_workers(0);
        assert_eq!(controls.batch_size(), 1);
        assert_eq!(controls.upsert_batch_size(), 1);
        assert_eq!(controls.max_workers(), 1);
    }

    #[test]
    fn defaults_match_flag_defaults() {
        let controls =
            GenerateControls::new(CollectionName::new("public", "artworks").expect("collection"));
        assert_eq!(controls.batch_size(), 16);
        assert_eq!(controls.upsert_batch_size(), 100);
        assert_eq!(controls.max_workers(), 8);
        assert!(!controls.reset() && !controls.resume());
        assert!(controls.output_dir().is_none());
    }
}
