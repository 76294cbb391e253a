#![warn(missing_docs)]
//! Image embedding pipeline, text-to-image search and retrieval evaluation over museum
//! artwork collections.

pub mod artwork;
pub mod controls;
pub mod embedder;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod fetcher;
pub mod ledger;
pub mod pipeline;
pub mod pixels;
pub mod query;
pub mod source;
pub mod vector_store;
pub mod writer;

pub use artwork::{ArtworkMetadata, ArtworkRecord};
pub use controls::{CacheArgs, EmbedderArgs, GenerateControls, IndexArgs};
pub use embedder::clip_http::ClipHttpBackend;
pub use embedder::{
    Device, DeviceCapability, DeviceRequest, EmbeddingBackend, EmbeddingVector, Precision,
};
pub use engine::{BatchEmbeddingEngine, EmbedOutcome, FallbackStrategy};
pub use error::{
    EmbedError, EmbeddingBatchError, EmbeddingItemError, FetchError, IndexError, LedgerError,
    PipelineError, QueryError, SourceError, StoreCommitError,
};
pub use fetcher::{FetchPool, FetchStatus, FetchedImage, HttpImageFetcher, ImageFetcher};
pub use ledger::{FailureReason, RunLedger, RunOutcome};
pub use pipeline::{run_generation, RunReport, StopSignal};
pub use pixels::PixelImage;
pub use query::{QueryEngine, QueryResults, SearchResult};
pub use source::{DatasetFilter, JsonlSource, MetadataSource};
pub use vector_store::{CollectionName, MemoryIndex, PgVectorIndex, VectorIndex};
pub use writer::VectorStoreWriter;
