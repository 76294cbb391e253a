//! Error taxonomy for the generation and query paths.
//!
//! Per-item and per-batch errors ([`FetchError`], [`EmbeddingBatchError`],
//! [`EmbeddingItemError`], [`StoreCommitError`]) end up in the run ledger and never abort a
//! run. [`PipelineError`] and [`QueryError`] are the only errors surfaced to callers.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::fetcher::FetchStatus;

/// Failure to acquire or decode one artwork image.
#[derive(Debug, Error)]
pub enum FetchError {
    /// The record has no usable image URL.
    #[error("artwork has no image url")]
    MissingUrl,
    /// The URL could not be parsed.
    #[error("invalid image url {url}: {message}")]
    InvalidUrl {
        /// Offending URL.
        url: String,
        /// Parser message.
        message: String,
    },
    /// The request or body read exceeded the fetch timeout.
    #[error("image request to {url} timed out")]
    Timeout {
        /// Requested URL.
        url: String,
    },
    /// Connection or transport failure.
    #[error("image request to {url} failed: {message}")]
    Http {
        /// Requested URL.
        url: String,
        /// Transport message.
        message: String,
    },
    /// The server answered with a non-success status.
    #[error("image at {url} returned status {status}")]
    Status {
        /// Requested URL.
        url: String,
        /// HTTP status code.
        status: u16,
    },
    /// The body exceeded the size cap.
    #[error("image at {url} exceeds {limit} bytes")]
    TooLarge {
        /// Requested URL.
        url: String,
        /// Cap in bytes.
        limit: u64,
    },
    /// The payload was not a decodable image.
    #[error("could not decode image from {url}: {message}")]
    Decode {
        /// Requested URL.
        url: String,
        /// Decoder message.
        message: String,
    },
}

impl FetchError {
    /// Status recorded for the artwork when this error occurs.
    pub fn status(&self) -> FetchStatus {
        match self {
            Self::Timeout { .. } => FetchStatus::Timeout,
            Self::Decode { .. } | Self::TooLarge { .. } => FetchStatus::DecodeError,
            Self::MissingUrl
            | Self::InvalidUrl { .. }
            | Self::Http { .. }
            | Self::Status { .. } => FetchStatus::NotFound,
        }
    }
}

/// Error raised by an embedding backend call.
#[derive(Debug, Error)]
pub enum EmbedError {
    /// The request could not be delivered.
    #[error("embedding request failed: {0}")]
    Request(String),
    /// The service rejected the request.
    #[error("embedding service returned status {status}: {body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body, if readable.
        body: String,
    },
    /// The response did not match the request (count, dimension, non-finite values).
    #[error("malformed embedding response: {0}")]
    Response(String),
    /// The input could not be encoded for the model.
    #[error("embedding input rejected: {0}")]
    InvalidInput(String),
}

/// A whole batch failed; the engine falls back to per-image embedding.
#[derive(Debug, Error)]
#[error("embedding batch of {size} image(s) failed: {source}")]
pub struct EmbeddingBatchError {
    /// Number of images in the failed batch.
    pub size: usize,
    /// Backend failure.
    #[source]
    pub source: EmbedError,
}

/// A single image failed to embed; terminal for that artwork.
#[derive(Debug, Error)]
#[error("embedding failed for {artwork_id}: {source}")]
pub struct EmbeddingItemError {
    /// Artwork whose image failed.
    pub artwork_id: String,
    /// Backend failure.
    #[source]
    pub source: EmbedError,
}

/// Vector index failures.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The collection has not been created.
    #[error("collection {0} does not exist")]
    MissingCollection(String),
    /// A vector does not match the collection dimension.
    #[error("collection {collection} stores {expected}-dimensional vectors, got {actual}")]
    DimensionMismatch {
        /// Collection label.
        collection: String,
        /// Dimension fixed by the collection.
        expected: usize,
        /// Dimension supplied.
        actual: usize,
    },
    /// An id appeared twice in one upsert batch.
    #[error("duplicate id {0} in upsert batch")]
    DuplicateId(String),
    /// The upsert batch reached its configured size.
    #[error("upsert batch is full ({0} entries)")]
    BatchFull(usize),
    /// Backend-specific failure (connection, SQL, ...).
    #[error("vector index backend error: {0}")]
    Backend(String),
}

/// An upsert batch failed after its retry; every id in it is recorded as failed.
#[derive(Debug, Error)]
#[error("upsert of {size} vector(s) into {collection} failed after {attempts} attempt(s): {source}")]
pub struct StoreCommitError {
    /// Collection label.
    pub collection: String,
    /// Entries in the batch.
    pub size: usize,
    /// Attempts made, including the retry.
    pub attempts: usize,
    /// Last index failure.
    #[source]
    pub source: IndexError,
}

/// Failure of a single search invocation.
#[derive(Debug, Error)]
pub enum QueryError {
    /// The query text was blank.
    #[error("query text must not be empty")]
    EmptyQuery,
    /// `top_k` was zero.
    #[error("top_k must be at least 1")]
    InvalidTopK,
    /// The collection holds no vectors.
    #[error("collection {0} is empty")]
    EmptyCollection(String),
    /// The text encoder failed.
    #[error("failed to embed query: {0}")]
    Embedding(#[source] EmbedError),
    /// The nearest-neighbor query failed.
    #[error("vector index query failed: {0}")]
    Index(#[source] IndexError),
}

/// Failures while reading artwork metadata.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The data directory is missing or unreadable.
    #[error("failed to read dataset directory {path:?}: {source}")]
    DataDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A requested dataset has no file.
    #[error("dataset {dataset} not found at {path:?}")]
    MissingDataset {
        /// Dataset name.
        dataset: String,
        /// Expected file path.
        path: PathBuf,
    },
    /// Reading a dataset file failed.
    #[error("failed to read {path:?}: {source}")]
    Io {
        /// Dataset file.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// A line was not a valid artwork record.
    #[error("invalid artwork record at {path:?} line {line}: {source}")]
    Parse {
        /// Dataset file.
        path: PathBuf,
        /// 1-based line number.
        line: usize,
        /// JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Failures while recording or persisting the run ledger.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// An id was recorded twice.
    #[error("artwork {0} already has a recorded outcome")]
    DuplicateOutcome(String),
    /// Some entered ids were never recorded, or recorded ids never entered.
    #[error(
        "ledger closure violated: {} id(s) unrecorded, {} id(s) outside the input set",
        .missing.len(),
        .unexpected.len()
    )]
    Closure {
        /// Ids that entered the pipeline without an outcome.
        missing: Vec<String>,
        /// Ids with an outcome that never entered the pipeline.
        unexpected: Vec<String>,
    },
    /// Artifact I/O failed.
    #[error("failed to access ledger artifact {path:?}: {source}")]
    Io {
        /// Artifact path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: io::Error,
    },
    /// Artifact (de)serialization failed.
    #[error("invalid ledger artifact {path:?}: {source}")]
    Json {
        /// Artifact path.
        path: PathBuf,
        /// JSON error.
        #[source]
        source: serde_json::Error,
    },
}

/// Fatal errors of a generation run.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// Metadata could not be loaded.
    #[error(transparent)]
    Source(#[from] SourceError),
    /// The collection could not be prepared or inspected.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// The ledger could not be recorded or persisted.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Worker threads could not be started.
    #[error("failed to start fetch workers: {0}")]
    Spawn(#[source] io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_errors_map_to_statuses() {
        let timeout = FetchError::Timeout {
            url: "https://img.test/a.jpg".to_string(),
        };
        assert_eq!(timeout.status(), FetchStatus::Timeout);
        let status = FetchError::Status {
            url: "https://img.test/a.jpg".to_string(),
            status: 404,
        };
        assert_eq!(status.status(), FetchStatus::NotFound);
        assert_eq!(FetchError::MissingUrl.status(), FetchStatus::NotFound);
        let decode = FetchError::Decode {
            url: "https://img.test/a.jpg".to_string(),
            message: "bad magic".to_string(),
        };
        assert_eq!(decode.status(), FetchStatus::DecodeError);
    }

    #[test]
    fn closure_error_reports_counts() {
        let err = LedgerError::Closure {
            missing: vec!["a".to_string(), "b".to_string()],
            unexpected: Vec::new(),
        };
        assert_eq!(
            err.to_string(),
            "ledger closure violated: 2 id(s) unrecorded, 0 id(s) outside the input set"
        );
    }
}
