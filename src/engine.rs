//! Batch embedding engine with a two-tier batch/per-image strategy.

use tracing::{debug, info, warn};

use crate::artwork::ArtworkRecord;
use crate::embedder::{EmbeddingBackend, EmbeddingVector, Precision};
use crate::error::{EmbedError, EmbeddingBatchError, EmbeddingItemError};
use crate::fetcher::FetchedImage;
use crate::ledger::FailureReason;
use crate::pixels::PixelImage;

/// An artwork whose image was fetched and decoded, waiting for a batch slot.
#[derive(Debug)]
pub struct ReadyImage {
    /// Source record.
    pub record: ArtworkRecord,
    /// Model-ready pixels.
    pub image: PixelImage,
}

/// Terminal result of the embedding stage for one artwork.
#[derive(Debug)]
pub enum EmbedOutcome {
    /// The artwork has a vector and moves on to the writer.
    Embedded {
        /// Source record.
        record: ArtworkRecord,
        /// Computed vector.
        vector: EmbeddingVector,
    },
    /// The artwork stops here and is recorded as failed.
    Failed {
        /// Source record.
        record: ArtworkRecord,
        /// Ledger classification.
        reason: FailureReason,
        /// Human-readable cause.
        detail: String,
    },
}

impl EmbedOutcome {
    /// Identifier of the artwork this outcome belongs to.
    pub fn artwork_id(&self) -> &str {
        match self {
            Self::Embedded { record, .. } | Self::Failed { record, .. } => &record.id,
        }
    }

    /// Whether a vector was produced.
    pub fn is_embedded(&self) -> bool {
        matches!(self, Self::Embedded { .. })
    }
}

/// First tier: one backend call for the whole batch.
#[derive(Debug, Clone, Copy)]
pub struct BatchTier {
    expected_dimension: usize,
}

impl BatchTier {
    /// Tier that rejects vectors whose length differs from `expected_dimension`.
    pub fn new(expected_dimension: usize) -> Self {
        Self { expected_dimension }
    }

    /// Embeds `images` in one call. Output position `i` belongs to input position `i`.
    pub fn run<B: EmbeddingBackend + ?Sized>(
        &self,
        backend: &mut B,
        images: &[PixelImage],
        precision: Precision,
    ) -> Result<Vec<Vec<f32>>, EmbeddingBatchError> {
        let size = images.len();
        let vectors = backend
            .embed_images(images, precision)
            .map_err(|source| EmbeddingBatchError { size, source })?;
        if vectors.len() != size {
            return Err(EmbeddingBatchError {
                size,
                source: EmbedError::Response(format!(
                    "expected {size} vectors, got {}",
                    vectors.len()
                )),
            });
        }
        for vector in &vectors {
            validate_vector(vector, self.expected_dimension)
                .map_err(|source| EmbeddingBatchError { size, source })?;
        }
        Ok(vectors)
    }
}

/// Second tier: one backend call per image, a single attempt each.
#[derive(Debug, Clone, Copy)]
pub struct SingleTier {
    expected_dimension: usize,
}

impl SingleTier {
    /// Tier that rejects vectors whose length differs from `expected_dimension`.
    pub fn new(expected_dimension: usize) -> Self {
        Self { expected_dimension }
    }

    /// Embeds one image.
    pub fn run<B: EmbeddingBackend + ?Sized>(
        &self,
        backend: &mut B,
        artwork_id: &str,
        image: &PixelImage,
        precision: Precision,
    ) -> Result<Vec<f32>, EmbeddingItemError> {
        let item_error = |source| EmbeddingItemError {
            artwork_id: artwork_id.to_string(),
            source,
        };
        let mut vectors = backend
            .embed_images(std::slice::from_ref(image), precision)
            .map_err(item_error)?;
        if vectors.len() != 1 {
            return Err(item_error(EmbedError::Response(format!(
                "expected 1 vector, got {}",
                vectors.len()
            ))));
        }
        let vector = vectors.remove(0);
        validate_vector(&vector, self.expected_dimension).map_err(item_error)?;
        Ok(vector)
    }
}

fn validate_vector(vector: &[f32], expected_dimension: usize) -> Result<(), EmbedError> {
    if vector.len() != expected_dimension {
        return Err(EmbedError::Response(format!(
            "expected dimension {expected_dimension}, got {}",
            vector.len()
        )));
    }
    if vector.iter().any(|value| !value.is_finite()) {
        return Err(EmbedError::Response(
            "vector contains non-finite values".to_string(),
        ));
    }
    Ok(())
}

/// Try the batch tier; on failure re-dispatch every image through the single tier.
#[derive(Debug, Clone, Copy)]
pub struct FallbackStrategy {
    batch: BatchTier,
    single: SingleTier,
}

/// What happened to one batch.
#[derive(Debug)]
pub struct BatchReport {
    /// Outcomes in input order.
    pub outcomes: Vec<EmbedOutcome>,
    /// Whether the per-image tier was used.
    pub fell_back: bool,
}

impl FallbackStrategy {
    /// Strategy for a model producing `dimension`-length vectors.
    pub fn new(dimension: usize) -> Self {
        Self {
            batch: BatchTier::new(dimension),
            single: SingleTier::new(dimension),
        }
    }

    /// Embeds `ready`, returning one outcome per input in input order.
    pub fn embed<B: EmbeddingBackend + ?Sized>(
        &self,
        backend: &mut B,
        ready: Vec<ReadyImage>,
        precision: Precision,
    ) -> BatchReport {
        if ready.is_empty() {
            return BatchReport {
                outcomes: Vec::new(),
                fell_back: false,
            };
        }
        let model_version = backend.model_version().to_string();
        let images: Vec<PixelImage> = ready.iter().map(|item| item.image.clone()).collect();
        match self.batch.run(backend, &images, precision) {
            Ok(vectors) => {
                let outcomes = ready
                    .into_iter()
                    .zip(vectors)
                    .map(|(item, vector)| EmbedOutcome::Embedded {
                        vector: EmbeddingVector {
                            artwork_id: item.record.id.clone(),
                            vector,
                            precision,
                            model_version: model_version.clone(),
                        },
                        record: item.record,
                    })
                    .collect();
                BatchReport {
                    outcomes,
                    fell_back: false,
                }
            }
            Err(err) => {
                warn!(
                    size = err.size,
                    error = %err.source,
                    "batch embedding failed; embedding images individually"
                );
                let outcomes = ready
                    .into_iter()
                    .map(|item| {
                        match self.single.run(backend, &item.record.id, &item.image, precision) {
                            Ok(vector) => EmbedOutcome::Embedded {
                                vector: EmbeddingVector {
                                    artwork_id: item.record.id.clone(),
                                    vector,
                                    precision,
                                    model_version: model_version.clone(),
                                },
                                record: item.record,
                            },
                            Err(err) => {
                                debug!(
                                    artwork = %err.artwork_id,
                                    error = %err.source,
                                    "image embedding failed"
                                );
                                EmbedOutcome::Failed {
                                    record: item.record,
                                    reason: FailureReason::EmbeddingFailed,
                                    detail: err.source.to_string(),
                                }
                            }
                        }
                    })
                    .collect();
                BatchReport {
                    outcomes,
                    fell_back: true,
                }
            }
        }
    }
}

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Batches dispatched to the backend.
    pub batches: usize,
    /// Batches that needed the per-image tier.
    pub fallback_batches: usize,
    /// Vectors produced.
    pub embedded: usize,
    /// Artworks that did not get a vector (fetch or embedding failures).
    pub failed: usize,
}

/// Single consumer of fetched images; owns the embedding backend for the run.
pub struct BatchEmbeddingEngine<B> {
    backend: B,
    strategy: FallbackStrategy,
    precision: Precision,
    batch_size: usize,
    pending: Vec<ReadyImage>,
    stats: EngineStats,
}

impl<B: EmbeddingBackend> BatchEmbeddingEngine<B> {
    /// Wraps a loaded backend. Precision is fixed here for the whole run.
    pub fn new(backend: B, batch_size: usize, force_full_precision: bool) -> Self {
        let capability = backend.capability();
        let precision = Precision::select(&capability, force_full_precision);
        let batch_size = batch_size.max(1);
        info!(
            device = ?capability.device,
            precision = precision.as_str(),
            model = backend.model_version(),
            dimension = backend.dimension(),
            batch_size,
            "embedding engine ready"
        );
        Self {
            strategy: FallbackStrategy::new(backend.dimension()),
            backend,
            precision,
            batch_size,
            pending: Vec::with_capacity(batch_size),
            stats: EngineStats::default(),
        }
    }

    /// Precision every vector of this run is computed at.
    pub fn precision(&self) -> Precision {
        self.precision
    }

    /// Model output dimension.
    pub fn dimension(&self) -> usize {
        self.backend.dimension()
    }

    /// Model identifier.
    pub fn model_version(&self) -> &str {
        self.backend.model_version()
    }

    /// Images waiting for a full batch.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> EngineStats {
        self.stats
    }

    /// Feeds one fetch result. Returns outcomes that became final: the item itself when its
    /// fetch failed, or a whole batch once `batch_size` images are pending.
    pub fn accept(&mut self, fetched: FetchedImage) -> Vec<EmbedOutcome> {
        let FetchedImage {
            record,
            status,
            image,
            error,
        } = fetched;
        let image = match (FailureReason::from_fetch(status), image) {
            (None, Some(image)) => image,
            (reason, _) => {
                self.stats.failed += 1;
                let detail = error
                    .map(|err| err.to_string())
                    .unwrap_or_else(|| "image missing after fetch".to_string());
                return vec![EmbedOutcome::Failed {
                    record,
                    reason: reason.unwrap_or(FailureReason::DecodeError),
                    detail,
                }];
            }
        };
        self.pending.push(ReadyImage { record, image });
        if self.pending.len() >= self.batch_size {
            self.dispatch()
        } else {
            Vec::new()
        }
    }

    /// Embeds whatever is pending, even a partial batch.
    pub fn flush(&mut self) -> Vec<EmbedOutcome> {
        if self.pending.is_empty() {
            Vec::new()
        } else {
            self.dispatch()
        }
    }

    /// Releases the backend and returns the final counters.
    pub fn release(mut self) -> EngineStats {
        self.backend.release();
        self.stats
    }

    fn dispatch(&mut self) -> Vec<EmbedOutcome> {
        let batch = std::mem::replace(&mut self.pending, Vec::with_capacity(self.batch_size));
        let size = batch.len();
        let report = self.strategy.embed(&mut self.backend, batch, self.precision);
        self.stats.batches += 1;
        if report.fell_back {
            self.stats.fallback_batches += 1;
        }
        let embedded = report.outcomes.iter().filter(|o| o.is_embedded()).count();
        self.stats.embedded += embedded;
        self.stats.failed += size - embedded;
        debug!(size, embedded, fell_back = report.fell_back, "batch embedded");
        report.outcomes
    }
}
