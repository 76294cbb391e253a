//! Generation run: metadata source -> fetch pool -> embedding engine -> writer -> ledger.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::artwork::ArtworkRecord;
use crate::controls::GenerateControls;
use crate::embedder::{EmbeddingBackend, Precision};
use crate::engine::{BatchEmbeddingEngine, EmbedOutcome, EngineStats};
use crate::error::{LedgerError, PipelineError};
use crate::fetcher::{FetchPool, ImageFetcher};
use crate::ledger::{self, LedgerPaths, RunLedger, RunOutcome};
use crate::source::MetadataSource;
use crate::vector_store::VectorIndex;
use crate::writer::{VectorStoreWriter, WriterStats};

const EXISTING_LOOKUP_CHUNK: usize = 1000;
const PROGRESS_EVERY: usize = 100;

/// Run-level cancellation flag shared between the caller and the fetch feeder.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    /// Flag in the "keep going" state.
    pub fn new() -> Self {
        Self::default()
    }

    /// Asks the run to stop dispatching new work. Returns whether a stop was already pending.
    pub fn request(&self) -> bool {
        self.0.swap(true, Ordering::AcqRel)
    }

    /// Whether a stop was requested.
    pub fn is_requested(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Everything a finished run reports.
#[derive(Debug)]
pub struct RunReport {
    /// Sealed partition of the entered ids.
    pub outcome: RunOutcome,
    /// Ids that entered the pipeline.
    pub entered: usize,
    /// Ids skipped because the index already held them.
    pub skipped_existing: usize,
    /// Ids skipped because a previous run recorded them as succeeded.
    pub skipped_resumed: usize,
    /// Whether the run was cut short by the stop signal.
    pub cancelled: bool,
    /// Precision used for every vector.
    pub precision: Precision,
    /// Wall-clock duration.
    pub elapsed: Duration,
    /// Embedding counters.
    pub engine: EngineStats,
    /// Writer counters.
    pub writer: WriterStats,
    /// Artifact locations when an output directory was configured.
    pub artifacts: Option<LedgerPaths>,
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.elapsed.as_secs_f32().max(f32::EPSILON);
        let succeeded = self.outcome.succeeded.len();
        writeln!(f, "--- embedding run ({secs:.2}s) ---")?;
        writeln!(f, "entered: {}", self.entered)?;
        writeln!(f, "succeeded: {succeeded}")?;
        writeln!(f, "failed: {}", self.outcome.failed.len())?;
        for (reason, count) in self.outcome.failure_counts() {
            writeln!(f, "  {}: {count}", reason.as_str())?;
        }
        writeln!(f, "skipped (already indexed): {}", self.skipped_existing)?;
        writeln!(f, "skipped (resumed): {}", self.skipped_resumed)?;
        writeln!(f, "precision: {}", self.precision.as_str())?;
        writeln!(
            f,
            "embedding batches: {} ({} fell back to single images)",
            self.engine.batches, self.engine.fallback_batches
        )?;
        writeln!(
            f,
            "upsert batches: {} committed, {} retried, {} failed",
            self.writer.committed_batches, self.writer.retried_batches, self.writer.failed_batches
        )?;
        writeln!(f, "artworks/sec: {:.2}", succeeded as f32 / secs)?;
        if self.entered > 0 {
            writeln!(
                f,
                "avg time per artwork: {:.3}s",
                secs / self.entered as f32
            )?;
        }
        if self.cancelled {
            writeln!(f, "run was cancelled before all records were dispatched")?;
        }
        if let Some(paths) = &self.artifacts {
            writeln!(f, "successes: {}", paths.succeeded.display())?;
            writeln!(f, "failures: {}", paths.failed.display())?;
            write!(f, "summary: {}", paths.summary.display())?;
        }
        Ok(())
    }
}

/// Runs one generation pass over `source` into the controls' collection.
///
/// Per-item and per-batch failures land in the ledger; only source, index setup and ledger
/// errors abort the run.
pub fn run_generation<S, B, I>(
    source: &S,
    fetcher: Arc<dyn ImageFetcher>,
    backend: B,
    index: I,
    controls: &GenerateControls,
    stop: &StopSignal,
) -> Result<RunReport, PipelineError>
where
    S: MetadataSource + ?Sized,
    B: EmbeddingBackend,
    I: VectorIndex,
{
    let started = Instant::now();
    let listed = source.list_artworks(controls.datasets(), controls.limit())?;
    let mut records = dedupe(listed);
    info!(records = records.len(), "artworks loaded");

    // A reset empties the collection, so earlier successes no longer describe the index.
    let previous = match (controls.resume(), controls.output_dir()) {
        (true, _) if controls.reset() => {
            warn!("reset requested; ignoring successes recorded by earlier runs");
            Vec::new()
        }
        (true, Some(dir)) => ledger::load_succeeded(dir)?,
        (true, None) => {
            warn!("resume requested without an output directory; nothing to resume from");
            Vec::new()
        }
        (false, _) => Vec::new(),
    };
    let skipped_resumed = if previous.is_empty() {
        0
    } else {
        let done: HashSet<&str> = previous.iter().map(|entry| entry.id.as_str()).collect();
        let before = records.len();
        records.retain(|record| !done.contains(record.id.as_str()));
        before - records.len()
    };

    let mut engine = BatchEmbeddingEngine::new(
        backend,
        controls.batch_size(),
        controls.force_full_precision(),
    );
    let precision = engine.precision();
    let mut writer = VectorStoreWriter::open(
        index,
        controls.collection().clone(),
        controls.upsert_batch_size(),
        controls.reset(),
        engine.dimension(),
    )?;

    let skipped_existing = if controls.reset() {
        0
    } else {
        skip_existing(&mut writer, &mut records)?
    };
    if skipped_resumed + skipped_existing > 0 {
        info!(
            skipped_resumed,
            skipped_existing,
            remaining = records.len(),
            "skipping artworks that are already embedded"
        );
    }

    let ids: Vec<String> = records.iter().map(|record| record.id.clone()).collect();
    let mut ledger = RunLedger::new();
    let pool = FetchPool::new(controls.max_workers());
    let mut stream = pool
        .spawn(records, fetcher, stop.clone())
        .map_err(PipelineError::Spawn)?;

    let mut seen = 0usize;
    while let Some(fetched) = stream.next() {
        seen += 1;
        let outcomes = engine.accept(fetched);
        route(outcomes, &mut writer, &mut ledger)?;
        if seen % PROGRESS_EVERY == 0 {
            info!(
                processed = seen,
                total = ids.len(),
                in_flight = stream.in_flight(),
                queued = stream.queued(),
                "progress"
            );
        }
    }
    route(engine.flush(), &mut writer, &mut ledger)?;
    let (_, writer_stats) = writer.finish(&mut ledger)?;
    let engine_stats = engine.release();

    let dispatched = stream.dispatched().min(ids.len());
    let cancelled = dispatched < ids.len();
    if cancelled {
        warn!(
            dispatched,
            total = ids.len(),
            "run stopped before all artworks were dispatched"
        );
    }
    let outcome = ledger.close(ids[..dispatched].iter().map(String::as_str))?;

    let artifacts = match controls.output_dir() {
        Some(dir) => Some(outcome.write_artifacts(
            dir,
            &controls.collection().label(),
            &previous,
        )?),
        None => None,
    };

    Ok(RunReport {
        entered: dispatched,
        outcome,
        skipped_existing,
        skipped_resumed,
        cancelled,
        precision,
        elapsed: started.elapsed(),
        engine: engine_stats,
        writer: writer_stats,
        artifacts,
    })
}

fn dedupe(records: Vec<ArtworkRecord>) -> Vec<ArtworkRecord> {
    let mut seen = HashSet::with_capacity(records.len());
    records
        .into_iter()
        .filter(|record| {
            let fresh = seen.insert(record.id.clone());
            if !fresh {
                warn!(artwork = %record.id, "duplicate artwork id dropped");
            }
            fresh
        })
        .collect()
}

fn skip_existing<I: VectorIndex>(
    writer: &mut VectorStoreWriter<I>,
    records: &mut Vec<ArtworkRecord>,
) -> Result<usize, PipelineError> {
    let collection = writer.collection().clone();
    let mut existing = HashSet::new();
    for chunk in records.chunks(EXISTING_LOOKUP_CHUNK) {
        let ids: Vec<String> = chunk.iter().map(|record| record.id.clone()).collect();
        existing.extend(writer.index_mut().existing_ids(&collection, &ids)?);
    }
    let before = records.len();
    records.retain(|record| !existing.contains(&record.id));
    Ok(before - records.len())
}

fn route<I: VectorIndex>(
    outcomes: Vec<EmbedOutcome>,
    writer: &mut VectorStoreWriter<I>,
    ledger: &mut RunLedger,
) -> Result<(), LedgerError> {
    for outcome in outcomes {
        match outcome {
            EmbedOutcome::Embedded { record, vector } => writer.push(&record, vector, ledger)?,
            EmbedOutcome::Failed {
                record,
                reason,
                detail,
            } => {
                debug!(artwork = %record.id, reason = reason.as_str(), "artwork failed");
                ledger.fail(&record, reason, detail)?;
            }
        }
    }
    Ok(())
}
