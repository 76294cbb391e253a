//! Vector store writer: batched upserts with a single retry per batch.

use tracing::{debug, info, warn};

use crate::artwork::ArtworkRecord;
use crate::embedder::EmbeddingVector;
use crate::error::{IndexError, LedgerError, StoreCommitError};
use crate::ledger::{FailureReason, RunLedger};
use crate::vector_store::{CollectionName, UpsertBatch, VectorEntry, VectorIndex};

const COMMIT_ATTEMPTS: usize = 2;

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Batches committed.
    pub committed_batches: usize,
    /// Batches that needed their retry and then succeeded.
    pub retried_batches: usize,
    /// Batches abandoned after the retry.
    pub failed_batches: usize,
    /// Vectors written.
    pub written: usize,
}

/// Accumulates vectors into [`UpsertBatch`]es and commits them to one collection.
///
/// Ledger entries for a vector are written only after its batch commits or is abandoned, so
/// an id is never both stored and recorded as failed.
pub struct VectorStoreWriter<I> {
    index: I,
    collection: CollectionName,
    dimension: usize,
    batch: UpsertBatch,
    records: Vec<ArtworkRecord>,
    stats: WriterStats,
}

impl<I: VectorIndex> VectorStoreWriter<I> {
    /// Prepares `collection`. With `reset` the collection is dropped first; this is the only
    /// place a reset happens.
    pub fn open(
        mut index: I,
        collection: CollectionName,
        upsert_batch_size: usize,
        reset: bool,
        dimension: usize,
    ) -> Result<Self, IndexError> {
        if reset {
            index.reset(&collection)?;
        }
        index.ensure_collection(&collection, dimension)?;
        let batch = UpsertBatch::with_capacity(upsert_batch_size);
        info!(
            collection = %collection.label(),
            dimension,
            upsert_batch_size = batch.limit(),
            reset,
            "vector store ready"
        );
        Ok(Self {
            records: Vec::with_capacity(batch.limit()),
            index,
            collection,
            dimension,
            batch,
            stats: WriterStats::default(),
        })
    }

    /// Target collection.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Vectors waiting for the next commit.
    pub fn pending(&self) -> usize {
        self.batch.len()
    }

    /// Counters so far.
    pub fn stats(&self) -> WriterStats {
        self.stats
    }

    /// Access to the underlying index (e.g. to look up existing ids).
    pub fn index_mut(&mut self) -> &mut I {
        &mut self.index
    }

    /// Queues one vector, committing when the batch fills up.
    ///
    /// Vectors that cannot be queued are recorded as failures right away. A second vector for
    /// an id that is already queued or recorded is dropped; the first one decides the outcome.
    pub fn push(
        &mut self,
        record: &ArtworkRecord,
        embedding: EmbeddingVector,
        ledger: &mut RunLedger,
    ) -> Result<(), LedgerError> {
        if self.batch.contains(&record.id) || ledger.contains(&record.id) {
            warn!(artwork = %record.id, "duplicate vector dropped");
            return Ok(());
        }
        if embedding.vector.len() != self.dimension {
            let err = IndexError::DimensionMismatch {
                collection: self.collection.label(),
                expected: self.dimension,
                actual: embedding.vector.len(),
            };
            return ledger.fail(record, FailureReason::DimensionMismatch, err.to_string());
        }
        let entry = VectorEntry {
            id: record.id.clone(),
            vector: embedding.vector,
            metadata: record.metadata(),
            precision: embedding.precision,
            model_version: embedding.model_version,
        };
        if let Err(err) = self.batch.push(entry) {
            return ledger.fail(record, FailureReason::StoreError, err.to_string());
        }
        self.records.push(record.clone());
        if self.batch.is_full() {
            self.flush(ledger)?;
        }
        Ok(())
    }

    /// Commits whatever is queued.
    pub fn flush(&mut self, ledger: &mut RunLedger) -> Result<(), LedgerError> {
        if self.batch.is_empty() {
            return Ok(());
        }
        let records = std::mem::take(&mut self.records);
        match self.commit() {
            Ok(()) => {
                for record in &records {
                    ledger.succeed(record)?;
                }
            }
            Err(err) => {
                warn!(error = %err, source = %err.source, "upsert batch abandoned");
                let detail = err.to_string();
                for record in &records {
                    ledger.fail(record, FailureReason::StoreError, detail.clone())?;
                }
            }
        }
        self.batch.take();
        Ok(())
    }

    /// Flushes and hands back the index.
    pub fn finish(mut self, ledger: &mut RunLedger) -> Result<(I, WriterStats), LedgerError> {
        self.flush(ledger)?;
        Ok((self.index, self.stats))
    }

    fn commit(&mut self) -> Result<(), StoreCommitError> {
        let size = self.batch.len();
        let mut last_error = None;
        for attempt in 1..=COMMIT_ATTEMPTS {
            match self.index.upsert(&self.collection, &self.batch) {
                Ok(()) => {
                    self.stats.committed_batches += 1;
                    self.stats.written += size;
                    if attempt > 1 {
                        self.stats.retried_batches += 1;
                    }
                    debug!(size, attempt, "upsert batch committed");
                    return Ok(());
                }
                Err(err) => {
                    warn!(size, attempt, error = %err, "upsert batch failed");
                    last_error = Some(err);
                }
            }
        }
        self.stats.failed_batches += 1;
        Err(StoreCommitError {
            collection: self.collection.label(),
            size,
            attempts: COMMIT_ATTEMPTS,
            source: last_error
                .unwrap_or_else(|| IndexError::Backend("upsert not attempted".to_string())),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::embedder::Precision;
    use crate::vector_store::{IndexMatch, MemoryIndex};
    use std::collections::HashSet;

    /// Fails the first `failures` upsert calls.
    struct Flaky {
        inner: MemoryIndex,
        failures: usize,
        calls: usize,
    }

    impl VectorIndex for Flaky {
        fn ensure_collection(&mut self, c: &CollectionName, d: usize) -> Result<(), IndexError> {
            self.inner.ensure_collection(c, d)
        }
        fn reset(&mut self, c: &CollectionName) -> Result<(), IndexError> {
            self.inner.reset(c)
        }
        fn upsert(&mut self, c: &CollectionName, b: &UpsertBatch) -> Result<(), IndexError> {
            self.calls += 1;
            if self.calls <= self.failures {
                return Err(IndexError::Backend("connection reset".to_string()));
            }
            self.inner.upsert(c, b)
        }
        fn query(
            &mut self,
            c: &CollectionName,
            v: &[f32],
            k: usize,
        ) -> Result<Vec<IndexMatch>, IndexError> {
            self.inner.query(c, v, k)
        }
        fn count(&mut self, c: &CollectionName) -> Result<usize, IndexError> {
            self.inner.count(c)
        }
        fn existing_ids(
            &mut self,
            c: &CollectionName,
            ids: &[String],
        ) -> Result<HashSet<String>, IndexError> {
            self.inner.existing_ids(c, ids)
        }
    }

    fn record(id: usize) -> ArtworkRecord {
        ArtworkRecord {
            id: format!("test:{id}"),
            museum: "Test Museum".to_string(),
            source_dataset: "test".to_string(),
            ..ArtworkRecord::default()
        }
    }

    fn vector(id: usize, dims: usize) -> EmbeddingVector {
        EmbeddingVector {
            artwork_id: format!("test:{id}"),
            vector: vec![1.0; dims],
            precision: Precision::Fp32,
            model_version: "test".to_string(),
        }
    }

    fn collection() -> CollectionName {
        CollectionName::new("public", "artworks").expect("collection")
    }

    #[test]
    fn commits_once_per_full_batch() {
        let mut ledger = RunLedger::new();
        let mut writer =
            VectorStoreWriter::open(MemoryIndex::new(), collection(), 3, false, 2).expect("open");
        for i in 0..7 {
            writer.push(&record(i), vector(i, 2), &mut ledger).expect("push");
        }
        assert_eq!(writer.pending(), 1);
        let (index, stats) = writer.finish(&mut ledger).expect("finish");
        assert_eq!(index.upsert_calls(), 3);
        assert_eq!(stats.written, 7);
        let ids: Vec<String> = (0..7).map(|i| format!("test:{i}")).collect();
        let outcome = ledger.close(ids.iter().map(String::as_str)).expect("close");
        assert_eq!(outcome.succeeded.len(), 7);
    }

    #[test]
    fn retry_once_then_record_store_errors() {
        let flaky = Flaky {
            inner: MemoryIndex::new(),
            failures: 2,
            calls: 0,
        };
        let mut ledger = RunLedger::new();
        let mut writer = VectorStoreWriter::open(flaky, collection(), 2, false, 2).expect("open");
        for i in 0..4 {
            writer.push(&record(i), vector(i, 2), &mut ledger).expect("push");
        }
        let (mut index, stats) = writer.finish(&mut ledger).expect("finish");
        assert_eq!(stats.failed_batches, 1);
        assert_eq!(stats.committed_batches, 1);
        assert_eq!(index.calls, 3);
        assert_eq!(index.count(&collection()).expect("count"), 2);

        let ids: Vec<String> = (0..4).map(|i| format!("test:{i}")).collect();
        let outcome = ledger.close(ids.iter().map(String::as_str)).expect("close");
        let failed: Vec<&str> = outcome.failed.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(failed, vec!["test:0", "test:1"]);
        assert!(outcome
            .failed
            .iter()
            .all(|e| e.reason == FailureReason::StoreError));
    }

    #[test]
    fn a_single_failure_is_retried() {
        let flaky = Flaky {
            inner: MemoryIndex::new(),
            failures: 1,
            calls: 0,
        };
        let mut ledger = RunLedger::new();
        let mut writer = VectorStoreWriter::open(flaky, collection(), 5, false, 2).expect("open");
        writer.push(&record(1), vector(1, 2), &mut ledger).expect("push");
        let (_, stats) = writer.finish(&mut ledger).expect("finish");
        assert_eq!(stats.retried_batches, 1);
        assert!(ledger.contains("test:1"));
    }

    #[test]
    fn repeated_ids_get_a_single_outcome() {
        let mut ledger = RunLedger::new();
        let mut writer =
            VectorStoreWriter::open(MemoryIndex::new(), collection(), 2, false, 2).expect("open");
        writer.push(&record(1), vector(1, 2), &mut ledger).expect("queued");
        writer.push(&record(1), vector(1, 2), &mut ledger).expect("queued twice");
        assert_eq!(writer.pending(), 1);
        writer.push(&record(2), vector(2, 2), &mut ledger).expect("fills batch");
        writer.push(&record(1), vector(1, 2), &mut ledger).expect("after commit");
        let (index, stats) = writer.finish(&mut ledger).expect("finish");
        assert_eq!(stats.written, 2);
        assert_eq!(index.upsert_calls(), 1);
        let outcome = ledger.close(["test:1", "test:2"]).expect("close");
        assert_eq!(outcome.succeeded.len(), 2);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn wrong_dimension_is_recorded_not_written() {
        let mut ledger = RunLedger::new();
        let mut writer =
            VectorStoreWriter::open(MemoryIndex::new(), collection(), 5, false, 2).expect("open");
        writer.push(&record(1), vector(1, 3), &mut ledger).expect("push");
        assert_eq!(writer.pending(), 0);
        let outcome = ledger.close(["test:1"]).expect("close");
        assert_eq!(outcome.failed[0].reason, FailureReason::DimensionMismatch);
    }

    #[test]
    fn reset_clears_existing_vectors_before_writes() {
        let name = collection();
        let mut index = MemoryIndex::new();
        index.ensure_collection(&name, 2).expect("ensure");
        let mut batch = UpsertBatch::with_capacity(3);
        for i in 0..3 {
            batch
                .push(VectorEntry {
                    id: format!("old:{i}"),
                    vector: vec![1.0, 0.0],
                    metadata: Default::default(),
                    precision: Precision::Fp32,
                    model_version: "old".to_string(),
                })
                .expect("push");
        }
        index.upsert(&name, &batch).expect("seed");

        let mut writer =
            VectorStoreWriter::open(&mut index, name.clone(), 5, true, 2).expect("open");
        assert_eq!(writer.index_mut().count(&name).expect("count"), 0);
    }
}
