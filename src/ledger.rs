//! Run ledger: the succeeded/failed partition of one generation run and its artifacts.

use std::collections::{BTreeMap, HashSet};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::artwork::ArtworkRecord;
use crate::error::LedgerError;
use crate::fetcher::FetchStatus;

/// Successes artifact, read back by resumed runs.
pub const SUCCEEDED_FILE: &str = "successful_embeddings.json";
/// Failures artifact.
pub const FAILED_FILE: &str = "failed_embeddings.json";

/// Why an artwork ended up in the failed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    /// No image URL, unreachable host, or error status.
    NotFound,
    /// The image request timed out.
    Timeout,
    /// The image bytes could not be decoded.
    DecodeError,
    /// The image failed to embed on its own after a batch failure.
    EmbeddingFailed,
    /// The vector did not fit the collection dimension.
    DimensionMismatch,
    /// The upsert batch failed after its retry.
    StoreError,
}

impl FailureReason {
    /// Maps a non-`Ok` fetch status to its failure reason.
    pub fn from_fetch(status: FetchStatus) -> Option<Self> {
        match status {
            FetchStatus::Ok => None,
            FetchStatus::NotFound => Some(Self::NotFound),
            FetchStatus::Timeout => Some(Self::Timeout),
            FetchStatus::DecodeError => Some(Self::DecodeError),
        }
    }

    /// snake_case label used in artifacts and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Timeout => "timeout",
            Self::DecodeError => "decode_error",
            Self::EmbeddingFailed => "embedding_failed",
            Self::DimensionMismatch => "dimension_mismatch",
            Self::StoreError => "store_error",
        }
    }
}

/// One artwork committed to the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SucceededEntry {
    /// Artwork id.
    pub id: String,
    /// Owning museum.
    pub museum: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Artist name.
    #[serde(default)]
    pub artist: String,
    /// Image URL that was embedded.
    #[serde(default)]
    pub image_url: String,
}

impl SucceededEntry {
    fn from_record(record: &ArtworkRecord) -> Self {
        Self {
            id: record.id.clone(),
            museum: record.museum.clone(),
            title: record.title.clone(),
            artist: record.artist_name.clone(),
            image_url: record.image_ref().unwrap_or_default().to_string(),
        }
    }
}

/// One artwork that did not make it into the index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedEntry {
    /// Artwork id.
    pub id: String,
    /// Owning museum.
    pub museum: String,
    /// Classification.
    pub reason: FailureReason,
    /// Underlying error message.
    #[serde(default)]
    pub detail: String,
}

/// Append-only recorder of per-artwork outcomes for a single run.
#[derive(Debug, Default)]
pub struct RunLedger {
    succeeded: Vec<SucceededEntry>,
    failed: Vec<FailedEntry>,
    recorded: HashSet<String>,
}

impl RunLedger {
    /// Empty ledger.
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a committed artwork.
    pub fn succeed(&mut self, record: &ArtworkRecord) -> Result<(), LedgerError> {
        self.claim(&record.id)?;
        self.succeeded.push(SucceededEntry::from_record(record));
        Ok(())
    }

    /// Records a failed artwork.
    pub fn fail(
        &mut self,
        record: &ArtworkRecord,
        reason: FailureReason,
        detail: impl Into<String>,
    ) -> Result<(), LedgerError> {
        self.claim(&record.id)?;
        self.failed.push(FailedEntry {
            id: record.id.clone(),
            museum: record.museum.clone(),
            reason,
            detail: detail.into(),
        });
        Ok(())
    }

    /// Whether `id` already has an outcome.
    pub fn contains(&self, id: &str) -> bool {
        self.recorded.contains(id)
    }

    /// Outcomes recorded so far.
    pub fn len(&self) -> usize {
        self.recorded.len()
    }

    /// Whether nothing has been recorded.
    pub fn is_empty(&self) -> bool {
        self.recorded.is_empty()
    }

    fn claim(&mut self, id: &str) -> Result<(), LedgerError> {
        if !self.recorded.insert(id.to_string()) {
            return Err(LedgerError::DuplicateOutcome(id.to_string()));
        }
        Ok(())
    }

    /// Checks that the recorded ids are exactly `entered` and seals the ledger.
    pub fn close<'a, I>(self, entered: I) -> Result<RunOutcome, LedgerError>
    where
        I: IntoIterator<Item = &'a str>,
    {
        let entered: HashSet<&str> = entered.into_iter().collect();
        let mut missing: Vec<String> = entered
            .iter()
            .filter(|id| !self.recorded.contains(**id))
            .map(|id| id.to_string())
            .collect();
        let mut unexpected: Vec<String> = self
            .recorded
            .iter()
            .filter(|id| !entered.contains(id.as_str()))
            .cloned()
            .collect();
        if !missing.is_empty() || !unexpected.is_empty() {
            missing.sort();
            unexpected.sort();
            return Err(LedgerError::Closure {
                missing,
                unexpected,
            });
        }
        Ok(RunOutcome {
            succeeded: self.succeeded,
            failed: self.failed,
        })
    }
}

/// Sealed partition of a run: every entered id is in exactly one list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunOutcome {
    /// Committed artworks in commit order.
    pub succeeded: Vec<SucceededEntry>,
    /// Failed artworks in recording order.
    pub failed: Vec<FailedEntry>,
}

/// Where a run's artifacts were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerPaths {
    /// Cumulative successes (previous runs plus this one).
    pub succeeded: PathBuf,
    /// This run's failures.
    pub failed: PathBuf,
    /// Human-readable listing of embedded artworks.
    pub summary: PathBuf,
}

impl RunOutcome {
    /// Failure count per reason.
    pub fn failure_counts(&self) -> BTreeMap<FailureReason, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.failed {
            *counts.entry(entry.reason).or_insert(0) += 1;
        }
        counts
    }

    /// Total artworks accounted for.
    pub fn total(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    /// Writes the successes, failures and summary artifacts into `dir`.
    ///
    /// `previous` holds successes loaded from an earlier run; they are kept in the successes
    /// file so a later resume still skips them.
    pub fn write_artifacts(
        &self,
        dir: &Path,
        collection_label: &str,
        previous: &[SucceededEntry],
    ) -> Result<LedgerPaths, LedgerError> {
        fs::create_dir_all(dir).map_err(|source| LedgerError::Io {
            path: dir.to_path_buf(),
            source,
        })?;

        let fresh: HashSet<&str> = self.succeeded.iter().map(|e| e.id.as_str()).collect();
        let cumulative: Vec<&SucceededEntry> = previous
            .iter()
            .filter(|entry| !fresh.contains(entry.id.as_str()))
            .chain(self.succeeded.iter())
            .collect();

        let succeeded = dir.join(SUCCEEDED_FILE);
        write_json(&succeeded, &cumulative)?;
        let failed = dir.join(FAILED_FILE);
        write_json(&failed, &self.failed)?;
        let summary = dir.join(format!(
            "{}_embedded_artworks.txt",
            summary_stem(collection_label)
        ));
        write_atomic(&summary, |out| self.write_summary(out, collection_label))?;

        Ok(LedgerPaths {
            succeeded,
            failed,
            summary,
        })
    }

    fn write_summary(&self, out: &mut dyn Write, collection_label: &str) -> std::io::Result<()> {
        writeln!(out, "Embedded artworks in collection: {collection_label}")?;
        writeln!(out, "Total: {}", self.succeeded.len())?;
        writeln!(out, "{}", "=".repeat(80))?;
        for entry in &self.succeeded {
            writeln!(out)?;
            writeln!(out, "ID: {}", entry.id)?;
            writeln!(out, "Title: {}", entry.title)?;
            writeln!(out, "Artist: {}", entry.artist)?;
            writeln!(out, "Museum: {}", entry.museum)?;
            writeln!(out, "Image URL: {}", entry.image_url)?;
            writeln!(out, "{}", "-".repeat(40))?;
        }
        if !self.failed.is_empty() {
            writeln!(out)?;
            writeln!(out, "Failed: {}", self.failed.len())?;
            for (reason, count) in self.failure_counts() {
                writeln!(out, "  {}: {count}", reason.as_str())?;
            }
        }
        Ok(())
    }
}

/// Loads successes from a previous run's artifacts; a missing file means no prior run.
pub fn load_succeeded(dir: &Path) -> Result<Vec<SucceededEntry>, LedgerError> {
    let path = dir.join(SUCCEEDED_FILE);
    let file = match File::open(&path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => return Err(LedgerError::Io { path, source }),
    };
    serde_json::from_reader(std::io::BufReader::new(file))
        .map_err(|source| LedgerError::Json { path, source })
}

fn summary_stem(label: &str) -> String {
    label
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() || ch == '-' { ch } else { '_' })
        .collect()
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), LedgerError> {
    let encoded = serde_json::to_vec_pretty(value).map_err(|source| LedgerError::Json {
        path: path.to_path_buf(),
        source,
    })?;
    write_atomic(path, |out| {
        out.write_all(&encoded)?;
        writeln!(out)
    })
}

/// Writes through a sibling temp file and renames it into place.
fn write_atomic<F>(path: &Path, write: F) -> Result<(), LedgerError>
where
    F: FnOnce(&mut dyn Write) -> std::io::Result<()>,
{
    let io_err = |source| LedgerError::Io {
        path: path.to_path_buf(),
        source,
    };
    let tmp = path.with_extension("tmp");
    let written = File::create(&tmp).and_then(|file| {
        let mut out = BufWriter::new(file);
        write(&mut out)?;
        out.flush()?;
        drop(out);
        fs::rename(&tmp, path)
    });
    if written.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    written.map_err(io_err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: &str) -> ArtworkRecord {
        ArtworkRecord {
            id: id.to_string(),
            title: format!("Title {id}"),
            artist_name: "Anon".to_string(),
            museum: "Rijks".to_string(),
            image_url: Some(format!("https://img.test/{id}.jpg")),
            source_dataset: "test".to_string(),
            ..ArtworkRecord::default()
        }
    }

    #[test]
    fn rejects_a_second_outcome_for_the_same_id() {
        let mut ledger = RunLedger::new();
        ledger.succeed(&record("a")).expect("first");
        let err = ledger
            .fail(&record("a"), FailureReason::StoreError, "boom")
            .expect_err("duplicate");
        assert!(matches!(err, LedgerError::DuplicateOutcome(id) if id == "a"));
    }

    #[test]
    fn close_checks_closure_against_entered_ids() {
        let mut ledger = RunLedger::new();
        ledger.succeed(&record("a")).expect("a");
        ledger
            .fail(&record("z"), FailureReason::NotFound, "")
            .expect("z");
        let err = ledger.close(["a", "b"]).expect_err("closure");
        match err {
            LedgerError::Closure {
                missing,
                unexpected,
            } => {
                assert_eq!(missing, vec!["b".to_string()]);
                assert_eq!(unexpected, vec!["z".to_string()]);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn artifacts_round_trip_through_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut ledger = RunLedger::new();
        ledger.succeed(&record("b")).expect("b");
        ledger
            .fail(&record("c"), FailureReason::Timeout, "timed out")
            .expect("c");
        let outcome = ledger.close(["b", "c"]).expect("close");
        assert_eq!(outcome.failure_counts().get(&FailureReason::Timeout), Some(&1));

        let previous = vec![SucceededEntry::from_record(&record("a"))];
        let paths = outcome
            .write_artifacts(dir.path(), "public.artworks", &previous)
            .expect("write");
        assert!(paths.summary.ends_with("public_artworks_embedded_artworks.txt"));

        let loaded = load_succeeded(dir.path()).expect("load");
        let ids: Vec<&str> = loaded.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b"]);

        let failed = fs::read_to_string(&paths.failed).expect("read failures");
        assert!(failed.contains("\"reason\": \"timeout\""));
        let summary = fs::read_to_string(&paths.summary).expect("read summary");
        assert!(summary.contains("ID: b"));
        assert!(summary.contains("timeout: 1"));
    }

    #[test]
    fn failed_writes_leave_no_temp_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join(FAILED_FILE);
        let err = write_atomic(&path, |out| {
            out.write_all(b"partial")?;
            Err(std::io::Error::other("disk full"))
        })
        .expect_err("write fails");
        assert!(matches!(err, LedgerError::Io { .. }));
        assert!(!path.exists());
        assert!(!path.with_extension("tmp").exists());
    }

    #[test]
    fn missing_artifacts_mean_no_previous_run() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(load_succeeded(dir.path()).expect("load").is_empty());
    }
}
