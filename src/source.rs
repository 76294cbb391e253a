//! Metadata source: normalized artwork records read from JSON-lines dataset files.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, warn};

use crate::artwork::ArtworkRecord;
use crate::error::SourceError;

/// Datasets to read; empty means every dataset found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetFilter {
    datasets: Vec<String>,
}

impl DatasetFilter {
    /// Filter accepting every dataset.
    pub fn all() -> Self {
        Self::default()
    }

    /// Filter restricted to the named datasets, in the given order.
    pub fn only<I, S>(datasets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut seen = HashSet::new();
        let datasets = datasets
            .into_iter()
            .map(Into::into)
            .map(|name: String| name.trim().to_string())
            .filter(|name| !name.is_empty() && seen.insert(name.clone()))
            .collect();
        Self { datasets }
    }

    /// Named datasets; empty when unrestricted.
    pub fn datasets(&self) -> &[String] {
        &self.datasets
    }

    /// Whether every dataset is accepted.
    pub fn is_all(&self) -> bool {
        self.datasets.is_empty()
    }
}

/// Supplies the bounded list of artworks a run works on.
pub trait MetadataSource {
    /// Records matching `filter`, at most `limit` per dataset.
    fn list_artworks(
        &self,
        filter: &DatasetFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ArtworkRecord>, SourceError>;
}

/// Directory of `<dataset>.jsonl` files, one normalized artwork per line.
#[derive(Debug, Clone)]
pub struct JsonlSource {
    dir: PathBuf,
}

/// One line of a dataset file. `id` is the dataset's native id unless already qualified.
#[derive(Debug, Deserialize)]
struct RawArtwork {
    id: serde_json::Value,
    #[serde(default)]
    title: String,
    #[serde(default, alias = "artist")]
    artist_name: String,
    #[serde(default)]
    museum: String,
    #[serde(default)]
    image_url: Option<String>,
    #[serde(default, alias = "type")]
    object_type: Option<String>,
    #[serde(default, alias = "date")]
    date_text: Option<String>,
    #[serde(default, alias = "url")]
    web_url: Option<String>,
    #[serde(default)]
    artist_birth: Option<String>,
    #[serde(default)]
    artist_death: Option<String>,
}

impl RawArtwork {
    fn into_record(self, dataset: &str) -> Option<ArtworkRecord> {
        let native = match &self.id {
            serde_json::Value::String(text) => text.trim().to_string(),
            serde_json::Value::Number(number) => number.to_string(),
            _ => return None,
        };
        if native.is_empty() {
            return None;
        }
        Some(ArtworkRecord {
            id: ArtworkRecord::qualified_id(dataset, &native),
            title: self.title,
            artist_name: self.artist_name,
            museum: self.museum,
            image_url: self.image_url,
            source_dataset: dataset.to_string(),
            object_type: non_blank(self.object_type),
            date_text: non_blank(self.date_text),
            web_url: non_blank(self.web_url),
            artist_birth: non_blank(self.artist_birth),
            artist_death: non_blank(self.artist_death),
        })
    }
}

fn non_blank(value: Option<String>) -> Option<String> {
    value.filter(|text| !text.trim().is_empty())
}

impl JsonlSource {
    /// Opens a dataset directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, SourceError> {
        let dir = dir.into();
        let metadata = fs::metadata(&dir).map_err(|source| SourceError::DataDir {
            path: dir.clone(),
            source,
        })?;
        if !metadata.is_dir() {
            return Err(SourceError::DataDir {
                path: dir,
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "not a directory"),
            });
        }
        Ok(Self { dir })
    }

    /// Dataset names available in the directory, sorted.
    pub fn datasets(&self) -> Result<Vec<String>, SourceError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| SourceError::DataDir {
            path: self.dir.clone(),
            source,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| SourceError::DataDir {
                path: self.dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("jsonl") {
                continue;
            }
            if let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        Ok(names)
    }

    fn read_dataset(
        &self,
        dataset: &str,
        limit: Option<usize>,
    ) -> Result<Vec<ArtworkRecord>, SourceError> {
        let path = self.dir.join(format!("{dataset}.jsonl"));
        if !path.is_file() {
            return Err(SourceError::MissingDataset {
                dataset: dataset.to_string(),
                path,
            });
        }
        let file = File::open(&path).map_err(|source| io_error(&path, source))?;
        let mut records = Vec::new();
        for (line_no, line) in BufReader::new(file).lines().enumerate() {
            if limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
            let line = line.map_err(|source| io_error(&path, source))?;
            if line.trim().is_empty() {
                continue;
            }
            let raw: RawArtwork =
                serde_json::from_str(&line).map_err(|source| SourceError::Parse {
                    path: path.clone(),
                    line: line_no + 1,
                    source,
                })?;
            match raw.into_record(dataset) {
                Some(record) => records.push(record),
                None => warn!(dataset, line = line_no + 1, "skipping artwork without id"),
            }
        }
        debug!(dataset, records = records.len(), "dataset loaded");
        Ok(records)
    }
}

fn io_error(path: &Path, source: std::io::Error) -> SourceError {
    SourceError::Io {
        path: path.to_path_buf(),
        source,
    }
}

impl MetadataSource for JsonlSource {
    fn list_artworks(
        &self,
        filter: &DatasetFilter,
        limit: Option<usize>,
    ) -> Result<Vec<ArtworkRecord>, SourceError> {
        let datasets = if filter.is_all() {
            self.datasets()?
        } else {
            filter.datasets().to_vec()
        };
        let mut seen = HashSet::new();
        let mut records = Vec::new();
        for dataset in datasets {
            for record in self.read_dataset(&dataset, limit)? {
                if seen.insert(record.id.clone()) {
                    records.push(record);
                } else {
                    warn!(artwork = %record.id, "duplicate artwork id; keeping first occurrence");
                }
            }
        }
        Ok(records)
    }
}
