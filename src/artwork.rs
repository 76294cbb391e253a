//! Artwork records shared across pipeline stages and the query path.

use serde::{Deserialize, Serialize};

/// Normalized artwork row supplied by a metadata source.
///
/// Records are read-only once loaded; pipeline stages clone what they need.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkRecord {
    /// Stable identifier, `<source_dataset>:<native id>`.
    pub id: String,
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Primary artist, empty when unknown.
    #[serde(default)]
    pub artist_name: String,
    /// Holding museum.
    #[serde(default)]
    pub museum: String,
    /// Primary image location; `None` or blank means no image is available.
    #[serde(default)]
    pub image_url: Option<String>,
    /// Dataset the record was normalized from.
    #[serde(default)]
    pub source_dataset: String,
    /// Object classification (painting, print, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object_type: Option<String>,
    /// Human readable creation date.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_text: Option<String>,
    /// Collection page for the object.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_url: Option<String>,
    /// Artist birth year as printed by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_birth: Option<String>,
    /// Artist death year as printed by the source.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist_death: Option<String>,
}

impl ArtworkRecord {
    /// Builds the collection-wide identifier from a dataset name and the dataset's own id.
    ///
    /// Ids that already carry the dataset prefix are returned unchanged.
    pub fn qualified_id(source_dataset: &str, native_id: &str) -> String {
        let native_id = native_id.trim();
        let prefix = format!("{source_dataset}:");
        if native_id.starts_with(&prefix) {
            native_id.to_string()
        } else {
            format!("{prefix}{native_id}")
        }
    }

    /// Image URL when one is present and non-blank.
    pub fn image_ref(&self) -> Option<&str> {
        self.image_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    /// Searchable one-line description stored next to the vector.
    pub fn description(&self) -> String {
        let mut parts = Vec::new();
        push_part(&mut parts, "Title", &self.title);
        push_part(&mut parts, "Artist", &self.artist_name);
        if let Some(date) = &self.date_text {
            push_part(&mut parts, "Date", date);
        }
        if let Some(kind) = &self.object_type {
            push_part(&mut parts, "Type", kind);
        }
        push_part(&mut parts, "Museum", &self.museum);
        parts.join(" | ")
    }

    /// Metadata persisted with the embedding.
    pub fn metadata(&self) -> ArtworkMetadata {
        ArtworkMetadata {
            title: self.title.clone(),
            artist: self.artist_name.clone(),
            museum: self.museum.clone(),
            source_dataset: self.source_dataset.clone(),
            object_type: self.object_type.clone().unwrap_or_default(),
            date_text: self.date_text.clone().unwrap_or_default(),
            url: self.web_url.clone().unwrap_or_default(),
            image_url: self.image_ref().unwrap_or_default().to_string(),
            artist_birth: self.artist_birth.clone().unwrap_or_default(),
            artist_death: self.artist_death.clone().unwrap_or_default(),
            description: self.description(),
        }
    }
}

fn push_part(parts: &mut Vec<String>, label: &str, value: &str) {
    let value = value.trim();
    if !value.is_empty() {
        parts.push(format!("{label}: {value}"));
    }
}

/// Flat metadata document stored alongside each vector and returned with search hits.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtworkMetadata {
    /// Display title.
    #[serde(default)]
    pub title: String,
    /// Artist name.
    #[serde(default)]
    pub artist: String,
    /// Holding museum.
    #[serde(default)]
    pub museum: String,
    /// Dataset the record came from.
    #[serde(default)]
    pub source_dataset: String,
    /// Object classification.
    #[serde(default)]
    pub object_type: String,
    /// Creation date text.
    #[serde(default)]
    pub date_text: String,
    /// Collection page.
    #[serde(default)]
    pub url: String,
    /// Image that was embedded.
    #[serde(default)]
    pub image_url: String,
    /// Artist birth year.
    #[serde(default)]
    pub artist_birth: String,
    /// Artist death year.
    #[serde(default)]
    pub artist_death: String,
    /// Searchable description (`Title: .. | Artist: ..`).
    #[serde(default)]
    pub description: String,
}
