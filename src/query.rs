//! Text-to-image search over an embedded collection.

use std::fmt;
use std::fs::File;
use std::io::BufWriter;
use std::num::NonZeroUsize;
use std::path::Path;

use lru::LruCache;
use serde::Serialize;
use tracing::debug;

use crate::artwork::ArtworkMetadata;
use crate::embedder::{EmbeddingBackend, Precision};
use crate::error::{IndexError, QueryError};
use crate::vector_store::{CollectionName, IndexMatch, VectorIndex};

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    /// Artwork id.
    pub artwork_id: String,
    /// Cosine similarity, higher is closer.
    pub score: f32,
    /// 1-based position.
    pub rank: usize,
    /// Stored metadata.
    pub metadata: ArtworkMetadata,
}

/// Embeds free-text queries and ranks the nearest artworks.
pub struct QueryEngine<B, I> {
    backend: B,
    index: I,
    collection: CollectionName,
    precision: Precision,
    cache: Option<LruCache<String, Vec<f32>>>,
}

impl<B: EmbeddingBackend, I: VectorIndex> QueryEngine<B, I> {
    /// Engine over `collection` with the same precision policy as generation.
    pub fn new(
        backend: B,
        index: I,
        collection: CollectionName,
        force_full_precision: bool,
    ) -> Self {
        let precision = Precision::select(&backend.capability(), force_full_precision);
        Self {
            backend,
            index,
            collection,
            precision,
            cache: None,
        }
    }

    /// Keeps up to `capacity` query embeddings in memory (0 disables caching).
    pub fn with_cache(mut self, capacity: usize) -> Self {
        self.cache = NonZeroUsize::new(capacity).map(LruCache::new);
        self
    }

    /// Collection searched.
    pub fn collection(&self) -> &CollectionName {
        &self.collection
    }

    /// Returns up to `top_k` results by descending score, ties broken by ascending id.
    pub fn search(&mut self, query: &str, top_k: usize) -> Result<Vec<SearchResult>, QueryError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(QueryError::EmptyQuery);
        }
        if top_k == 0 {
            return Err(QueryError::InvalidTopK);
        }
        let stored = self
            .index
            .count(&self.collection)
            .map_err(QueryError::Index)?;
        if stored == 0 {
            return Err(QueryError::EmptyCollection(self.collection.label()));
        }
        let embedding = self.embed_query(query)?;
        let matches = self
            .index
            .query(&self.collection, &embedding, top_k)
            .map_err(QueryError::Index)?;
        if let Some(bad) = matches.iter().find(|hit| !hit.score.is_finite()) {
            return Err(QueryError::Index(IndexError::Backend(format!(
                "non-finite score for {}",
                bad.id
            ))));
        }
        debug!(query, hits = matches.len(), "search complete");
        Ok(rank_matches(matches, top_k))
    }

    /// Releases the backend.
    pub fn release(mut self) {
        self.backend.release();
    }

    fn embed_query(&mut self, query: &str) -> Result<Vec<f32>, QueryError> {
        if let Some(hit) = self.cache.as_mut().and_then(|cache| cache.get(query)) {
            return Ok(hit.clone());
        }
        let embedding = self
            .backend
            .embed_text(query, self.precision)
            .map_err(QueryError::Embedding)?;
        if let Some(cache) = self.cache.as_mut() {
            cache.put(query.to_string(), embedding.clone());
        }
        Ok(embedding)
    }
}

/// Orders matches by score (descending) then id (ascending), keeps `top_k`, assigns ranks.
pub fn rank_matches(mut matches: Vec<IndexMatch>, top_k: usize) -> Vec<SearchResult> {
    matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
    matches
        .into_iter()
        .take(top_k)
        .enumerate()
        .map(|(position, hit)| SearchResult {
            artwork_id: hit.id,
            score: hit.score,
            rank: position + 1,
            metadata: hit.metadata,
        })
        .collect()
}

/// Human-readable listing of a result set; see [`render_results`].
pub struct RenderedResults<'a> {
    query: &'a str,
    results: &'a [SearchResult],
}

/// Numbered listing of `results` for display.
pub fn render_results<'a>(query: &'a str, results: &'a [SearchResult]) -> RenderedResults<'a> {
    RenderedResults { query, results }
}

impl fmt::Display for RenderedResults<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Search results for: '{}'", self.query)?;
        writeln!(f, "{}", "=".repeat(80))?;
        for result in self.results {
            let meta = &result.metadata;
            writeln!(f)?;
            writeln!(f, "{}. {}", result.rank, or_unknown(&meta.title, "Untitled"))?;
            writeln!(f, "   Artist: {}", or_unknown(&meta.artist, "Unknown"))?;
            writeln!(f, "   Museum: {}", or_unknown(&meta.museum, "Unknown"))?;
            if !meta.object_type.is_empty() {
                writeln!(f, "   Type: {}", meta.object_type)?;
            }
            if !meta.date_text.is_empty() {
                writeln!(f, "   Date: {}", meta.date_text)?;
            }
            writeln!(f, "   Similarity: {:.3}", result.score)?;
            if !meta.url.is_empty() {
                writeln!(f, "   URL: {}", meta.url)?;
            }
            if !meta.image_url.is_empty() {
                writeln!(f, "   Image: {}", meta.image_url)?;
            }
            writeln!(f, "   ID: {}", result.artwork_id)?;
        }
        if self.results.is_empty() {
            writeln!(f, "No results.")?;
        }
        Ok(())
    }
}

fn or_unknown<'a>(value: &'a str, fallback: &'a str) -> &'a str {
    if value.trim().is_empty() {
        fallback
    } else {
        value
    }
}

/// Ranked results for one query, as saved to disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResults {
    /// Query text as given.
    pub query: String,
    /// Ranked hits.
    pub results: Vec<SearchResult>,
}

/// Writes the result sets as a pretty JSON array of `{query, results}` objects.
pub fn save_results(path: &Path, runs: &[QueryResults]) -> Result<(), serde_json::Error> {
    let file = File::create(path).map_err(serde_json::Error::io)?;
    serde_json::to_writer_pretty(BufWriter::new(file), runs)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hit(id: &str, score: f32) -> IndexMatch {
        IndexMatch {
            id: id.to_string(),
            score,
            metadata: ArtworkMetadata::default(),
        }
    }

    #[test]
    fn ties_break_by_ascending_id() {
        let ranked = rank_matches(
            vec![hit("c", 0.5), hit("a", 0.9), hit("b", 0.5), hit("d", 0.1)],
            3,
        );
        let order: Vec<(&str, usize)> = ranked
            .iter()
            .map(|r| (r.artwork_id.as_str(), r.rank))
            .collect();
        assert_eq!(order, vec![("a", 1), ("b", 2), ("c", 3)]);
    }

    #[test]
    fn rendering_lists_every_result() {
        let mut result = rank_matches(vec![hit("rijks:1", 0.42)], 1);
        result[0].metadata.title = "The Milkmaid".to_string();
        let text = render_results("woman pouring milk", &result).to_string();
        assert!(text.contains("Search results for: 'woman pouring milk'"));
        assert!(text.contains("1. The Milkmaid"));
        assert!(text.contains("Artist: Unknown"));
        assert!(text.contains("Similarity: 0.420"));
    }

    #[test]
    fn saved_results_are_json() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("results.json");
        let runs = vec![
            QueryResults {
                query: "sunflowers".to_string(),
                results: rank_matches(vec![hit("a", 0.7)], 1),
            },
            QueryResults {
                query: "night sky".to_string(),
                results: Vec::new(),
            },
        ];
        save_results(&path, &runs).expect("save");
        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).expect("read")).expect("json");
        assert_eq!(value[0]["query"], "sunflowers");
        assert_eq!(value[0]["results"][0]["artwork_id"], "a");
        assert_eq!(value[0]["results"][0]["rank"], 1);
        assert_eq!(value[1]["results"].as_array().map(Vec::len), Some(0));
    }
}
