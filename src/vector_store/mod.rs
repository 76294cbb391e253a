//! Vector index abstraction plus the Postgres/pgvector and in-memory implementations.

pub mod memory;
pub mod pg;

use std::collections::HashSet;

use anyhow::Result;

use crate::artwork::ArtworkMetadata;
use crate::embedder::Precision;
use crate::error::IndexError;

pub use memory::MemoryIndex;
pub use pg::PgVectorIndex;

/// Fully-qualified collection name (schema + table).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CollectionName {
    schema: String,
    table: String,
}

impl CollectionName {
    /// Builds a new collection identifier.
    pub fn new<S, T>(schema: S, table: T) -> Result<Self>
    where
        S: Into<String>,
        T: Into<String>,
    {
        let schema = schema.into();
        let table = table.into();
        anyhow::ensure!(!schema.trim().is_empty(), "schema name is required");
        anyhow::ensure!(!table.trim().is_empty(), "collection name is required");
        Ok(Self { schema, table })
    }

    /// Table reference with quoted identifiers.
    pub fn qualified(&self) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(&self.table))
    }

    /// Raw schema string.
    pub fn schema(&self) -> &str {
        &self.schema
    }

    /// Raw table string.
    pub fn table(&self) -> &str {
        &self.table
    }

    /// `schema.table`, unquoted, for logs and artifact names.
    pub fn label(&self) -> String {
        format!("{}.{}", self.schema, self.table)
    }

    /// Name of the cosine HNSW index on the embedding column.
    pub fn embedding_index_name(&self) -> String {
        format!(
            "{}_{}_embedding_idx",
            sanitize_ident(&self.schema),
            sanitize_ident(&self.table)
        )
    }
}

/// Quotes Postgres identifiers, escaping embedded quotes.
pub fn quote_ident(input: &str) -> String {
    let escaped = input.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

fn sanitize_ident(input: &str) -> String {
    input
        .chars()
        .map(|ch| if ch.is_ascii_alphanumeric() { ch } else { '_' })
        .collect()
}

/// One vector ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorEntry {
    /// Artwork id, the upsert key.
    pub id: String,
    /// Embedding components.
    pub vector: Vec<f32>,
    /// Metadata document stored with the vector.
    pub metadata: ArtworkMetadata,
    /// Precision the vector was computed at.
    pub precision: Precision,
    /// Model that produced the vector.
    pub model_version: String,
}

/// Entries committed together in one upsert call. Ids are unique within a batch.
#[derive(Debug, Clone)]
pub struct UpsertBatch {
    entries: Vec<VectorEntry>,
    ids: HashSet<String>,
    limit: usize,
}

impl UpsertBatch {
    /// Empty batch accepting at most `limit` entries.
    pub fn with_capacity(limit: usize) -> Self {
        let limit = limit.max(1);
        Self {
            entries: Vec::with_capacity(limit),
            ids: HashSet::with_capacity(limit),
            limit,
        }
    }

    /// Adds an entry; rejects repeated ids and pushes past the limit.
    pub fn push(&mut self, entry: VectorEntry) -> Result<(), IndexError> {
        if self.is_full() {
            return Err(IndexError::BatchFull(self.limit));
        }
        if !self.ids.insert(entry.id.clone()) {
            return Err(IndexError::DuplicateId(entry.id));
        }
        self.entries.push(entry);
        Ok(())
    }

    /// Entries queued.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the batch reached its limit.
    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.limit
    }

    /// Configured size limit.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Whether `id` is queued.
    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    /// Queued entries in insertion order.
    pub fn entries(&self) -> &[VectorEntry] {
        &self.entries
    }

    /// Queued ids in insertion order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|entry| entry.id.as_str())
    }

    /// Empties the batch, returning the entries.
    pub fn take(&mut self) -> Vec<VectorEntry> {
        self.ids.clear();
        std::mem::replace(&mut self.entries, Vec::with_capacity(self.limit))
    }
}

/// One nearest-neighbor hit.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexMatch {
    /// Artwork id.
    pub id: String,
    /// Cosine similarity, higher is closer.
    pub score: f32,
    /// Stored metadata.
    pub metadata: ArtworkMetadata,
}

/// Persistent vector index keyed by artwork id.
///
/// A collection's dimension is fixed when it is created.
pub trait VectorIndex {
    /// Creates the collection if missing; errors when it exists with another dimension.
    fn ensure_collection(
        &mut self,
        collection: &CollectionName,
        dimension: usize,
    ) -> Result<(), IndexError>;

    /// Drops the collection and everything in it.
    fn reset(&mut self, collection: &CollectionName) -> Result<(), IndexError>;

    /// Inserts or replaces every entry of `batch` as one unit.
    fn upsert(&mut self, collection: &CollectionName, batch: &UpsertBatch)
        -> Result<(), IndexError>;

    /// Up to `top_k` nearest entries to `vector`.
    fn query(
        &mut self,
        collection: &CollectionName,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, IndexError>;

    /// Number of stored vectors; a missing collection counts as empty.
    fn count(&mut self, collection: &CollectionName) -> Result<usize, IndexError>;

    /// Subset of `ids` already stored.
    fn existing_ids(
        &mut self,
        collection: &CollectionName,
        ids: &[String],
    ) -> Result<HashSet<String>, IndexError>;
}

impl<T: VectorIndex + ?Sized> VectorIndex for &mut T {
    fn ensure_collection(
        &mut self,
        collection: &CollectionName,
        dimension: usize,
    ) -> Result<(), IndexError> {
        (**self).ensure_collection(collection, dimension)
    }

    fn reset(&mut self, collection: &CollectionName) -> Result<(), IndexError> {
        (**self).reset(collection)
    }

    fn upsert(
        &mut self,
        collection: &CollectionName,
        batch: &UpsertBatch,
    ) -> Result<(), IndexError> {
        (**self).upsert(collection, batch)
    }

    fn query(
        &mut self,
        collection: &CollectionName,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        (**self).query(collection, vector, top_k)
    }

    fn count(&mut self, collection: &CollectionName) -> Result<usize, IndexError> {
        (**self).count(collection)
    }

    fn existing_ids(
        &mut self,
        collection: &CollectionName,
        ids: &[String],
    ) -> Result<HashSet<String>, IndexError> {
        (**self).existing_ids(collection, ids)
    }
}
