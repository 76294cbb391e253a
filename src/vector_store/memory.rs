//! Exact in-process index used for dry runs and tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use super::{CollectionName, IndexMatch, UpsertBatch, VectorEntry, VectorIndex};
use crate::error::IndexError;

#[derive(Debug, Clone)]
struct Collection {
    dimension: usize,
    rows: BTreeMap<String, VectorEntry>,
}

/// Brute-force cosine index held in memory.
#[derive(Debug, Clone, Default)]
pub struct MemoryIndex {
    collections: HashMap<CollectionName, Collection>,
    upserts: usize,
}

impl MemoryIndex {
    /// Empty index.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful upsert calls.
    pub fn upsert_calls(&self) -> usize {
        self.upserts
    }

    /// Stored ids of a collection in ascending order.
    pub fn ids(&self, collection: &CollectionName) -> Vec<String> {
        self.collections
            .get(collection)
            .map(|c| c.rows.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn collection(&self, name: &CollectionName) -> Result<&Collection, IndexError> {
        self.collections
            .get(name)
            .ok_or_else(|| IndexError::MissingCollection(name.label()))
    }
}

impl VectorIndex for MemoryIndex {
    fn ensure_collection(
        &mut self,
        collection: &CollectionName,
        dimension: usize,
    ) -> Result<(), IndexError> {
        let existing = self
            .collections
            .entry(collection.clone())
            .or_insert_with(|| Collection {
                dimension,
                rows: BTreeMap::new(),
            });
        if existing.dimension != dimension {
            return Err(IndexError::DimensionMismatch {
                collection: collection.label(),
                expected: existing.dimension,
                actual: dimension,
            });
        }
        Ok(())
    }

    fn reset(&mut self, collection: &CollectionName) -> Result<(), IndexError> {
        self.collections.remove(collection);
        Ok(())
    }

    fn upsert(
        &mut self,
        collection: &CollectionName,
        batch: &UpsertBatch,
    ) -> Result<(), IndexError> {
        let target = self
            .collections
            .get_mut(collection)
            .ok_or_else(|| IndexError::MissingCollection(collection.label()))?;
        // Validate first so a bad entry leaves the whole batch unwritten.
        if let Some(bad) = batch
            .entries()
            .iter()
            .find(|entry| entry.vector.len() != target.dimension)
        {
            return Err(IndexError::DimensionMismatch {
                collection: collection.label(),
                expected: target.dimension,
                actual: bad.vector.len(),
            });
        }
        for entry in batch.entries() {
            target.rows.insert(entry.id.clone(), entry.clone());
        }
        self.upserts += 1;
        Ok(())
    }

    fn query(
        &mut self,
        collection: &CollectionName,
        vector: &[f32],
        top_k: usize,
    ) -> Result<Vec<IndexMatch>, IndexError> {
        let target = self.collection(collection)?;
        if vector.len() != target.dimension {
            return Err(IndexError::DimensionMismatch {
                collection: collection.label(),
                expected: target.dimension,
                actual: vector.len(),
            });
        }
        let mut matches: Vec<IndexMatch> = target
            .rows
            .values()
            .map(|entry| IndexMatch {
                id: entry.id.clone(),
                score: cosine_similarity(vector, &entry.vector),
                metadata: entry.metadata.clone(),
            })
            .collect();
        matches.sort_by(|a, b| b.score.total_cmp(&a.score).then_with(|| a.id.cmp(&b.id)));
        matches.truncate(top_k);
        Ok(matches)
    }

    fn count(&mut self, collection: &CollectionName) -> Result<usize, IndexError> {
        Ok(self
            .collections
            .get(collection)
            .map(|c| c.rows.len())
            .unwrap_or(0))
    }

    fn existing_ids(
        &mut self,
        collection: &CollectionName,
        ids: &[String],
    ) -> Result<HashSet<String>, IndexError> {
        let Some(target) = self.collections.get(collection) else {
            return Ok(HashSet::new());
        };
        Ok(ids
            .iter()
            .filter(|id| target.rows.contains_key(id.as_str()))
            .cloned()
            .collect())
    }
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}
