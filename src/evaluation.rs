//! Retrieval quality evaluation on top of [`QueryEngine`].
//!
//! Two measurements of the shared text/image space:
//!
//! * consistency: paraphrases of one intent should retrieve overlapping artworks, scored as
//!   the mean pairwise Jaccard similarity of their result sets;
//! * known items: queries written for a specific artwork should retrieve it, scored as mean
//!   reciprocal rank and success@k.

use std::collections::{BTreeMap, HashSet};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use crate::embedder::EmbeddingBackend;
use crate::error::QueryError;
use crate::query::QueryEngine;
use crate::vector_store::VectorIndex;

/// Cutoffs reported for success@k in addition to `top_k` itself.
pub const SUCCESS_CUTOFFS: [usize; 5] = [1, 5, 10, 20, 50];

/// Query lists keyed by set name (consistency) or by target artwork id (known items).
pub type QueryGroups = BTreeMap<String, Vec<String>>;

const DEFAULT_CONSISTENCY_SETS: &[(&str, &[&str])] = &[
    (
        "sunset",
        &[
            "painting with sunset",
            "sunset scene",
            "artwork showing sunset",
            "landscape with setting sun",
        ],
    ),
    (
        "portrait",
        &[
            "portrait painting",
            "face portrait",
            "portrait of a person",
            "formal portrait artwork",
        ],
    ),
    (
        "landscape",
        &[
            "landscape painting",
            "natural landscape",
            "countryside scene",
            "scenic view artwork",
        ],
    ),
    (
        "still_life",
        &[
            "still life painting",
            "fruit bowl artwork",
            "floral arrangement painting",
            "table with objects",
        ],
    ),
    (
        "religious",
        &[
            "religious artwork",
            "biblical scene",
            "christian iconography",
            "religious figure painting",
        ],
    ),
    (
        "blue_vase",
        &[
            "blue porcelain vase",
            "blue glazed container",
            "blue ceramic vase",
            "blue pottery vessel",
        ],
    ),
];

/// Built-in paraphrase sets used when no consistency file is given.
pub fn default_consistency_sets() -> QueryGroups {
    DEFAULT_CONSISTENCY_SETS
        .iter()
        .map(|(name, queries)| {
            (
                name.to_string(),
                queries.iter().map(|query| query.to_string()).collect(),
            )
        })
        .collect()
}

/// Jaccard similarity of two result sets. Two empty sets count as identical.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count();
    let union = a.union(b).count();
    intersection as f64 / union as f64
}

/// Mean Jaccard similarity over every unordered pair, `None` for fewer than two sets.
pub fn mean_pairwise_jaccard(sets: &[HashSet<String>]) -> Option<f64> {
    if sets.len() < 2 {
        return None;
    }
    let mut total = 0.0;
    let mut pairs = 0usize;
    for (i, left) in sets.iter().enumerate() {
        for right in &sets[i + 1..] {
            total += jaccard(left, right);
            pairs += 1;
        }
    }
    Some(total / pairs as f64)
}

/// Consistency of one paraphrase set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsistencyScore {
    /// Set name.
    pub set: String,
    /// Queries searched.
    pub queries: usize,
    /// Mean pairwise Jaccard similarity of the result sets.
    pub mean_jaccard: f64,
}

/// Searches every query of every set and scores each set's consistency.
///
/// Sets with fewer than two queries are skipped.
pub fn evaluate_consistency<B, I>(
    engine: &mut QueryEngine<B, I>,
    groups: &QueryGroups,
    top_k: usize,
) -> Result<Vec<ConsistencyScore>, QueryError>
where
    B: EmbeddingBackend,
    I: VectorIndex,
{
    let mut scores = Vec::with_capacity(groups.len());
    for (name, queries) in groups {
        if queries.len() < 2 {
            warn!(set = %name, "skipping query set with fewer than two queries");
            continue;
        }
        let mut result_sets: Vec<HashSet<String>> = Vec::with_capacity(queries.len());
        for query in queries {
            let hits = engine.search(query, top_k)?;
            result_sets.push(hits.into_iter().map(|hit| hit.artwork_id).collect());
        }
        if let Some(mean_jaccard) = mean_pairwise_jaccard(&result_sets) {
            info!(set = %name, mean_jaccard, "query set scored");
            scores.push(ConsistencyScore {
                set: name.clone(),
                queries: queries.len(),
                mean_jaccard,
            });
        }
    }
    Ok(scores)
}

/// Known-item results for one target artwork.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArtworkScore {
    /// Target artwork id.
    pub artwork_id: String,
    /// Queries written for it.
    pub num_queries: usize,
    /// Ranks at which it was found, one per successful query.
    pub ranks: Vec<usize>,
    /// Mean reciprocal rank over all its queries; misses count as 0.
    pub mrr: f64,
    /// Share of its queries that found it.
    pub success_rate: f64,
    /// Mean rank over successful queries.
    pub avg_rank: Option<f64>,
}

/// Known-item results over all targets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownItemSummary {
    /// Mean reciprocal rank over all queries.
    pub mrr: f64,
    /// Share of queries whose target ranked at or above k.
    pub success_at_k: BTreeMap<usize, f64>,
    /// Queries searched.
    pub total_queries: usize,
    /// Target artworks.
    pub total_artworks: usize,
    /// Results fetched per query.
    pub top_k: usize,
}

/// Full known-item report, as written to disk.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownItemReport {
    /// Aggregate metrics.
    pub overall: KnownItemSummary,
    /// Per-target metrics.
    pub per_artwork: Vec<ArtworkScore>,
}

/// Scores known-item retrieval from the rank each query gave its target (`None` for a miss).
pub fn score_known_items(
    observed: &BTreeMap<String, Vec<Option<usize>>>,
    top_k: usize,
) -> KnownItemReport {
    let mut per_artwork = Vec::with_capacity(observed.len());
    let mut found = Vec::new();
    let mut total_queries = 0usize;
    for (artwork_id, ranks) in observed {
        let hits: Vec<usize> = ranks.iter().flatten().copied().collect();
        total_queries += ranks.len();
        found.extend_from_slice(&hits);
        per_artwork.push(ArtworkScore {
            artwork_id: artwork_id.clone(),
            num_queries: ranks.len(),
            mrr: ratio(reciprocal_sum(&hits), ranks.len()),
            success_rate: ratio(hits.len() as f64, ranks.len()),
            avg_rank: (!hits.is_empty())
                .then(|| hits.iter().sum::<usize>() as f64 / hits.len() as f64),
            ranks: hits,
        });
    }
    let success_at_k = success_cutoffs(top_k)
        .into_iter()
        .map(|k| {
            let within = found.iter().filter(|&&rank| rank <= k).count();
            (k, ratio(within as f64, total_queries))
        })
        .collect();
    KnownItemReport {
        overall: KnownItemSummary {
            mrr: ratio(reciprocal_sum(&found), total_queries),
            success_at_k,
            total_queries,
            total_artworks: observed.len(),
            top_k,
        },
        per_artwork,
    }
}

/// Searches every query and records where its target artwork ranked.
pub fn evaluate_known_items<B, I>(
    engine: &mut QueryEngine<B, I>,
    targets: &QueryGroups,
    top_k: usize,
) -> Result<KnownItemReport, QueryError>
where
    B: EmbeddingBackend,
    I: VectorIndex,
{
    let mut observed = BTreeMap::new();
    for (artwork_id, queries) in targets {
        let mut ranks = Vec::with_capacity(queries.len());
        for query in queries {
            let hits = engine.search(query, top_k)?;
            ranks.push(
                hits.iter()
                    .find(|hit| &hit.artwork_id == artwork_id)
                    .map(|hit| hit.rank),
            );
        }
        observed.insert(artwork_id.clone(), ranks);
    }
    let report = score_known_items(&observed, top_k);
    info!(
        mrr = report.overall.mrr,
        queries = report.overall.total_queries,
        "known-item evaluation complete"
    );
    Ok(report)
}

fn success_cutoffs(top_k: usize) -> Vec<usize> {
    let top_k = top_k.max(1);
    let mut cutoffs: Vec<usize> = SUCCESS_CUTOFFS
        .iter()
        .copied()
        .filter(|&k| k < top_k)
        .collect();
    cutoffs.push(top_k);
    cutoffs
}

fn reciprocal_sum(ranks: &[usize]) -> f64 {
    ranks.iter().map(|&rank| 1.0 / rank as f64).sum()
}

fn ratio(value: f64, count: usize) -> f64 {
    if count == 0 {
        0.0
    } else {
        value / count as f64
    }
}

/// Writes consistency scores as CSV (`query_set,queries,mean_jaccard`).
pub fn write_consistency_csv(path: &Path, scores: &[ConsistencyScore]) -> io::Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "query_set,queries,mean_jaccard")?;
    for score in scores {
        writeln!(
            out,
            "{},{},{:.4}",
            csv_field(&score.set),
            score.queries,
            score.mean_jaccard
        )?;
    }
    out.flush()
}

/// Writes the known-item report as pretty JSON.
pub fn write_known_items_json(
    path: &Path,
    report: &KnownItemReport,
) -> Result<(), serde_json::Error> {
    let file = File::create(path).map_err(serde_json::Error::io)?;
    serde_json::to_writer_pretty(BufWriter::new(file), report)
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
