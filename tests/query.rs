mod common;

use std::sync::atomic::Ordering;
use std::sync::Arc;

use artsearch::{run_generation, MemoryIndex, QueryEngine, QueryError, StopSignal};
use pretty_assertions::assert_eq;

use common::{
    collection, ok_url, record, seeded_index, ScriptedBackend, ScriptedFetcher, VecSource,
};

#[test]
fn ranks_by_score_with_id_tie_break() {
    let mut engine = QueryEngine::new(ScriptedBackend::cpu(), seeded_index(), collection(), false);
    let results = engine.search("a ship at sea", 3).expect("search");
    let ranked: Vec<(&str, usize)> = results
        .iter()
        .map(|r| (r.artwork_id.as_str(), r.rank))
        .collect();
    assert_eq!(ranked, vec![("rijks:a", 1), ("rijks:b", 2), ("met:c", 3)]);
    assert!(results[0].score >= results[2].score);
    assert_eq!(results[0].metadata.title, "Title rijks:a");

    let again = engine.search("a ship at sea", 3).expect("search again");
    assert_eq!(again, results);
}

#[test]
fn top_k_larger_than_collection_returns_everything() {
    let mut engine = QueryEngine::new(ScriptedBackend::cpu(), seeded_index(), collection(), false);
    let results = engine.search("anything", 50).expect("search");
    assert_eq!(results.len(), 4);
    assert_eq!(results.last().map(|r| r.rank), Some(4));
}

#[test]
fn empty_collection_is_a_query_error() {
    let mut engine =
        QueryEngine::new(ScriptedBackend::cpu(), MemoryIndex::new(), collection(), false);
    let err = engine.search("sunflowers", 5).expect_err("empty");
    assert!(matches!(err, QueryError::EmptyCollection(label) if label == "public.artworks"));
}

#[test]
fn embedding_failure_is_a_query_error() {
    let backend = ScriptedBackend::cpu().failing_text();
    let mut engine = QueryEngine::new(backend, seeded_index(), collection(), false);
    let err = engine.search("sunflowers", 5).expect_err("embedding");
    assert!(matches!(err, QueryError::Embedding(_)));
}

#[test]
fn invalid_input_is_rejected_before_embedding() {
    let backend = ScriptedBackend::cpu();
    let text_calls = Arc::clone(&backend.text_calls);
    let mut engine = QueryEngine::new(backend, seeded_index(), collection(), false);
    assert!(matches!(engine.search("   ", 5), Err(QueryError::EmptyQuery)));
    assert!(matches!(engine.search("night", 0), Err(QueryError::InvalidTopK)));
    assert_eq!(text_calls.load(Ordering::SeqCst), 0);
}

#[test]
fn cached_queries_skip_the_text_encoder() {
    let backend = ScriptedBackend::cpu();
    let text_calls = Arc::clone(&backend.text_calls);
    let mut engine =
        QueryEngine::new(backend, seeded_index(), collection(), false).with_cache(16);
    engine.search("still life", 2).expect("first");
    engine.search("  still life ", 2).expect("second");
    assert_eq!(text_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn generated_collection_is_searchable() {
    let source = VecSource((0..6).map(|i| record(i, ok_url(i))).collect());
    let mut index = MemoryIndex::new();
    let report = run_generation(
        &source,
        Arc::new(ScriptedFetcher::new()),
        ScriptedBackend::cpu(),
        &mut index,
        &artsearch::GenerateControls::new(collection()).with_batch_size(4),
        &StopSignal::new(),
    )
    .expect("generate");
    assert_eq!(report.outcome.succeeded.len(), 6);

    let mut engine = QueryEngine::new(ScriptedBackend::cpu(), index, collection(), false);
    let results = engine.search("portrait", 3).expect("search");
    assert_eq!(results.len(), 3);
    let ranks: Vec<usize> = results.iter().map(|r| r.rank).collect();
    assert_eq!(ranks, vec![1, 2, 3]);
    assert!(results
        .windows(2)
        .all(|pair| pair[0].score > pair[1].score
            || (pair[0].score == pair[1].score && pair[0].artwork_id < pair[1].artwork_id)));
}
