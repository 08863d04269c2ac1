//! Library-level retrieval scenarios: raw chunk records go through
//! ingestion, indexing and the orchestrator exactly as `tctx` runs them.

use chrono::NaiveDate;
use std::sync::Arc;

use temporal_harness::error::RetrievalError;
use temporal_harness::extract::TimestampExtractor;
use temporal_harness::index::{Bm25Params, SimilarityIndex, SimilarityMethod};
use temporal_harness::ingest::prepare_chunks;
use temporal_harness::models::{ChunkInput, ExtractionStrategy, ScoredChunk};
use temporal_harness::retrieve::{
    retrieve, temporal_retrieve, CorpusFilter, RetrievalParams, RetrievalPlan, RetrievalRequest,
};

const CHUNKING: &str = "fixed_660";

fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

fn input(id: &str, source: &str, text: &str) -> ChunkInput {
    ChunkInput {
        id: Some(id.to_string()),
        text: text.to_string(),
        source: source.to_string(),
        ..Default::default()
    }
}

fn build(inputs: Vec<ChunkInput>) -> SimilarityIndex {
    build_embedded(inputs, "bm25", None)
}

fn build_embedded(
    inputs: Vec<ChunkInput>,
    embedding_method: &str,
    vectors: Option<Vec<Vec<f32>>>,
) -> SimilarityIndex {
    let tags = vec!["UK".to_string(), "US".to_string()];
    let chunks = prepare_chunks(
        inputs,
        CHUNKING,
        embedding_method,
        &tags,
        &TimestampExtractor::default(),
    )
    .unwrap();
    SimilarityIndex::build(CHUNKING, chunks, vectors, Bm25Params::default()).unwrap()
}

fn request<'a>(query: &'a str, corpus: Option<&str>) -> RetrievalRequest<'a> {
    RetrievalRequest {
        query,
        query_vec: None,
        method: SimilarityMethod::Bm25,
        filter: CorpusFilter {
            chunking_method: Some(CHUNKING.to_string()),
            embedding_method: None,
            corpus_tag: corpus.map(str::to_string),
        },
        query_date: date("2025-01-01"),
        params: RetrievalParams {
            k: 5,
            months: 8,
            ..Default::default()
        },
    }
}

fn ids(results: &[ScoredChunk]) -> Vec<&str> {
    results.iter().map(|s| s.chunk.id.as_str()).collect()
}

/// UK speeches across two years plus unrelated US filler.
fn speeches() -> SimilarityIndex {
    build(vec![
        input("uk1", "UK_2023-01-01", "The government will expand sanctions on imports."),
        input("uk2", "UK_2023-03-01", "Sanctions remain under review by ministers."),
        input("uk3", "UK_2024-11-01", "We are lifting sanctions on agricultural goods."),
        input("uk4", "UK_2024-12-01", "All remaining sanctions end this winter."),
        input("us1", "US_2024-06-01", "Weather report: rain across the plains."),
        input("us2", "US_2023-05-01", "Weather report: snow in the mountains."),
    ])
}

#[test]
fn test_filenames_supply_timestamps() {
    let index = speeches();
    let uk1 = &index.chunks()[0];
    assert_eq!(uk1.timestamp, Some(date("2023-01-01")));
    assert_eq!(uk1.extraction_strategy, ExtractionStrategy::Filename);
    assert_eq!(uk1.corpus_tag, "UK");
}

#[test]
fn test_evolution_splits_early_and_late_windows() {
    let index = speeches();
    let result = temporal_retrieve(&index, &request("sanctions policy", Some("UK"))).unwrap();

    let RetrievalPlan::Windowed { windows } = result.plan else {
        panic!("expected windowed plan, got {:?}", result.plan);
    };
    assert_eq!(windows.early.start, date("2023-01-01"));
    assert_eq!(windows.early.end, date("2023-09-01"));
    assert_eq!(windows.late.start, date("2024-04-01"));
    assert_eq!(windows.late.end, date("2024-12-01"));

    assert_eq!(ids(&result.early), vec!["uk1", "uk2"]);
    assert_eq!(ids(&result.late), vec!["uk4", "uk3"]);
}

#[test]
fn test_one_year_corpus_fills_both_windows() {
    let inputs = (1..=12)
        .map(|m| {
            input(
                &format!("m{:02}", m),
                &format!("UK_2023-{:02}-01", m),
                "Inflation figures were published.",
            )
        })
        .collect();
    let index = build(inputs);
    let result = temporal_retrieve(&index, &request("inflation", None)).unwrap();

    let RetrievalPlan::Windowed { windows } = result.plan else {
        panic!("expected windowed plan, got {:?}", result.plan);
    };
    assert_eq!(windows.early.end, date("2023-09-01"));
    assert_eq!(windows.late.start, date("2023-04-01"));

    assert_eq!(result.early.len(), 5);
    assert_eq!(result.late.len(), 5);
    for s in &result.early {
        assert!(s.chunk.timestamp.unwrap() <= windows.early.end);
    }
    for s in &result.late {
        assert!(s.chunk.timestamp.unwrap() >= windows.late.start);
    }
}

#[test]
fn test_hybrid_evolution_ranks_each_window() {
    let index = build_embedded(
        vec![
            input("h1", "UK_2023-01-01", "Sanctions on steel imports."),
            input("h2", "UK_2023-02-01", "The harvest festival opened."),
            input("h3", "UK_2024-10-01", "Sanctions were lifted."),
            input("h4", "UK_2024-12-01", "Weather report for the coast."),
        ],
        "e5",
        Some(vec![
            vec![1.0, 0.0],
            vec![0.9, 0.1],
            vec![0.8, 0.2],
            vec![0.0, 1.0],
        ]),
    );
    let query_vec = [1.0f32, 0.0];
    let mut req = request("sanctions", Some("UK"));
    req.method = SimilarityMethod::Hybrid;
    req.query_vec = Some(&query_vec);
    req.filter.embedding_method = Some("e5".to_string());

    req.params.k = 1;
    let top = temporal_retrieve(&index, &req).unwrap();
    assert_eq!(ids(&top.early), vec!["h1"]);
    assert_eq!(ids(&top.late), vec!["h3"]);
    // h1 matches lexically and has cosine 1 within its window.
    assert!((top.early[0].similarity_score - 1.0).abs() < 1e-6);

    req.params.k = 2;
    let both = temporal_retrieve(&index, &req).unwrap();
    assert_eq!(ids(&both.early), vec!["h1", "h2"]);
    assert_eq!(ids(&both.late), vec!["h4", "h3"]);
    assert_eq!(both.late[1].rank, 1);
    assert_eq!(both.late[0].rank, 2);

    req.filter.embedding_method = Some("bm25".to_string());
    let other_tag = temporal_retrieve(&index, &req).unwrap();
    assert_eq!(other_tag.plan, RetrievalPlan::Empty);
}

#[test]
fn test_unrelated_corpus_does_not_shift_scores() {
    let uk = vec![
        input("uk1", "UK_2024-01-01", "Tax cuts announced today."),
        input("uk2", "UK_2024-02-01", "Weather mild today."),
    ];
    let alone = temporal_retrieve(&build(uk.clone()), &request("tax", Some("UK"))).unwrap();

    let mut mixed = uk;
    for i in 0..6 {
        mixed.push(input(&format!("us{}", i), "US_2024-01-15", "tax tax budget"));
    }
    let with_us = temporal_retrieve(&build(mixed), &request("tax", Some("UK"))).unwrap();

    assert_eq!(ids(&alone.early), vec!["uk1", "uk2"]);
    assert_eq!(alone.early, with_us.early);
    assert_eq!(alone.late, with_us.late);
    assert!(alone.early[0].similarity_score > alone.early[1].similarity_score);
}

#[test]
fn test_query_year_is_a_hard_filter() {
    let index = build(vec![
        input("old", "UK_2023-02-01", "budget budget budget deficit budget"),
        input("new", "UK_2024-02-01", "a short note on the budget"),
        input("other", "UK_2024-08-01", "nothing relevant here"),
        input("filler", "UK_2022-01-01", "weather report"),
    ]);
    let result =
        temporal_retrieve(&index, &request("What was the budget in 2024?", None)).unwrap();

    assert_eq!(result.plan, RetrievalPlan::YearFiltered { year: 2024 });
    for side in [&result.early, &result.late] {
        assert!(side
            .iter()
            .all(|s| s.chunk.timestamp_iso().unwrap().starts_with("2024")));
        assert!(!ids(side).contains(&"old"));
    }
    assert_eq!(ids(&result.early), vec!["new", "other"]);
    assert_eq!(ids(&result.late), vec!["other", "new"]);
}

#[test]
fn test_undated_chunk_keeps_its_similarity() {
    let index = build(vec![
        input("dated", "UK_2024-01-01", "tariffs were raised"),
        input("undated", "UK_speech", "tariffs tariffs and more tariffs"),
        input("filler", "UK_2020-01-01", "weather report"),
    ]);
    let results = retrieve(&index, &request("tariffs", None)).unwrap();

    let undated = results.iter().find(|s| s.chunk.id == "undated").unwrap();
    assert!(undated.chunk.timestamp.is_none());
    assert!(undated.temporal_score.is_none());
    assert_eq!(undated.combined_score, undated.similarity_score);
}

#[test]
fn test_empty_corpus_yields_empty_lists() {
    let index = SimilarityIndex::build(CHUNKING, Vec::new(), None, Bm25Params::default()).unwrap();
    let result = temporal_retrieve(&index, &request("anything", None)).unwrap();
    assert_eq!(result.plan, RetrievalPlan::Empty);
    assert!(result.early.is_empty() && result.late.is_empty());
}

#[test]
fn test_unknown_corpus_yields_empty_lists() {
    let index = speeches();
    let result = temporal_retrieve(&index, &request("sanctions", Some("FR"))).unwrap();
    assert_eq!(result.plan, RetrievalPlan::Empty);
}

#[test]
fn test_unknown_method_is_rejected() {
    let err = "cosine".parse::<SimilarityMethod>().unwrap_err();
    assert_eq!(err, RetrievalError::UnknownMethod("cosine".to_string()));
}

#[test]
fn test_dense_without_embeddings_fails() {
    let index = speeches();
    let mut req = request("sanctions", None);
    req.method = SimilarityMethod::Dense;
    let vec = [1.0f32, 0.0];
    req.query_vec = Some(&vec);
    assert!(matches!(
        temporal_retrieve(&index, &req),
        Err(RetrievalError::MissingEmbeddings(_))
    ));
}

#[test]
fn test_shared_index_across_threads() {
    let index = Arc::new(speeches());
    let queries = ["sanctions", "weather report", "lifting goods", "ministers review"];

    let expected: Vec<_> = queries
        .iter()
        .map(|q| temporal_retrieve(&index, &request(q, None)).unwrap())
        .collect();

    let handles: Vec<_> = queries
        .iter()
        .map(|q| {
            let index = Arc::clone(&index);
            let q = q.to_string();
            std::thread::spawn(move || temporal_retrieve(&index, &request(&q, None)).unwrap())
        })
        .collect();

    for (handle, want) in handles.into_iter().zip(&expected) {
        let got = handle.join().unwrap();
        assert_eq!(got.early, want.early);
        assert_eq!(got.late, want.late);
        assert_eq!(got.plan, want.plan);
    }
}

#[test]
fn test_saved_index_answers_identically() {
    let dir = tempfile::tempdir().unwrap();
    let index = speeches();
    index.save(dir.path()).unwrap();
    let loaded = SimilarityIndex::load(dir.path(), CHUNKING).unwrap();

    let req = request("sanctions", Some("UK"));
    let a = temporal_retrieve(&index, &req).unwrap();
    let b = temporal_retrieve(&loaded, &req).unwrap();
    assert_eq!(a.early, b.early);
    assert_eq!(a.late, b.late);
}

#[test]
fn test_provided_timestamps_win_over_extraction() {
    let mut rec = input("p1", "UK_2020-01-01", "Statement of March 3, 2019 on sanctions.");
    rec.timestamp = Some("2022-07-15".to_string());
    let index = build(vec![rec, input("f", "UK_2021-01-01", "weather")]);

    let chunk = &index.chunks()[0];
    assert_eq!(chunk.timestamp, Some(date("2022-07-15")));
    assert_eq!(chunk.extraction_strategy, ExtractionStrategy::Provided);
    assert_eq!(chunk.extraction_confidence, 1.0);
}
