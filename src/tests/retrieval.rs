//! Search over stores filled through the fake extractor.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::support::{
    color_embedding, fake_extractor, fake_query_processor, record, solid_frame, FailingTextEncoder,
    FakeTextEncoder, MapSynonyms,
};
use crate::extract::TextEncoder;
use crate::fusion::FusionWeights;
use crate::index::{IndexStorage, IndexStore, Modality, ModalityQuery, VideoId, WeightedTerm};
use crate::query::{ExpansionSettings, QueryProcessor};
use crate::search::{CandidatePool, SearchHit, SearchRequest, SearchService};
use crate::video::Frame;

const VISUAL_ONLY: FusionWeights = FusionWeights {
    clip: 1.0,
    text: 0.0,
    tfidf: 0.0,
};

const KEYWORD_ONLY: FusionWeights = FusionWeights {
    clip: 0.0,
    text: 0.0,
    tfidf: 1.0,
};

fn indexed_store(videos: &[(&str, [u8; 3])]) -> IndexStore {
    let extractor = fake_extractor();
    let mut store = IndexStore::new("sig");

    for &(path, rgb) in videos {
        let frames: Vec<Frame> = (0..4).map(|i| solid_frame(rgb, i as f64)).collect();
        let features = extractor.extract(&frames).unwrap();

        let mut rec = record(path, &[]);
        rec.frame_count_sampled = features.frames_used;
        rec.captions = features.captions;
        store.upsert(rec, &features.visual, &features.text).unwrap();
    }

    store
}

/// Store built from captions directly.
fn captioned_store(videos: &[(&str, &str, [u8; 3])]) -> IndexStore {
    let mut store = IndexStore::new("sig");
    for &(path, caption, rgb) in videos {
        let text = FakeTextEncoder.embed_text(caption).unwrap();
        store
            .upsert(record(path, &[caption]), &color_embedding(rgb), &text)
            .unwrap();
    }
    store
}

fn service(store: IndexStore) -> SearchService {
    service_with(store, fake_query_processor(MapSynonyms::new(&[])))
}

fn service_with(store: IndexStore, processor: QueryProcessor) -> SearchService {
    SearchService::new(Arc::new(store), processor, CandidatePool::default())
}

fn request(query: &str, top_k: usize, weights: FusionWeights) -> SearchRequest {
    SearchRequest {
        weights,
        ..SearchRequest::new(query, top_k)
    }
}

fn id(path: &str) -> VideoId {
    VideoId::from_path(Path::new(path))
}

fn ids(hits: &[SearchHit]) -> Vec<VideoId> {
    hits.iter().map(|h| h.video_id).collect()
}

fn assert_ranked(hits: &[SearchHit]) {
    for (i, hit) in hits.iter().enumerate() {
        assert_eq!(hit.rank, i + 1);
    }
    for pair in hits.windows(2) {
        let ordered = pair[0].fused_score > pair[1].fused_score
            || (pair[0].fused_score == pair[1].fused_score && pair[0].video_id < pair[1].video_id);
        assert!(ordered, "{pair:?}");
    }
}

#[test]
fn test_visual_only_weights_rank_by_visual_similarity() {
    let store = indexed_store(&[
        ("/v/blue.mp4", [20, 20, 220]),
        ("/v/orange.mp4", [220, 120, 20]),
        ("/v/red.mp4", [220, 20, 20]),
    ]);
    let svc = service(store);

    let hits = svc.search(&request("red", 10, VISUAL_ONLY));

    assert_eq!(
        ids(&hits),
        vec![id("/v/red.mp4"), id("/v/orange.mp4"), id("/v/blue.mp4")]
    );
    for hit in &hits {
        assert_eq!(hit.fused_score, hit.scores.visual);
    }
    assert_ranked(&hits);
}

#[test]
fn test_results_bounded_by_top_k_and_sorted() {
    let store = indexed_store(&[
        ("/v/a.mp4", [220, 20, 20]),
        ("/v/b.mp4", [200, 40, 40]),
        ("/v/c.mp4", [20, 200, 20]),
        ("/v/d.mp4", [20, 20, 220]),
        ("/v/e.mp4", [120, 120, 120]),
    ]);
    let svc = service(store);

    let hits = svc.search(&SearchRequest::new("a woman wearing red", 2));
    assert_eq!(hits.len(), 2);
    assert_ranked(&hits);

    let hits = svc.search(&SearchRequest::new("a woman wearing red", 50));
    assert!(hits.len() <= 5);
    assert_ranked(&hits);
}

#[test]
fn test_partial_keyword_match_scores_lower() {
    let store = captioned_store(&[
        ("/v/car.mp4", "a red car parked outside", [200, 30, 30]),
        ("/v/shirt.mp4", "a man in a red shirt", [200, 30, 30]),
        ("/v/dog.mp4", "a dog on the grass", [30, 200, 30]),
    ]);

    let terms = [WeightedTerm::new("red", 1.0), WeightedTerm::new("shirt", 1.0)];
    let raw = store
        .search(Modality::Keyword, ModalityQuery::Terms(&terms), 10)
        .unwrap();
    assert_eq!(raw.len(), 2);
    assert_eq!(raw[0].video_id, id("/v/shirt.mp4"));
    assert_eq!(raw[1].video_id, id("/v/car.mp4"));
    assert!(raw[1].score > 0.0 && raw[1].score < raw[0].score);

    let hits = service(store).search(&request("red shirt", 10, KEYWORD_ONLY));
    assert_eq!(ids(&hits)[..2], [id("/v/shirt.mp4"), id("/v/car.mp4")]);
    assert!(hits[1].scores.keyword > 0.0);
    assert!(hits[1].scores.keyword < hits[0].scores.keyword);
}

#[test]
fn test_persisted_store_gives_identical_results() {
    let tmp = tempfile::tempdir().unwrap();
    let storage = IndexStorage::new(tmp.path());

    let mut store = indexed_store(&[
        ("/v/a.mp4", [220, 20, 20]),
        ("/v/b.mp4", [20, 200, 20]),
        ("/v/c.mp4", [20, 20, 220]),
    ]);
    storage.save(&mut store).unwrap();
    let loaded = storage.load().unwrap();

    let original = service(store);
    let reloaded = service(loaded);

    for query in ["red", "a dog running on green grass", "blue jacket", "nothing here"] {
        let request = SearchRequest::new(query, 3);
        assert_eq!(original.search(&request), reloaded.search(&request), "{query}");
    }
}

#[test]
fn test_empty_inputs_give_empty_results() {
    let svc = service(indexed_store(&[("/v/a.mp4", [220, 20, 20])]));
    assert!(svc.search(&SearchRequest::new("   ", 5)).is_empty());
    assert!(svc.search(&SearchRequest::new("red", 0)).is_empty());

    let empty = service(IndexStore::new("sig"));
    assert!(empty.search(&SearchRequest::new("red", 5)).is_empty());
}

#[test]
fn test_hits_carry_metadata() {
    let svc = service(indexed_store(&[("/v/red.mp4", [220, 20, 20])]));

    let hits = svc.search(&SearchRequest::new("red shirt", 5));

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].path, PathBuf::from("/v/red.mp4"));
    assert_eq!(hits[0].duration, 10.0);
    assert!(hits[0].caption.as_deref().unwrap().contains("red shirt"));
    assert_eq!(hits[0].timestamp, Some(0.0));
}

#[test]
fn test_snippet_is_the_frame_matching_the_query() {
    let mut store = IndexStore::new("sig");
    let rec = record(
        "/v/mixed.mp4",
        &["an empty room", "a red car parked outside", "a dog on the grass"],
    );
    let text = FakeTextEncoder.embed_text(&rec.keyword_text()).unwrap();
    store.upsert(rec, &color_embedding([200, 30, 30]), &text).unwrap();
    let svc = service(store);

    let hits = svc.search(&SearchRequest::new("red car", 5));

    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].caption.as_deref(), Some("a red car parked outside"));
    assert_eq!(hits[0].timestamp, Some(1.0));

    let json = serde_json::to_value(&hits[0]).unwrap();
    assert_eq!(json["timestamp"], serde_json::json!(1.0));

    let hits = svc.search(&SearchRequest::new("dogs", 5));
    assert_eq!(hits[0].caption.as_deref(), Some("a dog on the grass"));
    assert_eq!(hits[0].timestamp, Some(2.0));
}

#[test]
fn test_directory_filter() {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().canonicalize().unwrap();
    std::fs::create_dir_all(root.join("cats")).unwrap();
    std::fs::create_dir_all(root.join("dogs")).unwrap();

    let path = |rel: &str| root.join(rel).to_string_lossy().to_string();
    let (a, b, c) = (path("cats/a.mp4"), path("cats/b.mp4"), path("dogs/c.mp4"));
    let svc = service(indexed_store(&[
        (&a, [220, 20, 20]),
        (&b, [20, 20, 220]),
        (&c, [220, 20, 20]),
    ]));

    let mut req = SearchRequest::new("red", 10);
    req.directory = Some(root.join("cats"));
    let hits = svc.search(&req);

    assert_eq!(hits.len(), 2);
    assert!(hits.iter().all(|h| h.path.starts_with(root.join("cats"))));
    assert_eq!(hits[0].video_id, id(&a));
    assert_ranked(&hits);

    assert_eq!(svc.video_count_under(&root.join("cats")), 2);
    assert_eq!(svc.video_count_under(&root), 3);
    assert_eq!(svc.video_count_under(&root.join("birds")), 0);
}

#[test]
fn test_encoder_failure_leaves_keyword_modality() {
    let store = captioned_store(&[
        ("/v/shirt.mp4", "a man in a red shirt", [200, 30, 30]),
        ("/v/dog.mp4", "a dog on the grass", [30, 200, 30]),
    ]);
    let processor = QueryProcessor::new(
        Box::new(MapSynonyms::new(&[])),
        Box::new(FailingTextEncoder),
        None,
        ExpansionSettings::default(),
    );
    let svc = service_with(store, processor);

    let hits = svc.search(&SearchRequest::new("red shirt", 5));

    assert_eq!(ids(&hits), vec![id("/v/shirt.mp4")]);
    assert_eq!(hits[0].scores.visual, 0.0);
    assert_eq!(hits[0].scores.text, 0.0);
    assert!(hits[0].scores.keyword > 0.0);
}

#[test]
fn test_mismatched_query_space_scores_visual_as_zero() {
    let store = indexed_store(&[("/v/a.mp4", [220, 20, 20]), ("/v/b.mp4", [20, 20, 220])]);
    // Caption-space encoder standing in for the joint one: wrong dimensions
    let processor = QueryProcessor::new(
        Box::new(MapSynonyms::new(&[])),
        Box::new(FakeTextEncoder),
        Some(Box::new(FakeTextEncoder)),
        ExpansionSettings::default(),
    );
    let svc = service_with(store, processor);

    let hits = svc.search(&SearchRequest::new("red shirt", 5));

    assert!(!hits.is_empty());
    assert!(hits.iter().all(|h| h.scores.visual == 0.0));
}

#[test]
fn test_synonyms_reach_the_keyword_index() {
    let store = indexed_store(&[("/v/red.mp4", [220, 20, 20]), ("/v/blue.mp4", [20, 20, 220])]);
    let svc = service_with(
        store,
        fake_query_processor(MapSynonyms::new(&[("crimson", &["red"])])),
    );

    let hits = svc.search(&request("crimson", 5, KEYWORD_ONLY));

    assert_eq!(hits[0].video_id, id("/v/red.mp4"));
    assert!(hits[0].scores.keyword > 0.0);
    // Still a vector candidate, but nothing to match in its captions
    let blue = hits.iter().find(|h| h.video_id == id("/v/blue.mp4")).unwrap();
    assert_eq!(blue.scores.keyword, 0.0);
    assert_eq!(blue.fused_score, 0.0);
}
