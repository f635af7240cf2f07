//! Search session over a loaded index snapshot.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::fusion::{fuse, FusionWeights, ModalityScores};
use crate::index::{IndexStore, Modality, ModalityQuery, ScoredVideo, VideoId};
use crate::query::{ProcessedQuery, QueryProcessor};

/// Per-modality candidate count: `min(top_k * multiplier, max)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CandidatePool {
    #[serde(default = "default_pool_multiplier")]
    pub multiplier: usize,
    #[serde(default = "default_pool_max")]
    pub max: usize,
}

impl Default for CandidatePool {
    fn default() -> Self {
        Self {
            multiplier: default_pool_multiplier(),
            max: default_pool_max(),
        }
    }
}

fn default_pool_multiplier() -> usize {
    3
}

fn default_pool_max() -> usize {
    200
}

impl CandidatePool {
    pub fn size(&self, top_k: usize) -> usize {
        top_k.saturating_mul(self.multiplier).min(self.max)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchRequest {
    pub query: String,
    pub top_k: usize,
    pub weights: FusionWeights,
    /// Only return videos under this directory
    pub directory: Option<PathBuf>,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>, top_k: usize) -> Self {
        Self {
            query: query.into(),
            top_k,
            weights: FusionWeights::default(),
            directory: None,
        }
    }
}

/// One ranked result with the metadata a caller needs to show it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub rank: usize,
    pub video_id: VideoId,
    pub path: PathBuf,
    pub fused_score: f32,
    pub scores: ModalityScores,
    pub duration: f64,
    /// Frame whose caption best matches the query
    pub timestamp: Option<f64>,
    pub caption: Option<String>,
}

pub struct SearchService {
    store: Arc<IndexStore>,
    processor: QueryProcessor,
    pool: CandidatePool,
}

impl SearchService {
    pub fn new(store: Arc<IndexStore>, processor: QueryProcessor, pool: CandidatePool) -> Self {
        Self {
            store,
            processor,
            pool,
        }
    }

    pub fn store(&self) -> &IndexStore {
        &self.store
    }

    /// Rank videos for a query. Empty queries, empty indices and queries
    /// with no candidates all yield an empty list.
    pub fn search(&self, request: &SearchRequest) -> Vec<SearchHit> {
        if request.top_k == 0 || self.store.is_empty() {
            return Vec::new();
        }

        let processed = self.processor.process(&request.query);
        if processed.is_empty() {
            return Vec::new();
        }

        let directory = request.directory.as_deref().map(resolve_dir);

        // Filtering happens after retrieval, so a filtered search looks at
        // every video instead of the usual pool
        let k = match directory {
            Some(_) => self.store.len(),
            None => self.pool.size(request.top_k),
        };

        let [visual, text, keyword] = self.candidates(&processed, k);
        let keep = |hits: Vec<ScoredVideo>| -> Vec<ScoredVideo> {
            match &directory {
                Some(dir) => hits.into_iter().filter(|h| self.is_under(h.video_id, dir)).collect(),
                None => hits,
            }
        };
        let (visual, text, keyword) = (keep(visual), keep(text), keep(keyword));

        fuse(&visual, &text, &keyword, request.weights, request.top_k)
            .into_iter()
            .enumerate()
            .filter_map(|(i, result)| {
                let record = self.store.record(result.video_id)?;
                let snippet = record.best_caption(&processed.terms);
                Some(SearchHit {
                    rank: i + 1,
                    video_id: result.video_id,
                    path: record.path.clone(),
                    fused_score: result.fused_score,
                    scores: result.scores,
                    duration: record.duration,
                    timestamp: snippet.map(|c| c.timestamp),
                    caption: snippet.map(|c| c.text.clone()),
                })
            })
            .collect()
    }

    /// Number of indexed videos under `dir`.
    pub fn video_count_under(&self, dir: &Path) -> usize {
        let dir = resolve_dir(dir);
        self.store.records().filter(|r| r.path.starts_with(&dir)).count()
    }

    fn is_under(&self, id: VideoId, dir: &Path) -> bool {
        self.store
            .record(id)
            .is_some_and(|r| r.path.starts_with(dir))
    }

    /// Candidate lists for visual, text and keyword. Each vector modality
    /// keeps a video's best score over the original and expanded query.
    fn candidates(&self, query: &ProcessedQuery, k: usize) -> [Vec<ScoredVideo>; 3] {
        let visual = self.best_of(Modality::Visual, &query.visual_embeddings, k);
        let text = self.best_of(Modality::Text, &query.text_embeddings, k);

        let keyword = if query.terms.is_empty() {
            Vec::new()
        } else {
            self.store
                .search(Modality::Keyword, ModalityQuery::Terms(&query.terms), k)
                .unwrap_or_else(|e| {
                    log::warn!("keyword search failed: {e}");
                    Vec::new()
                })
        };

        [visual, text, keyword]
    }

    fn best_of(&self, modality: Modality, embeddings: &[Vec<f32>], k: usize) -> Vec<ScoredVideo> {
        let mut best: HashMap<VideoId, f32> = HashMap::new();

        for embedding in embeddings {
            match self.store.search(modality, ModalityQuery::Vector(embedding), k) {
                Ok(hits) => {
                    for hit in hits {
                        best.entry(hit.video_id)
                            .and_modify(|s| *s = s.max(hit.score))
                            .or_insert(hit.score);
                    }
                }
                Err(e) => {
                    log::warn!("{modality:?} search failed, scoring it as 0: {e}");
                    return Vec::new();
                }
            }
        }

        best.into_iter()
            .map(|(video_id, score)| ScoredVideo { video_id, score })
            .collect()
    }
}

fn resolve_dir(dir: &Path) -> PathBuf {
    dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candidate_pool_size() {
        let pool = CandidatePool::default();
        assert_eq!(pool.size(10), 30);
        assert_eq!(pool.size(100), 200);
        assert_eq!(pool.size(0), 0);
    }
}
