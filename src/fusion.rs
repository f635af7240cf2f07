//! Weighted score fusion across the visual, text and keyword modalities.
//!
//! score(v) = clip · visual(v) + text · text(v) + tfidf · keyword(v)
//!
//! A video missing from a modality's candidate list scores 0 there, so a
//! video strong in a single modality can still rank when its weight allows.
//! Weights are plain multipliers; nothing is normalized.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::index::{ScoredVideo, VideoId};

/// Default weight of the visual (CLIP) modality.
pub const DEFAULT_CLIP_WEIGHT: f32 = 0.35;
/// Default weight of the caption-embedding modality.
pub const DEFAULT_TEXT_WEIGHT: f32 = 0.35;
/// Default weight of the keyword modality.
pub const DEFAULT_TFIDF_WEIGHT: f32 = 0.3;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FusionWeights {
    #[serde(default = "default_clip_weight")]
    pub clip: f32,
    #[serde(default = "default_text_weight")]
    pub text: f32,
    #[serde(default = "default_tfidf_weight")]
    pub tfidf: f32,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            clip: DEFAULT_CLIP_WEIGHT,
            text: DEFAULT_TEXT_WEIGHT,
            tfidf: DEFAULT_TFIDF_WEIGHT,
        }
    }
}

fn default_clip_weight() -> f32 {
    DEFAULT_CLIP_WEIGHT
}

fn default_text_weight() -> f32 {
    DEFAULT_TEXT_WEIGHT
}

fn default_tfidf_weight() -> f32 {
    DEFAULT_TFIDF_WEIGHT
}

/// Per-modality scores behind a fused score. 0.0 where the video was not
/// a candidate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct ModalityScores {
    pub visual: f32,
    pub text: f32,
    pub keyword: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub video_id: VideoId,
    pub fused_score: f32,
    pub scores: ModalityScores,
}

/// Fuse three candidate lists into one ranking of at most `top_k` videos,
/// best first, ties broken by ascending id.
pub fn fuse(
    visual: &[ScoredVideo],
    text: &[ScoredVideo],
    keyword: &[ScoredVideo],
    weights: FusionWeights,
    top_k: usize,
) -> Vec<QueryResult> {
    // visual, text, keyword; a list naming the same video twice keeps the best
    let mut candidates: HashMap<VideoId, [Option<f32>; 3]> = HashMap::new();
    for (slot, hits) in [visual, text, keyword].into_iter().enumerate() {
        for hit in hits {
            let entry = &mut candidates.entry(hit.video_id).or_default()[slot];
            let score = finite(hit.score);
            *entry = Some(entry.map_or(score, |s| s.max(score)));
        }
    }

    let mut results: Vec<QueryResult> = candidates
        .into_iter()
        .map(|(video_id, [v, t, k])| {
            let scores = ModalityScores {
                visual: v.unwrap_or(0.0),
                text: t.unwrap_or(0.0),
                keyword: k.unwrap_or(0.0),
            };
            QueryResult {
                video_id,
                fused_score: finite(
                    weights.clip * scores.visual
                        + weights.text * scores.text
                        + weights.tfidf * scores.keyword,
                ),
                scores,
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.fused_score
            .total_cmp(&a.fused_score)
            .then_with(|| a.video_id.cmp(&b.video_id))
    });
    results.truncate(top_k);

    results
}

/// NaN or infinite scores count as 0.
fn finite(score: f32) -> f32 {
    if score.is_finite() {
        score
    } else {
        0.0
    }
}
