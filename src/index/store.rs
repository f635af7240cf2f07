//! Aligned visual, text and keyword indices plus the metadata table.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    term_overlap, IndexError, KeywordIndex, ScoredVideo, VectorIndex, VideoId, WeightedTerm,
};

/// Cheap change detector for a video file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fingerprint {
    pub size: u64,
    /// Modification time, nanoseconds since the Unix epoch
    pub modified_ns: i128,
}

impl Fingerprint {
    pub fn of(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        let modified_ns = match meta.modified()?.duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_nanos() as i128,
            Err(e) => -(e.duration().as_nanos() as i128),
        };
        Ok(Self {
            size: meta.len(),
            modified_ns,
        })
    }
}

/// Caption of one sampled frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameCaption {
    /// Seconds from the start of the video
    pub timestamp: f64,
    pub text: String,
}

impl FrameCaption {
    pub fn new(timestamp: f64, text: impl Into<String>) -> Self {
        Self {
            timestamp,
            text: text.into(),
        }
    }
}

/// Metadata table entry for one indexed video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoRecord {
    pub video_id: VideoId,
    pub path: PathBuf,
    pub duration: f64,
    pub frame_count_sampled: usize,
    pub fingerprint: Fingerprint,
    /// One caption per successfully extracted frame, in timestamp order
    pub captions: Vec<FrameCaption>,
    pub indexed_at: DateTime<Utc>,
}

impl VideoRecord {
    /// Text fed to the keyword index.
    pub fn keyword_text(&self) -> String {
        self.captions
            .iter()
            .map(|c| c.text.as_str())
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// The frame caption sharing the most query weight with `terms`, used
    /// as the result snippet. Ties and no overlap at all fall back to the
    /// earliest non-empty caption.
    pub fn best_caption(&self, terms: &[WeightedTerm]) -> Option<&FrameCaption> {
        let mut best: Option<(&FrameCaption, f32)> = None;
        for caption in self.captions.iter().filter(|c| !c.text.trim().is_empty()) {
            let overlap = term_overlap(&caption.text, terms);
            if best.map_or(true, |(_, top)| overlap > top) {
                best = Some((caption, overlap));
            }
        }
        best.map(|(caption, _)| caption)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Modality {
    Visual,
    Text,
    Keyword,
}

/// Query payload for [`IndexStore::search`].
#[derive(Debug, Clone, Copy)]
pub enum ModalityQuery<'a> {
    Vector(&'a [f32]),
    Terms(&'a [WeightedTerm]),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoreStats {
    pub videos: usize,
    pub frames_sampled: usize,
    pub visual_dimensions: usize,
    pub text_dimensions: usize,
    pub vocabulary_size: usize,
    pub generation: u64,
    pub encoder_signature: String,
}

/// The three indices and the metadata table, always holding the same ids.
///
/// Mutated only by the thread that owns it; searches take `&self`.
#[derive(Debug, Clone, Default)]
pub struct IndexStore {
    pub(super) visual: VectorIndex,
    pub(super) text: VectorIndex,
    pub(super) keywords: KeywordIndex,
    pub(super) records: BTreeMap<VideoId, VideoRecord>,
    pub(super) generation: u64,
    pub(super) encoder_signature: String,
}

impl IndexStore {
    pub fn new(encoder_signature: impl Into<String>) -> Self {
        Self {
            encoder_signature: encoder_signature.into(),
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: VideoId) -> bool {
        self.records.contains_key(&id)
    }

    pub fn record(&self, id: VideoId) -> Option<&VideoRecord> {
        self.records.get(&id)
    }

    pub fn records(&self) -> impl Iterator<Item = &VideoRecord> {
        self.records.values()
    }

    pub fn visual_embedding(&self, id: VideoId) -> Option<&[f32]> {
        self.visual.get(id)
    }

    pub fn text_embedding(&self, id: VideoId) -> Option<&[f32]> {
        self.text.get(id)
    }

    /// Generation of the last persisted state this store was loaded from or
    /// saved as.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn encoder_signature(&self) -> &str {
        &self.encoder_signature
    }

    /// Insert or replace a video in every index.
    ///
    /// Both vectors are validated before anything is touched, so a rejected
    /// upsert leaves the store as it was.
    pub fn upsert(
        &mut self,
        record: VideoRecord,
        visual: &[f32],
        text: &[f32],
    ) -> Result<(), IndexError> {
        let id = record.video_id;
        self.visual.validate(id, visual)?;
        self.text.validate(id, text)?;

        self.remove(id);

        self.visual.insert(id, visual)?;
        self.text.insert(id, text)?;
        self.keywords.insert(id, &record.keyword_text());
        self.records.insert(id, record);

        Ok(())
    }

    /// Remove a video from every index. No-op when absent.
    pub fn remove(&mut self, id: VideoId) -> bool {
        let visual = self.visual.remove(id);
        let text = self.text.remove(id);
        let keywords = self.keywords.remove(id);
        let record = self.records.remove(&id).is_some();
        visual || text || keywords || record
    }

    /// Search one modality. A vector query against the keyword index (or
    /// terms against a vector index) is rejected.
    pub fn search(
        &self,
        modality: Modality,
        query: ModalityQuery<'_>,
        k: usize,
    ) -> Result<Vec<ScoredVideo>, IndexError> {
        match (modality, query) {
            (Modality::Visual, ModalityQuery::Vector(v)) => self.visual.search(v, k),
            (Modality::Text, ModalityQuery::Vector(v)) => self.text.search(v, k),
            (Modality::Keyword, ModalityQuery::Terms(terms)) => Ok(self.keywords.search(terms, k)),
            (modality, ModalityQuery::Vector(_)) => Err(IndexError::QueryKind {
                modality,
                query: "a vector",
            }),
            (modality, ModalityQuery::Terms(_)) => Err(IndexError::QueryKind {
                modality,
                query: "terms",
            }),
        }
    }

    /// Describe the first disagreement between the id sets, if any.
    pub fn alignment_error(&self) -> Option<String> {
        let expected: BTreeSet<VideoId> = self.records.keys().copied().collect();

        let sets = [
            ("visual", self.visual.ids().collect::<BTreeSet<_>>()),
            ("text", self.text.ids().collect::<BTreeSet<_>>()),
            ("keyword", self.keywords.ids().collect::<BTreeSet<_>>()),
        ];

        for (name, ids) in sets {
            if ids != expected {
                let stray = ids.symmetric_difference(&expected).next().copied();
                return Some(match stray {
                    Some(id) => format!("{name} index disagrees with metadata on video {id}"),
                    None => format!("{name} index disagrees with metadata"),
                });
            }
        }

        None
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            videos: self.len(),
            frames_sampled: self.records.values().map(|r| r.frame_count_sampled).sum(),
            visual_dimensions: self.visual.dimensions(),
            text_dimensions: self.text.dimensions(),
            vocabulary_size: self.keywords.vocabulary_size(),
            generation: self.generation,
            encoder_signature: self.encoder_signature.clone(),
        }
    }
}
