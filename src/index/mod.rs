//! Index store for video search.
//!
//! Three indices share one id space with the metadata table:
//!
//! - `vector`: arena-backed cosine index, used for visual and caption embeddings
//! - `keyword`: TF-IDF index over caption text
//! - `store`: keeps the indices and metadata aligned on every mutation
//! - `persist`: writes and loads the whole set as one generation

mod keyword;
mod persist;
mod store;
mod vector;

use std::fmt;
use std::path::Path;

use serde::{Deserialize, Serialize};

pub use keyword::{term_overlap, tokenize, KeywordIndex, WeightedTerm};
pub use persist::{IndexStorage, StoreError};
pub use store::{
    FrameCaption, Fingerprint, IndexStore, Modality, ModalityQuery, StoreStats, VideoRecord,
};
pub use vector::VectorIndex;
pub(crate) use vector::l2_norm;

/// Stable identifier of an indexed video, derived from its absolute path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VideoId(pub u64);

impl VideoId {
    /// First eight bytes of the SHA-256 of the path.
    pub fn from_path(path: &Path) -> Self {
        use sha2::{Digest, Sha256};
        let mut hasher = Sha256::new();
        hasher.update(path.to_string_lossy().as_bytes());
        let digest: [u8; 32] = hasher.finalize().into();

        let mut head = [0u8; 8];
        head.copy_from_slice(&digest[..8]);
        Self(u64::from_be_bytes(head))
    }
}

impl fmt::Display for VideoId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// One hit from a single index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoredVideo {
    pub video_id: VideoId,
    pub score: f32,
}

/// Sort by descending score, ties by ascending id, then keep `k`.
pub(crate) fn rank(results: &mut Vec<ScoredVideo>, k: usize) {
    results.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.video_id.cmp(&b.video_id))
    });
    results.truncate(k);
}

/// Errors from index mutation and lookup.
#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("Dimension mismatch: expected {expected}, got {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Cannot store or search with zero-norm vector")]
    ZeroNormVector,

    #[error("{modality:?} index cannot be queried with {query}")]
    QueryKind {
        modality: Modality,
        query: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_id_stable() {
        let a = VideoId::from_path(Path::new("/videos/clip.mp4"));
        let b = VideoId::from_path(Path::new("/videos/clip.mp4"));
        let c = VideoId::from_path(Path::new("/videos/other.mp4"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.to_string().len(), 16);
    }

    #[test]
    fn test_rank_ties_by_id() {
        let mut results = vec![
            ScoredVideo { video_id: VideoId(3), score: 0.5 },
            ScoredVideo { video_id: VideoId(1), score: 0.5 },
            ScoredVideo { video_id: VideoId(2), score: 0.9 },
        ];
        rank(&mut results, 10);
        let ids: Vec<u64> = results.iter().map(|r| r.video_id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }
}
