//! Arena-backed vector index with cosine similarity search.
//!
//! Vectors live in one contiguous `Vec<f32>`, row `i` belonging to `ids[i]`.
//! Removal swaps the last row into the hole, so rows stay dense.

use std::collections::HashMap;

use super::{rank, IndexError, ScoredVideo, VideoId};

/// In-memory vector index keyed by video id.
///
/// An empty index has no dimensionality; it adopts the length of the first
/// vector inserted into it.
#[derive(Debug, Clone, Default)]
pub struct VectorIndex {
    dimensions: usize,
    ids: Vec<VideoId>,
    data: Vec<f32>,
    positions: HashMap<VideoId, usize>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an index with pre-allocated capacity.
    pub fn with_capacity(dimensions: usize, capacity: usize) -> Self {
        Self {
            dimensions,
            ids: Vec::with_capacity(capacity),
            data: Vec::with_capacity(dimensions * capacity),
            positions: HashMap::with_capacity(capacity),
        }
    }

    /// Dimensionality of stored vectors, 0 when empty.
    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn contains(&self, id: VideoId) -> bool {
        self.positions.contains_key(&id)
    }

    pub fn get(&self, id: VideoId) -> Option<&[f32]> {
        let row = *self.positions.get(&id)?;
        Some(self.row(row))
    }

    pub fn ids(&self) -> impl Iterator<Item = VideoId> + '_ {
        self.ids.iter().copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (VideoId, &[f32])> {
        self.ids
            .iter()
            .enumerate()
            .map(move |(row, id)| (*id, self.row(row)))
    }

    /// Check that `embedding` could be stored under `id` without changing
    /// anything.
    pub fn validate(&self, id: VideoId, embedding: &[f32]) -> Result<(), IndexError> {
        let replaces_only_entry = self.len() == 1 && self.contains(id);
        if !self.is_empty() && !replaces_only_entry && embedding.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: embedding.len(),
            });
        }

        if embedding.is_empty() || l2_norm(embedding) < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        Ok(())
    }

    /// Insert a vector, replacing any previous vector for the same id.
    pub fn insert(&mut self, id: VideoId, embedding: &[f32]) -> Result<(), IndexError> {
        self.validate(id, embedding)?;

        if self.len() == 1 && self.contains(id) && embedding.len() != self.dimensions {
            self.clear();
        }

        if self.is_empty() {
            self.dimensions = embedding.len();
        }

        match self.positions.get(&id) {
            Some(&row) => {
                let start = row * self.dimensions;
                self.data[start..start + self.dimensions].copy_from_slice(embedding);
            }
            None => {
                self.positions.insert(id, self.ids.len());
                self.ids.push(id);
                self.data.extend_from_slice(embedding);
            }
        }

        Ok(())
    }

    /// Remove the vector for `id`. Returns false when it was not present.
    pub fn remove(&mut self, id: VideoId) -> bool {
        let Some(row) = self.positions.remove(&id) else {
            return false;
        };

        let last = self.ids.len() - 1;
        if row != last {
            let moved = self.ids[last];
            let (dst, src) = (row * self.dimensions, last * self.dimensions);
            self.data.copy_within(src..src + self.dimensions, dst);
            self.ids[row] = moved;
            self.positions.insert(moved, row);
        }

        self.ids.pop();
        self.data.truncate(last * self.dimensions);

        if self.ids.is_empty() {
            self.dimensions = 0;
        }

        true
    }

    /// Cosine similarity search. Returns at most `k` results ordered by
    /// descending score, ties broken by ascending id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<ScoredVideo>, IndexError> {
        if self.is_empty() || k == 0 {
            return Ok(Vec::new());
        }

        if query.len() != self.dimensions {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimensions,
                got: query.len(),
            });
        }

        let query_norm = l2_norm(query);
        if query_norm < f32::EPSILON {
            return Err(IndexError::ZeroNormVector);
        }

        let mut results: Vec<ScoredVideo> = self
            .iter()
            .map(|(video_id, target)| ScoredVideo {
                video_id,
                score: cosine_similarity(query, target, query_norm),
            })
            .collect();

        rank(&mut results, k);
        Ok(results)
    }

    pub fn clear(&mut self) {
        self.ids.clear();
        self.data.clear();
        self.positions.clear();
        self.dimensions = 0;
    }

    fn row(&self, row: usize) -> &[f32] {
        let start = row * self.dimensions;
        &self.data[start..start + self.dimensions]
    }
}

pub(crate) fn l2_norm(v: &[f32]) -> f32 {
    v.iter().map(|x| x * x).sum::<f32>().sqrt()
}

/// Assumes `query_norm` is precomputed.
fn cosine_similarity(query: &[f32], target: &[f32], query_norm: f32) -> f32 {
    let target_norm = l2_norm(target);
    if target_norm < f32::EPSILON {
        return 0.0;
    }

    let dot: f32 = query.iter().zip(target.iter()).map(|(a, b)| a * b).sum();
    dot / (query_norm * target_norm)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: u64) -> VideoId {
        VideoId(n)
    }

    #[test]
    fn test_new_index() {
        let index = VectorIndex::new();
        assert_eq!(index.dimensions(), 0);
        assert!(index.is_empty());
    }

    #[test]
    fn test_insert_adopts_dimensions() {
        let mut index = VectorIndex::new();
        index.insert(id(1), &[1.0, 0.0, 0.0]).unwrap();

        assert_eq!(index.dimensions(), 3);
        assert_eq!(index.get(id(1)).unwrap(), &[1.0, 0.0, 0.0]);
    }

    #[test]
    fn test_insert_dimension_mismatch() {
        let mut index = VectorIndex::new();
        index.insert(id(1), &[1.0, 0.0, 0.0]).unwrap();

        let result = index.insert(id(2), &[1.0, 0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::DimensionMismatch { .. })));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_insert_zero_norm_rejected() {
        let mut index = VectorIndex::new();
        let result = index.insert(id(1), &[0.0, 0.0, 0.0]);
        assert!(matches!(result, Err(IndexError::ZeroNormVector)));
    }

    #[test]
    fn test_insert_replaces_in_place() {
        let mut index = VectorIndex::new();
        index.insert(id(1), &[1.0, 0.0]).unwrap();
        index.insert(id(1), &[0.0, 1.0]).unwrap();

        assert_eq!(index.len(), 1);
        assert_eq!(index.get(id(1)).unwrap(), &[0.0, 1.0]);
    }

    #[test]
    fn test_remove_keeps_rows_dense() {
        let mut index = VectorIndex::new();
        index.insert(id(1), &[1.0, 0.0]).unwrap();
        index.insert(id(2), &[0.0, 1.0]).unwrap();
        index.insert(id(3), &[1.0, 1.0]).unwrap();

        assert!(index.remove(id(1)));
        assert!(!index.remove(id(1)));

        assert_eq!(index.len(), 2);
        assert_eq!(index.get(id(2)).unwrap(), &[0.0, 1.0]);
        assert_eq!(index.get(id(3)).unwrap(), &[1.0, 1.0]);
    }

    #[test]
    fn test_remove_last_resets_dimensions() {
        let mut index = VectorIndex::new();
        index.insert(id(1), &[1.0, 0.0]).unwrap();
        index.remove(id(1));
        assert_eq!(index.dimensions(), 0);

        index.insert(id(2), &[1.0, 0.0, 0.0]).unwrap();
        assert_eq!(index.dimensions(), 3);
    }

    #[test]
    fn test_search_basic() {
        let mut index = VectorIndex::new();
        index.insert(id(1), &[1.0, 0.0, 0.0]).unwrap();
        index.insert(id(2), &[0.0, 1.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.1, 0.0], 10).unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].video_id, id(1));
        assert!(results[0].score > results[1].score);
    }

    #[test]
    fn test_search_limit_and_order() {
        let mut index = VectorIndex::new();
        for i in 0..10 {
            index.insert(id(i), &[1.0, i as f32 * 0.1, 0.0]).unwrap();
        }

        let results = index.search(&[1.0, 0.0, 0.0], 3).unwrap();

        assert_eq!(results.len(), 3);
        for pair in results.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_search_ties_ascending_id() {
        let mut index = VectorIndex::new();
        index.insert(id(9), &[1.0, 0.0]).unwrap();
        index.insert(id(4), &[2.0, 0.0]).unwrap();
        index.insert(id(6), &[3.0, 0.0]).unwrap();

        let results = index.search(&[1.0, 0.0], 10).unwrap();
        let ids: Vec<u64> = results.iter().map(|r| r.video_id.0).collect();
        assert_eq!(ids, vec![4, 6, 9]);
    }

    #[test]
    fn test_search_empty_index() {
        let index = VectorIndex::new();
        assert!(index.search(&[1.0, 0.0], 5).unwrap().is_empty());
    }
}
