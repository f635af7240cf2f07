//! TF-IDF keyword index over caption text.
//!
//! Documents are weighted with sublinear term frequency and smoothed inverse
//! document frequency, then compared to the query by cosine similarity.
//! IDF depends on the whole collection, so weights are computed at query
//! time rather than stored.
//!
//! Terms are reduced to a common stem before they reach the index, on both
//! the document and the query side, so "dancing dogs" matches "dance dog".

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use super::{rank, ScoredVideo, VideoId};

const STOP_WORDS: &[&str] = &[
    "a", "an", "the", "is", "are", "was", "were", "be", "been", "being", "in", "on", "at", "to",
    "for", "of", "with", "by", "from", "as", "and", "or", "but", "not", "no", "so", "if", "then",
    "this", "that", "it", "its", "there", "their", "his", "her", "he", "she", "they", "them",
    "what", "which", "who", "into", "up", "down", "over", "some", "very",
];

/// Tokenize text into lowercase terms.
/// Filters out single characters and common stop words.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .map(|s| s.to_lowercase())
        .filter(|s| s.chars().count() > 1 && !STOP_WORDS.contains(&s.as_str()))
        .collect()
}

/// Strip inflection from a lowercase word: plurals, then `-ing`/`-ed`,
/// then a trailing silent `e`. Crude, but applied to documents and queries
/// alike, so only agreement matters.
pub fn stem(word: &str) -> String {
    if word.len() <= 3 || !word.bytes().all(|b| b.is_ascii_lowercase()) {
        return word.to_string();
    }

    let mut w = strip_plural(word);

    let mut stripped = false;
    for suffix in ["ing", "ed"] {
        if suffix == "ed" && w.ends_with("eed") {
            continue;
        }
        let Some(stem) = w.strip_suffix(suffix) else {
            continue;
        };
        let keep = stem.len();
        if keep >= 3 && stem.bytes().any(is_vowel) {
            w.truncate(keep);
            stripped = true;
            break;
        }
    }

    if stripped {
        let b = w.as_bytes();
        let n = b.len();
        if n >= 2 && b[n - 1] == b[n - 2] && !is_vowel(b[n - 1]) && !b"lsz".contains(&b[n - 1]) {
            w.pop();
        }
    }

    if w.len() > 3 && w.ends_with('e') && !w.ends_with("ee") {
        w.pop();
    }

    w
}

fn strip_plural(word: &str) -> String {
    if let Some(stem) = word.strip_suffix("ies") {
        if stem.len() >= 2 {
            return format!("{stem}y");
        }
    }
    for suffix in ["sses", "shes", "ches", "xes", "zes"] {
        if word.ends_with(suffix) {
            return word[..word.len() - 2].to_string();
        }
    }
    if word.ends_with('s') && !word.ends_with("ss") && !word.ends_with("us") && !word.ends_with("is") {
        return word[..word.len() - 1].to_string();
    }
    word.to_string()
}

fn is_vowel(b: u8) -> bool {
    b"aeiouy".contains(&b)
}

/// Stemmed index terms of `text`.
fn index_terms(text: &str) -> impl Iterator<Item = String> {
    tokenize(text).into_iter().map(|t| stem(&t))
}

/// Stemmed query terms, a repeated stem keeping its strongest weight.
/// Ordered so scores are reproducible.
fn query_weights(terms: &[WeightedTerm]) -> BTreeMap<String, f32> {
    let mut query: BTreeMap<String, f32> = BTreeMap::new();
    for t in terms.iter().filter(|t| t.weight > 0.0) {
        for term in index_terms(&t.term) {
            let entry = query.entry(term).or_insert(0.0);
            *entry = entry.max(t.weight);
        }
    }
    query
}

/// Summed weight of the query terms that occur in `text`.
pub fn term_overlap(text: &str, terms: &[WeightedTerm]) -> f32 {
    let words: BTreeSet<String> = index_terms(text).collect();
    query_weights(terms)
        .into_iter()
        .filter(|(term, _)| words.contains(term))
        .map(|(_, weight)| weight)
        .sum()
}

/// A query term and how much it counts.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightedTerm {
    pub term: String,
    pub weight: f32,
}

impl WeightedTerm {
    pub fn new(term: impl Into<String>, weight: f32) -> Self {
        Self {
            term: term.into(),
            weight,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct KeywordDoc {
    term_freq: BTreeMap<String, u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KeywordIndex {
    docs: BTreeMap<VideoId, KeywordDoc>,
    doc_freq: BTreeMap<String, u32>,
}

impl KeywordIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.docs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.docs.is_empty()
    }

    pub fn contains(&self, id: VideoId) -> bool {
        self.docs.contains_key(&id)
    }

    pub fn ids(&self) -> impl Iterator<Item = VideoId> + '_ {
        self.docs.keys().copied()
    }

    pub fn vocabulary_size(&self) -> usize {
        self.doc_freq.len()
    }

    /// Index `text` under `id`, replacing any previous document.
    pub fn insert(&mut self, id: VideoId, text: &str) {
        self.remove(id);

        let mut term_freq = BTreeMap::new();
        for term in index_terms(text) {
            *term_freq.entry(term).or_insert(0u32) += 1;
        }

        for term in term_freq.keys() {
            *self.doc_freq.entry(term.clone()).or_insert(0) += 1;
        }

        self.docs.insert(id, KeywordDoc { term_freq });
    }

    /// Returns false when `id` was not indexed.
    pub fn remove(&mut self, id: VideoId) -> bool {
        let Some(doc) = self.docs.remove(&id) else {
            return false;
        };

        for term in doc.term_freq.keys() {
            if let Some(df) = self.doc_freq.get_mut(term) {
                *df -= 1;
                if *df == 0 {
                    self.doc_freq.remove(term);
                }
            }
        }

        true
    }

    /// Describe the first term whose stored document frequency disagrees
    /// with the documents, if any.
    pub fn frequency_error(&self) -> Option<String> {
        let mut counted: BTreeMap<&str, u32> = BTreeMap::new();
        for doc in self.docs.values() {
            for term in doc.term_freq.keys() {
                *counted.entry(term.as_str()).or_insert(0) += 1;
            }
        }

        let stored = self.doc_freq.iter().map(|(t, df)| (t.as_str(), *df));
        if counted.iter().map(|(t, df)| (*t, *df)).eq(stored) {
            return None;
        }

        let bad = self
            .doc_freq
            .iter()
            .find(|(term, df)| counted.get(term.as_str()) != Some(*df))
            .map(|(term, _)| term.as_str())
            .or_else(|| {
                counted
                    .keys()
                    .find(|term| !self.doc_freq.contains_key(**term))
                    .copied()
            })
            .unwrap_or("?");
        Some(format!("keyword document frequency for '{bad}' disagrees with documents"))
    }

    fn idf(&self, term: &str) -> f32 {
        let n = self.docs.len() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        ((1.0 + n) / (1.0 + df)).ln() + 1.0
    }

    /// Score documents against weighted query terms. Only documents sharing
    /// at least one term are returned; at most `k`, best first, ties by
    /// ascending id.
    pub fn search(&self, terms: &[WeightedTerm], k: usize) -> Vec<ScoredVideo> {
        if self.docs.is_empty() || k == 0 {
            return Vec::new();
        }

        let query: Vec<(String, f32)> = query_weights(terms)
            .into_iter()
            .filter(|(term, _)| self.doc_freq.contains_key(term))
            .map(|(term, weight)| {
                let idf = self.idf(&term);
                (term, weight * idf)
            })
            .collect();

        if query.is_empty() {
            return Vec::new();
        }

        let query_norm = query.iter().map(|(_, w)| w * w).sum::<f32>().sqrt();

        let mut results: Vec<ScoredVideo> = self
            .docs
            .iter()
            .filter_map(|(id, doc)| {
                let dot: f32 = query
                    .iter()
                    .filter_map(|(term, qw)| {
                        doc.term_freq
                            .get(term)
                            .map(|tf| qw * sublinear_tf(*tf) * self.idf(term))
                    })
                    .sum();

                if dot <= 0.0 {
                    return None;
                }

                let doc_norm = doc
                    .term_freq
                    .iter()
                    .map(|(term, tf)| {
                        let w = sublinear_tf(*tf) * self.idf(term);
                        w * w
                    })
                    .sum::<f32>()
                    .sqrt();

                Some(ScoredVideo {
                    video_id: *id,
                    score: dot / (query_norm * doc_norm),
                })
            })
            .collect();

        rank(&mut results, k);
        results
    }
}

fn sublinear_tf(tf: u32) -> f32 {
    1.0 + (tf as f32).ln()
}
