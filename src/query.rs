//! Query processing: expansion, keyword terms and embeddings.
//!
//! Expansion is a fixed function of the query text and the thesaurus, so
//! the same query always expands the same way.

use std::collections::{BTreeMap, HashSet};

use once_cell::sync::Lazy;

use crate::extract::{normalize, TextEncoder};
use crate::index::{tokenize, WeightedTerm};

/// Weight of terms typed by the user.
const ORIGINAL_TERM_WEIGHT: f32 = 1.0;

/// Source of related terms for query expansion.
pub trait SynonymLookup: Send + Sync {
    /// Related terms for a lowercase term, most relevant first.
    fn synonyms(&self, term: &str) -> Vec<String>;
}

static BUILTIN_SYNONYMS: Lazy<BTreeMap<&'static str, &'static [&'static str]>> = Lazy::new(|| {
    let entries: &[(&str, &[&str])] = &[
        // People
        ("person", &["individual", "human"]),
        ("woman", &["lady", "female"]),
        ("man", &["guy", "male"]),
        ("girl", &["woman", "lady"]),
        ("boy", &["man", "guy"]),
        ("lady", &["woman", "female"]),
        ("guy", &["man", "male"]),
        ("dancer", &["performer", "dancing"]),
        ("performer", &["dancer", "artist"]),
        ("child", &["kid", "boy", "girl"]),
        ("kid", &["child"]),
        // Clothing
        ("clothing", &["outfit", "clothes"]),
        ("outfit", &["clothing", "clothes"]),
        ("dress", &["gown", "frock"]),
        ("shirt", &["top", "blouse"]),
        ("top", &["shirt", "blouse"]),
        ("blouse", &["shirt", "top"]),
        ("skirt", &["dress"]),
        ("pants", &["trousers", "jeans"]),
        ("trousers", &["pants"]),
        ("jeans", &["denim", "pants"]),
        ("jacket", &["coat", "hoodie"]),
        ("coat", &["jacket"]),
        ("hoodie", &["sweatshirt", "jacket"]),
        ("sweater", &["jumper", "pullover"]),
        ("bikini", &["swimwear", "swimsuit"]),
        ("swimsuit", &["swimwear", "bikini"]),
        ("lingerie", &["underwear"]),
        ("leggings", &["tights"]),
        // Colors
        ("red", &["crimson", "scarlet"]),
        ("blue", &["navy", "azure"]),
        ("green", &["emerald"]),
        ("black", &["dark"]),
        ("white", &["light"]),
        ("gray", &["grey", "silver"]),
        ("grey", &["gray", "silver"]),
        ("pink", &["rose"]),
        ("purple", &["violet"]),
        ("yellow", &["golden"]),
        ("gold", &["golden", "yellow"]),
        ("brown", &["tan"]),
        ("maroon", &["burgundy", "red"]),
        // Actions
        ("dancing", &["dance", "moving"]),
        ("dance", &["dancing", "choreography"]),
        ("posing", &["pose", "modeling"]),
        ("standing", &["stand", "upright"]),
        ("sitting", &["seated", "sit"]),
        ("walking", &["walk", "strolling"]),
        ("running", &["run", "jogging"]),
        ("jumping", &["jump", "leaping"]),
        ("spinning", &["twirling", "turning"]),
        ("twirling", &["spinning", "turning"]),
        ("singing", &["song", "vocal"]),
        ("talking", &["speaking", "chatting"]),
        // Places
        ("room", &["bedroom", "indoor"]),
        ("bedroom", &["room", "bed"]),
        ("kitchen", &["cooking", "indoor"]),
        ("studio", &["indoor", "set"]),
        ("stage", &["concert", "performance"]),
        ("outdoors", &["outside", "outdoor"]),
        ("outside", &["outdoors", "outdoor"]),
        ("beach", &["sea", "shore"]),
        ("street", &["road", "city"]),
        ("home", &["house", "indoor"]),
        ("mirror", &["reflection"]),
        // Style
        ("casual", &["relaxed", "everyday"]),
        ("formal", &["elegant", "dressy"]),
        ("elegant", &["formal", "chic"]),
        ("sporty", &["athletic", "sport"]),
        ("vintage", &["retro", "classic"]),
        ("modern", &["contemporary"]),
        ("cute", &["pretty", "adorable"]),
        ("pretty", &["cute", "beautiful"]),
    ];
    entries.iter().copied().collect()
});

/// Fixed synonym table: the built-in entries, optionally overridden per
/// term from configuration.
#[derive(Debug, Clone, Default)]
pub struct Thesaurus {
    overrides: BTreeMap<String, Vec<String>>,
}

impl Thesaurus {
    pub fn builtin() -> Self {
        Self::default()
    }

    /// Entries in `extra` replace the built-in entry for the same term.
    pub fn with_overrides(extra: &BTreeMap<String, Vec<String>>) -> Self {
        Self {
            overrides: extra
                .iter()
                .map(|(term, synonyms)| {
                    let synonyms = synonyms.iter().map(|s| s.trim().to_lowercase()).collect();
                    (term.trim().to_lowercase(), synonyms)
                })
                .collect(),
        }
    }
}

impl SynonymLookup for Thesaurus {
    fn synonyms(&self, term: &str) -> Vec<String> {
        if let Some(synonyms) = self.overrides.get(term) {
            return synonyms.clone();
        }
        BUILTIN_SYNONYMS
            .get(term)
            .map(|s| s.iter().map(|s| s.to_string()).collect())
            .unwrap_or_default()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExpansionSettings {
    pub max_synonyms_per_term: usize,
    pub synonym_weight: f32,
}

impl Default for ExpansionSettings {
    fn default() -> Self {
        Self {
            max_synonyms_per_term: 2,
            synonym_weight: 0.5,
        }
    }
}

/// Everything the search needs from a query. Embedding lists hold the
/// original query's vector, then the expanded query's when expansion added
/// anything. An empty list means that modality is unavailable.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessedQuery {
    pub original: String,
    pub expanded: String,
    pub terms: Vec<WeightedTerm>,
    pub visual_embeddings: Vec<Vec<f32>>,
    pub text_embeddings: Vec<Vec<f32>>,
}

impl ProcessedQuery {
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty() && self.visual_embeddings.is_empty() && self.text_embeddings.is_empty()
    }
}

pub struct QueryProcessor {
    synonyms: Box<dyn SynonymLookup>,
    text: Box<dyn TextEncoder>,
    /// Text tower of the joint visual-text model
    joint: Option<Box<dyn TextEncoder>>,
    settings: ExpansionSettings,
}

impl QueryProcessor {
    pub fn new(
        synonyms: Box<dyn SynonymLookup>,
        text: Box<dyn TextEncoder>,
        joint: Option<Box<dyn TextEncoder>>,
        settings: ExpansionSettings,
    ) -> Self {
        Self {
            synonyms,
            text,
            joint,
            settings,
        }
    }

    /// Expand the query into weighted terms plus the expanded query text.
    pub fn expand(&self, query: &str) -> (Vec<WeightedTerm>, String) {
        let original = tokenize(query);
        let mut seen: HashSet<String> = original.iter().cloned().collect();

        let mut terms: Vec<WeightedTerm> = Vec::new();
        let mut added_words: Vec<String> = Vec::new();
        let mut unique_original: HashSet<&str> = HashSet::new();
        for term in &original {
            if unique_original.insert(term.as_str()) {
                terms.push(WeightedTerm::new(term.clone(), ORIGINAL_TERM_WEIGHT));
            }
        }

        for term in &original {
            let synonyms = self.synonyms.synonyms(term);
            let mut used = 0;
            for synonym in synonyms {
                if used >= self.settings.max_synonyms_per_term {
                    break;
                }
                let tokens = tokenize(&synonym);
                let fresh: Vec<String> = tokens.into_iter().filter(|t| !seen.contains(t)).collect();
                if fresh.is_empty() {
                    continue;
                }
                used += 1;
                for token in fresh {
                    seen.insert(token.clone());
                    terms.push(WeightedTerm::new(token.clone(), self.settings.synonym_weight));
                    added_words.push(token);
                }
            }
        }

        let expanded = if added_words.is_empty() {
            query.trim().to_string()
        } else {
            format!("{} {}", query.trim(), added_words.join(" "))
        };

        (terms, expanded)
    }

    /// Build all query representations. A failing encoder leaves its
    /// modality empty instead of failing the query.
    pub fn process(&self, query: &str) -> ProcessedQuery {
        let original = query.trim().to_string();
        if original.is_empty() {
            return ProcessedQuery::default();
        }

        let (terms, expanded) = self.expand(&original);

        let mut texts = vec![original.clone()];
        if expanded != original {
            texts.push(expanded.clone());
        }

        let text_embeddings = embed_all(self.text.as_ref(), &texts, "text");
        let visual_embeddings = match &self.joint {
            Some(joint) => embed_all(joint.as_ref(), &texts, "visual"),
            None => Vec::new(),
        };

        log::debug!("query '{}' expanded to '{}' ({} terms)", original, expanded, terms.len());

        ProcessedQuery {
            original,
            expanded,
            terms,
            visual_embeddings,
            text_embeddings,
        }
    }
}

fn embed_all(encoder: &dyn TextEncoder, texts: &[String], modality: &str) -> Vec<Vec<f32>> {
    match encoder.embed_texts(texts) {
        Ok(vectors) => vectors.into_iter().filter_map(normalize).collect(),
        Err(e) => {
            log::warn!("{modality} query embedding failed, modality disabled: {e}");
            Vec::new()
        }
    }
}
