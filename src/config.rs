use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::builder::MAX_WORKERS;
use crate::fusion::FusionWeights;
use crate::models::{DEFAULT_TEXT_MODEL, DEFAULT_VISUAL_MODEL};
use crate::query::ExpansionSettings;
use crate::search::CandidatePool;

pub const CONFIG_FILE: &str = "config.yaml";

const DEFAULT_WORKERS: usize = 2;
const DEFAULT_MAX_FRAMES: usize = 60;
const DEFAULT_BATCH_SIZE: usize = 16;
const DEFAULT_FRAME_BATCH_SIZE: usize = 8;
/// Longest frame edge handed to the encoders, in pixels
const DEFAULT_FRAME_EDGE: u32 = 448;

pub fn default_video_extensions() -> Vec<String> {
    ["mp4", "mov", "mkv", "avi", "webm", "wmv", "flv", "m4v", "3gp", "ogv"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_skip_dirs() -> Vec<String> {
    vec!["raw".to_string()]
}

fn default_workers() -> usize {
    DEFAULT_WORKERS
}

fn default_max_frames() -> usize {
    DEFAULT_MAX_FRAMES
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_frame_batch_size() -> usize {
    DEFAULT_FRAME_BATCH_SIZE
}

fn default_frame_edge() -> u32 {
    DEFAULT_FRAME_EDGE
}

/// Encoder selection
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelsConfig {
    /// Image model; its text tower embeds queries for the visual modality
    #[serde(default = "default_visual_model")]
    pub visual: String,

    /// Sentence model for captions and the text modality
    #[serde(default = "default_text_model")]
    pub text: String,

    /// Where models are downloaded, `~/.local/share/vidseek/models` if unset
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,

    /// Extra phrases the captioner may use, e.g. "a red car"
    #[serde(default)]
    pub caption_labels: Vec<String>,
}

impl Default for ModelsConfig {
    fn default() -> Self {
        Self {
            visual: default_visual_model(),
            text: default_text_model(),
            cache_dir: None,
            caption_labels: Vec::new(),
        }
    }
}

fn default_visual_model() -> String {
    DEFAULT_VISUAL_MODEL.to_string()
}

fn default_text_model() -> String {
    DEFAULT_TEXT_MODEL.to_string()
}

/// Query expansion
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExpansionConfig {
    #[serde(default = "default_max_synonyms")]
    pub max_synonyms_per_term: usize,

    /// Keyword weight of a synonym relative to a typed term
    #[serde(default = "default_synonym_weight")]
    pub synonym_weight: f32,

    /// Replaces the built-in synonyms of the listed terms
    #[serde(default)]
    pub synonyms: BTreeMap<String, Vec<String>>,
}

impl Default for ExpansionConfig {
    fn default() -> Self {
        Self {
            max_synonyms_per_term: default_max_synonyms(),
            synonym_weight: default_synonym_weight(),
            synonyms: BTreeMap::new(),
        }
    }
}

impl ExpansionConfig {
    pub fn settings(&self) -> ExpansionSettings {
        ExpansionSettings {
            max_synonyms_per_term: self.max_synonyms_per_term,
            synonym_weight: self.synonym_weight,
        }
    }
}

fn default_max_synonyms() -> usize {
    ExpansionSettings::default().max_synonyms_per_term
}

fn default_synonym_weight() -> f32 {
    ExpansionSettings::default().synonym_weight
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Parallel preprocessing workers, at most 3
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_max_frames")]
    pub max_frames: usize,
    /// Videos merged between two index writes
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Frames per encoder call
    #[serde(default = "default_frame_batch_size")]
    pub frame_batch_size: usize,
    #[serde(default = "default_frame_edge")]
    pub frame_edge: u32,
    #[serde(default = "default_video_extensions")]
    pub video_extensions: Vec<String>,
    #[serde(default = "default_skip_dirs")]
    pub skip_dirs: Vec<String>,
    #[serde(default)]
    pub weights: FusionWeights,
    #[serde(default)]
    pub candidate_pool: CandidatePool,
    #[serde(default)]
    pub expansion: ExpansionConfig,
    #[serde(default)]
    pub models: ModelsConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            max_frames: DEFAULT_MAX_FRAMES,
            batch_size: DEFAULT_BATCH_SIZE,
            frame_batch_size: DEFAULT_FRAME_BATCH_SIZE,
            frame_edge: DEFAULT_FRAME_EDGE,
            video_extensions: default_video_extensions(),
            skip_dirs: default_skip_dirs(),
            weights: FusionWeights::default(),
            candidate_pool: CandidatePool::default(),
            expansion: ExpansionConfig::default(),
            models: ModelsConfig::default(),
            base_path: PathBuf::new(),
        }
    }
}

impl Config {
    fn validate(&mut self) -> anyhow::Result<()> {
        if self.workers == 0 || self.workers > MAX_WORKERS {
            let clamped = self.workers.clamp(1, MAX_WORKERS);
            log::warn!("workers must be between 1 and {MAX_WORKERS}, using {clamped}");
            self.workers = clamped;
        }

        if self.max_frames == 0 {
            bail!("max_frames must be greater than 0");
        }
        if self.batch_size == 0 {
            bail!("batch_size must be greater than 0");
        }
        if self.frame_batch_size == 0 {
            bail!("frame_batch_size must be greater than 0");
        }
        if self.video_extensions.is_empty() {
            bail!("video_extensions must not be empty");
        }

        let w = &self.weights;
        for (name, value) in [("clip", w.clip), ("text", w.text), ("tfidf", w.tfidf)] {
            if !value.is_finite() || value < 0.0 {
                bail!("weights.{name} must be a non-negative number, got {value}");
            }
        }

        if self.candidate_pool.multiplier == 0 || self.candidate_pool.max == 0 {
            bail!("candidate_pool.multiplier and candidate_pool.max must be greater than 0");
        }

        if !(0.0..=1.0).contains(&self.expansion.synonym_weight) {
            bail!(
                "expansion.synonym_weight must be between 0.0 and 1.0, got {}",
                self.expansion.synonym_weight
            );
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults when
    /// missing and rewriting it when new fields were added.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(base_path)
            .with_context(|| format!("failed to create {}", base_path.display()))?;
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            let defaults = serde_yml::to_string(&Self::default())?;
            std::fs::write(&path, defaults)
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("{} is malformed", path.display()))?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    /// Read-only variant for commands that must not touch the directory.
    pub fn load_existing(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(CONFIG_FILE);
        let mut config: Self = if path.exists() {
            let config_str = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            serde_yml::from_str(&config_str).with_context(|| format!("{} is malformed", path.display()))?
        } else {
            Self::default()
        };

        config.base_path = base_path.to_path_buf();
        config.validate()?;
        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        let path = self.base_path.join(CONFIG_FILE);
        std::fs::write(&path, config_str).with_context(|| format!("failed to write {}", path.display()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_creates_default_file() {
        let tmp = tempfile::tempdir().unwrap();

        let config = Config::load_with(tmp.path()).unwrap();

        assert!(tmp.path().join(CONFIG_FILE).exists());
        assert_eq!(config.workers, 2);
        assert_eq!(config.max_frames, 60);
        assert_eq!(config.weights, FusionWeights::default());
        assert_eq!(config.skip_dirs, vec!["raw"]);
    }

    #[test]
    fn test_partial_file_gets_defaults_and_is_upgraded() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(CONFIG_FILE);
        std::fs::write(&path, "max_frames: 24\nweights:\n  clip: 1.0\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();

        assert_eq!(config.max_frames, 24);
        assert_eq!(config.weights.clip, 1.0);
        assert_eq!(config.weights.tfidf, 0.3);
        assert_eq!(config.batch_size, 16);

        let rewritten = std::fs::read_to_string(&path).unwrap();
        assert!(rewritten.contains("batch_size"));
    }

    #[test]
    fn test_workers_clamped() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "workers: 12\n").unwrap();

        let config = Config::load_with(tmp.path()).unwrap();
        assert_eq!(config.workers, 3);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "max_frames: 0\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());

        std::fs::write(tmp.path().join(CONFIG_FILE), "weights:\n  text: -1.0\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());

        std::fs::write(tmp.path().join(CONFIG_FILE), "expansion:\n  synonym_weight: 2.0\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());
    }

    #[test]
    fn test_load_existing_does_not_create_file() {
        let tmp = tempfile::tempdir().unwrap();
        let config = Config::load_existing(tmp.path()).unwrap();
        assert_eq!(config, Config {
            base_path: tmp.path().to_path_buf(),
            ..Config::default()
        });
        assert!(!tmp.path().join(CONFIG_FILE).exists());
    }

    #[test]
    fn test_malformed_file_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(CONFIG_FILE), "workers: [nope\n").unwrap();
        assert!(Config::load_with(tmp.path()).is_err());
    }
}
