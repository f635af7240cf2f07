//! Pretrained encoders backed by fastembed.
//!
//! - `ClipImageEncoder`: CLIP image tower, frames -> joint space
//! - `FastembedTextEncoder`: any fastembed text model (CLIP text tower for
//!   the joint space, a sentence model for the caption space)
//! - `ZeroShotCaptioner`: describes a frame by the vocabulary phrases its
//!   CLIP embedding sits closest to
//!
//! Models are downloaded into the cache directory on first use. Every
//! worker builds its own [`EncoderSet`]; nothing here is shared across
//! workers.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use fastembed::{ImageEmbedding, ImageEmbeddingModel, ImageInitOptions, InitOptions, TextEmbedding};
use once_cell::sync::Lazy;

use crate::config::ModelsConfig;
use crate::extract::{normalize, FrameCaptioner, TextEncoder, VisualEncoder};
use crate::video::Frame;

/// Default visual model, shares its space with [`DEFAULT_JOINT_TEXT_MODEL`]
pub const DEFAULT_VISUAL_MODEL: &str = "clip-vit-b-32";

/// Text tower paired with the visual model
pub const DEFAULT_JOINT_TEXT_MODEL: &str = "clip-vit-b-32-text";

/// Default caption-space model
pub const DEFAULT_TEXT_MODEL: &str = "all-MiniLM-L6-v2";

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Embedding generation failed: {0}")]
    EmbeddingFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

/// Words the captioner picks from, one group per aspect of the scene.
static CAPTION_VOCABULARY: Lazy<Vec<(&'static str, Vec<&'static str>)>> = Lazy::new(|| {
    vec![
        (
            "subject",
            vec![
                "a woman", "a man", "a girl", "a boy", "a group of people", "a dancer",
                "a performer", "a child", "an animal", "no people",
            ],
        ),
        (
            "clothing",
            vec![
                "wearing a dress", "wearing a shirt", "wearing a skirt", "wearing jeans",
                "wearing shorts", "wearing a jacket", "wearing a hoodie", "wearing a sweater",
                "wearing a bikini", "wearing a bodysuit", "wearing leggings", "wearing a suit",
            ],
        ),
        (
            "color",
            vec![
                "red", "blue", "green", "black", "white", "pink", "purple", "yellow", "orange",
                "brown", "gray", "gold", "silver",
            ],
        ),
        (
            "action",
            vec![
                "dancing", "posing", "standing", "sitting", "walking", "jumping", "spinning",
                "running", "talking", "singing", "lying down",
            ],
        ),
        (
            "setting",
            vec![
                "in a bedroom", "in a living room", "in a kitchen", "in a studio", "on a stage",
                "outdoors", "on a beach", "on a street", "in front of a mirror", "in a gym",
            ],
        ),
        (
            "style",
            vec![
                "casual", "formal", "sporty", "vintage", "elegant", "modern", "bright lighting",
                "dim lighting",
            ],
        ),
    ]
});

/// Stable digest of the configured models. Stored with the index so a
/// model change can be detected.
pub fn encoder_signature(models: &ModelsConfig) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(models.visual.to_lowercase().as_bytes());
    hasher.update(b"\n");
    hasher.update(models.text.to_lowercase().as_bytes());
    hasher.update(b"\n");
    for label in &models.caption_labels {
        hasher.update(label.as_bytes());
        hasher.update(b"\n");
    }
    let digest: [u8; 32] = hasher.finalize().into();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// Resolve the model cache directory.
pub fn cache_dir(models: &ModelsConfig) -> Result<PathBuf, EmbeddingError> {
    if let Some(dir) = &models.cache_dir {
        return Ok(dir.clone());
    }

    let home = homedir::my_home()
        .map_err(|e| EmbeddingError::InitFailed(format!("Could not determine home directory: {e}")))?
        .ok_or_else(|| EmbeddingError::InitFailed("Home directory path is empty".to_string()))?;

    Ok(home.join(".local/share/vidseek/models"))
}

fn ensure_dir(dir: &PathBuf) -> Result<(), EmbeddingError> {
    std::fs::create_dir_all(dir).map_err(|e| {
        EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
    })
}

/// Parse text model name string to fastembed enum.
fn parse_text_model(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32-text" | "clip-vit-b-32" | "clipvitb32" => {
            Ok(fastembed::EmbeddingModel::ClipVitB32)
        }
        "all-minilm-l6-v2" | "allminiml6v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
        "all-minilm-l6-v2-q" | "allminiml6v2q" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2Q),
        "bge-small-en-v1.5" | "bgesmallenv15" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
        "bge-base-en-v1.5" | "bgebaseenv15" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown text model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, clip-vit-b-32-text",
            name
        ))),
    }
}

/// Parse visual model name. Returns the image model and the text tower that
/// embeds queries into the same space.
fn parse_visual_model(name: &str) -> Result<(ImageEmbeddingModel, &'static str), EmbeddingError> {
    match name.to_lowercase().as_str() {
        "clip-vit-b-32" | "clipvitb32" => {
            Ok((ImageEmbeddingModel::ClipVitB32, DEFAULT_JOINT_TEXT_MODEL))
        }
        _ => Err(EmbeddingError::InvalidModel(format!(
            "Unknown visual model: {}. Supported models: clip-vit-b-32",
            name
        ))),
    }
}

/// CLIP image tower.
pub struct ClipImageEncoder {
    model: Mutex<ImageEmbedding>,
    model_name: String,
}

impl ClipImageEncoder {
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let (model_enum, _) = parse_visual_model(model_name)?;
        ensure_dir(&cache_dir)?;

        let options = ImageInitOptions::new(model_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true);

        let model = ImageEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }
}

impl VisualEncoder for ClipImageEncoder {
    fn embed_frames(&self, frames: &[Frame]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if frames.is_empty() {
            return Ok(vec![]);
        }

        let encoded = frames
            .iter()
            .map(|f| f.to_png())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| EmbeddingError::EmbeddingFailed(format!("Failed to encode frame: {e}")))?;
        let images: Vec<&[u8]> = encoded.iter().map(|b| b.as_slice()).collect();

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed_bytes(&images, None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

impl VisualEncoder for Arc<ClipImageEncoder> {
    fn embed_frames(&self, frames: &[Frame]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        self.as_ref().embed_frames(frames)
    }
}

/// Wrapper around fastembed's TextEmbedding model.
/// Uses a Mutex because fastembed's embed() requires &mut self.
pub struct FastembedTextEncoder {
    model: Mutex<TextEmbedding>,
    model_name: String,
    dimensions: usize,
}

impl FastembedTextEncoder {
    pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
        let model_enum = parse_text_model(model_name)?;
        ensure_dir(&cache_dir)?;

        let options = InitOptions::new(model_enum)
            .with_cache_dir(cache_dir)
            .with_show_download_progress(true);

        let mut model = TextEmbedding::try_new(options)
            .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

        let dimensions = Self::probe_dimensions(&mut model)?;

        Ok(Self {
            model: Mutex::new(model),
            model_name: model_name.to_string(),
            dimensions,
        })
    }

    pub fn name(&self) -> &str {
        &self.model_name
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Probe the model to determine embedding dimensions.
    fn probe_dimensions(model: &mut TextEmbedding) -> Result<usize, EmbeddingError> {
        let test_embeddings = model
            .embed(vec!["test"], None)
            .map_err(|e| EmbeddingError::InitFailed(format!("Failed to probe dimensions: {}", e)))?;

        test_embeddings
            .first()
            .map(|v| v.len())
            .ok_or_else(|| EmbeddingError::InitFailed("Model returned no embedding".to_string()))
    }
}

impl TextEncoder for FastembedTextEncoder {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        if texts.is_empty() {
            return Ok(vec![]);
        }

        let mut model = self.model.lock().map_err(|e| {
            EmbeddingError::EmbeddingFailed(format!("Failed to acquire model lock: {}", e))
        })?;

        model
            .embed(texts.to_vec(), None)
            .map_err(|e| EmbeddingError::EmbeddingFailed(e.to_string()))
    }
}

/// Vocabulary group with the joint-space embedding of every phrase.
struct LabelGroup {
    phrases: Vec<String>,
    embeddings: Vec<Vec<f32>>,
}

/// Captions a frame with the closest phrase of each vocabulary group,
/// e.g. "a woman wearing a dress red dancing in a bedroom casual".
///
/// Works on CLIP image embeddings. During extraction it reuses the ones
/// computed for the visual vector; `image` only serves frames captioned on
/// their own.
pub struct ZeroShotCaptioner {
    image: Arc<ClipImageEncoder>,
    groups: Vec<LabelGroup>,
}

impl ZeroShotCaptioner {
    /// Embed the vocabulary (plus `extra_labels` as one more group) with the
    /// joint-space text encoder.
    pub fn new(
        image: Arc<ClipImageEncoder>,
        joint_text: &dyn TextEncoder,
        extra_labels: &[String],
    ) -> Result<Self, EmbeddingError> {
        let mut raw: Vec<Vec<String>> = CAPTION_VOCABULARY
            .iter()
            .map(|(_, phrases)| phrases.iter().map(|p| p.to_string()).collect())
            .collect();
        if !extra_labels.is_empty() {
            raw.push(extra_labels.to_vec());
        }

        let mut groups = Vec::with_capacity(raw.len());
        for phrases in raw {
            let prompts: Vec<String> = phrases.iter().map(|p| format!("a photo of {p}")).collect();
            let embeddings = joint_text
                .embed_texts(&prompts)?
                .into_iter()
                .map(|v| {
                    normalize(v).ok_or_else(|| {
                        EmbeddingError::InitFailed("label embedding has zero norm".to_string())
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            groups.push(LabelGroup { phrases, embeddings });
        }

        Ok(Self { image, groups })
    }

    fn describe(&self, embedding: &[f32]) -> String {
        let Some(frame) = normalize(embedding.to_vec()) else {
            return String::new();
        };

        self.groups
            .iter()
            .filter_map(|group| {
                group
                    .embeddings
                    .iter()
                    .zip(&group.phrases)
                    .map(|(label, phrase)| {
                        let score: f32 = label.iter().zip(&frame).map(|(a, b)| a * b).sum();
                        (score, phrase)
                    })
                    .max_by(|a, b| a.0.total_cmp(&b.0))
                    .map(|(_, phrase)| phrase.as_str())
            })
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl FrameCaptioner for ZeroShotCaptioner {
    fn caption_frames(&self, frames: &[Frame]) -> Result<Vec<String>, EmbeddingError> {
        let embeddings = self.image.embed_frames(frames)?;
        Ok(embeddings.iter().map(|e| self.describe(e)).collect())
    }

    fn caption_embedded(
        &self,
        _frames: &[Frame],
        embeddings: &[&[f32]],
    ) -> Result<Vec<String>, EmbeddingError> {
        Ok(embeddings.iter().map(|e| self.describe(e)).collect())
    }
}

/// One worker's encoders.
pub struct EncoderSet {
    pub visual: Arc<ClipImageEncoder>,
    pub captioner: ZeroShotCaptioner,
    pub text: FastembedTextEncoder,
}

impl EncoderSet {
    pub fn load(models: &ModelsConfig) -> Result<Self, EmbeddingError> {
        let dir = cache_dir(models)?;
        let (_, joint_text_name) = parse_visual_model(&models.visual)?;

        let visual = Arc::new(ClipImageEncoder::new(&models.visual, dir.clone())?);
        let joint_text = FastembedTextEncoder::new(joint_text_name, dir.clone())?;
        let captioner = ZeroShotCaptioner::new(visual.clone(), &joint_text, &models.caption_labels)?;
        let text = FastembedTextEncoder::new(&models.text, dir)?;

        log::debug!(
            "loaded encoders: visual={} captions={} text={} ({} dims)",
            visual.name(),
            joint_text.name(),
            text.name(),
            text.dimensions()
        );

        Ok(Self {
            visual,
            captioner,
            text,
        })
    }
}

/// Query-side encoders: the joint-space text tower and the caption-space
/// sentence model.
pub struct QueryEncoders {
    pub joint: FastembedTextEncoder,
    pub text: FastembedTextEncoder,
}

impl QueryEncoders {
    pub fn load(models: &ModelsConfig) -> Result<Self, EmbeddingError> {
        let dir = cache_dir(models)?;
        let (_, joint_text_name) = parse_visual_model(&models.visual)?;

        Ok(Self {
            joint: FastembedTextEncoder::new(joint_text_name, dir.clone())?,
            text: FastembedTextEncoder::new(&models.text, dir)?,
        })
    }
}
