//! Feature extraction: frames in, one visual vector, one text vector and the
//! captions out.
//!
//! Frames go through the encoders in fixed-size batches. When a batch call
//! fails, its frames are retried one at a time and only the frames that
//! still fail are dropped. A video fails only when no frame survives.
//!
//! Captioners see each frame together with its visual embedding, so a
//! captioner working in the visual space never encodes a frame twice.

use crate::index::{l2_norm, FrameCaption};
use crate::models::EmbeddingError;
use crate::video::Frame;

/// Embeds raster frames into a fixed-dimension space.
pub trait VisualEncoder: Send {
    fn embed_frames(&self, frames: &[Frame]) -> Result<Vec<Vec<f32>>, EmbeddingError>;
}

/// Describes a raster frame in words. Each frame is captioned on its own.
pub trait FrameCaptioner: Send {
    fn caption_frames(&self, frames: &[Frame]) -> Result<Vec<String>, EmbeddingError>;

    /// Caption frames whose visual embeddings are already known. Captioners
    /// that read pixels ignore the embeddings.
    fn caption_embedded(
        &self,
        frames: &[Frame],
        _embeddings: &[&[f32]],
    ) -> Result<Vec<String>, EmbeddingError> {
        self.caption_frames(frames)
    }
}

/// Embeds text into a fixed-dimension space.
pub trait TextEncoder: Send {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError>;

    fn embed_text(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.embed_texts(&[text.to_string()])?
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::EmbeddingFailed("No embedding returned".to_string()))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExtractError {
    #[error("extraction failed: {0}")]
    ExtractionFailed(String),
}

/// Everything the index needs about one video.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoFeatures {
    /// Mean of the per-frame unit vectors, renormalized
    pub visual: Vec<f32>,
    pub text: Vec<f32>,
    /// Caption of every frame that made it into `visual`, in frame order
    pub captions: Vec<FrameCaption>,
    pub frames_used: usize,
}

/// Owns one set of encoders. Not shared between workers.
pub struct FeatureExtractor {
    visual: Box<dyn VisualEncoder>,
    captioner: Box<dyn FrameCaptioner>,
    text: Box<dyn TextEncoder>,
    batch_size: usize,
}

impl FeatureExtractor {
    pub fn new(
        visual: Box<dyn VisualEncoder>,
        captioner: Box<dyn FrameCaptioner>,
        text: Box<dyn TextEncoder>,
        batch_size: usize,
    ) -> Self {
        Self {
            visual,
            captioner,
            text,
            batch_size: batch_size.max(1),
        }
    }

    pub fn extract(&self, frames: &[Frame]) -> Result<VideoFeatures, ExtractError> {
        if frames.is_empty() {
            return Err(ExtractError::ExtractionFailed("no frames to extract".to_string()));
        }

        let mut embeddings: Vec<Vec<f32>> = Vec::with_capacity(frames.len());
        let mut captions: Vec<FrameCaption> = Vec::with_capacity(frames.len());
        let mut dropped = 0usize;

        for batch in frames.chunks(self.batch_size) {
            for (frame, outcome) in batch.iter().zip(self.extract_batch(batch)) {
                match outcome {
                    Some((embedding, caption)) => {
                        if let Some(first) = embeddings.first() {
                            if first.len() != embedding.len() {
                                log::warn!(
                                    "visual encoder changed dimensionality mid-video ({} -> {})",
                                    first.len(),
                                    embedding.len()
                                );
                                dropped += 1;
                                continue;
                            }
                        }
                        embeddings.push(embedding);
                        captions.push(FrameCaption::new(frame.timestamp, caption));
                    }
                    None => dropped += 1,
                }
            }
        }

        if embeddings.is_empty() {
            return Err(ExtractError::ExtractionFailed(format!(
                "all {} frames failed",
                frames.len()
            )));
        }

        if dropped > 0 {
            log::debug!("dropped {dropped} of {} frames", frames.len());
        }

        let visual = mean_pool(&embeddings).ok_or_else(|| {
            ExtractError::ExtractionFailed("frame embeddings cancel out".to_string())
        })?;
        let text = self.embed_captions(&captions)?;

        Ok(VideoFeatures {
            visual,
            text,
            frames_used: embeddings.len(),
            captions,
        })
    }

    /// Embedding and caption per frame, `None` where the frame failed.
    fn extract_batch(&self, batch: &[Frame]) -> Vec<Option<(Vec<f32>, String)>> {
        let embedded = match self.visual.embed_frames(batch) {
            Ok(v) if v.len() == batch.len() => v.into_iter().map(Some).collect(),
            Ok(v) => {
                log::debug!("visual encoder returned {} of {} embeddings", v.len(), batch.len());
                self.embed_one_by_one(batch)
            }
            Err(e) => {
                log::debug!("visual batch failed, retrying per frame: {e}");
                self.embed_one_by_one(batch)
            }
        };

        // Frames without an embedding are dropped anyway, so only a fully
        // embedded batch is captioned in one call
        let whole: Option<Vec<&[f32]>> = embedded.iter().map(|e| e.as_deref()).collect();
        let captioned = match whole.map(|e| self.captioner.caption_embedded(batch, &e)) {
            Some(Ok(c)) if c.len() == batch.len() => c.into_iter().map(Some).collect(),
            _ => self.caption_one_by_one(batch, &embedded),
        };

        embedded
            .into_iter()
            .zip(captioned)
            .map(|(embedding, caption)| {
                let embedding = normalize(embedding?)?;
                Some((embedding, caption?))
            })
            .collect()
    }

    fn embed_one_by_one(&self, batch: &[Frame]) -> Vec<Option<Vec<f32>>> {
        batch
            .iter()
            .map(|frame| match self.visual.embed_frames(std::slice::from_ref(frame)) {
                Ok(mut v) if v.len() == 1 => v.pop(),
                Ok(_) => None,
                Err(e) => {
                    log::debug!("frame at {:.2}s failed to embed: {e}", frame.timestamp);
                    None
                }
            })
            .collect()
    }

    fn caption_one_by_one(&self, batch: &[Frame], embedded: &[Option<Vec<f32>>]) -> Vec<Option<String>> {
        batch
            .iter()
            .zip(embedded)
            .map(|(frame, embedding)| {
                let embedding = embedding.as_deref()?;
                match self
                    .captioner
                    .caption_embedded(std::slice::from_ref(frame), &[embedding])
                {
                    Ok(mut c) if c.len() == 1 => c.pop(),
                    Ok(_) => None,
                    Err(e) => {
                        log::debug!("frame at {:.2}s failed to caption: {e}", frame.timestamp);
                        None
                    }
                }
            })
            .collect()
    }

    /// One text vector for the whole video: unique non-empty captions are
    /// embedded, normalized, averaged and renormalized.
    fn embed_captions(&self, captions: &[FrameCaption]) -> Result<Vec<f32>, ExtractError> {
        let mut unique: Vec<String> = Vec::new();
        for caption in captions.iter().map(|c| c.text.trim()).filter(|c| !c.is_empty()) {
            if !unique.iter().any(|u| u == caption) {
                unique.push(caption.to_string());
            }
        }

        if unique.is_empty() {
            return Err(ExtractError::ExtractionFailed("no usable captions".to_string()));
        }

        let mut vectors = Vec::with_capacity(unique.len());
        for chunk in unique.chunks(self.batch_size) {
            let embedded = self
                .text
                .embed_texts(chunk)
                .map_err(|e| ExtractError::ExtractionFailed(format!("caption embedding: {e}")))?;
            vectors.extend(embedded.into_iter().filter_map(normalize));
        }

        let dims = vectors.first().map(|v| v.len()).unwrap_or(0);
        if vectors.iter().any(|v| v.len() != dims) {
            return Err(ExtractError::ExtractionFailed(
                "text encoder returned mixed dimensionality".to_string(),
            ));
        }

        mean_pool(&vectors)
            .ok_or_else(|| ExtractError::ExtractionFailed("caption embeddings unusable".to_string()))
    }
}

/// Scale to unit length. `None` for empty or zero vectors.
pub fn normalize(mut v: Vec<f32>) -> Option<Vec<f32>> {
    let norm = l2_norm(&v);
    if v.is_empty() || !norm.is_finite() || norm < f32::EPSILON {
        return None;
    }
    v.iter_mut().for_each(|x| *x /= norm);
    Some(v)
}

/// Element-wise mean of equally sized vectors, renormalized.
fn mean_pool(vectors: &[Vec<f32>]) -> Option<Vec<f32>> {
    let first = vectors.first()?;
    let mut sum = vec![0.0f32; first.len()];
    for v in vectors {
        for (acc, x) in sum.iter_mut().zip(v) {
            *acc += x;
        }
    }
    let n = vectors.len() as f32;
    sum.iter_mut().for_each(|x| *x /= n);

    normalize(sum)
}
