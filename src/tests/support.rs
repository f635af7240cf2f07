//! Deterministic stand-ins for the decoder, the encoders and the thesaurus.
//!
//! Frames are solid colors. The fake visual encoder maps a frame to its
//! mean color, the fake joint text encoder maps color words into the same
//! space, and the fake captioner names the dominant color, so "red" queries
//! find red videos without any model.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::DateTime;

use crate::extract::{FeatureExtractor, FrameCaptioner, TextEncoder, VisualEncoder};
use crate::index::{Fingerprint, FrameCaption, VideoId, VideoRecord};
use crate::models::EmbeddingError;
use crate::query::{ExpansionSettings, QueryProcessor, SynonymLookup};
use crate::video::{DecodeError, Frame, VideoSource, VideoStream};

const FRAME_EDGE: u32 = 16;
const TEXT_DIMENSIONS: usize = 32;

pub fn solid_frame(rgb: [u8; 3], timestamp: f64) -> Frame {
    let pixels = (FRAME_EDGE * FRAME_EDGE) as usize;
    let data = rgb.iter().copied().cycle().take(pixels * 3).collect();
    Frame::new(FRAME_EDGE, FRAME_EDGE, data, timestamp)
}

fn mean_rgb(frame: &Frame) -> [u8; 3] {
    let mut sums = [0u64; 3];
    let mut pixels = 0u64;
    for px in frame.data.chunks_exact(3) {
        for (sum, &c) in sums.iter_mut().zip(px) {
            *sum += c as u64;
        }
        pixels += 1;
    }
    let pixels = pixels.max(1);
    sums.map(|s| (s / pixels) as u8)
}

/// Position of a color in the fake joint space. Never zero.
pub fn color_embedding(rgb: [u8; 3]) -> Vec<f32> {
    vec![
        rgb[0] as f32 / 255.0,
        rgb[1] as f32 / 255.0,
        rgb[2] as f32 / 255.0,
        0.05,
    ]
}

pub fn color_name(rgb: [u8; 3]) -> &'static str {
    let [r, g, b] = rgb;
    let max = r.max(g).max(b);
    let min = r.min(g).min(b);
    if max < 60 {
        "dark"
    } else if max - min < 40 {
        "gray"
    } else if r == max {
        "red"
    } else if g == max {
        "green"
    } else {
        "blue"
    }
}

pub fn caption_for(rgb: [u8; 3]) -> String {
    match color_name(rgb) {
        "red" => "a woman wearing a red shirt",
        "green" => "a dog running on green grass",
        "blue" => "a man in a blue jacket",
        "gray" => "an empty gray room",
        _ => "a dark night street",
    }
    .to_string()
}

fn words(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()).to_lowercase())
        .filter(|w| !w.is_empty())
}

/// A decodable stream whose frame color is a function of time.
pub struct SyntheticStream {
    duration: f64,
    fps: f64,
    color: Box<dyn Fn(f64) -> [u8; 3] + Send>,
    broken: bool,
}

impl SyntheticStream {
    pub fn new(duration: f64, fps: f64, color: impl Fn(f64) -> [u8; 3] + Send + 'static) -> Self {
        Self {
            duration,
            fps,
            color: Box::new(color),
            broken: false,
        }
    }

    pub fn constant(duration: f64, fps: f64, rgb: [u8; 3]) -> Self {
        Self::new(duration, fps, move |_| rgb)
    }

    /// Reports metadata but decodes nothing.
    pub fn broken(duration: f64, fps: f64) -> Self {
        Self {
            broken: true,
            ..Self::constant(duration, fps, [0, 0, 0])
        }
    }
}

impl VideoStream for SyntheticStream {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_at(&mut self, timestamp: f64) -> Result<Frame, DecodeError> {
        if self.broken {
            return Err(DecodeError::Frame {
                timestamp,
                reason: "corrupt packet".to_string(),
            });
        }
        if timestamp < 0.0 || timestamp > self.duration {
            return Err(DecodeError::Frame {
                timestamp,
                reason: "past end of stream".to_string(),
            });
        }
        Ok(solid_frame((self.color)(timestamp), timestamp))
    }
}

#[derive(Debug, Clone, Copy)]
struct FakeVideo {
    duration: f64,
    /// None decodes nothing
    color: Option<[u8; 3]>,
}

/// In-memory decode source keyed by path.
#[derive(Debug, Clone, Default)]
pub struct FakeSource {
    videos: HashMap<PathBuf, FakeVideo>,
    require_files: bool,
}

impl FakeSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_video(mut self, path: impl Into<PathBuf>, duration: f64, rgb: [u8; 3]) -> Self {
        self.videos.insert(
            path.into(),
            FakeVideo {
                duration,
                color: Some(rgb),
            },
        );
        self
    }

    pub fn with_broken(mut self, path: impl Into<PathBuf>, duration: f64) -> Self {
        self.videos.insert(path.into(), FakeVideo { duration, color: None });
        self
    }

    /// Fail to open registered videos whose file is gone from disk.
    pub fn requiring_files(mut self) -> Self {
        self.require_files = true;
        self
    }
}

impl VideoSource for FakeSource {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoStream>, DecodeError> {
        if self.require_files && !path.exists() {
            return Err(DecodeError::Open(format!("{}: no such file", path.display())));
        }
        let video = self
            .videos
            .get(path)
            .ok_or_else(|| DecodeError::Open(format!("{}: unknown video", path.display())))?;

        Ok(Box::new(match video.color {
            Some(rgb) => SyntheticStream::constant(video.duration, 10.0, rgb),
            None => SyntheticStream::broken(video.duration, 10.0),
        }))
    }
}

/// Frames to their mean color. Batches holding a frame at one of the
/// failing timestamps error out as a whole.
#[derive(Debug, Clone, Default)]
pub struct FakeVisualEncoder {
    failing: Vec<f64>,
}

impl FakeVisualEncoder {
    pub fn failing_on(timestamps: &[f64]) -> Self {
        Self {
            failing: timestamps.to_vec(),
        }
    }
}

impl VisualEncoder for FakeVisualEncoder {
    fn embed_frames(&self, frames: &[Frame]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        let bad = frames
            .iter()
            .find(|f| self.failing.iter().any(|t| (t - f.timestamp).abs() < 1e-9));
        if let Some(frame) = bad {
            return Err(EmbeddingError::EmbeddingFailed(format!(
                "frame at {:.2}s rejected",
                frame.timestamp
            )));
        }
        Ok(frames.iter().map(|f| color_embedding(mean_rgb(f))).collect())
    }
}

pub struct FakeCaptioner;

impl FrameCaptioner for FakeCaptioner {
    fn caption_frames(&self, frames: &[Frame]) -> Result<Vec<String>, EmbeddingError> {
        Ok(frames.iter().map(|f| caption_for(mean_rgb(f))).collect())
    }
}

/// Reads the color back out of the fake visual embedding. Refuses to
/// look at pixels.
pub struct EmbeddingCaptioner;

impl FrameCaptioner for EmbeddingCaptioner {
    fn caption_frames(&self, _frames: &[Frame]) -> Result<Vec<String>, EmbeddingError> {
        Err(EmbeddingError::EmbeddingFailed("needs visual embeddings".to_string()))
    }

    fn caption_embedded(
        &self,
        _frames: &[Frame],
        embeddings: &[&[f32]],
    ) -> Result<Vec<String>, EmbeddingError> {
        Ok(embeddings
            .iter()
            .map(|e| {
                let channel = |i: usize| (e.get(i).copied().unwrap_or(0.0) * 255.0).round() as u8;
                caption_for([channel(0), channel(1), channel(2)])
            })
            .collect())
    }
}

/// Hashed bag of words.
pub struct FakeTextEncoder;

impl TextEncoder for FakeTextEncoder {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0f32; TEXT_DIMENSIONS];
                v[TEXT_DIMENSIONS - 1] = 0.1;
                for word in words(text) {
                    let h = word
                        .bytes()
                        .fold(17u64, |h, b| h.wrapping_mul(31).wrapping_add(b as u64));
                    v[(h % (TEXT_DIMENSIONS as u64 - 1)) as usize] += 1.0;
                }
                v
            })
            .collect())
    }
}

/// Color words to the fake visual space.
pub struct FakeJointEncoder;

impl TextEncoder for FakeJointEncoder {
    fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Ok(texts
            .iter()
            .map(|text| {
                let mut v = vec![0.0, 0.0, 0.0, 0.05];
                for word in words(text) {
                    let rgb = match word.as_str() {
                        "red" => [255, 0, 0],
                        "green" => [0, 255, 0],
                        "blue" => [0, 0, 255],
                        _ => continue,
                    };
                    for (x, c) in v.iter_mut().zip(color_embedding(rgb)) {
                        *x += c;
                    }
                }
                v
            })
            .collect())
    }
}

pub struct FailingTextEncoder;

impl TextEncoder for FailingTextEncoder {
    fn embed_texts(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, EmbeddingError> {
        Err(EmbeddingError::EmbeddingFailed("encoder offline".to_string()))
    }
}

#[derive(Debug, Clone, Default)]
pub struct MapSynonyms {
    map: HashMap<String, Vec<String>>,
}

impl MapSynonyms {
    pub fn new(entries: &[(&str, &[&str])]) -> Self {
        Self {
            map: entries
                .iter()
                .map(|(term, syns)| (term.to_string(), syns.iter().map(|s| s.to_string()).collect()))
                .collect(),
        }
    }
}

impl SynonymLookup for MapSynonyms {
    fn synonyms(&self, term: &str) -> Vec<String> {
        self.map.get(term).cloned().unwrap_or_default()
    }
}

pub fn fake_extractor() -> FeatureExtractor {
    FeatureExtractor::new(
        Box::new(FakeVisualEncoder::default()),
        Box::new(FakeCaptioner),
        Box::new(FakeTextEncoder),
        8,
    )
}

pub fn fake_query_processor(synonyms: MapSynonyms) -> QueryProcessor {
    QueryProcessor::new(
        Box::new(synonyms),
        Box::new(FakeTextEncoder),
        Some(Box::new(FakeJointEncoder)),
        ExpansionSettings::default(),
    )
}

/// Metadata row for a video that was never decoded. Caption `i` sits at
/// second `i`.
pub fn record(path: &str, captions: &[&str]) -> VideoRecord {
    let path = PathBuf::from(path);
    VideoRecord {
        video_id: VideoId::from_path(&path),
        path,
        duration: 10.0,
        frame_count_sampled: captions.len(),
        fingerprint: Fingerprint {
            size: 1,
            modified_ns: 0,
        },
        captions: captions
            .iter()
            .enumerate()
            .map(|(i, c)| FrameCaption::new(i as f64, *c))
            .collect(),
        indexed_at: DateTime::from_timestamp(1_700_000_000, 0).unwrap_or_default(),
    }
}
