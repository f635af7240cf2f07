//! Sampling and extraction for one video, run inside a worker.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;

use crate::extract::FeatureExtractor;
use crate::index::{Fingerprint, VideoId, VideoRecord};
use crate::sampler::FrameSampler;
use crate::video::VideoSource;

/// One unit of work handed to a worker.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoTask {
    pub video_id: VideoId,
    pub path: PathBuf,
    pub fingerprint: Fingerprint,
}

impl VideoTask {
    pub fn new(path: PathBuf, fingerprint: Fingerprint) -> Self {
        Self {
            video_id: VideoId::from_path(&path),
            path,
            fingerprint,
        }
    }
}

/// Where a video is in its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Discovered,
    Sampled,
    Extracted,
    Upserted,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Stage::Discovered => "discovered",
            Stage::Sampled => "sampled",
            Stage::Extracted => "extracted",
            Stage::Upserted => "upserted",
        };
        f.write_str(s)
    }
}

/// A video that dropped out of the pipeline. `stage` is the last stage it
/// reached.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoFailure {
    pub path: PathBuf,
    pub stage: Stage,
    pub reason: String,
}

impl VideoFailure {
    pub fn new(path: impl Into<PathBuf>, stage: Stage, reason: impl ToString) -> Self {
        Self {
            path: path.into(),
            stage,
            reason: reason.to_string(),
        }
    }
}

/// A fully extracted video, ready for upsert.
#[derive(Debug, Clone)]
pub struct ProcessedVideo {
    pub record: VideoRecord,
    pub visual: Vec<f32>,
    pub text: Vec<f32>,
}

/// Turns a task into index-ready features. Each worker owns one.
pub trait VideoProcessor: Send {
    fn process(&mut self, task: &VideoTask) -> Result<ProcessedVideo, VideoFailure>;
}

/// Decode, sample and extract with one worker's encoders.
pub struct Pipeline {
    source: Arc<dyn VideoSource>,
    sampler: FrameSampler,
    extractor: FeatureExtractor,
}

impl Pipeline {
    pub fn new(source: Arc<dyn VideoSource>, sampler: FrameSampler, extractor: FeatureExtractor) -> Self {
        Self {
            source,
            sampler,
            extractor,
        }
    }
}

impl VideoProcessor for Pipeline {
    fn process(&mut self, task: &VideoTask) -> Result<ProcessedVideo, VideoFailure> {
        let path = task.path.as_path();
        let fail = |stage: Stage, reason: &dyn fmt::Display| VideoFailure::new(path, stage, reason);

        let mut stream = self.source.open(path).map_err(|e| {
            fail(
                Stage::Discovered,
                &crate::sampler::SampleError::unreadable(path, e.to_string()),
            )
        })?;

        let plan = self
            .sampler
            .plan(task.video_id, path, stream.as_mut())
            .map_err(|e| fail(Stage::Discovered, &e))?;
        let frames = self
            .sampler
            .decode(&plan, path, stream.as_mut())
            .map_err(|e| fail(Stage::Discovered, &e))?;
        let duration = stream.duration();
        drop(stream);

        log::debug!(
            "{} [{}]: {} -> {} ({} frames)",
            path.display(),
            task.video_id,
            Stage::Discovered,
            Stage::Sampled,
            frames.len()
        );

        let features = self
            .extractor
            .extract(&frames)
            .map_err(|e| fail(Stage::Sampled, &e))?;

        log::debug!(
            "{} [{}]: {} -> {}",
            path.display(),
            task.video_id,
            Stage::Sampled,
            Stage::Extracted
        );

        let record = VideoRecord {
            video_id: task.video_id,
            path: task.path.clone(),
            duration,
            frame_count_sampled: features.frames_used,
            fingerprint: task.fingerprint,
            captions: features.captions,
            indexed_at: Utc::now(),
        };

        Ok(ProcessedVideo {
            record,
            visual: features.visual,
            text: features.text,
        })
    }
}
