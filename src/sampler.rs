//! Adaptive frame sampling.
//!
//! Picks at most `max_frames` timestamps per video. Short videos are sampled
//! uniformly. When the duration-derived budget exceeds `max_frames`, the
//! sampler probes the video at evenly spaced positions, measures how much
//! consecutive probes differ, and spends its interior samples where the
//! picture changes most. The first and last frame positions are always kept.

use std::path::{Path, PathBuf};

use rayon::prelude::*;

use crate::index::VideoId;
use crate::video::{Frame, VideoStream};

/// Probes taken per requested sample when planning a long video.
const PROBES_PER_SAMPLE: usize = 4;

/// Upper bound on probe decodes per video.
const MAX_PROBES: usize = 96;

/// Weight every segment gets regardless of visual change, so static
/// stretches still receive some coverage.
const FLOOR_WEIGHT: f32 = 0.15;

/// Timestamps closer than this are treated as the same frame.
const TIMESTAMP_EPSILON: f64 = 1e-3;

/// Ordered timestamps chosen for one video. Never persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct SamplePlan {
    pub video_id: VideoId,
    pub timestamps: Vec<f64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SampleError {
    #[error("video unreadable: {path}: {reason}")]
    VideoUnreadable { path: PathBuf, reason: String },
}

impl SampleError {
    pub fn unreadable(path: &Path, reason: impl Into<String>) -> Self {
        Self::VideoUnreadable {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }
}

/// Chooses which frames of a video get embedded.
#[derive(Debug, Clone)]
pub struct FrameSampler {
    max_frames: usize,
}

impl FrameSampler {
    pub fn new(max_frames: usize) -> Self {
        Self {
            max_frames: max_frames.max(1),
        }
    }

    /// Sampling interval for a video of the given duration (seconds).
    pub fn interval_for(duration: f64) -> f64 {
        match duration {
            d if d <= 5.0 => 0.25,
            d if d <= 15.0 => 0.5,
            d if d <= 45.0 => 1.0,
            d if d <= 120.0 => 2.0,
            _ => 3.0,
        }
    }

    /// How many frames the duration alone calls for.
    pub fn computed_budget(duration: f64) -> usize {
        if !duration.is_finite() || duration <= 0.0 {
            return 1;
        }
        (duration / Self::interval_for(duration)).floor() as usize + 1
    }

    /// Produce the sample plan for an opened video.
    pub fn plan(
        &self,
        video_id: VideoId,
        path: &Path,
        stream: &mut dyn VideoStream,
    ) -> Result<SamplePlan, SampleError> {
        let duration = stream.duration();
        let duration = if duration.is_finite() { duration.max(0.0) } else { 0.0 };
        let last = stream.last_frame_timestamp().clamp(0.0, duration);

        let budget = Self::computed_budget(duration);
        let count = self.max_frames.min(budget).max(1);

        let timestamps = if count == 1 || last <= TIMESTAMP_EPSILON {
            vec![0.0]
        } else if budget <= self.max_frames || count < 3 {
            uniform(last, count)
        } else {
            self.scene_weighted(path, stream, last, count)?
        };

        log::debug!(
            "{}: {:.1}s, budget {}, sampling {} frames",
            path.display(),
            duration,
            budget,
            timestamps.len()
        );

        Ok(SamplePlan {
            video_id,
            timestamps,
        })
    }

    /// Decode every planned frame. Frames that fail to decode are skipped;
    /// a plan with no decodable frame makes the video unreadable.
    pub fn decode(
        &self,
        plan: &SamplePlan,
        path: &Path,
        stream: &mut dyn VideoStream,
    ) -> Result<Vec<Frame>, SampleError> {
        let mut frames = Vec::with_capacity(plan.timestamps.len());
        let mut last_error = None;

        for &ts in &plan.timestamps {
            match stream.frame_at(ts) {
                Ok(frame) => frames.push(frame),
                Err(e) => {
                    log::debug!("{}: skipping frame at {:.2}s: {}", path.display(), ts, e);
                    last_error = Some(e.to_string());
                }
            }
        }

        if frames.is_empty() {
            return Err(SampleError::unreadable(
                path,
                last_error.unwrap_or_else(|| "no decodable frames".to_string()),
            ));
        }

        Ok(frames)
    }

    fn scene_weighted(
        &self,
        path: &Path,
        stream: &mut dyn VideoStream,
        last: f64,
        count: usize,
    ) -> Result<Vec<f64>, SampleError> {
        let probe_count = (count * PROBES_PER_SAMPLE).min(MAX_PROBES).max(count + 1);
        let positions = uniform(last, probe_count);

        let probes: Vec<Option<Frame>> = positions
            .iter()
            .map(|&ts| stream.frame_at(ts).ok())
            .collect();

        if probes.iter().all(Option::is_none) {
            return Err(SampleError::unreadable(path, "no decodable frames"));
        }

        let signatures: Vec<Option<FrameSignature>> = probes
            .par_iter()
            .map(|frame| frame.as_ref().and_then(FrameSignature::of))
            .collect();

        let weights: Vec<f32> = signatures
            .windows(2)
            .map(|pair| match (&pair[0], &pair[1]) {
                (Some(a), Some(b)) => FLOOR_WEIGHT + a.delta(b),
                _ => FLOOR_WEIGHT,
            })
            .collect();

        let mut timestamps = Vec::with_capacity(count);
        timestamps.push(0.0);
        timestamps.extend(allocate(&positions, &weights, count - 2));
        timestamps.push(last);

        timestamps.sort_by(|a, b| a.total_cmp(b));
        timestamps.dedup_by(|b, a| (*b - *a).abs() < TIMESTAMP_EPSILON);

        Ok(timestamps)
    }
}

/// `count` evenly spaced timestamps covering `[0, last]`.
fn uniform(last: f64, count: usize) -> Vec<f64> {
    if count <= 1 {
        return vec![0.0];
    }
    (0..count)
        .map(|i| last * i as f64 / (count - 1) as f64)
        .collect()
}

/// Spread `samples` timestamps over the probe segments in proportion to the
/// segment weights (systematic sampling over the cumulative weight).
fn allocate(positions: &[f64], weights: &[f32], samples: usize) -> Vec<f64> {
    let total: f32 = weights.iter().sum();
    if samples == 0 || total <= 0.0 {
        return Vec::new();
    }

    let mut out = Vec::with_capacity(samples);
    let mut segment = 0;
    let mut cumulative = 0.0f32;

    for k in 0..samples {
        let target = (k as f32 + 0.5) / samples as f32 * total;
        while segment + 1 < weights.len() && cumulative + weights[segment] < target {
            cumulative += weights[segment];
            segment += 1;
        }
        let fraction = ((target - cumulative) / weights[segment]).clamp(0.0, 1.0) as f64;
        let start = positions[segment];
        let end = positions[segment + 1];
        out.push(start + fraction * (end - start));
    }

    out
}

/// Coarse appearance of a frame: an 8x8 average hash plus a 64-bin luma
/// histogram.
#[derive(Debug, Clone, PartialEq)]
struct FrameSignature {
    hash: u64,
    histogram: [u32; 64],
}

impl FrameSignature {
    fn of(frame: &Frame) -> Option<Self> {
        let small = frame.thumbnail(8, 8)?;
        let gray = luma(&small.data);
        let mean = gray.iter().map(|&v| v as u32).sum::<u32>() / gray.len().max(1) as u32;

        let mut hash = 0u64;
        for (i, &v) in gray.iter().enumerate().take(64) {
            if v as u32 > mean {
                hash |= 1 << i;
            }
        }

        let medium = frame.thumbnail(32, 32)?;
        let mut histogram = [0u32; 64];
        for v in luma(&medium.data) {
            histogram[(v >> 2) as usize] += 1;
        }

        Some(Self { hash, histogram })
    }

    /// 0.0 for identical frames, approaching 1.0 for unrelated ones.
    fn delta(&self, other: &Self) -> f32 {
        let hash_diff = (self.hash ^ other.hash).count_ones() as f32 / 64.0;
        let overlap = histogram_intersection(&self.histogram, &other.histogram);
        hash_diff * 0.5 + (1.0 - overlap) * 0.5
    }
}

fn luma(rgb: &[u8]) -> Vec<u8> {
    rgb.chunks_exact(3)
        .map(|px| ((px[0] as u32 * 299 + px[1] as u32 * 587 + px[2] as u32 * 114) / 1000) as u8)
        .collect()
}

fn histogram_intersection(h1: &[u32; 64], h2: &[u32; 64]) -> f32 {
    let shared: u32 = h1.iter().zip(h2.iter()).map(|(a, b)| *a.min(b)).sum();
    let sum1: u32 = h1.iter().sum();
    let sum2: u32 = h2.iter().sum();

    if sum1 == 0 || sum2 == 0 {
        return 0.0;
    }

    shared as f32 / sum1.max(sum2) as f32
}
