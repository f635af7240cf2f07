//! Video decode boundary.
//!
//! The indexer never decodes video itself. It talks to a [`VideoSource`],
//! which opens a file and hands back a [`VideoStream`] that can produce a
//! raster frame at a timestamp. [`FfmpegSource`] is the production
//! implementation and shells out to `ffprobe`/`ffmpeg`.

use std::path::Path;
use std::process::{Command, Stdio};

use image::{imageops::FilterType, DynamicImage, ImageFormat, RgbImage};
use serde::Deserialize;

/// Longest edge frames are scaled to before they reach the encoders.
const DEFAULT_FRAME_EDGE: u32 = 448;

/// An RGB raster frame.
#[derive(Debug, Clone)]
pub struct Frame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB8 pixels, row major
    pub data: Vec<u8>,
    /// Position of the frame in the video (seconds)
    pub timestamp: f64,
}

impl Frame {
    pub fn new(width: u32, height: u32, data: Vec<u8>, timestamp: f64) -> Self {
        Self {
            width,
            height,
            data,
            timestamp,
        }
    }

    pub fn from_image(img: DynamicImage, timestamp: f64) -> Self {
        let rgb = img.to_rgb8();
        let (width, height) = rgb.dimensions();
        Self::new(width, height, rgb.into_raw(), timestamp)
    }

    fn to_rgb_image(&self) -> Option<RgbImage> {
        RgbImage::from_raw(self.width, self.height, self.data.clone())
    }

    /// Encode the frame as PNG, the input format the image encoders accept.
    pub fn to_png(&self) -> Result<Vec<u8>, image::ImageError> {
        let img = self.to_rgb_image().ok_or_else(|| {
            image::ImageError::Parameter(image::error::ParameterError::from_kind(
                image::error::ParameterErrorKind::DimensionMismatch,
            ))
        })?;

        let mut buf = std::io::Cursor::new(Vec::new());
        img.write_to(&mut buf, ImageFormat::Png)?;
        Ok(buf.into_inner())
    }

    /// Downscale to an exact size, used for coarse frame comparisons.
    pub fn thumbnail(&self, width: u32, height: u32) -> Option<Frame> {
        let img = self.to_rgb_image()?;
        let small = image::imageops::resize(&img, width, height, FilterType::Triangle);
        Some(Frame::new(width, height, small.into_raw(), self.timestamp))
    }
}

/// Errors reported by a decode source.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot open video: {0}")]
    Open(String),

    #[error("no frame at {timestamp:.2}s: {reason}")]
    Frame { timestamp: f64, reason: String },

    #[error("decoder tool not available: {0}")]
    ToolMissing(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Opens videos for frame extraction.
pub trait VideoSource: Send + Sync {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoStream>, DecodeError>;
}

/// An opened video.
pub trait VideoStream: Send {
    /// Duration in seconds.
    fn duration(&self) -> f64;

    /// Frames per second reported by the container.
    fn fps(&self) -> f64;

    /// Decode the frame closest to `timestamp`.
    fn frame_at(&mut self, timestamp: f64) -> Result<Frame, DecodeError>;

    /// Timestamp of the last decodable frame.
    fn last_frame_timestamp(&self) -> f64 {
        let step = if self.fps() > 0.0 { 1.0 / self.fps() } else { 0.0 };
        (self.duration() - step).max(0.0)
    }
}

/// Decode source backed by the ffmpeg command line tools.
#[derive(Debug, Clone)]
pub struct FfmpegSource {
    max_edge: u32,
}

impl Default for FfmpegSource {
    fn default() -> Self {
        Self {
            max_edge: DEFAULT_FRAME_EDGE,
        }
    }
}

impl FfmpegSource {
    pub fn new(max_edge: u32) -> Self {
        Self {
            max_edge: max_edge.max(32),
        }
    }
}

#[derive(Debug, Deserialize)]
struct FfprobeOutput {
    format: FfprobeFormat,
    streams: Vec<FfprobeStream>,
}

#[derive(Debug, Deserialize)]
struct FfprobeFormat {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FfprobeStream {
    codec_type: String,
    avg_frame_rate: Option<String>,
    r_frame_rate: Option<String>,
    nb_frames: Option<String>,
}

impl VideoSource for FfmpegSource {
    fn open(&self, path: &Path) -> Result<Box<dyn VideoStream>, DecodeError> {
        if !path.is_file() {
            return Err(DecodeError::Open(format!("{} does not exist", path.display())));
        }

        let output = Command::new("ffprobe")
            .args([
                "-v",
                "quiet",
                "-print_format",
                "json",
                "-show_format",
                "-show_streams",
            ])
            .arg(path)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DecodeError::ToolMissing("ffprobe".to_string()),
                _ => DecodeError::Io(e),
            })?;

        if !output.status.success() {
            return Err(DecodeError::Open(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let probe: FfprobeOutput = serde_json::from_slice(&output.stdout)
            .map_err(|e| DecodeError::Open(format!("unreadable ffprobe output: {e}")))?;

        let stream = probe
            .streams
            .iter()
            .find(|s| s.codec_type == "video")
            .ok_or_else(|| DecodeError::Open("no video stream".to_string()))?;

        if stream.nb_frames.as_deref() == Some("0") {
            return Err(DecodeError::Open("video stream has no frames".to_string()));
        }

        let fps = stream
            .avg_frame_rate
            .as_deref()
            .and_then(parse_frame_rate)
            .or_else(|| stream.r_frame_rate.as_deref().and_then(parse_frame_rate))
            .unwrap_or(25.0);

        let duration = probe
            .format
            .duration
            .as_deref()
            .and_then(|d| d.parse::<f64>().ok())
            .unwrap_or(0.0);

        Ok(Box::new(FfmpegStream {
            path: path.to_path_buf(),
            duration,
            fps,
            max_edge: self.max_edge,
        }))
    }
}

struct FfmpegStream {
    path: std::path::PathBuf,
    duration: f64,
    fps: f64,
    max_edge: u32,
}

impl VideoStream for FfmpegStream {
    fn duration(&self) -> f64 {
        self.duration
    }

    fn fps(&self) -> f64 {
        self.fps
    }

    fn frame_at(&mut self, timestamp: f64) -> Result<Frame, DecodeError> {
        let scale = format!(
            "scale='min({edge},iw)':'min({edge},ih)':force_original_aspect_ratio=decrease",
            edge = self.max_edge
        );

        let output = Command::new("ffmpeg")
            .args(["-v", "error", "-ss", &format!("{timestamp:.3}"), "-i"])
            .arg(&self.path)
            .args([
                "-frames:v", "1", "-vf", &scale, "-f", "image2pipe", "-vcodec", "png", "-",
            ])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => DecodeError::ToolMissing("ffmpeg".to_string()),
                _ => DecodeError::Io(e),
            })?;

        if !output.status.success() || output.stdout.is_empty() {
            return Err(DecodeError::Frame {
                timestamp,
                reason: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        let img = image::load_from_memory(&output.stdout).map_err(|e| DecodeError::Frame {
            timestamp,
            reason: e.to_string(),
        })?;

        Ok(Frame::from_image(img, timestamp))
    }
}

/// Parse an ffprobe rational like "30000/1001".
fn parse_frame_rate(rate: &str) -> Option<f64> {
    let (num, den) = match rate.split_once('/') {
        Some((n, d)) => (n.parse::<f64>().ok()?, d.parse::<f64>().ok()?),
        None => (rate.parse::<f64>().ok()?, 1.0),
    };
    if den == 0.0 || num <= 0.0 {
        return None;
    }
    Some(num / den)
}
