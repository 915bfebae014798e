//! Frame ingestion sources.
//!
//! Every source yields decoded RGB `Frame`s through the `FrameSource` trait:
//! - synthetic `stub://` streams (tests, demos)
//! - still images and image directories
//! - USB/V4L2 cameras (feature: camera-v4l2)
//! - local video files (feature: video-ffmpeg)
//!
//! `next_frame` returning `Ok(None)` means the stream ended; an `Err` is fatal to the
//! session reading it. Device-backed sources bound every read with a timeout so a
//! stalled camera surfaces as an error instead of a hung loop.

#[cfg(feature = "video-ffmpeg")]
pub(crate) mod file_ffmpeg;
pub mod images;
#[cfg(feature = "camera-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use std::path::Path;
use std::time::Duration;

use crate::config::CaptureSettings;
use crate::frame::Frame;

pub use images::ImageSequenceSource;
pub use synthetic::SyntheticSource;
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Source;

pub const WEBCAM_DEVICE: &str = "/dev/video0";
const VIDEO_EXTENSIONS: &[&str] = &["mp4", "avi", "mov", "mkv", "webm", "m4v"];

/// A producer of frames, owned by exactly one capture loop.
pub trait FrameSource: Send {
    /// Open the underlying device or file.
    fn connect(&mut self) -> Result<()>;

    /// Next frame, or `None` once the stream is exhausted.
    fn next_frame(&mut self) -> Result<Option<Frame>>;

    fn is_healthy(&self) -> bool;

    fn stats(&self) -> SourceStats;

    /// Native frame rate, when the source knows it.
    fn frame_rate(&self) -> Option<f64> {
        None
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SourceStats {
    pub frames_captured: u64,
    /// Label stamped on detections from this source.
    pub source: String,
}

/// How to open a source.
#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// `webcam`, `/dev/videoN`, `stub://name?frames=N`, an image, a directory or a video file.
    pub spec: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Upper bound on a single device read.
    pub frame_timeout: Duration,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            spec: "webcam".to_string(),
            width: 640,
            height: 480,
            target_fps: 30,
            frame_timeout: Duration::from_secs(2),
        }
    }
}

impl SourceConfig {
    pub fn new(spec: impl Into<String>) -> Self {
        Self {
            spec: spec.into(),
            ..Self::default()
        }
    }

    pub fn from_capture(capture: &CaptureSettings) -> Self {
        Self {
            spec: capture.source.clone(),
            width: capture.width,
            height: capture.height,
            target_fps: capture.fps,
            frame_timeout: capture.frame_timeout,
        }
    }
}

/// Which backend a spec string selects.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SourceKind {
    Synthetic,
    Camera(String),
    Images,
    Video,
}

pub fn classify(spec: &str) -> Result<SourceKind> {
    let spec = spec.trim();
    if spec.is_empty() {
        return Err(anyhow!("empty source"));
    }
    if spec.starts_with("stub://") {
        return Ok(SourceKind::Synthetic);
    }
    if spec.eq_ignore_ascii_case("webcam") {
        return Ok(SourceKind::Camera(WEBCAM_DEVICE.to_string()));
    }
    if spec.starts_with("/dev/video") {
        return Ok(SourceKind::Camera(spec.to_string()));
    }
    if spec.contains("://") {
        return Err(anyhow!("network sources are not supported: {}", spec));
    }
    let path = Path::new(spec);
    if path.is_dir() || images::is_image_path(path) {
        return Ok(SourceKind::Images);
    }
    if is_video_path(path) {
        return Ok(SourceKind::Video);
    }
    Err(anyhow!("unrecognised source {:?}", spec))
}

/// True when the extension names a video container.
pub fn is_video_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| VIDEO_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Build and connect the source a spec names.
pub fn open_source(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    let mut source: Box<dyn FrameSource> = match classify(&config.spec)? {
        SourceKind::Synthetic => Box::new(SyntheticSource::from_spec(&config.spec, config)?),
        SourceKind::Images => Box::new(ImageSequenceSource::new(Path::new(config.spec.trim()))?),
        SourceKind::Camera(device) => open_camera(device, config)?,
        SourceKind::Video => open_video(config)?,
    };
    source.connect()?;
    Ok(source)
}

#[cfg(feature = "camera-v4l2")]
fn open_camera(device: String, config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
        device,
        target_fps: config.target_fps,
        width: config.width,
        height: config.height,
        frame_timeout: config.frame_timeout,
    })))
}

#[cfg(not(feature = "camera-v4l2"))]
fn open_camera(device: String, _config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "camera {} requires the camera-v4l2 feature",
        device
    ))
}

#[cfg(feature = "video-ffmpeg")]
fn open_video(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(file_ffmpeg::FfmpegFileSource::new(
        config.spec.trim(),
        config.target_fps,
    )?))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_video(config: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "video file {} requires the video-ffmpeg feature",
        config.spec
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_maps_known_specs() {
        assert_eq!(classify("stub://cam?frames=3").unwrap(), SourceKind::Synthetic);
        assert_eq!(
            classify("webcam").unwrap(),
            SourceKind::Camera(WEBCAM_DEVICE.to_string())
        );
        assert_eq!(
            classify("/dev/video2").unwrap(),
            SourceKind::Camera("/dev/video2".to_string())
        );
        assert_eq!(classify("clip.MP4").unwrap(), SourceKind::Video);
        assert_eq!(classify("photo.jpg").unwrap(), SourceKind::Images);
        assert!(classify("rtsp://10.0.0.2/stream").is_err());
        assert!(classify("  ").is_err());
    }

    #[test]
    fn open_source_connects_synthetic_stream() -> Result<()> {
        let mut source = open_source(&SourceConfig::new("stub://lobby?frames=2"))?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        Ok(())
    }
}
