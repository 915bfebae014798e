//! Annotated output for batch runs: a video file when the video-ffmpeg feature
//! is built, otherwise a snapshot of the last frame written.

#[cfg(feature = "video-ffmpeg")]
mod video;

use anyhow::{anyhow, Result};
use std::path::{Path, PathBuf};

use crate::frame::Frame;
use crate::ingest::is_video_path;

#[cfg(feature = "video-ffmpeg")]
pub use video::VideoSink;

/// Frame rate used when the source does not report one.
pub const DEFAULT_OUTPUT_FPS: f64 = 30.0;

/// Consumer of the annotated frame sequence.
pub trait FrameSink {
    fn write(&mut self, frame: &Frame) -> Result<()>;

    /// Flush and close. Returns the file written, if any frame arrived.
    fn finish(&mut self) -> Result<Option<PathBuf>>;
}

/// Keeps only the most recent frame and saves it as an image on `finish`.
pub struct SnapshotSink {
    path: PathBuf,
    last: Option<Frame>,
}

impl SnapshotSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            last: None,
        }
    }
}

impl FrameSink for SnapshotSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        self.last = Some(frame.clone());
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<PathBuf>> {
        let Some(frame) = self.last.take() else {
            return Ok(None);
        };
        frame.save(&self.path)?;
        Ok(Some(self.path.clone()))
    }
}

/// Sink for `path`: video paths get an encoder, anything else a snapshot.
pub fn open_sink(path: &Path, fps: f64) -> Result<Box<dyn FrameSink>> {
    if path.as_os_str().is_empty() {
        return Err(anyhow!("empty output path"));
    }
    if is_video_path(path) {
        return open_video_sink(path, fps);
    }
    Ok(Box::new(SnapshotSink::new(path)))
}

#[cfg(feature = "video-ffmpeg")]
fn open_video_sink(path: &Path, fps: f64) -> Result<Box<dyn FrameSink>> {
    Ok(Box::new(VideoSink::new(path, fps)))
}

#[cfg(not(feature = "video-ffmpeg"))]
fn open_video_sink(path: &Path, _fps: f64) -> Result<Box<dyn FrameSink>> {
    let fallback = path.with_extension("jpg");
    log::warn!(
        "writing {} needs the video-ffmpeg feature; saving the last frame to {} instead",
        path.display(),
        fallback.display()
    );
    Ok(Box::new(SnapshotSink::new(fallback)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    fn frame(shade: u8) -> Frame {
        Frame::new(RgbImage::from_pixel(16, 12, image::Rgb([shade, shade, shade])))
    }

    #[test]
    fn snapshot_keeps_the_last_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("last.png");
        let mut sink = open_sink(&path, DEFAULT_OUTPUT_FPS).unwrap();
        sink.write(&frame(10)).unwrap();
        sink.write(&frame(200)).unwrap();

        assert_eq!(sink.finish().unwrap(), Some(path.clone()));
        let saved = image::open(&path).unwrap().to_rgb8();
        assert_eq!(saved.get_pixel(3, 3).0, [200, 200, 200]);
    }

    #[test]
    fn snapshot_without_frames_writes_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("never.png");
        let mut sink = SnapshotSink::new(&path);
        assert_eq!(sink.finish().unwrap(), None);
        assert!(!path.exists());
    }

    #[cfg(not(feature = "video-ffmpeg"))]
    #[test]
    fn video_path_falls_back_to_a_jpeg_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = open_sink(&dir.path().join("run.mp4"), 25.0).unwrap();
        sink.write(&frame(90)).unwrap();
        let written = sink.finish().unwrap().unwrap();
        assert_eq!(written, dir.path().join("run.jpg"));
        assert!(written.exists());
    }

    #[cfg(feature = "video-ffmpeg")]
    #[test]
    fn video_path_encodes_every_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.mp4");
        let mut sink = open_sink(&path, 10.0).unwrap();
        for shade in 0..20u8 {
            sink.write(&frame(shade * 10)).unwrap();
        }
        assert_eq!(sink.finish().unwrap(), Some(path.clone()));
        assert!(std::fs::metadata(&path).unwrap().len() > 0);
    }
}
