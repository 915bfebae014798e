//! Captured frames.
//!
//! A `Frame` is an immutable RGB image plus its capture time. The pixel buffer is
//! reference counted so the loop, the engine worker and the renderer can share one
//! capture without copying; producing a modified frame (annotation, mirroring) always
//! allocates a new buffer and leaves the original untouched.

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use image::codecs::jpeg::JpegEncoder;
use image::{imageops, RgbImage};
use std::path::Path;
use std::sync::Arc;

use crate::error::PipelineError;

#[derive(Clone, Debug)]
pub struct Frame {
    image: Arc<RgbImage>,
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap an already decoded image, stamping it with the current time.
    pub fn new(image: RgbImage) -> Self {
        Self::captured(image, Utc::now())
    }

    pub fn captured(image: RgbImage, captured_at: DateTime<Utc>) -> Self {
        Self {
            image: Arc::new(image),
            captured_at,
        }
    }

    /// Build a frame from packed RGB24 pixels.
    pub fn from_rgb(width: u32, height: u32, pixels: Vec<u8>) -> Result<Self> {
        let expected = (width as usize)
            .checked_mul(height as usize)
            .and_then(|v| v.checked_mul(3))
            .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
        if pixels.len() != expected {
            return Err(anyhow!(
                "expected {} RGB bytes for {}x{}, received {}",
                expected,
                width,
                height,
                pixels.len()
            ));
        }
        let image = RgbImage::from_raw(width, height, pixels)
            .ok_or_else(|| anyhow!("pixel buffer does not match {}x{}", width, height))?;
        Ok(Self::new(image))
    }

    /// Decode an encoded image (JPEG, PNG, BMP).
    pub fn decode(bytes: &[u8]) -> Result<Self, PipelineError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| PipelineError::InvalidInput(format!("could not decode image: {}", e)))?;
        Ok(Self::new(decoded.to_rgb8()))
    }

    pub fn open(path: &Path) -> Result<Self, PipelineError> {
        let bytes = std::fs::read(path).map_err(|e| {
            PipelineError::InvalidInput(format!("could not read {}: {}", path.display(), e))
        })?;
        Self::decode(&bytes)
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    /// Packed RGB24 pixels, row-major.
    pub fn pixels(&self) -> &[u8] {
        self.image.as_raw()
    }

    /// Horizontally flipped copy (photobooth mirror).
    pub fn mirrored(&self) -> Frame {
        Frame {
            image: Arc::new(imageops::flip_horizontal(self.image.as_ref())),
            captured_at: self.captured_at,
        }
    }

    /// Encode as baseline JPEG at the given quality (1..=100).
    pub fn encode_jpeg(&self, quality: u8) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
        encoder
            .encode_image(self.image.as_ref())
            .context("jpeg encode failed")?;
        Ok(out)
    }

    /// Write the frame to disk; the format follows the path's extension.
    pub fn save(&self, path: &Path) -> Result<()> {
        self.image
            .save(path)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}
