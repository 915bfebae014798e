//! Still image and image directory source.

use anyhow::{anyhow, Context, Result};
use std::path::{Path, PathBuf};

use super::{FrameSource, SourceStats};
use crate::frame::Frame;

const IMAGE_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

/// Yields each image once, in file name order. Undecodable files are skipped.
pub struct ImageSequenceSource {
    root: PathBuf,
    paths: Vec<PathBuf>,
    cursor: usize,
    frame_count: u64,
    skipped: u64,
    current: Option<String>,
}

impl ImageSequenceSource {
    pub fn new(root: &Path) -> Result<Self> {
        if !root.exists() {
            return Err(anyhow!("{} does not exist", root.display()));
        }
        Ok(Self {
            root: root.to_path_buf(),
            paths: Vec::new(),
            cursor: 0,
            frame_count: 0,
            skipped: 0,
            current: None,
        })
    }

    /// File name of the most recently returned frame.
    pub fn current_name(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// Files that could not be decoded.
    pub fn skipped(&self) -> u64 {
        self.skipped
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl FrameSource for ImageSequenceSource {
    fn connect(&mut self) -> Result<()> {
        self.paths = if self.root.is_dir() {
            let mut paths: Vec<PathBuf> = std::fs::read_dir(&self.root)
                .with_context(|| format!("failed to list {}", self.root.display()))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|path| path.is_file() && is_image_path(path))
                .collect();
            paths.sort();
            paths
        } else if is_image_path(&self.root) {
            vec![self.root.clone()]
        } else {
            return Err(anyhow!("{} is not an image", self.root.display()));
        };
        self.cursor = 0;
        log::info!(
            "ImageSequenceSource: {} image(s) under {}",
            self.paths.len(),
            self.root.display()
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        while let Some(path) = self.paths.get(self.cursor) {
            self.cursor += 1;
            match Frame::open(path) {
                Ok(frame) => {
                    self.frame_count += 1;
                    self.current = path.file_name().map(|n| n.to_string_lossy().into_owned());
                    return Ok(Some(frame));
                }
                Err(err) => {
                    self.skipped += 1;
                    log::warn!("skipping {}: {}", path.display(), err);
                }
            }
        }
        Ok(None)
    }

    fn is_healthy(&self) -> bool {
        self.root.exists()
    }

    fn stats(&self) -> SourceStats {
        let source = if self.root.is_dir() {
            self.current.clone().unwrap_or_else(|| self.root.display().to_string())
        } else {
            self.root
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.root.display().to_string())
        };
        SourceStats {
            frames_captured: self.frame_count,
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn directory_yields_images_in_name_order_and_skips_junk() -> Result<()> {
        let dir = tempfile::tempdir()?;
        RgbImage::new(4, 4).save(dir.path().join("b.png"))?;
        RgbImage::new(8, 8).save(dir.path().join("a.png"))?;
        std::fs::write(dir.path().join("c.jpg"), b"not a jpeg")?;
        std::fs::write(dir.path().join("notes.txt"), b"ignored")?;

        let mut source = ImageSequenceSource::new(dir.path())?;
        source.connect()?;
        assert_eq!(source.len(), 3);

        let first = source.next_frame()?.ok_or_else(|| anyhow!("missing a.png"))?;
        assert_eq!(first.width(), 8);
        assert_eq!(source.current_name(), Some("a.png"));
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().frames_captured, 2);
        assert_eq!(source.skipped(), 1);
        Ok(())
    }

    #[test]
    fn single_file_is_one_frame() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("shot.bmp");
        RgbImage::new(2, 2).save(&path)?;
        let mut source = ImageSequenceSource::new(&path)?;
        source.connect()?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame()?.is_none());
        assert_eq!(source.stats().source, "shot.bmp");
        Ok(())
    }
}
