//! Synthetic `stub://` source.
//!
//! `stub://<name>?frames=N&width=W&height=H&fail_after=K` renders a moving gradient
//! with a little sensor noise. Without `frames` the stream never ends; with
//! `fail_after` the K+1-th read returns an error.

use anyhow::{anyhow, Context, Result};
use image::RgbImage;
use rand::Rng;

use super::{FrameSource, SourceConfig, SourceStats};
use crate::frame::Frame;

pub struct SyntheticSource {
    name: String,
    width: u32,
    height: u32,
    frame_limit: Option<u64>,
    fail_after: Option<u64>,
    frame_count: u64,
    connected: bool,
}

impl SyntheticSource {
    pub fn from_spec(spec: &str, config: &SourceConfig) -> Result<Self> {
        let rest = spec
            .trim()
            .strip_prefix("stub://")
            .ok_or_else(|| anyhow!("synthetic source must start with stub://"))?;
        let (name, query) = rest.split_once('?').unwrap_or((rest, ""));

        let mut source = Self {
            name: if name.is_empty() { "stub".to_string() } else { name.to_string() },
            width: config.width,
            height: config.height,
            frame_limit: None,
            fail_after: None,
            frame_count: 0,
            connected: false,
        };

        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed stub parameter {:?}", pair))?;
            let parse = || -> Result<u64> {
                value
                    .parse()
                    .with_context(|| format!("stub parameter {} must be an integer", key))
            };
            match key {
                "frames" => source.frame_limit = Some(parse()?),
                "fail_after" => source.fail_after = Some(parse()?),
                "width" => source.width = parse()? as u32,
                "height" => source.height = parse()? as u32,
                other => return Err(anyhow!("unknown stub parameter {:?}", other)),
            }
        }
        if source.width == 0 || source.height == 0 {
            return Err(anyhow!("stub frame size must be non-zero"));
        }
        Ok(source)
    }

    fn render(&self) -> RgbImage {
        let mut rng = rand::thread_rng();
        let shift = self.frame_count as u32;
        RgbImage::from_fn(self.width, self.height, |x, y| {
            let noise: u8 = rng.gen_range(0..8);
            image::Rgb([
                ((x + shift) % 256) as u8 ^ noise,
                ((y + shift / 2) % 256) as u8,
                (((x + y) / 2) % 256) as u8,
            ])
        })
    }
}

impl FrameSource for SyntheticSource {
    fn connect(&mut self) -> Result<()> {
        self.connected = true;
        log::info!(
            "SyntheticSource: connected to stub://{} ({}x{})",
            self.name,
            self.width,
            self.height
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Err(anyhow!("stub://{} not connected", self.name));
        }
        if let Some(limit) = self.fail_after {
            if self.frame_count >= limit {
                return Err(anyhow!("stub://{} dropped out after {} frames", self.name, limit));
            }
        }
        if let Some(limit) = self.frame_limit {
            if self.frame_count >= limit {
                return Ok(None);
            }
        }
        self.frame_count += 1;
        Ok(Some(Frame::new(self.render())))
    }

    fn is_healthy(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: format!("stub:{}", self.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open(spec: &str) -> Result<SyntheticSource> {
        let mut source = SyntheticSource::from_spec(spec, &SourceConfig::default())?;
        source.connect()?;
        Ok(source)
    }

    #[test]
    fn honours_size_parameters() -> Result<()> {
        let mut source = open("stub://cam?width=32&height=16")?;
        let frame = source.next_frame()?.ok_or_else(|| anyhow!("no frame"))?;
        assert_eq!((frame.width(), frame.height()), (32, 16));
        Ok(())
    }

    #[test]
    fn fail_after_reports_an_error() -> Result<()> {
        let mut source = open("stub://cam?width=4&height=4&fail_after=1")?;
        assert!(source.next_frame()?.is_some());
        assert!(source.next_frame().is_err());
        Ok(())
    }

    #[test]
    fn rejects_unknown_parameters() {
        assert!(SyntheticSource::from_spec("stub://cam?fps=3", &SourceConfig::default()).is_err());
    }
}
