//! V4L2 camera source.
//!
//! Connects to a local device node (e.g. /dev/video0), negotiates RGB3, YUYV, NV12
//! or MJPG, and converts every buffer to an RGB `Frame`. Buffer dequeues are bounded
//! by the configured frame timeout.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::{Duration, Instant};

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, SourceStats};
use crate::frame::Frame;

#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    /// Requested frame rate; 0 leaves the driver default.
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    pub frame_timeout: Duration,
}

impl Default for V4l2Config {
    fn default() -> Self {
        Self {
            device: super::WEBCAM_DEVICE.to_string(),
            target_fps: 30,
            width: 640,
            height: 480,
            frame_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum WireFormat {
    Raw(PixelFormat),
    Mjpeg,
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    wire: WireFormat,
    frame_count: u64,
    last_frame_at: Option<Instant>,
    last_error: Option<String>,
    active_width: u32,
    active_height: u32,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            wire: WireFormat::Raw(PixelFormat::Rgb24),
            frame_count: 0,
            last_frame_at: None,
            last_error: None,
        }
    }

    fn negotiate(&self, device: &mut v4l::Device) -> Result<(v4l::Format, WireFormat)> {
        use v4l::video::Capture;

        let mut last = device.format().context("read v4l2 format")?;
        for fourcc in [b"RGB3", b"YUYV", b"MJPG", b"NV12"] {
            let mut wanted = last;
            wanted.width = self.config.width;
            wanted.height = self.config.height;
            wanted.fourcc = v4l::FourCC::new(fourcc);
            match device.set_format(&wanted) {
                Ok(actual) if actual.fourcc.repr == *fourcc => {
                    let wire = if fourcc == b"MJPG" {
                        WireFormat::Mjpeg
                    } else {
                        let format = PixelFormat::from_fourcc(fourcc)
                            .ok_or_else(|| anyhow!("no converter for {:?}", fourcc))?;
                        WireFormat::Raw(format)
                    };
                    return Ok((actual, wire));
                }
                Ok(actual) => last = actual,
                Err(err) => log::debug!(
                    "V4l2Source: {} rejected {}: {}",
                    self.config.device,
                    String::from_utf8_lossy(fourcc),
                    err
                ),
            }
        }
        Err(anyhow!(
            "{} offers none of RGB3, YUYV, MJPG, NV12 (driver chose {})",
            self.config.device,
            last.fourcc
        ))
    }

    fn health_grace(&self) -> Duration {
        let base_ms = if self.config.target_fps == 0 {
            2_000
        } else {
            (1000 / self.config.target_fps).saturating_mul(6)
        };
        Duration::from_millis(base_ms.max(2_000) as u64)
    }
}

impl FrameSource for V4l2Source {
    fn connect(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let (format, wire) = self.negotiate(&mut device)?;

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        self.wire = wire;
        self.last_error = None;

        let timeout = self.config.frame_timeout;
        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .map_err(|err| anyhow::Error::new(err).context("create v4l2 buffer stream"))?;
                stream.set_timeout(timeout);
                Ok::<_, anyhow::Error>(stream)
            },
        }
        .try_build()
        .map_err(|err| {
            self.last_error = Some(err.to_string());
            err
        })?;
        self.state = Some(state);

        log::info!(
            "V4l2Source: connected to {} ({}x{} {})",
            self.config.device,
            self.active_width,
            self.active_height,
            format.fourcc
        );
        Ok(())
    }

    fn next_frame(&mut self) -> Result<Option<Frame>> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not connected")?;
        let buf = state
            .with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
            .map_err(|err| {
                self.last_error = Some(err.to_string());
                anyhow::Error::new(err).context("capture v4l2 frame")
            })?;

        let frame = match self.wire {
            WireFormat::Mjpeg => Frame::decode(&buf).map_err(anyhow::Error::new)?,
            WireFormat::Raw(format) => {
                let rgb = normalize_to_rgb(&buf, self.active_width, self.active_height, format)?;
                Frame::from_rgb(self.active_width, self.active_height, rgb)?
            }
        };

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Some(frame))
    }

    fn is_healthy(&self) -> bool {
        if self.last_error.is_some() {
            return false;
        }
        let Some(last_frame_at) = self.last_frame_at else {
            return self.state.is_some();
        };
        last_frame_at.elapsed() <= self.health_grace()
    }

    fn stats(&self) -> SourceStats {
        SourceStats {
            frames_captured: self.frame_count,
            source: "webcam".to_string(),
        }
    }
}
