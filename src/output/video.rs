//! MPEG-4 video writer on FFmpeg. The encoder opens on the first frame, sized
//! to it; later frames of a different size are resized to match.

use anyhow::{anyhow, Context, Result};
use ffmpeg_next as ffmpeg;
use ffmpeg::util::format::pixel::Pixel;
use ffmpeg::{codec, encoder, format, software::scaling, Packet, Rational};
use image::imageops::{self, FilterType};
use image::RgbImage;
use std::path::{Path, PathBuf};

use super::FrameSink;
use crate::frame::Frame;

pub struct VideoSink {
    path: PathBuf,
    fps: i32,
    encoding: Option<Encoding>,
    frames: u64,
}

struct Encoding {
    output: format::context::Output,
    encoder: encoder::Video,
    scaler: scaling::Context,
    stream_index: usize,
    encoder_time_base: Rational,
    stream_time_base: Rational,
    width: u32,
    height: u32,
    next_pts: i64,
}

impl VideoSink {
    pub fn new(path: &Path, fps: f64) -> Self {
        let fps = if fps.is_finite() { fps.round().clamp(1.0, 240.0) as i32 } else { 30 };
        Self {
            path: path.to_path_buf(),
            fps,
            encoding: None,
            frames: 0,
        }
    }
}

impl FrameSink for VideoSink {
    fn write(&mut self, frame: &Frame) -> Result<()> {
        if self.encoding.is_none() {
            self.encoding = Some(Encoding::open(&self.path, frame.width(), frame.height(), self.fps)?);
        }
        let encoding = self
            .encoding
            .as_mut()
            .ok_or_else(|| anyhow!("video encoder not open"))?;
        encoding.push(frame.image())?;
        self.frames += 1;
        Ok(())
    }

    fn finish(&mut self) -> Result<Option<PathBuf>> {
        let Some(mut encoding) = self.encoding.take() else {
            return Ok(None);
        };
        encoding.close()?;
        log::info!("wrote {} frame(s) to {}", self.frames, self.path.display());
        Ok(Some(self.path.clone()))
    }
}

impl Encoding {
    fn open(path: &Path, width: u32, height: u32, fps: i32) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;
        // 4:2:0 chroma needs even dimensions.
        let width = (width & !1).max(2);
        let height = (height & !1).max(2);

        let mut output = format::output(&path)
            .with_context(|| format!("failed to create video '{}'", path.display()))?;
        let global_header = output.format().flags().contains(format::Flags::GLOBAL_HEADER);
        let codec = encoder::find(codec::Id::MPEG4)
            .ok_or_else(|| anyhow!("ffmpeg was built without an MPEG-4 encoder"))?;
        let time_base = Rational::new(1, fps);

        let mut video = codec::context::Context::new_with_codec(codec)
            .encoder()
            .video()
            .context("create video encoder")?;
        video.set_width(width);
        video.set_height(height);
        video.set_format(Pixel::YUV420P);
        video.set_time_base(time_base);
        video.set_frame_rate(Some(Rational::new(fps, 1)));
        if global_header {
            video.set_flags(codec::Flags::GLOBAL_HEADER);
        }
        let encoder = video.open_as(codec).context("open MPEG-4 encoder")?;

        let stream_index = {
            let mut stream = output.add_stream(codec).context("add video stream")?;
            stream.set_parameters(&encoder);
            stream.set_time_base(time_base);
            stream.index()
        };
        output.write_header().context("write video header")?;
        let stream_time_base = output
            .stream(stream_index)
            .map(|stream| stream.time_base())
            .ok_or_else(|| anyhow!("video stream vanished after header"))?;

        let scaler = scaling::Context::get(
            Pixel::RGB24,
            width,
            height,
            Pixel::YUV420P,
            width,
            height,
            scaling::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("encoding {}x{} @ {} fps to {}", width, height, fps, path.display());
        Ok(Self {
            output,
            encoder,
            scaler,
            stream_index,
            encoder_time_base: time_base,
            stream_time_base,
            width,
            height,
            next_pts: 0,
        })
    }

    fn push(&mut self, image: &RgbImage) -> Result<()> {
        let resized;
        let image = if image.dimensions() == (self.width, self.height) {
            image
        } else {
            resized = imageops::resize(image, self.width, self.height, FilterType::Triangle);
            &resized
        };

        let mut rgb = ffmpeg::frame::Video::new(Pixel::RGB24, self.width, self.height);
        let stride = rgb.stride(0);
        let row_bytes = self.width as usize * 3;
        let plane = rgb.data_mut(0);
        for (row, pixels) in image.as_raw().chunks_exact(row_bytes).enumerate() {
            let start = row * stride;
            plane
                .get_mut(start..start + row_bytes)
                .context("ffmpeg frame is smaller than its dimensions")?
                .copy_from_slice(pixels);
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        self.scaler.run(&rgb, &mut yuv).context("convert frame to YUV")?;
        yuv.set_pts(Some(self.next_pts));
        self.next_pts += 1;
        self.encoder.send_frame(&yuv).context("send frame to encoder")?;
        self.drain()
    }

    fn drain(&mut self) -> Result<()> {
        let mut packet = Packet::empty();
        while self.encoder.receive_packet(&mut packet).is_ok() {
            packet.set_stream(self.stream_index);
            packet.rescale_ts(self.encoder_time_base, self.stream_time_base);
            packet
                .write_interleaved(&mut self.output)
                .context("write video packet")?;
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.encoder.send_eof().context("flush encoder")?;
        self.drain()?;
        self.output.write_trailer().context("write video trailer")?;
        Ok(())
    }
}
