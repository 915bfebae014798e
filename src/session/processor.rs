//! Per-frame work shared by the capture loop and the upload path.

use serde::Serialize;
use std::sync::atomic::Ordering;

use super::CaptureSession;
use crate::annotate::annotate;
use crate::detect::{AdapterOutput, Detection, InferenceStatus};
use crate::error::{PipelineError, StoreError};
use crate::frame::Frame;
use crate::publish::FramePacket;
use crate::stats::AggregateStatistics;

pub(super) struct ProcessedFrame {
    pub output: AdapterOutput,
    pub stored: Result<(), StoreError>,
    pub annotated: Frame,
}

/// Detections and rendered output for one still image.
#[derive(Clone, Debug)]
pub struct StillResult {
    pub detections: Vec<Detection>,
    pub annotated: Frame,
}

/// Result of a synchronous upload.
#[derive(Clone, Debug, Serialize)]
pub struct UploadResult {
    /// Annotated JPEG.
    #[serde(skip)]
    pub annotated_jpeg: Vec<u8>,
    pub detections: Vec<Detection>,
    pub count: usize,
}

impl CaptureSession {
    /// Detect, persist, log and annotate one frame.
    pub(super) fn process_frame(&self, frame: &Frame, source: &str) -> ProcessedFrame {
        let output = self.adapter.detect(frame, self.settings.thresholds, source);

        let stored = if output.detections.is_empty() {
            Ok(())
        } else {
            match self.store.record(&output.detections) {
                Ok(()) => {
                    self.total_detections
                        .fetch_add(output.detections.len() as u64, Ordering::SeqCst);
                    self.log.extend(&output.detections);
                    Ok(())
                }
                Err(err) => Err(err),
            }
        };

        let annotated = annotate(frame, &output.detections);
        ProcessedFrame {
            output,
            stored,
            annotated,
        }
    }

    /// Run one uploaded image through detection, persistence and annotation on the
    /// caller's thread. Validation failures touch nothing.
    pub fn process_upload(&self, filename: &str, bytes: &[u8]) -> Result<UploadResult, PipelineError> {
        let filename = filename.trim();
        if filename.is_empty() {
            return Err(PipelineError::InvalidInput("missing file name".into()));
        }
        if !self.settings.upload.accepts(filename) {
            return Err(PipelineError::InvalidInput(format!(
                "unsupported file type for {:?} (allowed: {})",
                filename,
                self.settings.upload.extensions.join(", ")
            )));
        }
        if bytes.is_empty() {
            return Err(PipelineError::InvalidInput("empty upload".into()));
        }
        if bytes.len() > self.settings.upload.max_bytes {
            return Err(PipelineError::InvalidInput(format!(
                "upload of {} bytes exceeds the {} byte limit",
                bytes.len(),
                self.settings.upload.max_bytes
            )));
        }
        let frame = Frame::decode(bytes)?;
        let still = self.process_still(&frame, filename)?;

        let annotated_jpeg = still
            .annotated
            .encode_jpeg(self.settings.jpeg_quality)
            .map_err(|err| PipelineError::InvalidInput(format!("could not encode result: {:#}", err)))?;
        let count = still.detections.len();
        log::info!("upload {}: {} detection(s)", filename, count);
        Ok(UploadResult {
            annotated_jpeg,
            detections: still.detections,
            count,
        })
    }

    /// Detect, persist and annotate one decoded image on the caller's thread.
    /// Unlike the capture loop, engine and store failures are returned.
    pub fn process_still(&self, frame: &Frame, source: &str) -> Result<StillResult, PipelineError> {
        let processed = self.process_frame(frame, source);
        if let InferenceStatus::Failed(reason) = processed.output.status {
            return Err(PipelineError::InferenceFailure(reason));
        }
        processed.stored?;
        Ok(StillResult {
            detections: processed.output.detections,
            annotated: processed.annotated,
        })
    }

    /// Encode and broadcast a frame if anyone is watching.
    pub(super) fn publish_frame(
        &self,
        frame: &Frame,
        detections: Vec<Detection>,
        stats: Option<AggregateStatistics>,
        seq: u64,
        annotated: bool,
    ) {
        if !self.publisher.has_subscribers() {
            return;
        }
        match frame.encode_jpeg(self.settings.jpeg_quality) {
            Ok(jpeg) => self.publisher.emit(FramePacket {
                frame: jpeg,
                detections,
                stats,
                seq,
                annotated,
            }),
            Err(err) => log::warn!("frame {} not published: {:#}", seq, err),
        }
    }
}
