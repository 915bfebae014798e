#![cfg(feature = "backend-tract")]

use std::path::Path;

use anyhow::{anyhow, Context, Result};
use image::imageops::{self, FilterType};
use tract_onnx::prelude::*;

use crate::detect::engine::InferenceEngine;
use crate::detect::result::{non_max_suppression, BoundingBox, RawCandidate};
use crate::frame::Frame;

/// YOLOv8/YOLO11 ONNX engine running on tract.
///
/// Loads a local model file; frames are resized to the model input, and boxes are
/// scaled back into the frame's pixel space.
pub struct TractEngine {
    model: TypedRunnableModel<TypedModel>,
    input_width: u32,
    input_height: u32,
    class_names: Vec<String>,
}

impl TractEngine {
    /// Load an ONNX model from disk and prepare it for inference.
    pub fn new<P: AsRef<Path>>(
        model_path: P,
        input_width: u32,
        input_height: u32,
        class_names: Vec<String>,
    ) -> Result<Self> {
        let model_path = model_path.as_ref();
        let model = tract_onnx::onnx()
            .model_for_path(model_path)
            .with_context(|| format!("failed to load ONNX model from {}", model_path.display()))?
            .with_input_fact(
                0,
                f32::fact([1, 3, input_height as usize, input_width as usize]).into(),
            )
            .context("failed to set input fact")?
            .into_optimized()
            .context("failed to optimize ONNX model")?
            .into_runnable()
            .context("failed to build runnable ONNX model")?;

        Ok(Self {
            model,
            input_width,
            input_height,
            class_names,
        })
    }

    fn build_input(&self, frame: &Frame) -> Tensor {
        let resized = imageops::resize(
            frame.image(),
            self.input_width,
            self.input_height,
            FilterType::Triangle,
        );
        tract_ndarray::Array4::from_shape_fn(
            (1, 3, self.input_height as usize, self.input_width as usize),
            |(_, channel, y, x)| resized.get_pixel(x as u32, y as u32)[channel] as f32 / 255.0,
        )
        .into_tensor()
    }

    /// Decode a `[1, 4 + classes, anchors]` head (or its transpose).
    fn decode(
        &self,
        outputs: TVec<TValue>,
        base_confidence: f32,
        sx: f32,
        sy: f32,
    ) -> Result<Vec<RawCandidate>> {
        let output = outputs
            .first()
            .ok_or_else(|| anyhow!("model produced no outputs"))?;
        let view = output
            .to_array_view::<f32>()
            .context("model output tensor was not f32")?
            .into_dimensionality::<tract_ndarray::Ix3>()
            .context("expected a rank-3 detection head")?;

        let (rows, cols) = (view.shape()[1], view.shape()[2]);
        let transposed = rows > cols;
        let (attrs, anchors) = if transposed { (cols, rows) } else { (rows, cols) };
        if attrs < 5 {
            return Err(anyhow!("detection head has only {} attributes", attrs));
        }
        let at = |attr: usize, anchor: usize| {
            if transposed {
                view[[0, anchor, attr]]
            } else {
                view[[0, attr, anchor]]
            }
        };

        let mut candidates = Vec::new();
        for anchor in 0..anchors {
            let mut best = (0usize, f32::NEG_INFINITY);
            for class_id in 0..attrs - 4 {
                let score = at(4 + class_id, anchor);
                if score > best.1 {
                    best = (class_id, score);
                }
            }
            if best.1 < base_confidence {
                continue;
            }
            let bbox = BoundingBox::from_center(
                at(0, anchor),
                at(1, anchor),
                at(2, anchor),
                at(3, anchor),
            )
            .scaled(sx, sy);
            candidates.push(RawCandidate {
                class_id: best.0,
                confidence: best.1,
                bbox,
            });
        }
        Ok(candidates)
    }
}

impl InferenceEngine for TractEngine {
    fn name(&self) -> &'static str {
        "tract"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn infer(
        &mut self,
        frame: &Frame,
        base_confidence: f32,
        iou_threshold: f32,
    ) -> Result<Vec<RawCandidate>> {
        if frame.width() == 0 || frame.height() == 0 {
            return Err(anyhow!("empty frame"));
        }
        let input = self.build_input(frame);
        let outputs = self
            .model
            .run(tvec!(input.into()))
            .context("ONNX inference failed")?;
        let sx = frame.width() as f32 / self.input_width as f32;
        let sy = frame.height() as f32 / self.input_height as f32;
        let mut candidates = self.decode(outputs, base_confidence, sx, sy)?;
        candidates.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        Ok(non_max_suppression(candidates, iou_threshold))
    }

    fn warm_up(&mut self) -> Result<()> {
        let blank = Frame::new(image::RgbImage::new(self.input_width, self.input_height));
        self.infer(&blank, 1.0, 0.5).map(|_| ())
    }
}
