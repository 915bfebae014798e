use anyhow::Result;

use crate::detect::result::RawCandidate;
use crate::frame::Frame;

/// Coarse engine-level pre-filters.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EngineThresholds {
    pub base_confidence: f32,
    pub iou_threshold: f32,
}

impl Default for EngineThresholds {
    fn default() -> Self {
        Self {
            base_confidence: 0.5,
            iou_threshold: 0.4,
        }
    }
}

/// External inference engine boundary.
///
/// Implementations receive a shared, read-only frame and return raw candidates
/// in their native order. Class-aware filtering happens in the adapter, not here.
pub trait InferenceEngine: Send {
    /// Engine identifier.
    fn name(&self) -> &'static str;

    /// `class_id -> class_name` lookup table.
    fn class_names(&self) -> &[String];

    /// Run inference with the engine's own confidence and IoU suppression.
    fn infer(
        &mut self,
        frame: &Frame,
        base_confidence: f32,
        iou_threshold: f32,
    ) -> Result<Vec<RawCandidate>>;

    /// Optional warm-up hook, run once on the worker thread before the first frame.
    fn warm_up(&mut self) -> Result<()> {
        Ok(())
    }
}
