use std::sync::Arc;
use std::time::Duration;

use crate::detect::engine::EngineThresholds;
use crate::detect::result::{Detection, RawCandidate};
use crate::detect::worker::EngineWorker;
use crate::frame::Frame;
use crate::policy::{ConfidencePolicy, PolicyTable};

/// Out-of-band engine status for one frame.
#[derive(Clone, Debug, PartialEq)]
pub enum InferenceStatus {
    Ok,
    Failed(String),
}

impl InferenceStatus {
    pub fn is_failed(&self) -> bool {
        matches!(self, InferenceStatus::Failed(_))
    }
}

#[derive(Clone, Debug)]
pub struct AdapterOutput {
    pub detections: Vec<Detection>,
    pub status: InferenceStatus,
}

/// Wraps the engine worker and applies the class-aware confidence policy.
#[derive(Clone)]
pub struct DetectionAdapter {
    worker: Arc<EngineWorker>,
    policy: Arc<ConfidencePolicy>,
    timeout: Duration,
}

impl DetectionAdapter {
    pub fn new(worker: Arc<EngineWorker>, policy: Arc<ConfidencePolicy>, timeout: Duration) -> Self {
        Self {
            worker,
            policy,
            timeout,
        }
    }

    pub fn engine_name(&self) -> &'static str {
        self.worker.name()
    }

    pub fn class_names(&self) -> &[String] {
        self.worker.class_names()
    }

    pub fn policy(&self) -> &Arc<ConfidencePolicy> {
        &self.policy
    }

    /// Detect objects in `frame`. Engine errors are reported through `status`,
    /// never returned.
    pub fn detect(&self, frame: &Frame, thresholds: EngineThresholds, source: &str) -> AdapterOutput {
        match self.worker.infer(frame, thresholds, self.timeout) {
            Ok(candidates) => {
                let table = self.policy.snapshot();
                AdapterOutput {
                    detections: filter_candidates(
                        candidates,
                        self.worker.class_names(),
                        &table,
                        frame,
                        source,
                    ),
                    status: InferenceStatus::Ok,
                }
            }
            Err(err) => {
                log::warn!("inference failed for {}: {:#}", source, err);
                AdapterOutput {
                    detections: Vec::new(),
                    status: InferenceStatus::Failed(format!("{:#}", err)),
                }
            }
        }
    }
}

/// Map raw candidates to named detections, dropping those below their class threshold.
pub fn filter_candidates(
    candidates: Vec<RawCandidate>,
    class_names: &[String],
    table: &PolicyTable,
    frame: &Frame,
    source: &str,
) -> Vec<Detection> {
    candidates
        .into_iter()
        .filter_map(|cand| {
            let class_name = class_names
                .get(cand.class_id)
                .cloned()
                .unwrap_or_else(|| format!("class_{}", cand.class_id));
            if cand.confidence < table.threshold(&class_name) {
                return None;
            }
            Some(Detection {
                class_name,
                confidence: cand.confidence,
                bbox: cand.bbox,
                timestamp: frame.captured_at(),
                source: source.to_string(),
            })
        })
        .collect()
}
