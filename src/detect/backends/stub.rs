use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Result};

use crate::detect::engine::InferenceEngine;
use crate::detect::labels::coco_class_names;
use crate::detect::result::{non_max_suppression, RawCandidate};
use crate::frame::Frame;

/// One scripted engine answer.
#[derive(Clone, Debug)]
pub enum StubResponse {
    Candidates(Vec<RawCandidate>),
    Fail(String),
    /// Sleep before answering with no candidates.
    Stall(Duration),
}

/// Scripted engine for tests, demos and model-less runs.
///
/// Responses are consumed in order; once the script runs out the last entry
/// repeats. An empty script always answers with no candidates.
pub struct StubEngine {
    class_names: Vec<String>,
    script: Vec<StubResponse>,
    cursor: usize,
    calls: Arc<AtomicUsize>,
}

impl StubEngine {
    pub fn new(class_names: Vec<String>) -> Self {
        Self {
            class_names,
            script: Vec::new(),
            cursor: 0,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Stub answering with nothing, labelled with the COCO set.
    pub fn coco() -> Self {
        Self::new(coco_class_names())
    }

    pub fn with_script(mut self, script: Vec<StubResponse>) -> Self {
        self.script = script;
        self.cursor = 0;
        self
    }

    /// Answer every frame with the same candidates.
    pub fn always(self, candidates: Vec<RawCandidate>) -> Self {
        self.with_script(vec![StubResponse::Candidates(candidates)])
    }

    /// Shared counter of `infer` invocations.
    pub fn call_counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }

    fn next_response(&mut self) -> Option<StubResponse> {
        let last = self.script.len().checked_sub(1)?;
        let idx = self.cursor.min(last);
        self.cursor = self.cursor.saturating_add(1);
        self.script.get(idx).cloned()
    }
}

impl InferenceEngine for StubEngine {
    fn name(&self) -> &'static str {
        "stub"
    }

    fn class_names(&self) -> &[String] {
        &self.class_names
    }

    fn infer(
        &mut self,
        _frame: &Frame,
        base_confidence: f32,
        iou_threshold: f32,
    ) -> Result<Vec<RawCandidate>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match self.next_response() {
            None => Ok(Vec::new()),
            Some(StubResponse::Fail(reason)) => Err(anyhow!(reason)),
            Some(StubResponse::Stall(delay)) => {
                thread::sleep(delay);
                Ok(Vec::new())
            }
            Some(StubResponse::Candidates(candidates)) => {
                let above: Vec<RawCandidate> = candidates
                    .into_iter()
                    .filter(|c| c.confidence >= base_confidence)
                    .collect();
                Ok(non_max_suppression(above, iou_threshold))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::result::BoundingBox;
    use image::RgbImage;

    fn frame() -> Frame {
        Frame::new(RgbImage::new(4, 4))
    }

    fn cand(class_id: usize, confidence: f32) -> RawCandidate {
        RawCandidate {
            class_id,
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 2.0, 2.0),
        }
    }

    #[test]
    fn script_repeats_last_entry() {
        let mut engine = StubEngine::coco().with_script(vec![
            StubResponse::Fail("boom".into()),
            StubResponse::Candidates(vec![cand(0, 0.9)]),
        ]);
        assert!(engine.infer(&frame(), 0.5, 0.4).is_err());
        assert_eq!(engine.infer(&frame(), 0.5, 0.4).unwrap().len(), 1);
        assert_eq!(engine.infer(&frame(), 0.5, 0.4).unwrap().len(), 1);
        assert_eq!(engine.call_counter().load(Ordering::SeqCst), 3);
    }

    #[test]
    fn base_confidence_prefilters_candidates() {
        let mut engine = StubEngine::coco().always(vec![cand(0, 0.9), cand(2, 0.3)]);
        let out = engine.infer(&frame(), 0.5, 0.4).unwrap();
        assert_eq!(out, vec![cand(0, 0.9)]);
    }

    #[test]
    fn empty_script_answers_nothing() {
        let mut engine = StubEngine::coco();
        assert!(engine.infer(&frame(), 0.5, 0.4).unwrap().is_empty());
    }
}
