mod adapter;
pub mod backends;
mod engine;
pub mod labels;
mod result;
mod worker;

use anyhow::{anyhow, Result};

pub use adapter::{filter_candidates, AdapterOutput, DetectionAdapter, InferenceStatus};
pub use backends::{StubEngine, StubResponse};
pub use engine::{EngineThresholds, InferenceEngine};
pub use result::{non_max_suppression, BoundingBox, Detection, RawCandidate};
pub use worker::EngineWorker;

pub(crate) use result::round3;

use crate::config::DetectionSettings;

/// Engines compiled into this build.
pub fn available_engines() -> Vec<&'static str> {
    let mut engines = vec!["stub"];
    if cfg!(feature = "backend-tract") {
        engines.push("tract");
    }
    engines
}

/// Build the configured engine and start its worker thread.
pub fn spawn_engine(settings: &DetectionSettings) -> Result<EngineWorker> {
    let class_names = match settings.labels_path.as_deref() {
        Some(path) => labels::load_class_names(path)?,
        None => labels::coco_class_names(),
    };
    match settings.engine.as_str() {
        "stub" => EngineWorker::spawn(StubEngine::new(class_names)),
        #[cfg(feature = "backend-tract")]
        "tract" => EngineWorker::spawn(backends::TractEngine::new(
            &settings.model_path,
            settings.input_width,
            settings.input_height,
            class_names,
        )?),
        other => Err(anyhow!(
            "engine {:?} is not available (built with: {})",
            other,
            available_engines().join(", ")
        )),
    }
}
