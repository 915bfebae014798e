//! JSON detection report for batch runs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::StoreError;
use crate::stats::ClassMetrics;
use crate::store::DetectionStore;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub engine: String,
    pub model_path: Option<String>,
    pub classes: usize,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DetectionReport {
    pub generated_at: DateTime<Utc>,
    pub model: ModelInfo,
    pub total_detections: u64,
    /// Most frequent class first.
    pub classes: Vec<ClassMetrics>,
}

impl DetectionReport {
    pub fn build(store: &dyn DetectionStore, model: ModelInfo) -> Result<Self, StoreError> {
        let classes = store.class_metrics()?;
        let total_detections = store.count()?;
        Ok(Self {
            generated_at: Utc::now(),
            model,
            total_detections,
            classes,
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .with_context(|| format!("failed to write report {}", path.display()))?;
        Ok(())
    }

    /// One line per class: `name: count (avg 0.873)`.
    pub fn summary_lines(&self) -> Vec<String> {
        self.classes
            .iter()
            .map(|m| format!("{}: {} (avg {:.3})", m.class_name, m.count, m.avg_confidence))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BoundingBox, Detection};
    use crate::store::InMemoryDetectionStore;

    fn det(class: &str, confidence: f32) -> Detection {
        Detection {
            class_name: class.to_string(),
            confidence,
            bbox: BoundingBox::new(0.0, 0.0, 10.0, 10.0),
            timestamp: Utc::now(),
            source: "test".to_string(),
        }
    }

    fn model() -> ModelInfo {
        ModelInfo {
            engine: "stub".to_string(),
            model_path: None,
            classes: 80,
        }
    }

    #[test]
    fn report_collects_lifetime_metrics() {
        let store = InMemoryDetectionStore::new();
        store
            .record(&[det("dog", 0.9), det("dog", 0.7), det("knife", 0.8)])
            .unwrap();

        let report = DetectionReport::build(&store, model()).unwrap();
        assert_eq!(report.total_detections, 3);
        assert_eq!(report.classes[0].class_name, "dog");
        assert_eq!(report.classes[0].count, 2);
        assert!((report.classes[0].max_confidence - 0.9).abs() < 1e-6);
        assert!((report.classes[0].min_confidence - 0.7).abs() < 1e-6);
        assert_eq!(report.summary_lines()[1], "knife: 1 (avg 0.800)");
    }

    #[test]
    fn report_writes_pretty_json() {
        let store = InMemoryDetectionStore::new();
        store.record(&[det("cat", 0.75)]).unwrap();
        let report = DetectionReport::build(&store, model()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("report.json");
        report.write(&path).unwrap();

        let value: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(value["total_detections"], 1);
        assert_eq!(value["classes"][0]["class"], "cat");
        assert_eq!(value["model"]["engine"], "stub");
    }
}
