//! yodavi: real-time capture, detect and publish pipeline.
//!
//! Frames flow from a single `FrameSource` through a sampling policy into an
//! inference engine. Accepted detections are filtered by a class-aware confidence
//! policy, persisted, rendered onto the frame and published to live viewers.
//!
//! # Module Structure
//!
//! - `ingest`: frame sources (synthetic, images, V4L2 cameras, video files)
//! - `detect`: engine trait, worker thread, policy-filtering adapter, backends
//! - `session`: the Idle/Running/Stopping capture state machine and upload path
//! - `store`: detection persistence and rolling statistics
//! - `publish`: latest-frame fan-out to viewers
//! - `api`: HTTP control, MJPEG stream and viewer event surface
//! - `output`: annotated video or snapshot files for batch runs

use anyhow::Result;
use std::sync::Arc;

pub mod annotate;
pub mod api;
pub mod config;
pub mod detect;
pub mod detection_log;
pub mod error;
pub mod frame;
pub mod ingest;
pub mod output;
pub mod policy;
pub mod publish;
pub mod report;
pub mod sampler;
pub mod session;
pub mod stats;
pub mod store;
pub mod ui;

pub use config::AppConfig;
pub use detect::{BoundingBox, Detection, DetectionAdapter, EngineWorker, InferenceEngine};
pub use error::{PipelineError, StoreError};
pub use frame::Frame;
pub use ingest::{open_source, FrameSource, SourceConfig};
pub use policy::ConfidencePolicy;
pub use publish::{FramePacket, Publisher, Subscription};
pub use session::{CaptureSession, SessionSettings, SessionStatus, StartOutcome, StopOutcome};
pub use stats::{AggregateStatistics, ClassStatistics};
pub use store::{DetectionStore, InMemoryDetectionStore, SqliteDetectionStore};

/// Policy seeded from the configured per-class thresholds.
pub fn build_policy(cfg: &AppConfig) -> ConfidencePolicy {
    ConfidencePolicy::new(cfg.policy.thresholds.clone(), cfg.policy.default_threshold)
}

/// Spawn the configured engine and wire a session that opens `cfg.capture.source`
/// on every start.
pub fn build_session(cfg: &AppConfig, store: Arc<dyn DetectionStore>) -> Result<Arc<CaptureSession>> {
    let worker = detect::spawn_engine(&cfg.detection)?;
    let adapter = DetectionAdapter::new(
        Arc::new(worker),
        Arc::new(build_policy(cfg)),
        cfg.detection.inference_timeout,
    );
    let source_cfg = SourceConfig::from_capture(&cfg.capture);
    Ok(CaptureSession::new(
        SessionSettings::from_config(cfg),
        adapter,
        store,
        Box::new(move || open_source(&source_cfg)),
    ))
}
