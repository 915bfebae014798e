use anyhow::Result;
use chrono::{DateTime, Utc};
use image::{ImageFormat, RgbImage};
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use yodavi::detect::{BoundingBox, DetectionAdapter, EngineWorker, RawCandidate, StubEngine, StubResponse};
use yodavi::ingest::{open_source, SourceConfig};
use yodavi::session::SessionSettings;
use yodavi::stats::{ClassMetrics, ClassStatistics};
use yodavi::{
    CaptureSession, ConfidencePolicy, Detection, DetectionStore, InMemoryDetectionStore, SessionStatus,
    StoreError,
};

const PERSON: usize = 0;
const KNIFE: usize = 43;

fn session(engine: StubEngine, store: Arc<dyn DetectionStore>) -> Result<Arc<CaptureSession>> {
    let adapter = DetectionAdapter::new(
        Arc::new(EngineWorker::spawn(engine)?),
        Arc::new(ConfidencePolicy::new(
            [("person".to_string(), 0.7)].into_iter().collect(),
            0.6,
        )),
        Duration::from_secs(2),
    );
    let source = SourceConfig::new("stub://unused");
    Ok(CaptureSession::new(
        SessionSettings::default(),
        adapter,
        store,
        Box::new(move || open_source(&source)),
    ))
}

fn png_bytes(width: u32, height: u32) -> Vec<u8> {
    let image = RgbImage::from_pixel(width, height, image::Rgb([40, 90, 160]));
    let mut out = Cursor::new(Vec::new());
    image.write_to(&mut out, ImageFormat::Png).unwrap();
    out.into_inner()
}

fn candidate(class_id: usize, confidence: f32) -> RawCandidate {
    RawCandidate {
        class_id,
        confidence,
        bbox: BoundingBox::new(4.0, 4.0, 40.0, 30.0),
    }
}

#[test]
fn unsupported_extension_is_rejected_without_side_effects() -> Result<()> {
    let engine = StubEngine::coco().always(vec![candidate(KNIFE, 0.9)]);
    let calls = engine.call_counter();
    let store = Arc::new(InMemoryDetectionStore::new());
    let session = session(engine, store.clone())?;

    let err = session.process_upload("notes.txt", &png_bytes(8, 8)).unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    assert_eq!(store.count()?, 0);
    assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    assert!(session.recent_log(20).is_empty());
    Ok(())
}

#[test]
fn corrupt_image_is_invalid_input() -> Result<()> {
    let store = Arc::new(InMemoryDetectionStore::new());
    let session = session(StubEngine::coco(), store.clone())?;

    let err = session.process_upload("photo.jpg", b"definitely not a jpeg").unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    let err = session.process_upload("photo.jpg", &[]).unwrap_err();
    assert_eq!(err.code(), "invalid_input");
    assert_eq!(store.count()?, 0);
    Ok(())
}

#[test]
fn valid_upload_is_filtered_recorded_and_annotated() -> Result<()> {
    let store = Arc::new(InMemoryDetectionStore::new());
    let session = session(
        StubEngine::coco().always(vec![candidate(KNIFE, 0.9), candidate(PERSON, 0.65)]),
        store.clone(),
    )?;

    let result = session.process_upload("Kitchen.PNG", &png_bytes(64, 48))?;
    assert_eq!(result.count, 1);
    assert_eq!(result.detections[0].class_name, "knife");
    assert_eq!(result.detections[0].source, "Kitchen.PNG");
    assert!(result.annotated_jpeg.starts_with(&[0xFF, 0xD8]));

    assert_eq!(store.count()?, 1);
    assert_eq!(session.total_detections(), 1);
    assert_eq!(session.recent_log(20).len(), 1);
    // Uploads never touch the live capture state.
    assert_eq!(session.status(), SessionStatus::Idle);
    assert_eq!(session.frame_counter(), 0);
    Ok(())
}

#[test]
fn engine_failure_is_reported_to_the_caller() -> Result<()> {
    let store = Arc::new(InMemoryDetectionStore::new());
    let session = session(
        StubEngine::coco().with_script(vec![StubResponse::Fail("model not loaded".into())]),
        store.clone(),
    )?;

    let err = session.process_upload("frame.png", &png_bytes(16, 16)).unwrap_err();
    assert_eq!(err.code(), "inference_failure");
    assert!(err.to_string().contains("model not loaded"));
    assert_eq!(store.count()?, 0);
    Ok(())
}

struct ReadOnlyStore;

impl DetectionStore for ReadOnlyStore {
    fn record(&self, _detections: &[Detection]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("database is read-only".into()))
    }

    fn statistics_since(
        &self,
        _cutoff: DateTime<Utc>,
        _top_n: usize,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        Ok(Vec::new())
    }

    fn class_metrics(&self) -> Result<Vec<ClassMetrics>, StoreError> {
        Ok(Vec::new())
    }

    fn count(&self) -> Result<u64, StoreError> {
        Ok(0)
    }

    fn clear(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[test]
fn store_write_failure_is_reported_to_the_caller() -> Result<()> {
    let session = session(
        StubEngine::coco().always(vec![candidate(KNIFE, 0.9)]),
        Arc::new(ReadOnlyStore),
    )?;

    let err = session.process_upload("door.jpg", &png_bytes(32, 32)).unwrap_err();
    assert_eq!(err.code(), "store_write_failure");
    assert!(err.to_string().contains("read-only"));
    assert_eq!(session.total_detections(), 0);
    assert!(session.recent_log(20).is_empty());
    Ok(())
}
