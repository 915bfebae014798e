use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use yodavi::detect::{BoundingBox, DetectionAdapter, EngineWorker, RawCandidate, StubEngine, StubResponse};
use yodavi::ingest::{open_source, SourceConfig};
use yodavi::session::{LoopExit, SessionSettings, SessionStatus, StartOutcome, StopOutcome};
use yodavi::stats::{ClassMetrics, ClassStatistics};
use yodavi::{CaptureSession, ConfidencePolicy, Detection, DetectionStore, InMemoryDetectionStore, StoreError};

const DOG: usize = 16;
const WAIT: Duration = Duration::from_secs(10);

fn settings(skip_rate: u64, fps: u32) -> SessionSettings {
    let mut settings = SessionSettings::default();
    settings.skip_rate = skip_rate;
    settings.fps = fps;
    settings
}

fn session_with(
    engine: StubEngine,
    settings: SessionSettings,
    store: Arc<dyn DetectionStore>,
    spec: &str,
) -> Result<Arc<CaptureSession>> {
    let adapter = DetectionAdapter::new(
        Arc::new(EngineWorker::spawn(engine)?),
        Arc::new(ConfidencePolicy::default()),
        Duration::from_secs(2),
    );
    let mut source = SourceConfig::new(spec);
    source.width = 32;
    source.height = 24;
    Ok(CaptureSession::new(
        settings,
        adapter,
        store,
        Box::new(move || open_source(&source)),
    ))
}

fn dog(confidence: f32) -> RawCandidate {
    RawCandidate {
        class_id: DOG,
        confidence,
        bbox: BoundingBox::new(2.0, 2.0, 20.0, 18.0),
    }
}

#[test]
fn skip_rate_limits_inference_to_every_nth_frame() -> Result<()> {
    let engine = StubEngine::coco();
    let calls = engine.call_counter();
    let session = session_with(
        engine,
        settings(4, 0),
        Arc::new(InMemoryDetectionStore::new()),
        "stub://cam?frames=12",
    )?;

    assert_eq!(session.start()?, StartOutcome::Started);
    assert!(session.wait_idle(WAIT));
    assert_eq!(session.last_exit(), Some(LoopExit::Exhausted));
    assert_eq!(session.frame_counter(), 12);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    Ok(())
}

#[test]
fn accepted_detections_are_stored_logged_and_counted() -> Result<()> {
    let store = Arc::new(InMemoryDetectionStore::new());
    let session = session_with(
        StubEngine::coco().always(vec![dog(0.9)]),
        settings(2, 0),
        store.clone(),
        "stub://yard?frames=6",
    )?;

    session.start()?;
    assert!(session.wait_idle(WAIT));

    assert_eq!(store.count()?, 3);
    assert_eq!(session.total_detections(), 3);
    let log = session.recent_log(20);
    assert_eq!(log.len(), 3);
    assert!(log.iter().all(|d| d.class_name == "dog" && d.source == "stub:yard"));

    let stats = session.statistics()?;
    assert_eq!(stats.total_detections, 3);
    assert_eq!(stats.class_statistics[0].class_name, "dog");
    assert_eq!(stats.class_statistics[0].count, 3);
    Ok(())
}

#[test]
fn second_start_reports_already_running_without_resetting() -> Result<()> {
    let session = session_with(
        StubEngine::coco(),
        settings(1, 100),
        Arc::new(InMemoryDetectionStore::new()),
        "stub://cam",
    )?;

    assert_eq!(session.start()?, StartOutcome::Started);
    std::thread::sleep(Duration::from_millis(100));
    let before = session.frame_counter();
    assert!(before > 0);
    assert_eq!(session.start()?, StartOutcome::AlreadyRunning);
    assert!(session.frame_counter() >= before);
    assert_eq!(session.status(), SessionStatus::Running);

    assert_eq!(session.stop(), StopOutcome::Stopping);
    assert!(session.wait_idle(WAIT));
    assert_eq!(session.last_exit(), Some(LoopExit::Stopped));
    assert_eq!(session.stop(), StopOutcome::Idle);
    Ok(())
}

#[test]
fn repeated_inference_failures_end_the_run() -> Result<()> {
    let engine = StubEngine::coco().with_script(vec![StubResponse::Fail("gpu lost".into())]);
    let mut settings = settings(1, 0);
    settings.max_consecutive_failures = 5;
    let session = session_with(
        engine,
        settings,
        Arc::new(InMemoryDetectionStore::new()),
        "stub://cam",
    )?;

    session.start()?;
    assert!(session.wait_idle(WAIT));
    assert_eq!(session.status(), SessionStatus::Idle);
    assert_eq!(session.last_exit(), Some(LoopExit::InferenceFailures(5)));
    assert_eq!(session.frame_counter(), 5);
    Ok(())
}

#[test]
fn isolated_inference_failure_does_not_stop_the_run() -> Result<()> {
    let engine = StubEngine::coco().with_script(vec![
        StubResponse::Candidates(vec![dog(0.9)]),
        StubResponse::Fail("transient".into()),
        StubResponse::Candidates(vec![dog(0.8)]),
    ]);
    let session = session_with(
        engine,
        settings(1, 0),
        Arc::new(InMemoryDetectionStore::new()),
        "stub://cam?frames=4",
    )?;

    session.start()?;
    assert!(session.wait_idle(WAIT));
    assert_eq!(session.last_exit(), Some(LoopExit::Exhausted));
    assert_eq!(session.total_detections(), 3);
    Ok(())
}

#[test]
fn source_failure_returns_session_to_idle() -> Result<()> {
    let session = session_with(
        StubEngine::coco(),
        settings(1, 0),
        Arc::new(InMemoryDetectionStore::new()),
        "stub://cam?fail_after=3",
    )?;

    session.start()?;
    assert!(session.wait_idle(WAIT));
    assert!(matches!(session.last_exit(), Some(LoopExit::SourceFailed(_))));
    assert_eq!(session.frame_counter(), 3);

    // A fresh source is opened on restart.
    assert_eq!(session.start()?, StartOutcome::Started);
    assert!(session.wait_idle(WAIT));
    Ok(())
}

struct FailingStore;

impl DetectionStore for FailingStore {
    fn record(&self, _detections: &[Detection]) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
    }

    fn statistics_since(
        &self,
        _cutoff: DateTime<Utc>,
        _top_n: usize,
    ) -> Result<Vec<ClassStatistics>, StoreError> {
        Err(StoreError::Unavailable("disk full".into()))
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
fn store_failures_keep_the_loop_running() -> Result<()> {
    let engine = StubEngine::coco().always(vec![dog(0.9)]);
    let calls = engine.call_counter();
    let session = session_with(engine, settings(1, 0), Arc::new(FailingStore), "stub://cam?frames=8")?;

    session.start()?;
    assert!(session.wait_idle(WAIT));
    assert_eq!(session.last_exit(), Some(LoopExit::Exhausted));
    assert_eq!(calls.load(Ordering::SeqCst), 8);
    assert_eq!(session.total_detections(), 0);
    assert!(session.recent_log(20).is_empty());
    assert_eq!(session.statistics().unwrap_err().to_body().error, "store_unavailable");
    Ok(())
}

#[test]
fn viewers_receive_annotated_frames_until_shutdown() -> Result<()> {
    let session = session_with(
        StubEngine::coco().always(vec![dog(0.9)]),
        settings(1, 50),
        Arc::new(InMemoryDetectionStore::new()),
        "stub://cam",
    )?;
    let viewer = session.subscribe();
    assert_eq!(session.subscriber_count(), 1);

    session.start()?;
    let packet = viewer.recv_timeout(WAIT).expect("published frame");
    assert!(packet.annotated);
    assert!(packet.seq >= 1);
    assert!(packet.frame.starts_with(&[0xFF, 0xD8]));
    assert_eq!(packet.detections.len(), 1);
    assert!(packet.stats.is_some());

    assert!(session.shutdown(WAIT));
    assert!(viewer.is_closed());
    Ok(())
}

#[test]
fn clearing_history_resets_totals_and_log() -> Result<()> {
    let store = Arc::new(InMemoryDetectionStore::new());
    let session = session_with(
        StubEngine::coco().always(vec![dog(0.9)]),
        settings(1, 0),
        store.clone(),
        "stub://cam?frames=2",
    )?;
    session.start()?;
    assert!(session.wait_idle(WAIT));
    assert_eq!(session.total_detections(), 2);

    session.clear_log()?;
    assert_eq!(session.total_detections(), 0);
    assert!(session.recent_log(20).is_empty());
    assert_eq!(store.count()?, 0);
    assert!(session.statistics()?.class_statistics.is_empty());
    Ok(())
}
