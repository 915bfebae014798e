//! Capture session: the single shared Idle -> Running -> Stopping -> Idle state machine.
//!
//! A session owns everything one pipeline run needs (adapter, store, detection log,
//! publisher) and is always handled through an explicitly constructed
//! `Arc<CaptureSession>`. Control calls hold the state mutex only briefly; the
//! capture loop runs on its own thread and owns the frame source until it exits.

mod loop_worker;
mod processor;

use serde::Serialize;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::{AppConfig, StatsSettings, UnsampledFrames, UploadSettings};
use crate::detect::{Detection, DetectionAdapter, EngineThresholds};
use crate::detection_log::DetectionLog;
use crate::error::{PipelineError, StoreError};
use crate::ingest::FrameSource;
use crate::publish::{Publisher, Subscription};
use crate::sampler::{EveryNth, FrameSampler, IntervalSampler};
use crate::stats::AggregateStatistics;
use crate::store::DetectionStore;

pub use processor::{StillResult, UploadResult};

/// Opens a fresh, connected frame source for each run.
pub type SourceFactory = Box<dyn Fn() -> anyhow::Result<Box<dyn FrameSource>> + Send + Sync>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Idle,
    Running,
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartOutcome {
    Started,
    AlreadyRunning,
    /// The previous run has not finished shutting down yet.
    Stopping,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    Stopping,
    /// Nothing was running.
    Idle,
}

/// Why the last capture loop ended.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum LoopExit {
    Stopped,
    Exhausted,
    SourceFailed(String),
    InferenceFailures(u32),
    Panicked(String),
}

/// Per-session pipeline knobs.
#[derive(Clone, Debug)]
pub struct SessionSettings {
    pub skip_rate: u64,
    pub sample_interval: Option<Duration>,
    pub mirror: bool,
    pub caption: bool,
    pub unsampled: UnsampledFrames,
    /// 0 leaves the loop unpaced.
    pub fps: u32,
    pub thresholds: EngineThresholds,
    pub max_consecutive_failures: u32,
    pub stats: StatsSettings,
    pub jpeg_quality: u8,
    pub upload: UploadSettings,
}

impl SessionSettings {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            skip_rate: cfg.capture.skip_rate,
            sample_interval: cfg.capture.sample_interval,
            mirror: cfg.capture.mirror,
            caption: cfg.capture.caption,
            unsampled: cfg.capture.unsampled,
            fps: cfg.capture.fps,
            thresholds: cfg.detection.thresholds(),
            max_consecutive_failures: cfg.detection.max_consecutive_failures,
            stats: cfg.stats.clone(),
            jpeg_quality: cfg.stream.jpeg_quality,
            upload: cfg.upload.clone(),
        }
    }

    fn sampler(&self) -> Box<dyn FrameSampler> {
        match self.sample_interval {
            Some(interval) => Box::new(IntervalSampler::new(interval)),
            None => Box::new(EveryNth::new(self.skip_rate)),
        }
    }
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

struct SessionState {
    status: SessionStatus,
    worker: Option<JoinHandle<()>>,
    last_exit: Option<LoopExit>,
}

pub struct CaptureSession {
    settings: SessionSettings,
    adapter: DetectionAdapter,
    store: Arc<dyn DetectionStore>,
    log: DetectionLog,
    publisher: Publisher,
    source_factory: SourceFactory,
    state: Mutex<SessionState>,
    idle: Condvar,
    stop_requested: AtomicBool,
    frame_counter: AtomicU64,
    total_detections: AtomicU64,
    created_at: Instant,
}

impl CaptureSession {
    pub fn new(
        settings: SessionSettings,
        adapter: DetectionAdapter,
        store: Arc<dyn DetectionStore>,
        source_factory: SourceFactory,
    ) -> Arc<Self> {
        let total = store.count().unwrap_or_else(|err| {
            log::warn!("could not read stored detection count: {}", err);
            0
        });
        Arc::new(Self {
            log: DetectionLog::new(settings.stats.log_capacity),
            settings,
            adapter,
            store,
            publisher: Publisher::new(),
            source_factory,
            state: Mutex::new(SessionState {
                status: SessionStatus::Idle,
                worker: None,
                last_exit: None,
            }),
            idle: Condvar::new(),
            stop_requested: AtomicBool::new(false),
            frame_counter: AtomicU64::new(0),
            total_detections: AtomicU64::new(total),
            created_at: Instant::now(),
        })
    }

    fn lock_state(&self) -> MutexGuard<'_, SessionState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn settings(&self) -> &SessionSettings {
        &self.settings
    }

    pub fn adapter(&self) -> &DetectionAdapter {
        &self.adapter
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == SessionStatus::Running
    }

    /// Frames acquired by the current (or last) run.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter.load(Ordering::SeqCst)
    }

    pub fn total_detections(&self) -> u64 {
        self.total_detections.load(Ordering::SeqCst)
    }

    pub fn last_exit(&self) -> Option<LoopExit> {
        self.lock_state().last_exit.clone()
    }

    pub fn subscriber_count(&self) -> usize {
        self.publisher.subscriber_count()
    }

    /// Acquire the source and spawn the capture loop.
    ///
    /// A failing source leaves the session Idle and reports `SourceUnavailable`.
    pub fn start(self: &Arc<Self>) -> Result<StartOutcome, PipelineError> {
        let mut state = self.lock_state();
        match state.status {
            SessionStatus::Running => return Ok(StartOutcome::AlreadyRunning),
            SessionStatus::Stopping => return Ok(StartOutcome::Stopping),
            SessionStatus::Idle => {}
        }

        let source = (self.source_factory)().map_err(|err| {
            log::warn!("capture start failed: {:#}", err);
            PipelineError::SourceUnavailable(format!("{:#}", err))
        })?;

        self.stop_requested.store(false, Ordering::SeqCst);
        self.frame_counter.store(0, Ordering::SeqCst);
        state.last_exit = None;

        let session = Arc::clone(self);
        let worker = thread::Builder::new()
            .name("capture-loop".to_string())
            .spawn(move || session.run(source))
            .map_err(|err| {
                PipelineError::SourceUnavailable(format!("failed to spawn capture loop: {}", err))
            })?;

        // A finished previous loop is detached; it no longer touches the session.
        state.worker = Some(worker);
        state.status = SessionStatus::Running;
        log::info!("capture session started");
        Ok(StartOutcome::Started)
    }

    /// Request the loop to stop at its next iteration boundary. Does not wait.
    pub fn stop(&self) -> StopOutcome {
        let mut state = self.lock_state();
        match state.status {
            SessionStatus::Idle => StopOutcome::Idle,
            SessionStatus::Stopping => StopOutcome::Stopping,
            SessionStatus::Running => {
                self.stop_requested.store(true, Ordering::SeqCst);
                state.status = SessionStatus::Stopping;
                log::info!("capture session stopping");
                StopOutcome::Stopping
            }
        }
    }

    /// Block until the session is Idle or `timeout` elapses. True when Idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        let state = self.lock_state();
        let result = self
            .idle
            .wait_timeout_while(state, timeout, |s| s.status != SessionStatus::Idle);
        match result {
            Ok((state, _)) => state.status == SessionStatus::Idle,
            Err(poisoned) => poisoned.into_inner().0.status == SessionStatus::Idle,
        }
    }

    /// Stop, wait for the loop to exit and close every viewer.
    pub fn shutdown(&self, timeout: Duration) -> bool {
        self.stop();
        let idle = self.wait_idle(timeout);
        if idle {
            let worker = self.lock_state().worker.take();
            if let Some(worker) = worker {
                if worker.join().is_err() {
                    log::warn!("capture loop thread panicked during shutdown");
                }
            }
        } else {
            log::warn!("capture loop did not stop within {:?}", timeout);
        }
        self.publisher.close_all();
        idle
    }

    pub fn subscribe(&self) -> Subscription {
        self.publisher.subscribe()
    }

    /// Rolling per-class statistics plus lifetime totals.
    pub fn statistics(&self) -> Result<AggregateStatistics, StoreError> {
        let classes = self
            .store
            .statistics(self.settings.stats.window_minutes, self.settings.stats.top_n)?;
        Ok(AggregateStatistics::new(
            classes,
            self.total_detections(),
            self.created_at.elapsed(),
        ))
    }

    pub fn recent_log(&self, n: usize) -> Vec<Detection> {
        self.log.recent(n)
    }

    /// Delete stored detections, reset the lifetime total and empty the log.
    pub fn clear_log(&self) -> Result<(), StoreError> {
        self.store.clear()?;
        self.total_detections.store(0, Ordering::SeqCst);
        self.log.clear();
        log::info!("detection history cleared");
        Ok(())
    }

    fn run(self: Arc<Self>, source: Box<dyn FrameSource>) {
        let exit = catch_unwind(AssertUnwindSafe(|| loop_worker::run(&self, source)))
            .unwrap_or_else(|panic| {
                let detail = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                LoopExit::Panicked(detail)
            });

        match &exit {
            LoopExit::Stopped | LoopExit::Exhausted => {
                log::info!("capture loop ended: {:?}", exit)
            }
            _ => log::error!("capture loop ended: {:?}", exit),
        }

        let mut state = self.lock_state();
        state.status = SessionStatus::Idle;
        state.last_exit = Some(exit);
        self.idle.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{EngineWorker, StubEngine};
    use crate::ingest::{open_source, SourceConfig};
    use crate::policy::ConfidencePolicy;
    use crate::store::InMemoryDetectionStore;

    fn session(spec: &'static str) -> Arc<CaptureSession> {
        let worker = Arc::new(EngineWorker::spawn(StubEngine::coco()).unwrap());
        let adapter = DetectionAdapter::new(
            worker,
            Arc::new(ConfidencePolicy::default()),
            Duration::from_secs(2),
        );
        let mut settings = SessionSettings::default();
        settings.fps = 200;
        let mut source = SourceConfig::new(spec);
        source.width = 16;
        source.height = 16;
        CaptureSession::new(
            settings,
            adapter,
            Arc::new(InMemoryDetectionStore::new()),
            Box::new(move || open_source(&source)),
        )
    }

    #[test]
    fn stop_while_idle_is_a_no_op() {
        let session = session("stub://cam");
        assert_eq!(session.stop(), StopOutcome::Idle);
        assert_eq!(session.stop(), StopOutcome::Idle);
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn failed_source_leaves_session_idle() {
        let session = session("rtsp://nowhere/stream");
        let err = session.start().unwrap_err();
        assert_eq!(err.code(), "source_unavailable");
        assert_eq!(session.status(), SessionStatus::Idle);
    }

    #[test]
    fn start_stop_cycle_returns_to_idle() {
        let session = session("stub://cam");
        assert_eq!(session.start().unwrap(), StartOutcome::Started);
        assert_eq!(session.stop(), StopOutcome::Stopping);
        assert!(session.wait_idle(Duration::from_secs(5)));
        assert_eq!(session.last_exit(), Some(LoopExit::Stopped));
        assert_eq!(session.start().unwrap(), StartOutcome::Started);
        assert!(session.shutdown(Duration::from_secs(5)));
    }

    #[test]
    fn loop_exit_serializes_with_reason_tag() {
        let json = serde_json::to_value(LoopExit::InferenceFailures(5)).unwrap();
        assert_eq!(json["reason"], "inference_failures");
        assert_eq!(json["detail"], 5);
        let json = serde_json::to_value(StartOutcome::AlreadyRunning).unwrap();
        assert_eq!(json, "already_running");
    }
}
