use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, TrySendError};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};

use crate::detect::engine::{EngineThresholds, InferenceEngine};
use crate::detect::result::RawCandidate;
use crate::frame::Frame;

/// Jobs waiting behind the one the engine is running.
pub const DEFAULT_QUEUE_DEPTH: usize = 4;

struct Job {
    frame: Frame,
    thresholds: EngineThresholds,
    /// The caller stops waiting at this instant.
    deadline: Instant,
    reply: mpsc::SyncSender<Result<Vec<RawCandidate>>>,
}

/// Owns the inference engine on a dedicated thread.
///
/// Callers from the capture loop and the upload path queue jobs here; each call
/// waits at most `timeout` for its answer, so a wedged engine turns into a
/// failure instead of a stalled caller. The queue is bounded; a full queue
/// fails the call immediately, and jobs whose caller already gave up are
/// dropped unrun.
pub struct EngineWorker {
    name: &'static str,
    class_names: Arc<[String]>,
    jobs: Mutex<Option<mpsc::SyncSender<Job>>>,
}

impl EngineWorker {
    pub fn spawn<E: InferenceEngine + 'static>(engine: E) -> Result<Self> {
        Self::spawn_with_queue(engine, DEFAULT_QUEUE_DEPTH)
    }

    pub fn spawn_with_queue<E: InferenceEngine + 'static>(
        mut engine: E,
        queue_depth: usize,
    ) -> Result<Self> {
        let name = engine.name();
        let class_names: Arc<[String]> = engine.class_names().to_vec().into();
        let (tx, rx) = mpsc::sync_channel::<Job>(queue_depth.max(1));

        thread::Builder::new()
            .name(format!("engine-{}", name))
            .spawn(move || {
                if let Err(err) = engine.warm_up() {
                    log::warn!("engine {} warm-up failed: {}", name, err);
                }
                for job in rx {
                    if Instant::now() >= job.deadline {
                        log::debug!("engine {} skipping expired job", name);
                        continue;
                    }
                    let result = catch_unwind(AssertUnwindSafe(|| {
                        engine.infer(
                            &job.frame,
                            job.thresholds.base_confidence,
                            job.thresholds.iou_threshold,
                        )
                    }))
                    .unwrap_or_else(|_| Err(anyhow!("engine {} panicked", name)));
                    // The caller may have timed out and gone away.
                    let _ = job.reply.send(result);
                }
                log::debug!("engine {} worker exiting", name);
            })
            .context("failed to spawn engine worker")?;

        log::info!(
            "engine {} ready ({} classes)",
            name,
            class_names.len()
        );
        Ok(Self {
            name,
            class_names,
            jobs: Mutex::new(Some(tx)),
        })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    /// Run one inference, waiting at most `timeout`.
    pub fn infer(
        &self,
        frame: &Frame,
        thresholds: EngineThresholds,
        timeout: Duration,
    ) -> Result<Vec<RawCandidate>> {
        let sender = {
            let guard = self
                .jobs
                .lock()
                .map_err(|_| anyhow!("engine worker lock poisoned"))?;
            guard
                .as_ref()
                .cloned()
                .ok_or_else(|| anyhow!("engine worker shut down"))?
        };

        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job = Job {
            frame: frame.clone(),
            thresholds,
            deadline: Instant::now() + timeout,
            reply: reply_tx,
        };
        match sender.try_send(job) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(anyhow!("engine {} queue full", self.name));
            }
            Err(TrySendError::Disconnected(_)) => {
                return Err(anyhow!("engine worker stopped"));
            }
        }

        match reply_rx.recv_timeout(timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(anyhow!(
                "engine {} did not answer within {} ms",
                self.name,
                timeout.as_millis()
            )),
            Err(RecvTimeoutError::Disconnected) => {
                Err(anyhow!("engine {} dropped the request", self.name))
            }
        }
    }

    /// Close the job queue. The worker exits after its current job.
    pub fn shutdown(&self) {
        if let Ok(mut guard) = self.jobs.lock() {
            guard.take();
        }
    }
}

impl Drop for EngineWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
