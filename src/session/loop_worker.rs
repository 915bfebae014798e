use std::sync::atomic::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use super::{CaptureSession, LoopExit};
use crate::annotate::overlay_caption;
use crate::config::UnsampledFrames;
use crate::ingest::FrameSource;

const HEALTH_LOG_INTERVAL: Duration = Duration::from_secs(5);

/// Body of the capture thread. Owns `source` and drops it exactly once on return.
pub(super) fn run(session: &CaptureSession, mut source: Box<dyn FrameSource>) -> LoopExit {
    let settings = &session.settings;
    let label = source.stats().source;
    let mut sampler = settings.sampler();
    sampler.reset();
    let frame_interval = (settings.fps > 0).then(|| Duration::from_secs(1) / settings.fps);
    let max_failures = settings.max_consecutive_failures.max(1);

    let mut consecutive_failures = 0u32;
    let mut sampled = 0u64;
    let mut last_health_log = Instant::now();

    log::info!("capture loop running on {}", label);

    let exit = loop {
        let iteration_started = Instant::now();
        if session.stop_requested.load(Ordering::SeqCst) {
            break LoopExit::Stopped;
        }

        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => break LoopExit::Exhausted,
            Err(err) => {
                log::error!("frame source {} failed: {:#}", label, err);
                break LoopExit::SourceFailed(format!("{:#}", err));
            }
        };
        let counter = session.frame_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let frame = if settings.mirror { frame.mirrored() } else { frame };

        if sampler.should_sample(counter) {
            sampled += 1;
            let processed = session.process_frame(&frame, &label);

            if processed.output.status.is_failed() {
                consecutive_failures += 1;
                if consecutive_failures >= max_failures {
                    break LoopExit::InferenceFailures(consecutive_failures);
                }
            } else {
                consecutive_failures = 0;
            }
            if let Err(err) = &processed.stored {
                log::warn!(
                    "frame {}: {} detection(s) not persisted: {}",
                    counter,
                    processed.output.detections.len(),
                    err
                );
            }

            let rendered = if settings.caption {
                overlay_caption(&processed.annotated, &format!("Frame: {}", counter))
            } else {
                processed.annotated
            };
            let stats = if session.publisher.has_subscribers() {
                session
                    .statistics()
                    .map_err(|err| log::warn!("statistics unavailable: {}", err))
                    .ok()
            } else {
                None
            };
            session.publish_frame(&rendered, processed.output.detections, stats, counter, true);
        } else if settings.unsampled == UnsampledFrames::Forward {
            session.publish_frame(&frame, Vec::new(), None, counter, false);
        }

        if last_health_log.elapsed() >= HEALTH_LOG_INTERVAL {
            let stats = source.stats();
            log::info!(
                "capture: {} frames ({} sampled), source {} healthy={}, viewers={}",
                stats.frames_captured,
                sampled,
                stats.source,
                source.is_healthy(),
                session.publisher.subscriber_count()
            );
            last_health_log = Instant::now();
        }

        if let Some(interval) = frame_interval {
            if let Some(remaining) = interval.checked_sub(iteration_started.elapsed()) {
                thread::sleep(remaining);
            }
        }
    };

    drop(source);
    log::debug!("frame source {} released", label);
    exit
}
