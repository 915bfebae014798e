//! yodavi - batch detection over an image, a directory of images or a stream

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use yodavi::ingest::{classify, is_video_path, open_source, ImageSequenceSource, SourceConfig, SourceKind};
use yodavi::output::{open_sink, FrameSink, SnapshotSink, DEFAULT_OUTPUT_FPS};
use yodavi::report::{DetectionReport, ModelInfo};
use yodavi::sampler::{EveryNth, FrameSampler};
use yodavi::ui::{Ui, UiMode};
use yodavi::{build_session, AppConfig, CaptureSession, Frame, FrameSource, SqliteDetectionStore};

const DEFAULT_REPORT_PATH: &str = "detection_report.json";
const PROGRESS_POLL: Duration = Duration::from_millis(200);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// webcam, /dev/videoN, an image, a directory of images, a video file or stub://name.
    #[arg(long, default_value = "webcam")]
    source: String,
    /// Annotated output: an image file for a single image, a directory for a directory
    /// source, and for streams either a video file (.mp4, .avi, ...) or an image
    /// holding the last annotated frame.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Model path for file-backed engines.
    #[arg(long)]
    model: Option<PathBuf>,
    /// Inference engine (stub, tract).
    #[arg(long)]
    engine: Option<String>,
    /// Engine-level base confidence.
    #[arg(long)]
    conf: Option<f32>,
    /// Run inference on every n-th frame of a stream.
    #[arg(long)]
    skip_rate: Option<u64>,
    /// Detection database (defaults to the configured db_path).
    #[arg(long)]
    db: Option<String>,
    /// Write a JSON report; the path defaults to detection_report.json.
    #[arg(long, num_args = 0..=1, default_missing_value = DEFAULT_REPORT_PATH, value_name = "PATH")]
    report: Option<PathBuf>,
    #[arg(long, value_enum, default_value_t = UiMode::Auto)]
    ui: UiMode,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let ui = Ui::detect(args.ui);

    let cfg = {
        let _stage = ui.stage("load configuration");
        config_from_args(&args)?
    };
    let store: Arc<SqliteDetectionStore> = Arc::new(SqliteDetectionStore::open(&cfg.db_path)?);
    let session = {
        let _stage = ui.stage(&format!("start engine {}", cfg.detection.engine));
        build_session(&cfg, store.clone())?
    };

    let source = cfg.capture.source.trim().to_string();
    let found = match classify(&source)? {
        SourceKind::Images if Path::new(&source).is_file() => {
            process_image(&session, Path::new(&source), args.output.as_deref(), &ui)?
        }
        SourceKind::Images => process_directory(&session, Path::new(&source), args.output.as_deref(), &ui)?,
        SourceKind::Synthetic | SourceKind::Camera(_) | SourceKind::Video => match args.output.as_deref() {
            Some(output) if is_video_path(output) => process_recording(&session, &cfg, output, &ui)?,
            output => process_stream(&session, output, &ui)?,
        },
    };
    println!("Found {} object(s) in {}", found, source);

    let report = DetectionReport::build(
        store.as_ref(),
        ModelInfo {
            engine: cfg.detection.engine.clone(),
            model_path: (cfg.detection.engine != "stub")
                .then(|| cfg.detection.model_path.display().to_string()),
            classes: session.adapter().class_names().len(),
        },
    )?;
    println!("\n=== Detections recorded in {} ===", cfg.db_path);
    println!("Total detections: {}", report.total_detections);
    for line in report.summary_lines() {
        println!("{}", line);
    }
    if let Some(path) = &args.report {
        report.write(path)?;
        println!("Report written to {}", path.display());
    }
    Ok(())
}

fn config_from_args(args: &Args) -> Result<AppConfig> {
    let mut cfg = AppConfig::load()?;
    cfg.capture.source = args.source.clone();
    if let Some(model) = &args.model {
        cfg.detection.model_path = model.clone();
    }
    if let Some(engine) = &args.engine {
        cfg.detection.engine = engine.clone();
    }
    if let Some(conf) = args.conf {
        cfg.detection.base_confidence = conf;
    }
    if let Some(skip_rate) = args.skip_rate {
        cfg.capture.skip_rate = skip_rate;
    }
    if let Some(db) = &args.db {
        cfg.db_path = db.clone();
    }
    // Batch runs read files as fast as they decode.
    cfg.capture.fps = 0;
    cfg.validate()?;
    Ok(cfg)
}

fn process_image(session: &CaptureSession, path: &Path, output: Option<&Path>, ui: &Ui) -> Result<u64> {
    let _stage = ui.stage(&format!("detect {}", path.display()));
    let frame = Frame::open(path)?;
    let label = file_label(path);
    let still = session.process_still(&frame, &label)?;
    for det in &still.detections {
        println!("{} {:.2} {:?}", det.class_name, det.confidence, det.bbox);
    }
    if let Some(output) = output {
        still.annotated.save(output)?;
        println!("Results saved to {}", output.display());
    }
    Ok(still.detections.len() as u64)
}

fn process_directory(
    session: &CaptureSession,
    dir: &Path,
    output: Option<&Path>,
    ui: &Ui,
) -> Result<u64> {
    let mut source = ImageSequenceSource::new(dir)?;
    source.connect()?;
    if source.is_empty() {
        return Err(anyhow!("no images under {}", dir.display()));
    }
    if let Some(out_dir) = output {
        std::fs::create_dir_all(out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
    }

    let progress = ui.frames(Some(source.len() as u64));
    let mut found = 0u64;
    while let Some(frame) = source.next_frame()? {
        let name = source.current_name().unwrap_or("image").to_string();
        match session.process_still(&frame, &name) {
            Ok(still) => {
                found += still.detections.len() as u64;
                if let Some(out_dir) = output {
                    still.annotated.save(&out_dir.join(&name))?;
                }
            }
            Err(err) => log::warn!("{}: {}", name, err),
        }
        progress.tick(found);
    }
    progress.finish();
    if source.skipped() > 0 {
        println!("Skipped {} unreadable file(s)", source.skipped());
    }
    Ok(found)
}

fn process_stream(session: &Arc<CaptureSession>, output: Option<&Path>, ui: &Ui) -> Result<u64> {
    let subscription = output.map(|_| session.subscribe());
    let baseline = session.total_detections();

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    session.start()?;
    println!("Running detection. Press Ctrl-C to stop.");
    let progress = ui.frames(None);
    let mut snapshot = None;
    while !session.wait_idle(PROGRESS_POLL) {
        if rx.try_recv().is_ok() {
            session.stop();
        }
        if let Some(subscription) = &subscription {
            if let Some(packet) = subscription.try_recv().filter(|p| p.annotated) {
                snapshot = Some(packet);
            }
        }
        progress.set(
            session.frame_counter(),
            session.total_detections().saturating_sub(baseline),
        );
    }
    progress.finish();
    if let Some(packet) = subscription
        .as_ref()
        .and_then(|s| s.try_recv())
        .filter(|p| p.annotated)
    {
        snapshot = Some(packet);
    }
    session.shutdown(SHUTDOWN_TIMEOUT);

    if let Some(exit) = session.last_exit() {
        log::info!("capture ended: {:?}", exit);
    }
    println!("Processed {} frame(s)", session.frame_counter());

    if let (Some(output), Some(packet)) = (output, snapshot) {
        let mut sink = SnapshotSink::new(output);
        sink.write(&Frame::decode(&packet.frame)?)?;
        if let Some(path) = sink.finish()? {
            println!("Last annotated frame saved to {}", path.display());
        }
    }
    Ok(session.total_detections().saturating_sub(baseline))
}

/// Read the source on this thread and write every frame to `output`: sampled
/// frames annotated, the rest as captured.
fn process_recording(session: &CaptureSession, cfg: &AppConfig, output: &Path, ui: &Ui) -> Result<u64> {
    let mut source = open_source(&SourceConfig::from_capture(&cfg.capture))?;
    let label = source.stats().source;
    let mut sink = open_sink(output, source.frame_rate().unwrap_or(DEFAULT_OUTPUT_FPS))?;
    let mut sampler = EveryNth::new(cfg.capture.skip_rate);

    let stop = Arc::new(AtomicBool::new(false));
    let handler_stop = stop.clone();
    ctrlc::set_handler(move || handler_stop.store(true, Ordering::SeqCst))
        .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    println!("Recording annotated output. Press Ctrl-C to stop.");
    let progress = ui.frames(None);
    let (mut frames, mut found) = (0u64, 0u64);
    while !stop.load(Ordering::SeqCst) {
        let Some(frame) = source.next_frame()? else {
            break;
        };
        frames += 1;
        let frame = if cfg.capture.mirror { frame.mirrored() } else { frame };
        let rendered = if sampler.should_sample(frames) {
            match session.process_still(&frame, &label) {
                Ok(still) => {
                    found += still.detections.len() as u64;
                    still.annotated
                }
                Err(err) => {
                    log::warn!("frame {}: {}", frames, err);
                    frame
                }
            }
        } else {
            frame
        };
        sink.write(&rendered)?;
        progress.set(frames, found);
    }
    progress.finish();

    println!("Processed {} frame(s)", frames);
    if let Some(path) = sink.finish()? {
        println!("Annotated output saved to {}", path.display());
    }
    Ok(found)
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}
