use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::detect::EngineThresholds;
use crate::error::PipelineError;

const DEFAULT_DB_PATH: &str = "yodavi_detections.db";
const DEFAULT_API_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_SOURCE: &str = "webcam";
const DEFAULT_WIDTH: u32 = 640;
const DEFAULT_HEIGHT: u32 = 480;
const DEFAULT_FPS: u32 = 30;
const DEFAULT_SKIP_RATE: u64 = 4;
const DEFAULT_FRAME_TIMEOUT_MS: u64 = 2_000;
const DEFAULT_ENGINE: &str = "stub";
const DEFAULT_MODEL_PATH: &str = "yolo11n.onnx";
const DEFAULT_MODEL_INPUT: u32 = 640;
const DEFAULT_BASE_CONFIDENCE: f32 = 0.5;
const DEFAULT_IOU_THRESHOLD: f32 = 0.4;
const DEFAULT_INFERENCE_TIMEOUT_MS: u64 = 5_000;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
const DEFAULT_STATS_WINDOW_MINUTES: u32 = 10;
const DEFAULT_STATS_TOP_N: usize = 5;
const DEFAULT_LOG_CAPACITY: usize = 50;
const DEFAULT_LOG_PAGE: usize = 20;
const DEFAULT_JPEG_QUALITY: u8 = 80;
const DEFAULT_MAX_UPLOAD_BYTES: usize = 10 * 1024 * 1024;
const DEFAULT_UPLOAD_EXTENSIONS: &[&str] = &["jpg", "jpeg", "png", "bmp"];

/// Per-class acceptance thresholds shipped with the stock COCO model.
pub const DEFAULT_CLASS_THRESHOLDS: &[(&str, f32)] = &[
    ("person", 0.7),
    ("car", 0.8),
    ("truck", 0.8),
    ("bus", 0.8),
    ("motorcycle", 0.7),
    ("bicycle", 0.6),
    ("knife", 0.5),
    ("gun", 0.5),
];

#[derive(Debug, Deserialize, Default)]
struct AppConfigFile {
    db_path: Option<String>,
    api: Option<ApiConfigFile>,
    capture: Option<CaptureConfigFile>,
    detection: Option<DetectionConfigFile>,
    policy: Option<PolicyConfigFile>,
    stats: Option<StatsConfigFile>,
    stream: Option<StreamConfigFile>,
    upload: Option<UploadConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct ApiConfigFile {
    addr: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct CaptureConfigFile {
    source: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    fps: Option<u32>,
    skip_rate: Option<u64>,
    sample_interval_ms: Option<u64>,
    mirror: Option<bool>,
    caption: Option<bool>,
    autostart: Option<bool>,
    unsampled: Option<UnsampledFrames>,
    frame_timeout_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct DetectionConfigFile {
    engine: Option<String>,
    model_path: Option<PathBuf>,
    labels_path: Option<PathBuf>,
    input_width: Option<u32>,
    input_height: Option<u32>,
    base_confidence: Option<f32>,
    iou_threshold: Option<f32>,
    inference_timeout_ms: Option<u64>,
    max_consecutive_failures: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
struct PolicyConfigFile {
    default_threshold: Option<f32>,
    thresholds: Option<HashMap<String, f32>>,
}

#[derive(Debug, Deserialize, Default)]
struct StatsConfigFile {
    window_minutes: Option<u32>,
    top_n: Option<usize>,
    log_capacity: Option<usize>,
    log_page: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct StreamConfigFile {
    jpeg_quality: Option<u8>,
}

#[derive(Debug, Deserialize, Default)]
struct UploadConfigFile {
    max_bytes: Option<usize>,
    extensions: Option<Vec<String>>,
}

/// What the loop does with frames the sampler skips.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnsampledFrames {
    /// Publish the raw frame without detections or statistics.
    #[default]
    Forward,
    Drop,
}

impl FromStr for UnsampledFrames {
    type Err = anyhow::Error;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "forward" => Ok(UnsampledFrames::Forward),
            "drop" => Ok(UnsampledFrames::Drop),
            other => Err(anyhow!("unknown unsampled frame mode {:?}", other)),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_path: String,
    pub api_addr: String,
    pub capture: CaptureSettings,
    pub detection: DetectionSettings,
    pub policy: PolicySettings,
    pub stats: StatsSettings,
    pub stream: StreamSettings,
    pub upload: UploadSettings,
}

#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub source: String,
    pub width: u32,
    pub height: u32,
    /// Loop pacing; 0 runs as fast as the source delivers.
    pub fps: u32,
    pub skip_rate: u64,
    /// Time-based sampling instead of every n-th frame when set.
    pub sample_interval: Option<Duration>,
    pub mirror: bool,
    pub caption: bool,
    pub autostart: bool,
    pub unsampled: UnsampledFrames,
    pub frame_timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct DetectionSettings {
    pub engine: String,
    pub model_path: PathBuf,
    pub labels_path: Option<PathBuf>,
    pub input_width: u32,
    pub input_height: u32,
    pub base_confidence: f32,
    pub iou_threshold: f32,
    pub inference_timeout: Duration,
    pub max_consecutive_failures: u32,
}

impl DetectionSettings {
    pub fn thresholds(&self) -> EngineThresholds {
        EngineThresholds {
            base_confidence: self.base_confidence,
            iou_threshold: self.iou_threshold,
        }
    }
}

#[derive(Debug, Clone)]
pub struct PolicySettings {
    pub default_threshold: f32,
    pub thresholds: HashMap<String, f32>,
}

#[derive(Debug, Clone)]
pub struct StatsSettings {
    pub window_minutes: u32,
    pub top_n: usize,
    pub log_capacity: usize,
    pub log_page: usize,
}

#[derive(Debug, Clone)]
pub struct StreamSettings {
    pub jpeg_quality: u8,
}

#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub max_bytes: usize,
    pub extensions: Vec<String>,
}

impl UploadSettings {
    /// True when `filename` carries one of the accepted extensions (case-insensitive).
    pub fn accepts(&self, filename: &str) -> bool {
        Path::new(filename)
            .extension()
            .and_then(|ext| ext.to_str())
            .map(|ext| {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            })
            .unwrap_or(false)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self::from_file(AppConfigFile::default())
    }
}

impl AppConfig {
    /// Load from `YODAVI_CONFIG` (if set), then apply `YODAVI_*` overrides and validate.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("YODAVI_CONFIG").ok();
        let file_cfg = match config_path.as_deref() {
            Some(path) if !path.trim().is_empty() => Some(read_config_file(Path::new(path))?),
            _ => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default());
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: AppConfigFile) -> Self {
        let capture = file.capture.unwrap_or_default();
        let detection = file.detection.unwrap_or_default();
        let policy = file.policy.unwrap_or_default();
        let stats = file.stats.unwrap_or_default();

        Self {
            db_path: file.db_path.unwrap_or_else(|| DEFAULT_DB_PATH.to_string()),
            api_addr: file
                .api
                .and_then(|api| api.addr)
                .unwrap_or_else(|| DEFAULT_API_ADDR.to_string()),
            capture: CaptureSettings {
                source: capture.source.unwrap_or_else(|| DEFAULT_SOURCE.to_string()),
                width: capture.width.unwrap_or(DEFAULT_WIDTH),
                height: capture.height.unwrap_or(DEFAULT_HEIGHT),
                fps: capture.fps.unwrap_or(DEFAULT_FPS),
                skip_rate: capture.skip_rate.unwrap_or(DEFAULT_SKIP_RATE),
                sample_interval: capture.sample_interval_ms.map(Duration::from_millis),
                mirror: capture.mirror.unwrap_or(false),
                caption: capture.caption.unwrap_or(true),
                autostart: capture.autostart.unwrap_or(false),
                unsampled: capture.unsampled.unwrap_or_default(),
                frame_timeout: Duration::from_millis(
                    capture.frame_timeout_ms.unwrap_or(DEFAULT_FRAME_TIMEOUT_MS),
                ),
            },
            detection: DetectionSettings {
                engine: detection.engine.unwrap_or_else(|| DEFAULT_ENGINE.to_string()),
                model_path: detection
                    .model_path
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_MODEL_PATH)),
                labels_path: detection.labels_path,
                input_width: detection.input_width.unwrap_or(DEFAULT_MODEL_INPUT),
                input_height: detection.input_height.unwrap_or(DEFAULT_MODEL_INPUT),
                base_confidence: detection.base_confidence.unwrap_or(DEFAULT_BASE_CONFIDENCE),
                iou_threshold: detection.iou_threshold.unwrap_or(DEFAULT_IOU_THRESHOLD),
                inference_timeout: Duration::from_millis(
                    detection
                        .inference_timeout_ms
                        .unwrap_or(DEFAULT_INFERENCE_TIMEOUT_MS),
                ),
                max_consecutive_failures: detection
                    .max_consecutive_failures
                    .unwrap_or(DEFAULT_MAX_CONSECUTIVE_FAILURES),
            },
            policy: PolicySettings {
                default_threshold: policy
                    .default_threshold
                    .unwrap_or(crate::policy::DEFAULT_THRESHOLD),
                thresholds: policy.thresholds.unwrap_or_else(|| {
                    DEFAULT_CLASS_THRESHOLDS
                        .iter()
                        .map(|(class, value)| (class.to_string(), *value))
                        .collect()
                }),
            },
            stats: StatsSettings {
                window_minutes: stats.window_minutes.unwrap_or(DEFAULT_STATS_WINDOW_MINUTES),
                top_n: stats.top_n.unwrap_or(DEFAULT_STATS_TOP_N),
                log_capacity: stats.log_capacity.unwrap_or(DEFAULT_LOG_CAPACITY),
                log_page: stats.log_page.unwrap_or(DEFAULT_LOG_PAGE),
            },
            stream: StreamSettings {
                jpeg_quality: file
                    .stream
                    .and_then(|stream| stream.jpeg_quality)
                    .unwrap_or(DEFAULT_JPEG_QUALITY),
            },
            upload: {
                let upload = file.upload.unwrap_or_default();
                UploadSettings {
                    max_bytes: upload.max_bytes.unwrap_or(DEFAULT_MAX_UPLOAD_BYTES),
                    extensions: upload
                        .extensions
                        .map(|exts| {
                            exts.iter()
                                .map(|ext| ext.trim_start_matches('.').to_ascii_lowercase())
                                .collect()
                        })
                        .unwrap_or_else(|| {
                            DEFAULT_UPLOAD_EXTENSIONS
                                .iter()
                                .map(|ext| ext.to_string())
                                .collect()
                        }),
                }
            },
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_string("YODAVI_DB_PATH") {
            self.db_path = path;
        }
        if let Some(addr) = env_string("YODAVI_API_ADDR") {
            self.api_addr = addr;
        }
        if let Some(source) = env_string("YODAVI_SOURCE") {
            self.capture.source = source;
        }
        if let Some(skip) = env_parse::<u64>("YODAVI_SKIP_RATE")? {
            self.capture.skip_rate = skip;
        }
        if let Some(path) = env_string("YODAVI_MODEL_PATH") {
            self.detection.model_path = PathBuf::from(path);
        }
        if let Some(engine) = env_string("YODAVI_ENGINE") {
            self.detection.engine = engine;
        }
        if let Some(conf) = env_parse::<f32>("YODAVI_BASE_CONFIDENCE")? {
            self.detection.base_confidence = conf;
        }
        if let Some(iou) = env_parse::<f32>("YODAVI_IOU_THRESHOLD")? {
            self.detection.iou_threshold = iou;
        }
        if let Some(quality) = env_parse::<u8>("YODAVI_JPEG_QUALITY")? {
            self.stream.jpeg_quality = quality;
        }
        Ok(())
    }

    pub fn validate(&mut self) -> Result<()> {
        let invalid = |msg: String| -> anyhow::Error { PipelineError::Config(msg).into() };

        if self.db_path.trim().is_empty() {
            return Err(invalid("db_path must not be empty".into()));
        }
        if self.capture.source.trim().is_empty() {
            return Err(invalid("capture.source must not be empty".into()));
        }
        if self.capture.skip_rate == 0 {
            return Err(invalid("capture.skip_rate must be at least 1".into()));
        }
        if matches!(self.capture.sample_interval, Some(d) if d.is_zero()) {
            return Err(invalid("capture.sample_interval_ms must be positive".into()));
        }
        for (name, value) in [
            ("detection.base_confidence", self.detection.base_confidence),
            ("detection.iou_threshold", self.detection.iou_threshold),
            ("policy.default_threshold", self.policy.default_threshold),
        ] {
            check_probability(name, value).map_err(invalid)?;
        }
        for (class, value) in &self.policy.thresholds {
            check_probability(&format!("policy.thresholds.{}", class), *value).map_err(invalid)?;
        }
        if self.detection.max_consecutive_failures == 0 {
            return Err(invalid("detection.max_consecutive_failures must be at least 1".into()));
        }
        if self.detection.inference_timeout.is_zero() {
            return Err(invalid("detection.inference_timeout_ms must be positive".into()));
        }
        if self.detection.input_width == 0 || self.detection.input_height == 0 {
            return Err(invalid("detection input size must be non-zero".into()));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(invalid(format!(
                "stream.jpeg_quality must be within 1..=100, got {}",
                self.stream.jpeg_quality
            )));
        }
        if self.stats.window_minutes == 0 {
            return Err(invalid("stats.window_minutes must be at least 1".into()));
        }
        if self.stats.log_capacity == 0 {
            return Err(invalid("stats.log_capacity must be at least 1".into()));
        }
        if self.upload.max_bytes == 0 || self.upload.extensions.is_empty() {
            return Err(invalid("upload limits must allow at least one file type".into()));
        }
        self.detection.engine = self.detection.engine.trim().to_ascii_lowercase();
        Ok(())
    }
}

fn check_probability(name: &str, value: f32) -> std::result::Result<(), String> {
    if (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(format!("{} must be within [0, 1], got {}", name, value))
    }
}

fn read_config_file(path: &Path) -> Result<AppConfigFile> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let is_toml = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("toml"))
        .unwrap_or(false);
    let cfg = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

fn env_string(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn env_parse<T: FromStr>(name: &str) -> Result<Option<T>> {
    match env_string(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| anyhow!("{} has an invalid value {:?}", name, raw)),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_stock_settings() {
        let cfg = AppConfig::default();
        assert_eq!(cfg.capture.skip_rate, 4);
        assert_eq!(cfg.stats.log_capacity, 50);
        assert_eq!(cfg.stream.jpeg_quality, 80);
        assert_eq!(cfg.policy.thresholds.get("person"), Some(&0.7));
        assert_eq!(cfg.policy.default_threshold, 0.6);
        assert_eq!(cfg.capture.unsampled, UnsampledFrames::Forward);
    }

    #[test]
    fn upload_extension_check_ignores_case() {
        let cfg = AppConfig::default();
        assert!(cfg.upload.accepts("holiday.JPG"));
        assert!(cfg.upload.accepts("scan.bmp"));
        assert!(!cfg.upload.accepts("clip.gif"));
        assert!(!cfg.upload.accepts("noextension"));
    }

    #[test]
    fn validation_rejects_out_of_range_probability() {
        let mut cfg = AppConfig::default();
        cfg.policy.thresholds.insert("dog".into(), 1.5);
        let err = cfg.validate().unwrap_err();
        let pipeline = err.downcast_ref::<PipelineError>().unwrap();
        assert_eq!(pipeline.code(), "config");
    }
}
