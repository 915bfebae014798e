use std::io::Write;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::Builder;

use yodavi::config::{AppConfig, UnsampledFrames};
use yodavi::PipelineError;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "YODAVI_CONFIG",
        "YODAVI_DB_PATH",
        "YODAVI_API_ADDR",
        "YODAVI_SOURCE",
        "YODAVI_SKIP_RATE",
        "YODAVI_MODEL_PATH",
        "YODAVI_ENGINE",
        "YODAVI_BASE_CONFIDENCE",
        "YODAVI_IOU_THRESHOLD",
        "YODAVI_JPEG_QUALITY",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, contents: &str) -> tempfile::NamedTempFile {
    let mut file = Builder::new().suffix(suffix).tempfile().expect("temp config");
    file.write_all(contents.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_toml_config_with_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
        db_path = "lobby.db"

        [api]
        addr = "127.0.0.1:4100"

        [capture]
        source = "stub://lobby"
        skip_rate = 2
        mirror = true
        unsampled = "drop"
        frame_timeout_ms = 750

        [detection]
        engine = "STUB"
        inference_timeout_ms = 1200

        [policy]
        default_threshold = 0.55
        thresholds = { person = 0.9 }

        [stats]
        window_minutes = 30
        top_n = 3
        "#,
    );

    std::env::set_var("YODAVI_CONFIG", file.path());
    std::env::set_var("YODAVI_SKIP_RATE", "6");
    std::env::set_var("YODAVI_JPEG_QUALITY", "65");

    let cfg = AppConfig::load().expect("load config");

    assert_eq!(cfg.db_path, "lobby.db");
    assert_eq!(cfg.api_addr, "127.0.0.1:4100");
    assert_eq!(cfg.capture.source, "stub://lobby");
    assert_eq!(cfg.capture.skip_rate, 6);
    assert!(cfg.capture.mirror);
    assert_eq!(cfg.capture.unsampled, UnsampledFrames::Drop);
    assert_eq!(cfg.capture.frame_timeout, Duration::from_millis(750));
    assert_eq!(cfg.detection.engine, "stub");
    assert_eq!(cfg.detection.inference_timeout, Duration::from_millis(1200));
    assert!((cfg.policy.default_threshold - 0.55).abs() < f32::EPSILON);
    assert_eq!(cfg.policy.thresholds.len(), 1);
    assert_eq!(cfg.stats.window_minutes, 30);
    assert_eq!(cfg.stats.top_n, 3);
    assert_eq!(cfg.stream.jpeg_quality, 65);

    clear_env();
}

#[test]
fn loads_json_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "capture": { "source": "samples/", "sample_interval_ms": 250 },
            "upload": { "max_bytes": 2048, "extensions": [".PNG"] }
        }"#,
    );
    std::env::set_var("YODAVI_CONFIG", file.path());

    let cfg = AppConfig::load().expect("load config");
    assert_eq!(cfg.capture.source, "samples/");
    assert_eq!(cfg.capture.sample_interval, Some(Duration::from_millis(250)));
    assert_eq!(cfg.upload.max_bytes, 2048);
    assert!(cfg.upload.accepts("shot.png"));
    assert!(!cfg.upload.accepts("shot.jpg"));

    clear_env();
}

#[test]
fn rejects_out_of_range_thresholds() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("YODAVI_BASE_CONFIDENCE", "1.5");
    let err = AppConfig::load().unwrap_err();
    let pipeline = err.downcast_ref::<PipelineError>().expect("config error");
    assert_eq!(pipeline.code(), "config");

    clear_env();
}

#[test]
fn rejects_unparseable_env_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("YODAVI_SKIP_RATE", "often");
    let err = AppConfig::load().unwrap_err();
    assert!(err.to_string().contains("YODAVI_SKIP_RATE"));

    clear_env();
}
