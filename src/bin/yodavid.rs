//! yodavid - capture/detect/publish daemon
//!
//! This daemon:
//! 1. Loads configuration (`YODAVI_CONFIG` plus `YODAVI_*` overrides)
//! 2. Opens the detection store and spawns the inference engine
//! 3. Serves the control and stream API
//! 4. Optionally starts capture immediately (`capture.autostart`)
//! 5. Stops capture and the API on Ctrl-C

use anyhow::{anyhow, Result};
use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use yodavi::api::{ApiConfig, ApiServer};
use yodavi::{build_session, AppConfig, SqliteDetectionStore, StartOutcome};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cfg = AppConfig::load()?;
    let store = Arc::new(SqliteDetectionStore::open(&cfg.db_path)?);
    let session = build_session(&cfg, store)?;
    log::info!(
        "yodavid {} running. writing to {}, source {}",
        env!("CARGO_PKG_VERSION"),
        cfg.db_path,
        cfg.capture.source
    );

    let api_handle = ApiServer::new(ApiConfig::from(&cfg), session.clone()).spawn()?;
    log::info!("control api listening on {}", api_handle.addr);

    if cfg.capture.autostart {
        match session.start() {
            Ok(StartOutcome::Started) => log::info!("capture autostarted"),
            Ok(outcome) => log::info!("capture autostart skipped: {:?}", outcome),
            Err(err) => log::error!("capture autostart failed: {}", err),
        }
    }

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|err| anyhow!("error setting Ctrl-C handler: {}", err))?;

    log::info!("yodavid waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping capture and api...");
    if !session.shutdown(SHUTDOWN_TIMEOUT) {
        log::warn!("capture loop still running after {:?}", SHUTDOWN_TIMEOUT);
    }
    api_handle.stop()?;

    Ok(())
}
