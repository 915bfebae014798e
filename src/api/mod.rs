//! Control and stream HTTP surface for a capture session.
//!
//! Each accepted connection is served on its own short-lived thread so a long
//! `/stream` viewer or a slow upload never blocks control requests.

mod http;

use anyhow::{anyhow, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::AppConfig;
use crate::error::{ErrorBody, PipelineError};
use crate::session::CaptureSession;
use crate::publish::FramePacket;
use http::{
    read_request, write_event, write_event_head, write_json, write_stream_head, write_stream_part,
    HttpRequest, ReadError,
};

const MAX_CONNECTIONS: usize = 64;
const STREAM_POLL: Duration = Duration::from_millis(500);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub max_upload_bytes: usize,
    /// Number of entries returned by `GET /logs`.
    pub log_page: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:3000".to_string(),
            max_upload_bytes: 10 * 1024 * 1024,
            log_page: 20,
        }
    }
}

impl From<&AppConfig> for ApiConfig {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            addr: cfg.api_addr.clone(),
            max_upload_bytes: cfg.upload.max_bytes,
            log_page: cfg.stats.log_page,
        }
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    session: Arc<CaptureSession>,
}

struct Shared {
    cfg: ApiConfig,
    session: Arc<CaptureSession>,
    shutdown: Arc<AtomicBool>,
    active: AtomicUsize,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, session: Arc<CaptureSession>) -> Self {
        Self { cfg, session }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shared = Arc::new(Shared {
            cfg: self.cfg,
            session: self.session,
            shutdown: shutdown.clone(),
            active: AtomicUsize::new(0),
        });
        let join = std::thread::Builder::new()
            .name("api-accept".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, shared) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        log::info!("control api listening on http://{}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, shared: Arc<Shared>) -> Result<()> {
    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = stream.set_nonblocking(false) {
                    log::warn!("control api connection dropped: {}", err);
                    continue;
                }
                dispatch(stream, shared.clone());
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn dispatch(mut stream: TcpStream, shared: Arc<Shared>) {
    if shared.active.fetch_add(1, Ordering::SeqCst) >= MAX_CONNECTIONS {
        shared.active.fetch_sub(1, Ordering::SeqCst);
        let _ = write_json(&mut stream, 503, &error_body("busy", "too many connections"));
        return;
    }
    let worker_shared = shared.clone();
    let spawned = std::thread::Builder::new()
        .name("api-conn".to_string())
        .spawn(move || {
            if let Err(err) = handle_connection(stream, &worker_shared) {
                log::warn!("control api request failed: {}", err);
            }
            worker_shared.active.fetch_sub(1, Ordering::SeqCst);
        });
    if let Err(err) = spawned {
        shared.active.fetch_sub(1, Ordering::SeqCst);
        log::warn!("control api could not spawn connection thread: {}", err);
    }
}

fn error_body(code: &'static str, message: impl Into<String>) -> ErrorBody {
    ErrorBody {
        error: code,
        message: message.into(),
    }
}

fn pipeline_status(err: &PipelineError) -> u16 {
    match err {
        PipelineError::InvalidInput(_) | PipelineError::Config(_) => 400,
        PipelineError::SourceUnavailable(_) => 503,
        PipelineError::InferenceFailure(_) | PipelineError::StoreWriteFailure(_) => 500,
    }
}

fn handle_connection(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json(&mut stream, 403, &error_body("forbidden", "loopback only"))?;
        return Ok(());
    }

    let request = match read_request(&mut stream, shared.cfg.max_upload_bytes) {
        Ok(request) => request,
        Err(ReadError::TooLarge { declared, limit }) => {
            let err = PipelineError::InvalidInput(format!(
                "upload of {} bytes exceeds the {} byte limit",
                declared, limit
            ));
            write_json(&mut stream, 413, &err.to_body())?;
            return Ok(());
        }
        Err(ReadError::Malformed(err)) => {
            write_json(&mut stream, 400, &error_body("bad_request", err.to_string()))?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);

    let session = &shared.session;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json(
            &mut stream,
            200,
            &json!({"status": "ok", "engine": session.adapter().engine_name()}),
        ),
        ("GET", "/session") => write_json(&mut stream, 200, &session_view(session)),
        ("POST", "/session/start") => match session.start() {
            Ok(outcome) => write_json(
                &mut stream,
                200,
                &json!({"result": outcome, "status": session.status()}),
            ),
            Err(err) => write_json(&mut stream, pipeline_status(&err), &err.to_body()),
        },
        ("POST", "/session/stop") => {
            let outcome = session.stop();
            write_json(
                &mut stream,
                200,
                &json!({"result": outcome, "status": session.status()}),
            )
        }
        ("POST", "/upload") => handle_upload(&mut stream, session, &request),
        ("GET", "/statistics") => match session.statistics() {
            Ok(stats) => write_json(&mut stream, 200, &stats),
            Err(err) => write_json(&mut stream, 500, &err.to_body()),
        },
        ("GET", "/logs") => write_json(&mut stream, 200, &session.recent_log(shared.cfg.log_page)),
        ("POST", "/logs/clear") => match session.clear_log() {
            Ok(()) => write_json(&mut stream, 200, &json!({"success": true})),
            Err(err) => write_json(&mut stream, 500, &err.to_body()),
        },
        ("GET", "/policy") => {
            let table = session.adapter().policy().snapshot();
            write_json(
                &mut stream,
                200,
                &json!({
                    "default_threshold": table.default_threshold,
                    "thresholds": table.thresholds,
                }),
            )
        }
        ("GET", "/stream") => serve_stream(stream, shared),
        ("GET", "/events") => serve_events(stream, shared),
        (
            _,
            "/health" | "/session" | "/session/start" | "/session/stop" | "/upload" | "/statistics"
            | "/logs" | "/logs/clear" | "/policy" | "/stream" | "/events",
        ) => write_json(
            &mut stream,
            405,
            &error_body("method_not_allowed", format!("{} not allowed", request.method)),
        ),
        _ => write_json(&mut stream, 404, &error_body("not_found", request.path.clone())),
    }
}

fn session_view(session: &CaptureSession) -> serde_json::Value {
    json!({
        "status": session.status(),
        "frame_counter": session.frame_counter(),
        "total_detections": session.total_detections(),
        "viewers": session.subscriber_count(),
        "last_exit": session.last_exit(),
    })
}

fn handle_upload(stream: &mut TcpStream, session: &CaptureSession, request: &HttpRequest) -> Result<()> {
    let Some(filename) = request.query.get("filename") else {
        let err = PipelineError::InvalidInput("missing filename query parameter".into());
        return write_json(stream, 400, &err.to_body());
    };
    match session.process_upload(filename, &request.body) {
        Ok(result) => write_json(
            stream,
            200,
            &json!({
                "success": true,
                "image": format!("data:image/jpeg;base64,{}", BASE64.encode(&result.annotated_jpeg)),
                "detections": result.detections,
                "count": result.count,
            }),
        ),
        Err(err) => {
            log::warn!("upload {} rejected: {}", filename, err);
            write_json(stream, pipeline_status(&err), &err.to_body())
        }
    }
}

/// MJPEG stream of published frames until the viewer disconnects or the api stops.
fn serve_stream(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let subscription = shared.session.subscribe();
    write_stream_head(&mut stream)?;
    log::info!("stream viewer connected from {}", stream.peer_addr()?);
    loop {
        if shared.shutdown.load(Ordering::SeqCst) || subscription.is_closed() {
            break;
        }
        let Some(packet) = subscription.recv_timeout(STREAM_POLL) else {
            continue;
        };
        if let Err(err) = write_stream_part(&mut stream, &packet.frame) {
            log::info!("stream viewer left: {}", err);
            break;
        }
    }
    Ok(())
}

/// Viewer payload for one published frame.
fn viewer_payload(packet: &FramePacket) -> serde_json::Value {
    json!({
        "frame": format!("data:image/jpeg;base64,{}", BASE64.encode(&packet.frame)),
        "detections": packet.detections,
        "stats": packet.stats,
        "frame_count": packet.seq,
        "annotated": packet.annotated,
    })
}

/// Server-sent `frame` events carrying the full viewer payload.
fn serve_events(mut stream: TcpStream, shared: &Shared) -> Result<()> {
    let subscription = shared.session.subscribe();
    write_event_head(&mut stream)?;
    log::info!("event viewer connected from {}", stream.peer_addr()?);
    loop {
        if shared.shutdown.load(Ordering::SeqCst) || subscription.is_closed() {
            break;
        }
        let Some(packet) = subscription.recv_timeout(STREAM_POLL) else {
            continue;
        };
        let data = serde_json::to_string(&viewer_payload(&packet))?;
        if let Err(err) = write_event(&mut stream, "frame", &data) {
            log::info!("event viewer left: {}", err);
            break;
        }
    }
    Ok(())
}
