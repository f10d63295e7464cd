//! HTTP surface: the annotated video stream, status, and manual control.
//!
//! Routes:
//! - `GET /health`
//! - `GET /status`: [`StatusSnapshot`] as JSON
//! - `GET /video_feed`: `multipart/x-mixed-replace; boundary=frame` JPEG stream
//! - `POST /toggle_servo`, `/custom_move_left`, `/custom_move_right`, `/alert`
//!
//! Control routes need `Authorization: Bearer <token>` unless
//! `require_token` is off. Each connection gets its own thread, so a manual
//! servo move or a long-lived stream never blocks the accept loop.

use anyhow::{anyhow, Result};
use rand::RngCore;
use serde_json::json;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::fall::FallEvent;
use crate::notify::FallNotifier;
use crate::pipeline::{FrameHub, HubFrame, StatusBoard, StatusSnapshot};
use crate::tracking::{AutoTrackController, PanDirection};

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_POLL: Duration = Duration::from_secs(1);

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub token_path: Option<PathBuf>,
    pub require_token: bool,
    /// Concurrent `/video_feed` clients; extra clients get 503.
    pub max_streams: usize,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:5000".to_string(),
            token_path: None,
            require_token: true,
            max_streams: 4,
        }
    }
}

/// Everything the handlers read from or act on.
#[derive(Clone)]
pub struct ApiState {
    pub tracker: Arc<AutoTrackController>,
    pub notifier: Arc<FallNotifier>,
    pub hub: Arc<FrameHub>,
    pub status: Arc<StatusBoard>,
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    pub token: String,
    pub token_path: Option<PathBuf>,
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
    state: ApiState,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, state: ApiState) -> Self {
        Self { cfg, state }
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

        let token = generate_token();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ConnectionContext {
            cfg: self.cfg.clone(),
            state: self.state,
            token: token.clone(),
            shutdown: Arc::clone(&shutdown),
            active_streams: AtomicUsize::new(0),
        });
        let join = std::thread::Builder::new()
            .name("api-accept".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx) {
                    log::error!("http api stopped: {}", err);
                }
            })?;
        log::info!("http api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            token,
            token_path: self.cfg.token_path,
            shutdown,
            join: Some(join),
        })
    }
}

struct ConnectionContext {
    cfg: ApiConfig,
    state: ApiState,
    token: String,
    shutdown: Arc<AtomicBool>,
    active_streams: AtomicUsize,
}

fn run_api(listener: TcpListener, ctx: Arc<ConnectionContext>) -> Result<()> {
    let mut connections: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                connections.retain(|handle| !handle.is_finished());
                let conn_ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name("api-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &conn_ctx) {
                            log::warn!("http api request rejected: {}", err);
                        }
                    });
                match spawned {
                    Ok(handle) => connections.push(handle),
                    Err(err) => log::warn!("http api could not spawn handler: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for handle in connections {
        let _ = handle.join();
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, &json!({"status": "ok"})),
        ("GET", "/status") => {
            let snapshot: StatusSnapshot = ctx.state.status.snapshot();
            let payload = serde_json::to_vec(&snapshot)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        ("GET", "/video_feed") => serve_stream(stream, ctx),
        ("POST", "/toggle_servo")
        | ("POST", "/custom_move_left")
        | ("POST", "/custom_move_right")
        | ("POST", "/alert") => {
            if !authorize(&mut stream, &request, ctx)? {
                return Ok(());
            }
            handle_control(&mut stream, &request.path, ctx)
        }
        (
            _,
            "/health" | "/status" | "/video_feed" | "/toggle_servo" | "/custom_move_left"
            | "/custom_move_right" | "/alert",
        ) => write_json_response(&mut stream, 405, &json!({"error": "method_not_allowed"})),
        _ => write_json_response(&mut stream, 404, &json!({"error": "not_found"})),
    }
}

/// Returns `false` after writing the rejection.
fn authorize(stream: &mut TcpStream, request: &HttpRequest, ctx: &ConnectionContext) -> Result<bool> {
    if !ctx.cfg.require_token {
        return Ok(true);
    }
    if request.has_query_token() {
        write_json_response(
            stream,
            400,
            &json!({"error": "token_query_param_not_allowed"}),
        )?;
        return Ok(false);
    }
    let Some(presented) = request.bearer_token() else {
        write_json_response(stream, 401, &json!({"error": "missing_token"}))?;
        return Ok(false);
    };
    if !token_matches(&ctx.token, &presented) {
        write_json_response(stream, 401, &json!({"error": "invalid_token"}))?;
        return Err(anyhow!("invalid control token from client"));
    }
    Ok(true)
}

fn handle_control(stream: &mut TcpStream, path: &str, ctx: &ConnectionContext) -> Result<()> {
    let tracker = &ctx.state.tracker;
    match path {
        "/toggle_servo" => {
            let enabled = tracker.toggle_auto_enabled();
            let state = if enabled { "enabled" } else { "disabled" };
            write_json_response(
                stream,
                200,
                &json!({
                    "message": format!("Auto servo movement {}.", state),
                    "auto_enabled": enabled,
                }),
            )
        }
        "/custom_move_left" | "/custom_move_right" => {
            let direction = if path == "/custom_move_left" {
                PanDirection::Left
            } else {
                PanDirection::Right
            };
            // blocks this connection until the servo is free and the move is done
            match tracker.manual_move(direction) {
                Ok(()) => write_json_response(
                    stream,
                    200,
                    &json!({
                        "message": format!("Moved {:?}.", direction).to_lowercase(),
                        "servo_available": tracker.driver().is_available(),
                    }),
                ),
                Err(err) => {
                    log::warn!("manual move failed: {:#}", err);
                    write_json_response(stream, 500, &json!({"error": "servo_failure"}))
                }
            }
        }
        "/alert" => {
            let delivered = ctx.state.notifier.emit(&FallEvent::simulated());
            write_json_response(
                stream,
                200,
                &json!({"message": "Alert triggered.", "delivered": delivered}),
            )
        }
        _ => write_json_response(stream, 404, &json!({"error": "not_found"})),
    }
}

/// Releases a stream slot when the client goes away.
struct StreamSlot<'a>(&'a AtomicUsize);

impl Drop for StreamSlot<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn serve_stream(mut stream: TcpStream, ctx: &ConnectionContext) -> Result<()> {
    if ctx.active_streams.fetch_add(1, Ordering::SeqCst) >= ctx.cfg.max_streams {
        ctx.active_streams.fetch_sub(1, Ordering::SeqCst);
        write_json_response(&mut stream, 503, &json!({"error": "too_many_streams"}))?;
        return Ok(());
    }
    let _slot = StreamSlot(&ctx.active_streams);

    stream.set_write_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(
        b"HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary=frame\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
    )?;

    let hub: &FrameHub = &ctx.state.hub;
    let mut seen = 0;
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match hub.wait_newer(seen, STREAM_POLL) {
            HubFrame::Frame { generation, jpeg } => {
                seen = generation;
                if write_part(&mut stream, &jpeg).is_err() {
                    log::debug!("stream client went away");
                    break;
                }
            }
            HubFrame::Timeout => continue,
            HubFrame::Closed => break,
        }
    }
    Ok(())
}

fn write_part(stream: &mut TcpStream, jpeg: &[u8]) -> std::io::Result<()> {
    let header = format!(
        "--frame\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
        jpeg.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(jpeg)?;
    stream.write_all(b"\r\n")?;
    stream.flush()
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    parse_request(&data)
}

fn parse_request(data: &[u8]) -> Result<HttpRequest> {
    let text = String::from_utf8_lossy(data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_ascii_uppercase(),
        path,
        headers,
        raw_path: raw_path.to_string(),
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &serde_json::Value) -> Result<()> {
    write_response(stream, status, "application/json", body.to_string().as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    headers: HashMap<String, String>,
    raw_path: String,
}

impl HttpRequest {
    fn bearer_token(&self) -> Option<String> {
        if let Some(value) = self.headers.get("authorization") {
            let parts: Vec<&str> = value.split_whitespace().collect();
            if parts.len() == 2 && parts[0].eq_ignore_ascii_case("bearer") {
                return Some(parts[1].to_string());
            }
        }
        None
    }

    fn has_query_token(&self) -> bool {
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&') {
                if let Some((k, _)) = pair.split_once('=') {
                    if k == "token" {
                        return true;
                    }
                }
            }
        }
        false
    }
}

fn generate_token() -> String {
    let mut token = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut token);
    hex::encode(token)
}

/// Compare decoded bytes without an early exit on the first mismatch.
fn token_matches(expected: &str, presented: &str) -> bool {
    let (Ok(expected), Ok(presented)) = (hex::decode(expected), hex::decode(presented)) else {
        return false;
    };
    if expected.len() != presented.len() {
        return false;
    }
    expected
        .iter()
        .zip(presented.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

fn write_token_file(path: &Path, token: &str) -> Result<()> {
    std::fs::write(path, format!("{token}\n"))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)?;
    }
    Ok(())
}
