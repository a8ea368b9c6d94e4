//! REST listener: `/health`, `/detect` and `/sessions`.
//!
//! One request per connection, answered with `Connection: close`. Requests run
//! on their own short-lived threads so a slow `/detect` never holds up
//! `/health`.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use crossbeam_channel::RecvTimeoutError;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::ACCEPT_BACKOFF;
use crate::detect::DetectorInfo;
use crate::error::RelayError;
use crate::frame::FrameInput;
use crate::gateway::TransportGateway;
use crate::health::{DetectorHealth, DetectorState};
use crate::session::SessionSummary;

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 16 * 1024 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(5);
/// How long `/detect` waits for the worker before giving up.
const DETECT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Clone)]
pub(crate) struct HttpContext {
    pub gateway: Arc<TransportGateway>,
    pub health: Arc<DetectorHealth>,
}

pub(crate) fn run(
    listener: TcpListener,
    ctx: HttpContext,
    shutdown: Arc<AtomicBool>,
) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let ctx = ctx.clone();
                let spawned = std::thread::Builder::new()
                    .name("relay-http-req".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &ctx) {
                            log::warn!("rest request rejected: {:#}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("failed to spawn rest request thread: {}", err);
                }
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

#[derive(Serialize)]
struct HealthBody<'a> {
    status: &'static str,
    detector_ready: bool,
    detector_state: DetectorState,
    active_sessions: usize,
    queue_size: usize,
    queue_capacity: usize,
    jobs_processed: u64,
    job_failures: u64,
    consecutive_failures: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    last_error: Option<String>,
    model_info: &'a DetectorInfo,
}

#[derive(Serialize)]
struct SessionsBody {
    active_sessions: Vec<SessionSummary>,
    total_count: usize,
}

#[derive(Deserialize)]
struct DetectRequest {
    #[serde(default)]
    image: Option<FrameInput>,
    #[serde(default)]
    annotate: bool,
}

fn handle_connection(mut stream: TcpStream, ctx: &HttpContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(RequestError::TooLarge) => {
            write_error(&mut stream, 413, "request body too large")?;
            return Ok(());
        }
        Err(RequestError::Malformed(err)) => {
            write_error(&mut stream, 400, "malformed request")?;
            return Err(err);
        }
    };

    if request.method == "OPTIONS" {
        write_response(&mut stream, 204, "application/json", &[])?;
        return Ok(());
    }

    let allowed = match request.path.as_str() {
        "/health" | "/sessions" => "GET",
        "/detect" => "POST",
        _ => {
            write_error(&mut stream, 404, "not_found")?;
            return Ok(());
        }
    };
    if request.method != allowed {
        write_error(&mut stream, 405, "method_not_allowed")?;
        return Ok(());
    }

    match request.path.as_str() {
        "/health" => health(&mut stream, ctx),
        "/sessions" => sessions(&mut stream, ctx),
        _ => detect(&mut stream, ctx, &request.body),
    }
}

fn health(stream: &mut TcpStream, ctx: &HttpContext) -> Result<()> {
    let snapshot = ctx.health.snapshot();
    let gateway = &ctx.gateway;
    let body = HealthBody {
        status: match snapshot.detector_state {
            DetectorState::Ok => "OK",
            DetectorState::Degraded => "DEGRADED",
            DetectorState::Stopped => "STOPPED",
        },
        detector_ready: snapshot.detector_ready,
        detector_state: snapshot.detector_state,
        active_sessions: gateway.registry().len(),
        queue_size: gateway.queue().len(),
        queue_capacity: gateway.queue().capacity(),
        jobs_processed: snapshot.jobs_processed,
        job_failures: snapshot.job_failures,
        consecutive_failures: snapshot.consecutive_failures,
        last_error: snapshot.last_error,
        model_info: gateway.detector_info(),
    };
    write_json(stream, 200, &body)
}

fn sessions(stream: &mut TcpStream, ctx: &HttpContext) -> Result<()> {
    let active_sessions = ctx.gateway.registry().list();
    let body = SessionsBody {
        total_count: active_sessions.len(),
        active_sessions,
    };
    write_json(stream, 200, &body)
}

fn detect(stream: &mut TcpStream, ctx: &HttpContext, body: &[u8]) -> Result<()> {
    let request: DetectRequest = match serde_json::from_slice(body) {
        Ok(request) => request,
        Err(err) => {
            return write_error(stream, 400, &format!("invalid request body: {}", err));
        }
    };
    let reply = match ctx.gateway.submit_direct(request.image, request.annotate) {
        Ok(reply) => reply,
        Err(err) => return write_relay_error(stream, &err),
    };
    match reply.recv_timeout(DETECT_TIMEOUT) {
        Ok(result) => {
            let status = if result.is_degraded() { 500 } else { 200 };
            write_json(stream, status, &result)
        }
        // The worker closed the queue with this job still in it.
        Err(RecvTimeoutError::Disconnected) => write_error(stream, 503, "relay stopping"),
        Err(RecvTimeoutError::Timeout) => write_error(stream, 504, "detection timed out"),
    }
}

enum RequestError {
    TooLarge,
    Malformed(anyhow::Error),
}

impl From<std::io::Error> for RequestError {
    fn from(err: std::io::Error) -> Self {
        RequestError::Malformed(err.into())
    }
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    body: Vec<u8>,
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest, RequestError> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 8192];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("connection closed mid-request")));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(RequestError::Malformed(anyhow!("request headers too large")));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = text.split("\r\n");
    let request_line = lines
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("empty request")))?;
    let mut parts = request_line.split_whitespace();
    let method = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing method")))?;
    let raw_path = parts
        .next()
        .ok_or_else(|| RequestError::Malformed(anyhow!("missing path")))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| RequestError::Malformed(anyhow!("bad content-length")))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(RequestError::TooLarge);
    }
    let mut body = data.split_off(header_end + 4);
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(RequestError::Malformed(anyhow!("body shorter than content-length")));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        body,
    })
}

fn write_relay_error(stream: &mut TcpStream, err: &RelayError) -> Result<()> {
    let status = match err {
        RelayError::Overload => 503,
        RelayError::SessionNotFound => 404,
        RelayError::Decode(_) | RelayError::Detector(_) => 500,
        RelayError::Validation(_) => 400,
    };
    let body = json!({ "error": err.to_string(), "kind": err.kind() });
    write_json(stream, status, &body)
}

fn write_error(stream: &mut TcpStream, status: u16, message: &str) -> Result<()> {
    write_json(stream, status, &json!({ "error": message }))
}

fn write_json<T: Serialize>(stream: &mut TcpStream, status: u16, body: &T) -> Result<()> {
    let payload = serde_json::to_vec(body)?;
    write_response(stream, status, "application/json", &payload)
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        204 => "HTTP/1.1 204 No Content",
        400 => "HTTP/1.1 400 Bad Request",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        504 => "HTTP/1.1 504 Gateway Timeout",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nAccess-Control-Allow-Origin: *\r\nAccess-Control-Allow-Methods: GET, POST, OPTIONS\r\nAccess-Control-Allow-Headers: Content-Type\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}
