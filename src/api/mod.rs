//! Control API.
//!
//! Small HTTP/1.1 server on a nonblocking listener. Each accepted connection is
//! served on its own thread, so a start request waiting on an attach never
//! blocks a concurrent stop or camera listing.
//!
//! Routes:
//! - `GET  /node/available`
//! - `GET  /node/cameras`
//! - `POST /node/deployments/initialise`
//! - `POST /node/deployments/stop`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::deployment::ControlOutcome;
use crate::node::NodeControl;
use crate::{DeploymentId, SourceId};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8080".to_string(),
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

/// One entry of a start or stop request.
#[derive(Clone, Debug, Deserialize)]
pub struct DeploymentInformation {
    pub deployment_id: u64,
    #[serde(default)]
    pub model_id: Option<String>,
    pub device_name: String,
}

#[derive(Debug, Deserialize)]
struct DeploymentRequest {
    deployment_information: Vec<DeploymentInformation>,
}

#[derive(Debug, Serialize)]
struct DeploymentReply {
    deployment_id: u64,
    device_name: String,
    status: &'static str,
    detail: String,
}

#[derive(Debug, Serialize)]
struct CameraList {
    node_id: String,
    cameras: Vec<String>,
}

#[derive(Debug, Serialize)]
struct CamerasReply {
    get_cameras: CameraList,
}

/// HTTP status for a control outcome.
pub fn status_code(outcome: &ControlOutcome) -> u16 {
    match outcome {
        ControlOutcome::Started | ControlOutcome::Stopped => 200,
        ControlOutcome::AlreadyActive
        | ControlOutcome::AlreadyInactive
        | ControlOutcome::InTransition(_) => 409,
        ControlOutcome::UnknownSource | ControlOutcome::UnknownModel => 404,
        ControlOutcome::TimedOut => 504,
        ControlOutcome::Failed(_) => 500,
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    control: NodeControl,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, control: NodeControl) -> Self {
        Self { cfg, control }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let control = self.control;
        let join = std::thread::Builder::new()
            .name("control-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, control, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, control: NodeControl, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let control = control.clone();
                let spawned = std::thread::Builder::new()
                    .name("control-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &control) {
                            log::warn!("control request from {} rejected: {}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("could not serve {}: {}", peer, err);
                }
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

fn handle_connection(mut stream: TcpStream, control: &NodeControl) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_json_response(&mut stream, 400, r#"{"error":"bad_request"}"#)?;
            return Err(err);
        }
    };
    log::debug!("{} {}", request.method, request.path);

    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/node/available") => {
            write_response(&mut stream, 200, "text/plain", b"Available")
        }
        ("GET", "/node/cameras") => {
            let reply = CamerasReply {
                get_cameras: CameraList {
                    node_id: control.node_id.clone(),
                    cameras: control.cameras().into_iter().map(|d| d.name).collect(),
                },
            };
            let payload = serde_json::to_vec(&reply)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        ("POST", "/node/deployments/initialise") => {
            handle_deployments(&mut stream, &request, control, start_one)
        }
        ("POST", "/node/deployments/stop") => {
            handle_deployments(&mut stream, &request, control, stop_one)
        }
        (_, "/node/available")
        | (_, "/node/cameras")
        | (_, "/node/deployments/initialise")
        | (_, "/node/deployments/stop") => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn start_one(control: &NodeControl, info: &DeploymentInformation) -> ControlOutcome {
    let Some(model_id) = info.model_id.as_deref() else {
        return ControlOutcome::UnknownModel;
    };
    control.manager.start_inference(
        DeploymentId(info.deployment_id),
        &SourceId::new(info.device_name.as_str()),
        model_id,
    )
}

fn stop_one(control: &NodeControl, info: &DeploymentInformation) -> ControlOutcome {
    control.manager.stop_inference(
        DeploymentId(info.deployment_id),
        &SourceId::new(info.device_name.as_str()),
    )
}

fn handle_deployments(
    stream: &mut TcpStream,
    request: &HttpRequest,
    control: &NodeControl,
    action: fn(&NodeControl, &DeploymentInformation) -> ControlOutcome,
) -> Result<()> {
    let parsed: DeploymentRequest = match serde_json::from_slice(&request.body) {
        Ok(parsed) => parsed,
        Err(err) => {
            log::warn!("malformed deployment request: {}", err);
            return write_json_response(stream, 400, r#"{"error":"invalid_json"}"#);
        }
    };
    if parsed.deployment_information.is_empty() {
        return write_json_response(stream, 400, r#"{"error":"no_deployments"}"#);
    }

    let mut status = 200;
    let mut replies = Vec::with_capacity(parsed.deployment_information.len());
    for info in &parsed.deployment_information {
        let outcome = action(control, info);
        if outcome.is_success() {
            log::info!(
                "deployment {} on {}: {}",
                info.deployment_id,
                info.device_name,
                outcome
            );
        } else {
            log::warn!(
                "deployment {} on {}: {}",
                info.deployment_id,
                info.device_name,
                outcome
            );
        }
        if status == 200 {
            status = status_code(&outcome);
        }
        replies.push(DeploymentReply {
            deployment_id: info.deployment_id,
            device_name: info.device_name.clone(),
            status: outcome.status(),
            detail: outcome.to_string(),
        });
    }
    let payload = serde_json::to_vec(&replies)?;
    write_response(stream, status, "application/json", &payload)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before headers"));
        }
        data.extend_from_slice(&buf[..n]);
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request headers too large"));
        }
    };

    let head = String::from_utf8_lossy(&data[..header_end]).to_string();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before body"));
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

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
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
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        504 => "HTTP/1.1 504 Gateway Timeout",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nConnection: close\r\nCache-Control: no-store\r\n\r\n",
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
    body: Vec<u8>,
}
