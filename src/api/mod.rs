//! HTTP surface of the gate service.
//!
//! A small HTTP/1.1 server over `TcpListener`: one accept thread, one short
//! thread per connection so a long validation poll never delays `/ping`.
//!
//! Routes (`{route}` is the configured prefix):
//! - `GET /ping`
//! - `GET /` service title, description and version
//! - `POST {route}/plates/validate?timeoutMilliseconds=<ms>`
//! - `GET {route}/cards/validate?timeout=<seconds>` (card registry configured)

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::gateway::{ValidationGateway, ValidationRequest};

const MAX_HEADER_BYTES: usize = 8192;
const MAX_BODY_BYTES: usize = 64 * 1024;
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const DEFAULT_PLATE_TIMEOUT_MS: u64 = 5000;
const DEFAULT_CARD_TIMEOUT_SECS: u64 = 5;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    /// Prefix for the validation routes, e.g. `/api/v1`. Empty for none.
    pub route_prefix: String,
    pub title: String,
    pub description: String,
    pub version: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "0.0.0.0:8000".to_string(),
            route_prefix: String::new(),
            title: "API".to_string(),
            description: "API description".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
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
    /// Stop accepting connections. Requests already being served finish on
    /// their own threads.
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
    gateway: Arc<ValidationGateway>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, gateway: Arc<ValidationGateway>) -> Self {
        Self { cfg, gateway }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self
            .cfg
            .addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", self.cfg.addr))?;
        let listener = TcpListener::bind(configured_addr)
            .with_context(|| format!("bind api listener on {}", configured_addr))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let routes = Arc::new(Routes::new(self.cfg, self.gateway));
        let join = std::thread::Builder::new()
            .name("gateway-api".to_string())
            .spawn(move || {
                if let Err(err) = run_api(listener, routes, shutdown_thread) {
                    log::error!("gateway api stopped: {}", err);
                }
            })
            .context("spawn api thread")?;

        log::info!("gateway api listening on {}", addr);
        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

struct Routes {
    cfg: ApiConfig,
    gateway: Arc<ValidationGateway>,
    plates_path: String,
    cards_path: String,
}

impl Routes {
    fn new(cfg: ApiConfig, gateway: Arc<ValidationGateway>) -> Self {
        let prefix = cfg.route_prefix.trim_end_matches('/').to_string();
        Self {
            plates_path: format!("{}/plates/validate", prefix),
            cards_path: format!("{}/cards/validate", prefix),
            cfg,
            gateway,
        }
    }
}

fn run_api(listener: TcpListener, routes: Arc<Routes>, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, peer)) => {
                let routes = routes.clone();
                let spawned = std::thread::Builder::new()
                    .name("api-conn".to_string())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &routes) {
                            log::warn!("api request from {} failed: {:#}", peer, err);
                        }
                    });
                if let Err(err) = spawned {
                    log::error!("could not spawn api connection thread: {}", err);
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

#[derive(Serialize)]
struct ServiceInfo<'a> {
    title: &'a str,
    description: &'a str,
    version: &'a str,
}

#[derive(Debug, Deserialize)]
struct PlateValidationBody {
    #[serde(rename = "plateNumber", alias = "plate_number", default)]
    plate_number: Option<String>,
    #[serde(rename = "gatePosition", alias = "gate_pos", alias = "gate_position", default)]
    gate_position: Option<String>,
}

fn handle_connection(mut stream: TcpStream, routes: &Routes) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            write_error(&mut stream, 400, "bad_request")?;
            return Err(err);
        }
    };

    let path = request.path.as_str();
    if path == "/ping" {
        if request.method != "GET" {
            return write_error(&mut stream, 405, "method_not_allowed");
        }
        return write_json_response(&mut stream, 200, r#"{"ping":"pong"}"#);
    }
    if path == "/" {
        if request.method != "GET" {
            return write_error(&mut stream, 405, "method_not_allowed");
        }
        let info = ServiceInfo {
            title: &routes.cfg.title,
            description: &routes.cfg.description,
            version: &routes.cfg.version,
        };
        let payload = serde_json::to_vec(&info)?;
        return write_response(&mut stream, 200, "application/json", &payload);
    }
    if path == routes.plates_path {
        if request.method != "POST" {
            return write_error(&mut stream, 405, "method_not_allowed");
        }
        return validate_plate(&mut stream, &request, &routes.gateway);
    }
    if path == routes.cards_path && routes.gateway.has_registry() {
        if request.method != "GET" {
            return write_error(&mut stream, 405, "method_not_allowed");
        }
        return validate_card(&mut stream, &request, &routes.gateway);
    }
    write_error(&mut stream, 404, "not_found")
}

fn validate_plate(
    stream: &mut TcpStream,
    request: &HttpRequest,
    gateway: &ValidationGateway,
) -> Result<()> {
    let timeout_ms = match request
        .query_u64(&["timeoutMilliseconds", "timeout"])
        .unwrap_or(Ok(DEFAULT_PLATE_TIMEOUT_MS))
    {
        Ok(ms) => ms,
        Err(_) => return write_error(stream, 400, "invalid_timeout"),
    };
    let body: PlateValidationBody = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(_) => return write_error(stream, 400, "invalid_body"),
    };
    let plate_number = body.plate_number.unwrap_or_default();
    let gate_position = body.gate_position.unwrap_or_default();
    if plate_number.trim().is_empty() {
        return write_error(stream, 400, "missing_plate_number");
    }
    if gate_position.trim().is_empty() {
        return write_error(stream, 400, "missing_gate_position");
    }

    let verdict = gateway.validate(&ValidationRequest::plate(
        &plate_number,
        &gate_position,
        Duration::from_millis(timeout_ms),
    ));
    let payload = serde_json::to_vec(&verdict)?;
    write_response(stream, 200, "application/json", &payload)
}

fn validate_card(
    stream: &mut TcpStream,
    request: &HttpRequest,
    gateway: &ValidationGateway,
) -> Result<()> {
    let timeout_secs = match request
        .query_u64(&["timeout"])
        .unwrap_or(Ok(DEFAULT_CARD_TIMEOUT_SECS))
    {
        Ok(secs) => secs,
        Err(_) => return write_error(stream, 400, "invalid_timeout"),
    };
    let request = ValidationRequest::registry(Duration::from_secs(timeout_secs));
    let verdict = gateway.validate(&request);
    let payload = serde_json::to_vec(&verdict)?;
    write_response(stream, 200, "application/json", &payload)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(READ_TIMEOUT))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos;
        }
        if data.len() > MAX_HEADER_BYTES {
            return Err(anyhow!("request too large"));
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let text = String::from_utf8_lossy(&data[..header_end]);
    let mut lines = text.split("\r\n");
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
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if content_length > MAX_BODY_BYTES {
        return Err(anyhow!("request body too large"));
    }
    let mut body = data[header_end + 4..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("connection closed before end of body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, query),
        None => (raw_path, ""),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query: url::form_urlencoded::parse(query.as_bytes())
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect(),
        body,
    })
}

fn write_error(stream: &mut TcpStream, status: u16, error: &str) -> Result<()> {
    let payload = serde_json::to_vec(&serde_json::json!({ "error": error }))?;
    write_response(stream, status, "application/json", &payload)
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
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: Vec<(String, String)>,
    body: Vec<u8>,
}

impl HttpRequest {
    /// First query parameter among `names`, parsed as an unsigned integer.
    /// `None` when absent.
    fn query_u64(&self, names: &[&str]) -> Option<Result<u64>> {
        names.iter().find_map(|name| {
            self.query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| {
                    v.trim()
                        .parse::<u64>()
                        .map_err(|_| anyhow!("query parameter {} is not an integer: '{}'", name, v))
                })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(query: &str) -> HttpRequest {
        HttpRequest {
            method: "POST".to_string(),
            path: "/plates/validate".to_string(),
            query: url::form_urlencoded::parse(query.as_bytes())
                .map(|(k, v)| (k.into_owned(), v.into_owned()))
                .collect(),
            body: Vec::new(),
        }
    }

    #[test]
    fn timeout_query_prefers_canonical_name() {
        let req = request("timeout=10&timeoutMilliseconds=250");
        assert_eq!(
            req.query_u64(&["timeoutMilliseconds", "timeout"]).unwrap().unwrap(),
            250
        );
        let alias = request("timeout=10");
        assert_eq!(
            alias.query_u64(&["timeoutMilliseconds", "timeout"]).unwrap().unwrap(),
            10
        );
        assert!(request("").query_u64(&["timeout"]).is_none());
        assert!(request("timeout=soon").query_u64(&["timeout"]).unwrap().is_err());
    }

    #[test]
    fn body_accepts_both_field_spellings() {
        let camel: PlateValidationBody =
            serde_json::from_str(r#"{"plateNumber":"AB1234C","gatePosition":"north"}"#).unwrap();
        let snake: PlateValidationBody =
            serde_json::from_str(r#"{"plate_number":"AB1234C","gate_pos":"north"}"#).unwrap();
        assert_eq!(camel.plate_number.as_deref(), Some("AB1234C"));
        assert_eq!(snake.gate_position.as_deref(), Some("north"));
        let empty: PlateValidationBody = serde_json::from_str("{}").unwrap();
        assert!(empty.plate_number.is_none());
    }

    #[test]
    fn routes_join_prefix() {
        let gateway = Arc::new(ValidationGateway::new(
            crate::signal::RecognitionWindow::new(),
            crate::queue::EvictingQueue::new(1),
            None,
        ));
        let routes = Routes::new(
            ApiConfig {
                route_prefix: "/api/v1/".to_string(),
                ..ApiConfig::default()
            },
            gateway,
        );
        assert_eq!(routes.plates_path, "/api/v1/plates/validate");
        assert_eq!(routes.cards_path, "/api/v1/cards/validate");
    }
}
