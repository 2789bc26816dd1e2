//! HTTP surface for exam clients and proctor tooling.
//!
//! Student routes (`/lock-state`, `/recover`) are open; staff routes under
//! `/violations` require the capability token as a bearer header.

use crate::{
    lock_state, ClearOutcome, Passkey, PasskeyAuthority, RecoveryConsole, RedeemOutcome,
    SessionKey, SqliteViolationStore, StaffId, StatusFilter, TimeWindow, ViolationFilter,
    ViolationStore, DEFAULT_MAX_REDEEM_ATTEMPTS,
};
use anyhow::{anyhow, Result};
use rand::RngCore;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use zeroize::{Zeroize, ZeroizeOnDrop};

const MAX_REQUEST_BYTES: usize = 8192;

#[derive(Clone, Debug)]
pub struct ApiConfig {
    pub addr: String,
    pub db_path: String,
    pub token_path: Option<PathBuf>,
    pub max_redeem_attempts: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8797".to_string(),
            db_path: "proctor.db".to_string(),
            token_path: None,
            max_redeem_attempts: DEFAULT_MAX_REDEEM_ATTEMPTS,
        }
    }
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

/// Staff capability token, minted once per server start.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct CapabilityToken {
    token: [u8; 32],
}

impl CapabilityToken {
    pub fn generate() -> Self {
        let mut token = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut token);
        Self { token }
    }

    pub fn token_hex(&self) -> String {
        hex::encode(self.token)
    }

    pub fn validate(&self, presented: &str) -> Result<()> {
        let mut presented = parse_hex32(presented)?;
        let diff = presented
            .iter()
            .zip(self.token.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b));
        presented.zeroize();
        if diff != 0 {
            return Err(anyhow!("capability token invalid"));
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig) -> Self {
        Self { cfg }
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

        // Open in the caller so a bad db path fails the spawn, not the thread.
        let store = SqliteViolationStore::open(&self.cfg.db_path)?;

        let capability = CapabilityToken::generate();
        let token = capability.token_hex();
        if let Some(path) = &self.cfg.token_path {
            write_token_file(path, &token)?;
        }

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let token_path = self.cfg.token_path.clone();
        let mut state = ApiState {
            store,
            authority: PasskeyAuthority::new(self.cfg.max_redeem_attempts),
            capability,
        };
        let join = std::thread::spawn(move || {
            if let Err(err) = run_api(listener, &mut state, shutdown_thread) {
                log::error!("proctor api stopped: {}", err);
            }
        });

        Ok(ApiHandle {
            addr,
            token,
            token_path,
            shutdown,
            join: Some(join),
        })
    }
}

struct ApiState {
    store: SqliteViolationStore,
    authority: PasskeyAuthority,
    capability: CapabilityToken,
}

fn run_api(listener: TcpListener, state: &mut ApiState, shutdown: Arc<AtomicBool>) -> Result<()> {
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(err) = handle_connection(stream, state) {
                    log::warn!("proctor api request rejected: {}", err);
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

fn handle_connection(mut stream: TcpStream, state: &mut ApiState) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, &json!({"error": "forbidden"}))?;
        return Ok(());
    }

    let request = read_request(&mut stream)?;
    match route(&request, state) {
        Ok((status, body)) => write_json_response(&mut stream, status, &body),
        Err(err) => {
            write_json_response(&mut stream, 500, &json!({"error": "internal"}))?;
            Err(err)
        }
    }
}

fn route(request: &HttpRequest, state: &mut ApiState) -> Result<(u16, Value)> {
    let method = request.method.as_str();
    let path = request.path.as_str();

    let (allowed, staff_only) = match path {
        "/health" | "/lock-state" => ("GET", false),
        "/recover" => ("POST", false),
        "/violations" => ("GET", true),
        "/violations/clear" => ("POST", true),
        _ => return Ok((404, json!({"error": "not_found"}))),
    };
    if method != allowed {
        return Ok((405, json!({"error": "method_not_allowed"})));
    }

    if request.has_query_token() {
        return Ok((400, json!({"error": "token_query_param_not_allowed"})));
    }

    if staff_only {
        let Some(token) = request.bearer_token() else {
            return Ok((401, json!({"error": "missing_token"})));
        };
        if let Err(err) = state.capability.validate(&token) {
            log::warn!("proctor api: {}", err);
            return Ok((401, json!({"error": "invalid_token"})));
        }
    }

    let query = request.query();
    match path {
        "/health" => Ok((200, json!({"status": "ok"}))),
        "/lock-state" => {
            let Some(key) = session_key(&query) else {
                return Ok(bad_request("examId and studentId are required"));
            };
            let lock = lock_state(&state.store, &key)?;
            Ok((200, serde_json::to_value(lock)?))
        }
        "/recover" => {
            let Some(key) = session_key(&query) else {
                return Ok(bad_request("examId and studentId are required"));
            };
            let input = String::from_utf8_lossy(&request.body).to_string();
            let outcome = state.authority.redeem(&mut state.store, &key, &input)?;
            Ok(match outcome {
                RedeemOutcome::Resumed => (200, json!({"outcome": "resumed"})),
                RedeemOutcome::AlreadyCleared => (200, json!({"outcome": "already_cleared"})),
                RedeemOutcome::Rejected => (403, json!({"outcome": "rejected"})),
                RedeemOutcome::AttemptsExhausted => {
                    (429, json!({"outcome": "attempts_exhausted"}))
                }
            })
        }
        "/violations" => {
            let filter = match violation_filter(&query) {
                Ok(filter) => filter,
                Err(err) => return Ok(bad_request(&err.to_string())),
            };
            let records = state.store.list(&filter)?;
            Ok((200, serde_json::to_value(records)?))
        }
        "/violations/clear" => {
            let (Some(key), Some(passkey), Some(staff)) = (
                session_key(&query),
                query.get("passkey").and_then(|p| Passkey::parse(p).ok()),
                query.get("staff").and_then(|s| StaffId::new(s).ok()),
            ) else {
                return Ok(bad_request("examId, studentId, passkey, and staff are required"));
            };
            let mut console = RecoveryConsole::new(&mut state.store, staff);
            Ok(match console.clear(&key, &passkey)? {
                ClearOutcome::Cleared => (200, json!({"outcome": "cleared"})),
                ClearOutcome::AlreadyCleared => (200, json!({"outcome": "already_cleared"})),
                ClearOutcome::NotFound => (404, json!({"outcome": "not_found"})),
            })
        }
        _ => Ok((404, json!({"error": "not_found"}))),
    }
}

fn bad_request(detail: &str) -> (u16, Value) {
    (400, json!({"error": "bad_request", "detail": detail}))
}

fn session_key(query: &HashMap<String, String>) -> Option<SessionKey> {
    let exam = query.get("examId")?;
    let student = query.get("studentId")?;
    SessionKey::new(exam, student).ok()
}

fn violation_filter(query: &HashMap<String, String>) -> Result<ViolationFilter> {
    let mut filter = ViolationFilter::new();
    if let Some(status) = query.get("status") {
        filter = filter.status(status.parse::<StatusFilter>()?);
    }
    if let Some(window) = query.get("window") {
        filter = filter.window(window.parse::<TimeWindow>()?);
    }
    if let Some(q) = query.get("q") {
        filter = filter.search(q);
    }
    Ok(filter)
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = data.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break data.len();
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
    };

    let text = String::from_utf8_lossy(&data[..header_end]).to_string();
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

    let content_length: usize = match headers.get("content-length") {
        Some(value) => value
            .parse()
            .map_err(|_| anyhow!("invalid content-length"))?,
        None => 0,
    };
    if header_end + content_length > MAX_REQUEST_BYTES {
        return Err(anyhow!("request too large"));
    }
    let mut body = data[header_end.min(data.len())..].to_vec();
    while body.len() < content_length {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            return Err(anyhow!("truncated request body"));
        }
        body.extend_from_slice(&buf[..n]);
    }
    body.truncate(content_length);

    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
        headers,
        raw_path: raw_path.to_string(),
        body,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &Value) -> Result<()> {
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
        400 => "HTTP/1.1 400 Bad Request",
        401 => "HTTP/1.1 401 Unauthorized",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        429 => "HTTP/1.1 429 Too Many Requests",
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
    body: Vec<u8>,
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
        self.query().contains_key("token")
    }

    fn query(&self) -> HashMap<String, String> {
        let mut out = HashMap::new();
        if let Some(query) = self.raw_path.split('?').nth(1) {
            for pair in query.split('&').filter(|p| !p.is_empty()) {
                let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
                out.insert(percent_decode(k), percent_decode(v));
            }
        }
        out
    }
}

/// Decodes `%XX` escapes and `+` as space. Malformed escapes pass through.
fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hi = (bytes[i + 1] as char).to_digit(16);
                let lo = (bytes[i + 2] as char).to_digit(16);
                match (hi, lo) {
                    (Some(hi), Some(lo)) => {
                        out.push((hi * 16 + lo) as u8);
                        i += 2;
                    }
                    _ => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).to_string()
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

fn parse_hex32(value: &str) -> Result<[u8; 32]> {
    let bytes = hex::decode(value)?;
    if bytes.len() != 32 {
        return Err(anyhow!("token must be 32 bytes"));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&bytes);
    Ok(out)
}
