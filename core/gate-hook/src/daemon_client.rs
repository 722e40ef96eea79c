//! Client helper for talking to the mindgate daemon.
//!
//! The daemon is the only writer. Events carry an event id so a retry after a
//! lost response is dropped by the daemon instead of being applied twice.
//! Outcomes have no such id and are never retried.

use chrono::Utc;
use mindgate_protocol::{
    Decision, EventEnvelope, EventKind, Method, OutcomeReport, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use rand::RngCore;
use serde_json::Value;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::time::Duration;

const ENABLE_ENV: &str = "MINDGATE_DAEMON_ENABLED";
const SOCKET_ENV: &str = "MINDGATE_DAEMON_SOCKET";
const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_MS: u64 = 2000;
const WRITE_TIMEOUT_MS: u64 = 600;
const RETRY_DELAY_MS: u64 = 50;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Daemon disabled via MINDGATE_DAEMON_ENABLED")]
    Disabled,

    #[error("Home directory not found")]
    NoHomeDir,

    #[error("Failed to connect to daemon socket {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Daemon I/O failed: {0}")]
    Io(String),

    #[error("Daemon error {code}: {message}")]
    Daemon { code: String, message: String },

    #[error("Unexpected daemon response: {0}")]
    Protocol(String),
}

pub struct EventArgs<'a> {
    pub kind: EventKind,
    pub app_id: &'a str,
    pub timestamp: Option<i64>,
    pub expires_at: Option<i64>,
    pub event_id: Option<String>,
}

pub fn send_event(args: EventArgs<'_>) -> Result<Decision, ClientError> {
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }

    let event = EventEnvelope {
        event_id: Some(args.event_id.unwrap_or_else(make_event_id)),
        kind: args.kind,
        app_id: args.app_id.to_string(),
        timestamp: args.timestamp.unwrap_or_else(|| Utc::now().timestamp_millis()),
        expires_at: args.expires_at,
    };

    let data = match send_event_once(&event) {
        Ok(data) => data,
        Err(ClientError::Daemon { code, message }) => {
            // Validation failures will not improve on retry.
            return Err(ClientError::Daemon { code, message });
        }
        Err(err) => {
            tracing::warn!(
                error = %err,
                event_id = ?event.event_id,
                "Failed to send event to daemon"
            );
            std::thread::sleep(Duration::from_millis(RETRY_DELAY_MS));
            send_event_once(&event).map_err(|retry_err| {
                tracing::warn!(
                    error = %retry_err,
                    event_id = ?event.event_id,
                    "Retry failed sending event to daemon"
                );
                retry_err
            })?
        }
    };

    serde_json::from_value(data)
        .map_err(|err| ClientError::Protocol(format!("decision was not valid: {}", err)))
}

pub fn report_outcome(report: &OutcomeReport) -> Result<Value, ClientError> {
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }
    let params = serde_json::to_value(report)
        .map_err(|err| ClientError::Protocol(format!("Failed to serialize outcome: {}", err)))?;
    call(Method::ReportOutcome, None, Some(params))
}

pub fn app_state(app_id: &str) -> Result<Value, ClientError> {
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }
    call(
        Method::GetAppState,
        None,
        Some(serde_json::json!({ "appId": app_id })),
    )
}

pub fn daemon_health() -> Result<Value, ClientError> {
    if !daemon_enabled() {
        return Err(ClientError::Disabled);
    }
    call(Method::GetHealth, Some("health-check".to_string()), None)
}

pub fn daemon_enabled() -> bool {
    match env::var(ENABLE_ENV) {
        Ok(value) => matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"),
        Err(_) => true,
    }
}

fn send_event_once(event: &EventEnvelope) -> Result<Value, ClientError> {
    let params = serde_json::to_value(event)
        .map_err(|err| ClientError::Protocol(format!("Failed to serialize event: {}", err)))?;
    call(Method::Event, event.event_id.clone(), Some(params))
}

fn call(method: Method, id: Option<String>, params: Option<Value>) -> Result<Value, ClientError> {
    let response = send_request(Request {
        protocol_version: PROTOCOL_VERSION,
        method,
        id,
        params,
    })?;

    if response.ok {
        return response
            .data
            .ok_or_else(|| ClientError::Protocol("response had no data".to_string()));
    }
    Err(match response.error {
        Some(err) => ClientError::Daemon {
            code: err.code,
            message: err.message,
        },
        None => ClientError::Protocol("Unknown daemon error".to_string()),
    })
}

fn socket_path() -> Result<PathBuf, ClientError> {
    if let Ok(path) = env::var(SOCKET_ENV) {
        return Ok(PathBuf::from(path));
    }
    let home = dirs::home_dir().ok_or(ClientError::NoHomeDir)?;
    Ok(home.join(".mindgate").join(SOCKET_NAME))
}

fn send_request(request: Request) -> Result<Response, ClientError> {
    let socket = socket_path()?;
    let mut stream = UnixStream::connect(&socket).map_err(|source| ClientError::Connect {
        path: socket.clone(),
        source,
    })?;
    let _ = stream.set_read_timeout(Some(Duration::from_millis(READ_TIMEOUT_MS)));
    let _ = stream.set_write_timeout(Some(Duration::from_millis(WRITE_TIMEOUT_MS)));

    serde_json::to_writer(&mut stream, &request)
        .map_err(|err| ClientError::Io(format!("Failed to write request: {}", err)))?;
    stream
        .write_all(b"\n")
        .map_err(|err| ClientError::Io(format!("Failed to flush request: {}", err)))?;
    stream.flush().ok();

    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Result<Response, ClientError> {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ClientError::Protocol(
                        "Response exceeded maximum size".to_string(),
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ClientError::Io(
                    "Timed out waiting for daemon response".to_string(),
                ));
            }
            Err(err) => return Err(ClientError::Io(format!("Failed to read response: {}", err))),
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    if response_bytes.is_empty() {
        return Err(ClientError::Io("Daemon response was empty".to_string()));
    }

    serde_json::from_slice(response_bytes)
        .map_err(|err| ClientError::Protocol(format!("Failed to parse response JSON: {}", err)))
}

fn make_event_id() -> String {
    let mut random = rand::thread_rng();
    format!(
        "evt-{}-{}-{:x}",
        Utc::now().timestamp_millis(),
        std::process::id(),
        random.next_u64()
    )
}
