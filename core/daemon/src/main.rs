//! Mindgate daemon entrypoint.
//!
//! A small, single-writer service that owns the decision engine. It listens on
//! a Unix socket, validates each newline-delimited JSON request strictly, and
//! answers detector events with exactly one decision.

use fs_err as fs;
use std::env;
use std::io::{Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use mindgate_protocol::{
    parse_app_state, parse_event, parse_outcome, ErrorInfo, Method, Request, Response,
    MAX_REQUEST_BYTES, PROTOCOL_VERSION,
};
use serde::Serialize;

mod classifier;
mod config;
mod db;
mod engine;
mod error;
mod evaluator;
mod flags;
mod guard;
mod launcher;
mod quota;
mod state;
mod timers;

use config::ConfigSource;
use db::Db;
use error::EngineError;
use state::SharedState;

const SOCKET_NAME: &str = "daemon.sock";
const READ_TIMEOUT_SECS: u64 = 2;
const READ_CHUNK_SIZE: usize = 4096;

fn main() {
    init_logging();

    let socket_path = match daemon_socket_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon socket path");
            std::process::exit(1);
        }
    };

    if let Err(err) = prepare_socket_dir(&socket_path) {
        error!(error = %err, "Failed to prepare daemon socket directory");
        std::process::exit(1);
    }

    if let Err(err) = remove_existing_socket(&socket_path) {
        error!(error = %err, path = %socket_path.display(), "Failed to remove existing socket");
        std::process::exit(1);
    }

    let listener = match UnixListener::bind(&socket_path) {
        Ok(listener) => listener,
        Err(err) => {
            error!(error = %err, path = %socket_path.display(), "Failed to bind daemon socket");
            std::process::exit(1);
        }
    };

    info!(path = %socket_path.display(), "Mindgate daemon started");

    let db_path = match daemon_db_path() {
        Ok(path) => path,
        Err(err) => {
            error!(error = %err, "Failed to resolve daemon database path");
            std::process::exit(1);
        }
    };

    let db = match Db::new(db_path) {
        Ok(db) => db,
        Err(err) => {
            error!(error = %err, "Failed to initialize daemon database");
            std::process::exit(1);
        }
    };

    let config = match ConfigSource::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to resolve config path");
            std::process::exit(1);
        }
    };
    match config.load() {
        Ok(loaded) => info!(
            path = %config.path().display(),
            monitored_apps = loaded.monitored_apps.len(),
            quick_task_max_uses = loaded.quick_task.max_uses,
            launcher = loaded.launcher.command.as_deref().unwrap_or("none"),
            "Engine config loaded"
        ),
        // Not fatal: the file is re-read per request and may be fixed later.
        Err(err) => warn!(error = %err, "Engine config is currently unreadable"),
    }

    let shared_state = Arc::new(SharedState::new(db, config));
    spawn_sweeper(Arc::clone(&shared_state));

    for stream in listener.incoming() {
        match stream {
            Ok(stream) => {
                let state = Arc::clone(&shared_state);
                thread::spawn(|| handle_connection(stream, state));
            }
            Err(err) => {
                warn!(error = %err, "Failed to accept daemon connection");
            }
        }
    }
}

fn spawn_sweeper(state: Arc<SharedState>) {
    thread::spawn(move || loop {
        thread::sleep(Duration::from_secs(state.sweep_interval_secs().max(1)));
        match state.sweep() {
            Ok(report) if report != db::SweepReport::default() => {
                info!(
                    stale_flags = report.stale_flags,
                    usage_rows = report.usage_rows,
                    event_rows = report.event_rows,
                    "Periodic sweep removed rows"
                );
            }
            Ok(_) => {}
            Err(err) => warn!(error = %err, "Periodic sweep failed"),
        }
    });
}

fn init_logging() {
    let debug_enabled = env::var("MINDGATE_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn daemon_socket_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".mindgate").join(SOCKET_NAME))
}

fn daemon_db_path() -> Result<PathBuf, String> {
    let home = dirs::home_dir().ok_or_else(|| "Home directory not found".to_string())?;
    Ok(home.join(".mindgate").join("daemon").join("state.db"))
}

fn prepare_socket_dir(socket_path: &Path) -> Result<(), String> {
    let parent = socket_path
        .parent()
        .ok_or_else(|| "Socket path has no parent".to_string())?;
    fs::create_dir_all(parent).map_err(|err| format!("Failed to create socket directory: {}", err))
}

fn remove_existing_socket(socket_path: &Path) -> Result<(), String> {
    if socket_path.exists() {
        fs::remove_file(socket_path)
            .map_err(|err| format!("Failed to remove existing socket: {}", err))?;
    }
    Ok(())
}

fn handle_connection(mut stream: UnixStream, state: Arc<SharedState>) {
    let request = match read_request(&mut stream) {
        Ok(request) => request,
        Err(err) => {
            warn!(code = %err.code, message = %err.message, "Failed to read request");
            let response = Response::error_with_info(None, err);
            let _ = write_response(&mut stream, response);
            return;
        }
    };

    tracing::debug!(method = ?request.method, id = ?request.id, "Daemon request received");
    let response = handle_request(request, state);
    let _ = write_response(&mut stream, response);
}

fn read_request(stream: &mut UnixStream) -> Result<Request, ErrorInfo> {
    let _ = stream.set_read_timeout(Some(Duration::from_secs(READ_TIMEOUT_SECS)));

    let mut buffer = Vec::new();
    let mut chunk = [0u8; READ_CHUNK_SIZE];

    loop {
        match stream.read(&mut chunk) {
            Ok(0) => break,
            Ok(n) => {
                buffer.extend_from_slice(&chunk[..n]);
                if buffer.len() > MAX_REQUEST_BYTES {
                    return Err(ErrorInfo::new(
                        "request_too_large",
                        "request exceeded maximum size",
                    ));
                }
                if chunk[..n].contains(&b'\n') {
                    break;
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                return Err(ErrorInfo::new("read_timeout", "request timed out"));
            }
            Err(err) => {
                return Err(ErrorInfo::new(
                    "read_error",
                    format!("failed to read request: {}", err),
                ));
            }
        }
    }

    if buffer.is_empty() {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    let request_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => {
            if buffer[index + 1..].iter().any(|b| !b.is_ascii_whitespace()) {
                warn!("Extra bytes detected after newline; ignoring trailing data");
            }
            &buffer[..index]
        }
        None => buffer.as_slice(),
    };

    if request_bytes.iter().all(|b| b.is_ascii_whitespace()) {
        return Err(ErrorInfo::new("empty_request", "request body was empty"));
    }

    serde_json::from_slice(request_bytes).map_err(|err| {
        ErrorInfo::new(
            "invalid_json",
            format!("request was not valid JSON: {}", err),
        )
    })
}

fn handle_request(request: Request, state: Arc<SharedState>) -> Response {
    if request.protocol_version != PROTOCOL_VERSION {
        return Response::error(
            request.id,
            "protocol_mismatch",
            "unsupported protocol version",
        );
    }

    match request.method {
        Method::GetHealth => {
            let mut data = serde_json::json!({
                "status": "ok",
                "pid": std::process::id(),
                "version": env!("CARGO_PKG_VERSION"),
                "protocol_version": PROTOCOL_VERSION,
            });
            match state.health() {
                Ok(health) => {
                    if let Ok(value) = serde_json::to_value(health) {
                        data["engine"] = value;
                    }
                }
                Err(err) => {
                    data["status"] = serde_json::json!("degraded");
                    data["engine_error"] = serde_json::json!(err.to_string());
                }
            }
            Response::ok(request.id, data)
        }
        Method::Event => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "event payload is required");
            };
            let event = match parse_event(params) {
                Ok(event) => event,
                Err(err) => return Response::error_with_info(request.id, err),
            };

            info!(
                event_id = ?event.event_id,
                kind = event.kind.as_str(),
                app_id = %event.app_id,
                timestamp = event.timestamp,
                expires_at = ?event.expires_at,
                "Received event"
            );
            respond(request.id, state.handle_event(&event))
        }
        Method::ReportOutcome => {
            let Some(params) = request.params else {
                return Response::error(
                    request.id,
                    "invalid_params",
                    "outcome payload is required",
                );
            };
            let report = match parse_outcome(params) {
                Ok(report) => report,
                Err(err) => return Response::error_with_info(request.id, err),
            };

            info!(
                app_id = %report.app_id,
                outcome = report.outcome.as_str(),
                "Received outcome"
            );
            respond(request.id, state.handle_outcome(&report))
        }
        Method::GetAppState => {
            let Some(params) = request.params else {
                return Response::error(request.id, "invalid_params", "app_id is required");
            };
            match parse_app_state(params) {
                Ok(parsed) => respond(request.id, state.app_state_snapshot(&parsed.app_id)),
                Err(err) => Response::error_with_info(request.id, err),
            }
        }
    }
}

fn respond<T: Serialize>(id: Option<String>, result: Result<T, EngineError>) -> Response {
    match result {
        Ok(value) => match serde_json::to_value(value) {
            Ok(value) => Response::ok(id, value),
            Err(err) => Response::error(
                id,
                "serialization_error",
                format!("Failed to serialize response: {}", err),
            ),
        },
        Err(err) => {
            error!(code = err.code(), error = %err, "Request failed");
            Response::error(id, err.code(), err.to_string())
        }
    }
}

fn write_response(stream: &mut UnixStream, response: Response) -> std::io::Result<()> {
    serde_json::to_writer(&mut *stream, &response)?;
    stream.write_all(b"\n")?;
    stream.flush()?;
    Ok(())
}
