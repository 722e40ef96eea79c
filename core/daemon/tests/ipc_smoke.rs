use chrono::Utc;
use mindgate_protocol::{
    Decision, EventEnvelope, EventKind, LaunchReason, Method, Outcome, OutcomeReport, Request,
    Response, PROTOCOL_VERSION,
};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::{Duration, Instant};
use tempfile::TempDir;

const FEED: &str = "com.example.feed";
const NEWS: &str = "news.example.org";

struct DaemonGuard {
    child: Child,
}

impl Drop for DaemonGuard {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn spawn_daemon(home: &Path) -> DaemonGuard {
    let child = Command::new(env!("CARGO_BIN_EXE_mindgate-daemon"))
        .env("HOME", home)
        .env_remove("MINDGATE_CONFIG")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn mindgate-daemon");
    let guard = DaemonGuard { child };
    wait_for_socket(&socket_path(home), Duration::from_secs(2));
    guard
}

fn write_config(home: &Path, body: &str) {
    let dir = home.join(".mindgate");
    std::fs::create_dir_all(&dir).expect("create config dir");
    std::fs::write(dir.join("config.toml"), body).expect("write config");
}

fn socket_path(home: &Path) -> PathBuf {
    home.join(".mindgate").join("daemon.sock")
}

fn wait_for_socket(path: &Path, timeout: Duration) {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() && UnixStream::connect(path).is_ok() {
            return;
        }
        sleep(Duration::from_millis(25));
    }
    panic!("Timed out waiting for daemon socket at {}", path.display());
}

fn send_request(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).expect("Failed to connect to daemon socket");
    serde_json::to_writer(&mut stream, &request).expect("Failed to serialize request");
    stream.write_all(b"\n").expect("Failed to write request");
    stream.flush().ok();
    read_response(&mut stream)
}

fn read_response(stream: &mut UnixStream) -> Response {
    let mut buffer = Vec::new();
    let mut chunk = [0u8; 4096];

    loop {
        let n = stream.read(&mut chunk).expect("Failed to read response");
        if n == 0 {
            break;
        }
        buffer.extend_from_slice(&chunk[..n]);
        if chunk[..n].contains(&b'\n') {
            break;
        }
    }

    let response_bytes = match buffer.iter().position(|b| *b == b'\n') {
        Some(index) => &buffer[..index],
        None => buffer.as_slice(),
    };

    serde_json::from_slice(response_bytes).expect("Failed to parse response JSON")
}

fn send_event(socket: &Path, kind: EventKind, app_id: &str, timestamp: i64) -> Decision {
    send_envelope(
        socket,
        EventEnvelope {
            event_id: None,
            kind,
            app_id: app_id.to_string(),
            timestamp,
            expires_at: None,
        },
    )
}

fn send_envelope(socket: &Path, event: EventEnvelope) -> Decision {
    let response = send_request(
        socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::Event,
            id: event.event_id.clone(),
            params: Some(serde_json::to_value(&event).expect("Failed to serialize event")),
        },
    );
    assert!(response.ok, "event response was not ok: {:?}", response.error);
    serde_json::from_value(response.data.expect("event data")).expect("decision JSON")
}

fn report(socket: &Path, app_id: &str, outcome: Outcome, timestamp: i64) -> serde_json::Value {
    let report = OutcomeReport {
        app_id: app_id.to_string(),
        outcome,
        timestamp: Some(timestamp),
    };
    let response = send_request(
        socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::ReportOutcome,
            id: None,
            params: Some(serde_json::to_value(report).expect("Failed to serialize outcome")),
        },
    );
    assert!(response.ok, "outcome response was not ok: {:?}", response.error);
    response.data.expect("outcome data")
}

#[test]
fn daemon_ipc_health_and_quick_task_smoke() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(
        home.path(),
        &format!(
            "monitored_apps = [\"{}\", \"{}\"]\n\n[quick_task]\nmax_uses = 2\n",
            FEED, NEWS
        ),
    );
    let _daemon = spawn_daemon(home.path());
    let socket = socket_path(home.path());

    let health = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetHealth,
            id: Some("health-check".to_string()),
            params: None,
        },
    );
    assert!(health.ok, "health response was not ok");
    let data = health.data.expect("health data");
    assert_eq!(data["status"], "ok");
    assert_eq!(data["engine"]["monitored_apps"], 2);

    let now = Utc::now().timestamp_millis();

    assert_eq!(
        send_event(&socket, EventKind::ForegroundChanged, "com.example.mail", now),
        Decision::None
    );
    assert_eq!(
        send_event(&socket, EventKind::ForegroundChanged, FEED, now + 10),
        Decision::launch(FEED, LaunchReason::ShowQuickTaskDialog)
    );
    // Storm while the dialog is up.
    for offset in 0..5 {
        assert_eq!(
            send_event(&socket, EventKind::UserInteraction, FEED, now + 20 + offset),
            Decision::None
        );
    }

    let ack = report(&socket, FEED, Outcome::AcceptQuickTask, now + 100);
    assert_eq!(ack["applied"], true);
    assert_eq!(ack["quick_task_expires_at"], now + 100 + 180_000);
    let ack = report(&socket, FEED, Outcome::SurfaceClosed, now + 120);
    assert_eq!(ack["surface_released"], true);

    assert_eq!(
        send_event(&socket, EventKind::UserInteraction, FEED, now + 200),
        Decision::None
    );

    let app_state = send_request(
        &socket,
        Request {
            protocol_version: PROTOCOL_VERSION,
            method: Method::GetAppState,
            id: None,
            params: Some(serde_json::json!({ "appId": FEED })),
        },
    );
    assert!(app_state.ok);
    let data = app_state.data.expect("app state data");
    assert_eq!(data["quick_task_valid"], true);
    assert_eq!(data["quota"]["used_in_window"], 1);
}

#[test]
fn daemon_restart_keeps_expired_quick_task_flag() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(home.path(), &format!("monitored_apps = [\"{}\"]\n", FEED));
    let socket = socket_path(home.path());
    let now = Utc::now().timestamp_millis();
    let expires_at = now + 100 + 180_000;

    {
        let _daemon = spawn_daemon(home.path());
        assert!(send_event(&socket, EventKind::ForegroundChanged, FEED, now).is_launch());
        report(&socket, FEED, Outcome::AcceptQuickTask, now + 100);
        report(&socket, FEED, Outcome::SurfaceClosed, now + 150);

        let elapsed = EventEnvelope {
            event_id: Some("timer-1".to_string()),
            kind: EventKind::TimerElapsed,
            app_id: FEED.to_string(),
            timestamp: expires_at,
            expires_at: Some(expires_at),
        };
        assert_eq!(send_envelope(&socket, elapsed.clone()), Decision::None);
        assert_eq!(send_envelope(&socket, elapsed), Decision::None);
    }

    let _daemon = spawn_daemon(home.path());
    assert_eq!(
        send_event(&socket, EventKind::UserInteraction, FEED, expires_at + 50),
        Decision::launch(FEED, LaunchReason::ShowPostQuickTaskChoice)
    );
    report(&socket, FEED, Outcome::SurfaceClosed, expires_at + 60);

    // Quota of one is spent; the only remaining path is the intervention.
    assert_eq!(
        send_event(&socket, EventKind::UserInteraction, FEED, expires_at + 100),
        Decision::launch(FEED, LaunchReason::StartInterventionFlow)
    );
}

#[test]
fn daemon_intention_suppresses_until_declined() {
    let home = TempDir::new().expect("Failed to create temp HOME");
    write_config(
        home.path(),
        &format!("monitored_apps = [\"{}\"]\n\n[quick_task]\nmax_uses = 0\n", FEED),
    );
    let _daemon = spawn_daemon(home.path());
    let socket = socket_path(home.path());
    let now = Utc::now().timestamp_millis();

    assert_eq!(
        send_event(&socket, EventKind::ForegroundChanged, FEED, now),
        Decision::launch(FEED, LaunchReason::StartInterventionFlow)
    );
    let ack = report(
        &socket,
        FEED,
        Outcome::IntentionSet {
            duration_ms: 300_000,
        },
        now + 50,
    );
    assert_eq!(ack["intention_expires_at"], now + 50 + 300_000);
    report(&socket, FEED, Outcome::SurfaceClosed, now + 60);

    assert_eq!(
        send_event(&socket, EventKind::ForegroundChanged, FEED, now + 1_000),
        Decision::None
    );

    report(&socket, FEED, Outcome::Decline, now + 2_000);
    assert!(send_event(&socket, EventKind::ForegroundChanged, FEED, now + 3_000).is_launch());
}
