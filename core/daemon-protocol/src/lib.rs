//! IPC protocol types and validation for mindgate-daemon.
//!
//! This crate is shared by the daemon and its clients (the foreground detector
//! bridge and the surface renderer) to prevent schema drift. The daemon remains
//! the authority on validation, but clients can reuse the same types to
//! construct valid requests and read decisions back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const PROTOCOL_VERSION: u32 = 1;
pub const MAX_REQUEST_BYTES: usize = 1024 * 1024; // 1MB

const MAX_EVENT_ID_LEN: usize = 128;
const MAX_APP_ID_LEN: usize = 256;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub enum Method {
    GetHealth,
    Event,
    ReportOutcome,
    GetAppState,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Request {
    pub protocol_version: u32,
    pub method: Method,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub params: Option<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Response {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: &str, message: impl Into<String>) -> Self {
        Self {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

impl Response {
    pub fn ok(id: Option<String>, data: Value) -> Self {
        Self {
            ok: true,
            id,
            data: Some(data),
            error: None,
        }
    }

    pub fn error(id: Option<String>, code: &str, message: impl Into<String>) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(ErrorInfo::new(code, message)),
        }
    }

    pub fn error_with_info(id: Option<String>, error: ErrorInfo) -> Self {
        Self {
            ok: false,
            id,
            data: None,
            error: Some(error),
        }
    }
}

/// Mechanical signal kinds emitted by the foreground detector.
///
/// None of these carry semantic meaning; in particular `TimerElapsed` does not
/// say *which* timer elapsed. The daemon resolves that against its own store.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    ForegroundChanged,
    TimerElapsed,
    UserInteraction,
    /// Any kind this daemon does not know. Logged and otherwise ignored, so a
    /// newer detector never turns into errors on an older daemon.
    #[serde(other)]
    Unknown,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ForegroundChanged => "FOREGROUND_CHANGED",
            EventKind::TimerElapsed => "TIMER_ELAPSED",
            EventKind::UserInteraction => "USER_INTERACTION",
            EventKind::Unknown => "UNKNOWN",
        }
    }

    /// Whether an interruption surface may be shown while handling this kind.
    pub fn is_ui_safe(&self) -> bool {
        matches!(
            self,
            EventKind::ForegroundChanged | EventKind::UserInteraction
        )
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EventEnvelope {
    /// Optional correlation id. Retries must reuse it so the daemon can drop
    /// replays of an event it already applied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_id: Option<String>,
    pub kind: EventKind,
    pub app_id: String,
    /// Wall-clock milliseconds since the Unix epoch.
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
}

impl EventEnvelope {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        if let Some(event_id) = &self.event_id {
            if event_id.trim().is_empty() {
                return Err(ErrorInfo::new(
                    "invalid_event_id",
                    "eventId must not be blank",
                ));
            }
            if event_id.len() > MAX_EVENT_ID_LEN {
                return Err(ErrorInfo::new(
                    "invalid_event_id",
                    "eventId must be 128 characters or fewer",
                ));
            }
        }

        validate_app_id(&self.app_id)?;
        validate_timestamp(self.timestamp, "timestamp")?;

        match self.kind {
            EventKind::TimerElapsed => {
                if let Some(expires_at) = self.expires_at {
                    validate_timestamp(expires_at, "expiresAt")?;
                }
            }
            EventKind::ForegroundChanged | EventKind::UserInteraction | EventKind::Unknown => {
                if self.expires_at.is_some() {
                    return Err(ErrorInfo::new(
                        "unexpected_field",
                        format!("expiresAt is not allowed on {}", self.kind.as_str()),
                    ));
                }
            }
        }

        Ok(())
    }
}

pub fn parse_event(params: Value) -> Result<EventEnvelope, ErrorInfo> {
    let envelope: EventEnvelope = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("event payload is invalid JSON: {}", err),
        )
    })?;
    envelope.validate()?;
    Ok(envelope)
}

/// Final, declarative instruction for the surface renderer.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LaunchReason {
    ShowQuickTaskDialog,
    StartInterventionFlow,
    ShowPostQuickTaskChoice,
}

impl LaunchReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            LaunchReason::ShowQuickTaskDialog => "SHOW_QUICK_TASK_DIALOG",
            LaunchReason::StartInterventionFlow => "START_INTERVENTION_FLOW",
            LaunchReason::ShowPostQuickTaskChoice => "SHOW_POST_QUICK_TASK_CHOICE",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum Decision {
    None,
    Launch {
        #[serde(rename = "appId")]
        app_id: String,
        reason: LaunchReason,
    },
}

impl Decision {
    pub fn launch(app_id: &str, reason: LaunchReason) -> Self {
        Decision::Launch {
            app_id: app_id.to_string(),
            reason,
        }
    }

    pub fn is_launch(&self) -> bool {
        matches!(self, Decision::Launch { .. })
    }
}

/// The user's answer on an interruption surface, or its closure.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    AcceptQuickTask,
    Decline,
    IntentionSet {
        #[serde(rename = "durationMs")]
        duration_ms: i64,
    },
    SurfaceClosed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::AcceptQuickTask => "ACCEPT_QUICK_TASK",
            Outcome::Decline => "DECLINE",
            Outcome::IntentionSet { .. } => "INTENTION_SET",
            Outcome::SurfaceClosed => "SURFACE_CLOSED",
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct OutcomeReport {
    pub app_id: String,
    pub outcome: Outcome,
    /// Defaults to the daemon's wall clock when omitted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
}

impl OutcomeReport {
    pub fn validate(&self) -> Result<(), ErrorInfo> {
        validate_app_id(&self.app_id)?;
        if let Some(timestamp) = self.timestamp {
            validate_timestamp(timestamp, "timestamp")?;
        }
        if let Outcome::IntentionSet { duration_ms } = self.outcome {
            if duration_ms <= 0 {
                return Err(ErrorInfo::new(
                    "invalid_duration",
                    "durationMs must be greater than zero",
                ));
            }
        }
        Ok(())
    }
}

pub fn parse_outcome(params: Value) -> Result<OutcomeReport, ErrorInfo> {
    let report: OutcomeReport = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("outcome payload is invalid JSON: {}", err),
        )
    })?;
    report.validate()?;
    Ok(report)
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AppStateParams {
    pub app_id: String,
}

pub fn parse_app_state(params: Value) -> Result<AppStateParams, ErrorInfo> {
    let parsed: AppStateParams = serde_json::from_value(params).map_err(|err| {
        ErrorInfo::new(
            "invalid_params",
            format!("app state params are invalid JSON: {}", err),
        )
    })?;
    validate_app_id(&parsed.app_id)?;
    Ok(parsed)
}

fn validate_app_id(app_id: &str) -> Result<(), ErrorInfo> {
    if app_id.trim().is_empty() {
        return Err(ErrorInfo::new("missing_field", "appId is required"));
    }
    if app_id.len() > MAX_APP_ID_LEN {
        return Err(ErrorInfo::new(
            "invalid_app_id",
            "appId must be 256 characters or fewer",
        ));
    }
    Ok(())
}

fn validate_timestamp(value: i64, field: &str) -> Result<(), ErrorInfo> {
    if value < 0 {
        return Err(ErrorInfo::new(
            "invalid_timestamp",
            format!("{} must be non-negative epoch milliseconds", field),
        ));
    }
    Ok(())
}
