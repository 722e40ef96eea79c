//! Tags raw detector events. Pure: no store access, no side effects.

use mindgate_protocol::{EventEnvelope, EventKind};
use serde::Serialize;

use crate::config::EngineConfig;
use crate::timers::{AppTimers, TimerKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AppClass {
    /// The daemon's own surfaces. Never monitored, and not treated as the
    /// user leaving the app underneath.
    Host,
    Unmonitored,
    Monitored,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifiedEvent {
    pub kind: EventKind,
    pub app_id: String,
    pub timestamp: i64,
    pub app_class: AppClass,
    /// Resolved only for TIMER_ELAPSED on monitored apps.
    pub elapsed_timer: Option<TimerKind>,
}

impl ClassifiedEvent {
    pub fn is_monitored(&self) -> bool {
        self.app_class == AppClass::Monitored
    }
}

pub fn classify(
    event: &EventEnvelope,
    config: &EngineConfig,
    timers: &AppTimers,
) -> ClassifiedEvent {
    let app_class = if event.app_id == config.host_app_id {
        AppClass::Host
    } else if config.is_monitored(&event.app_id) {
        AppClass::Monitored
    } else {
        AppClass::Unmonitored
    };

    let elapsed_timer = match (event.kind, app_class) {
        (EventKind::TimerElapsed, AppClass::Monitored) => {
            resolve_elapsed_timer(timers, event.timestamp, event.expires_at)
        }
        _ => None,
    };

    ClassifiedEvent {
        kind: event.kind,
        app_id: event.app_id.clone(),
        timestamp: event.timestamp,
        app_class,
        elapsed_timer,
    }
}

/// Which stored timer an elapsed notification refers to.
///
/// With `expires_at` the match must be exact. Without it, any stored timer
/// already due at `timestamp` matches, Quick Task first. `None` means the
/// notification is a replay or refers to a superseded timer.
pub fn resolve_elapsed_timer(
    timers: &AppTimers,
    timestamp: i64,
    expires_at: Option<i64>,
) -> Option<TimerKind> {
    [TimerKind::QuickTask, TimerKind::Intention]
        .into_iter()
        .find(|kind| match (timers.expires_at(*kind), expires_at) {
            (Some(stored), Some(reported)) => stored == reported,
            (Some(stored), None) => stored <= timestamp,
            (None, _) => false,
        })
}
