//! Per-app Intention and Quick Task timers.
//!
//! Expiry is lazy: a timer whose `expires_at` has passed is treated as absent
//! by `is_valid` even if no TIMER_ELAPSED has been processed for it yet, so
//! missed notifications from the detector never extend a permission window.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    QuickTask,
    Intention,
}

impl TimerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TimerKind::QuickTask => "quick_task",
            TimerKind::Intention => "intention",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AppTimers {
    pub app_id: String,
    pub intention_expires_at: Option<i64>,
    pub quick_task_expires_at: Option<i64>,
}

impl AppTimers {
    pub fn empty(app_id: &str) -> Self {
        Self {
            app_id: app_id.to_string(),
            intention_expires_at: None,
            quick_task_expires_at: None,
        }
    }

    /// Replaces any existing Intention timer. Returns the new expiry.
    pub fn set_intention(&mut self, duration_ms: i64, now: i64) -> i64 {
        let expires_at = now.saturating_add(duration_ms);
        self.intention_expires_at = Some(expires_at);
        expires_at
    }

    /// Replaces any existing Quick Task timer. Returns the new expiry.
    pub fn set_quick_task(&mut self, duration_ms: i64, now: i64) -> i64 {
        let expires_at = now.saturating_add(duration_ms);
        self.quick_task_expires_at = Some(expires_at);
        expires_at
    }

    pub fn clear_intention(&mut self) -> bool {
        self.intention_expires_at.take().is_some()
    }

    pub fn clear_quick_task(&mut self) -> bool {
        self.quick_task_expires_at.take().is_some()
    }

    pub fn clear(&mut self, kind: TimerKind) -> bool {
        match kind {
            TimerKind::QuickTask => self.clear_quick_task(),
            TimerKind::Intention => self.clear_intention(),
        }
    }

    pub fn expires_at(&self, kind: TimerKind) -> Option<i64> {
        match kind {
            TimerKind::QuickTask => self.quick_task_expires_at,
            TimerKind::Intention => self.intention_expires_at,
        }
    }

    pub fn intention_valid(&self, now: i64) -> bool {
        is_valid(self.intention_expires_at, now)
    }

    pub fn quick_task_valid(&self, now: i64) -> bool {
        is_valid(self.quick_task_expires_at, now)
    }

    pub fn is_empty(&self) -> bool {
        self.intention_expires_at.is_none() && self.quick_task_expires_at.is_none()
    }
}

pub fn is_valid(expires_at: Option<i64>, now: i64) -> bool {
    expires_at.map(|expires_at| expires_at > now).unwrap_or(false)
}
