//! "Quick Task expired" records.
//!
//! A flag describes a fact about the past (the timer ran out, and whether the
//! app was in front when it did), so it is safe to persist across restarts.
//! It is created once per elapsed Quick Task timer and deleted by the
//! evaluator or by staleness cleanup. A post-choice launch that fails puts it
//! back.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExpiredQuickTaskFlag {
    pub app_id: String,
    pub expired_at: i64,
    pub expired_while_foreground: bool,
}

impl ExpiredQuickTaskFlag {
    pub fn new(app_id: &str, expired_at: i64, expired_while_foreground: bool) -> Self {
        Self {
            app_id: app_id.to_string(),
            expired_at,
            expired_while_foreground,
        }
    }

    pub fn age_ms(&self, now: i64) -> i64 {
        now.saturating_sub(self.expired_at)
    }

    pub fn is_stale(&self, now: i64, threshold_ms: i64) -> bool {
        self.age_ms(now) > threshold_ms
    }
}
