//! Global, app-agnostic Quick Task quota.
//!
//! The window is rolling: each usage ages out `window_ms` after it was
//! recorded. Reads only count; old rows are compacted by the sweeper.

use serde::Serialize;

use crate::config::QuickTaskConfig;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QuotaState {
    usage_history: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QuotaSnapshot {
    pub max_uses: u32,
    pub window_ms: i64,
    pub used_in_window: u32,
    pub remaining: u32,
}

impl QuotaState {
    pub fn from_history(mut usage_history: Vec<i64>) -> Self {
        usage_history.sort_unstable();
        Self { usage_history }
    }

    pub fn used_in_window(&self, now: i64, window_ms: i64) -> u32 {
        let fresh = self
            .usage_history
            .iter()
            .filter(|used_at| now.saturating_sub(**used_at) < window_ms)
            .count();
        u32::try_from(fresh).unwrap_or(u32::MAX)
    }

    pub fn remaining(&self, now: i64, config: &QuickTaskConfig) -> u32 {
        config
            .max_uses
            .saturating_sub(self.used_in_window(now, config.window_ms))
    }

    /// `remaining` as seen by an app that is inside its own Quick Task: the
    /// usage that paid for that window does not count against it, so only a
    /// lowered `max_uses` can exhaust the quota mid-window.
    pub fn remaining_for(&self, now: i64, config: &QuickTaskConfig, in_quick_task: bool) -> u32 {
        let used = self
            .used_in_window(now, config.window_ms)
            .saturating_sub(u32::from(in_quick_task));
        config.max_uses.saturating_sub(used)
    }

    pub fn snapshot(&self, now: i64, config: &QuickTaskConfig) -> QuotaSnapshot {
        QuotaSnapshot {
            max_uses: config.max_uses,
            window_ms: config.window_ms,
            used_in_window: self.used_in_window(now, config.window_ms),
            remaining: self.remaining(now, config),
        }
    }
}
