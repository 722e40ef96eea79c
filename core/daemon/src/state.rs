//! Shared state owned by the daemon process.
//!
//! Every event and outcome goes through the guard mutex, so quota and lifecycle
//! read-modify-write cycles are serialized across connection threads. The
//! store transaction runs while the mutex is held; launching the surface does
//! not, because the renderer may report back before the launch command returns.

use chrono::Utc;
use mindgate_protocol::{Decision, EventEnvelope, OutcomeReport};
use serde::Serialize;
use std::sync::{Mutex, MutexGuard};

use crate::config::{ConfigSource, EngineConfig};
use crate::db::{Db, ForegroundRow, SweepReport};
use crate::engine::{self, OutcomeAck};
use crate::error::EngineError;
use crate::flags::ExpiredQuickTaskFlag;
use crate::guard::{GuardSnapshot, LifecycleGuard};
use crate::launcher::{launcher_for, SurfaceLauncher};
use crate::quota::{QuotaSnapshot, QuotaState};
use crate::timers::AppTimers;

pub struct SharedState {
    db: Db,
    config: ConfigSource,
    guard: Mutex<LifecycleGuard>,
    launcher: Option<Box<dyn SurfaceLauncher>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AppStateSnapshot {
    pub app_id: String,
    pub monitored: bool,
    pub now: i64,
    pub timers: AppTimers,
    pub intention_valid: bool,
    pub quick_task_valid: bool,
    pub expired_flag: Option<ExpiredQuickTaskFlag>,
    pub quota: QuotaSnapshot,
    pub foreground: Option<ForegroundRow>,
    pub guard: GuardSnapshot,
}

#[derive(Debug, Clone, Serialize)]
pub struct EngineHealth {
    pub config_path: String,
    pub monitored_apps: usize,
    pub pending_flags: usize,
    pub guard: GuardSnapshot,
}

impl SharedState {
    pub fn new(db: Db, config: ConfigSource) -> Self {
        match db.list_flags() {
            Ok(flags) if !flags.is_empty() => {
                tracing::info!(count = flags.len(), "Loaded pending expired Quick Task flags");
            }
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(error = %err, "Failed to read pending expired flags");
            }
        }

        Self {
            db,
            config,
            guard: Mutex::new(LifecycleGuard::new()),
            launcher: None,
        }
    }

    /// Replaces the config-driven launcher; used by tests and embedders.
    pub fn with_launcher(mut self, launcher: Box<dyn SurfaceLauncher>) -> Self {
        self.launcher = Some(launcher);
        self
    }

    pub fn handle_event(&self, event: &EventEnvelope) -> Result<Decision, EngineError> {
        let config = self.config.load()?;

        let handled = {
            let mut guard = self.lock_guard();
            let before = guard.clone();
            let result = self
                .db
                .transaction(|tx| engine::handle_event(tx, &mut guard, &config, event));
            match result {
                Ok(handled) => handled,
                Err(err) => {
                    // The store rolled back; the guard must not run ahead of it.
                    *guard = before;
                    return Err(err.into());
                }
            }
        };

        if handled.replayed {
            return Ok(handled.decision);
        }
        let Decision::Launch { app_id, reason } = &handled.decision else {
            return Ok(handled.decision);
        };

        let result = match &self.launcher {
            Some(launcher) => launcher.launch_surface(app_id, *reason),
            None => launcher_for(&config.launcher).launch_surface(app_id, *reason),
        };
        if let Err(err) = result {
            tracing::error!(
                error = %err,
                app_id = %app_id,
                reason = reason.as_str(),
                "Surface launch failed; releasing lifecycle guard"
            );
            let mut guard = self.lock_guard();
            if !guard.holds(app_id, *reason, event.timestamp) {
                return Ok(Decision::None);
            }
            guard.release();
            let released = guard.clone();
            let undo = self
                .db
                .transaction(|tx| engine::undo_launch(tx, &mut guard, app_id, &handled.undo));
            if let Err(err) = undo {
                *guard = released;
                tracing::error!(
                    error = %err,
                    app_id = %app_id,
                    "Failed to restore state consumed by the failed launch"
                );
            }
            return Ok(Decision::None);
        }

        Ok(handled.decision)
    }

    pub fn handle_outcome(&self, report: &OutcomeReport) -> Result<OutcomeAck, EngineError> {
        let config = self.config.load()?;
        let now = report.timestamp.unwrap_or_else(now_ms);

        let mut guard = self.lock_guard();
        let before = guard.clone();
        let result = self
            .db
            .transaction(|tx| engine::handle_outcome(tx, &mut guard, &config, report, now));
        match result {
            Ok(ack) => Ok(ack),
            Err(err) => {
                *guard = before;
                Err(err.into())
            }
        }
    }

    pub fn app_state_snapshot(&self, app_id: &str) -> Result<AppStateSnapshot, EngineError> {
        let config = self.config.load()?;
        let now = now_ms();
        let guard = self.lock_guard().snapshot();

        let (timers, expired_flag, history, foreground) = self.db.transaction(|tx| {
            Ok((
                tx.load_timers(app_id)?,
                tx.load_flag(app_id)?,
                tx.usage_history()?,
                tx.foreground()?,
            ))
        })?;
        let quota = QuotaState::from_history(history).snapshot(now, &config.quick_task);

        Ok(AppStateSnapshot {
            app_id: app_id.to_string(),
            monitored: config.is_monitored(app_id),
            now,
            intention_valid: timers.intention_valid(now),
            quick_task_valid: timers.quick_task_valid(now),
            timers,
            expired_flag,
            quota,
            foreground,
            guard,
        })
    }

    pub fn health(&self) -> Result<EngineHealth, EngineError> {
        let config = self.config.load()?;
        let pending_flags = self.db.list_flags()?.len();
        Ok(EngineHealth {
            config_path: self.config.path().to_string_lossy().to_string(),
            monitored_apps: config.monitored_apps.len(),
            pending_flags,
            guard: self.lock_guard().snapshot(),
        })
    }

    /// Drops stale flags and compacts history, aged against the newest
    /// recorded event. Safe to run concurrently with event handling; the store
    /// serializes writers.
    pub fn sweep(&self) -> Result<SweepReport, EngineError> {
        let config = self.config.load()?;
        let report = self
            .db
            .sweep(config.flags.stale_threshold_ms, config.quota_retention_ms())?;
        Ok(report)
    }

    pub fn sweep_interval_secs(&self) -> u64 {
        self.config
            .load()
            .map(|config| config.flags.sweep_interval_secs)
            .unwrap_or_else(|_| EngineConfig::default().flags.sweep_interval_secs)
    }

    fn lock_guard(&self) -> MutexGuard<'_, LifecycleGuard> {
        self.guard
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}
