//! Event and outcome handlers.
//!
//! Each handler runs inside one store transaction and receives the in-memory
//! guard by exclusive reference. Nothing here survives between invocations
//! except what is written through `StoreTx` and the guard itself.

use mindgate_protocol::{Decision, EventEnvelope, EventKind, LaunchReason, Outcome, OutcomeReport};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::classifier::{classify, AppClass, ClassifiedEvent};
use crate::config::EngineConfig;
use crate::db::StoreTx;
use crate::error::StoreError;
use crate::evaluator::{evaluate, Effect, EvaluationInput, Step};
use crate::flags::ExpiredQuickTaskFlag;
use crate::guard::LifecycleGuard;
use crate::quota::QuotaState;
use crate::timers::TimerKind;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OutcomeAck {
    pub outcome: &'static str,
    pub applied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quick_task_expires_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intention_expires_at: Option<i64>,
    pub surface_released: bool,
}

/// What one event produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandledEvent {
    pub decision: Decision,
    /// Answered from the event log; the launch already happened the first
    /// time this event id was seen.
    pub replayed: bool,
    pub undo: LaunchUndo,
}

impl HandledEvent {
    fn quiet() -> Self {
        Self::decided(Decision::None, LaunchUndo::default())
    }

    fn decided(decision: Decision, undo: LaunchUndo) -> Self {
        Self {
            decision,
            replayed: false,
            undo,
        }
    }
}

/// State a launch decision consumed. Put back if the surface never appears.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchUndo {
    pub consumed_flag: Option<ExpiredQuickTaskFlag>,
    pub suppressed_before: Option<String>,
}

impl OutcomeAck {
    fn new(outcome: &Outcome) -> Self {
        Self {
            outcome: outcome.as_str(),
            applied: false,
            quick_task_expires_at: None,
            intention_expires_at: None,
            surface_released: false,
        }
    }
}

pub fn handle_event(
    tx: &StoreTx<'_>,
    guard: &mut LifecycleGuard,
    config: &EngineConfig,
    event: &EventEnvelope,
) -> Result<HandledEvent, StoreError> {
    if let Some(event_id) = event.event_id.as_deref() {
        if let Some(recorded) = tx.recorded_decision(event_id)? {
            let decision = replayed_decision(guard, event, recorded);
            debug!(
                event_id = %event_id,
                app_id = %event.app_id,
                launch = decision.is_launch(),
                "Answering replayed event from the log"
            );
            return Ok(HandledEvent {
                decision,
                replayed: true,
                undo: LaunchUndo::default(),
            });
        }
    }
    tx.insert_event(event)?;

    let timers = tx.load_timers(&event.app_id)?;
    let classified = classify(event, config, &timers);
    debug!(
        kind = classified.kind.as_str(),
        app_id = %classified.app_id,
        app_class = ?classified.app_class,
        elapsed_timer = ?classified.elapsed_timer,
        "Classified event"
    );

    if classified.kind == EventKind::ForegroundChanged {
        track_foreground(tx, guard, &classified)?;
    }

    if !classified.kind.is_ui_safe() {
        // Deferred to the next UI-safe event: the detector may be running in
        // a background context with no window to host a surface.
        match classified.kind {
            EventKind::TimerElapsed => handle_timer_elapsed(tx, &classified)?,
            _ => debug!(app_id = %classified.app_id, "Ignoring unknown event kind"),
        }
        return Ok(HandledEvent::quiet());
    }

    let handled = decide(tx, guard, config, &classified)?;
    if let (Some(event_id), true) = (event.event_id.as_deref(), handled.decision.is_launch()) {
        tx.record_decision(event_id, &handled.decision)?;
    }
    Ok(handled)
}

/// A replayed launch is answered again only while its surface still holds the
/// guard; once closed or failed, repeating it would show a second surface.
fn replayed_decision(
    guard: &LifecycleGuard,
    event: &EventEnvelope,
    recorded: Decision,
) -> Decision {
    let still_held = match &recorded {
        Decision::Launch { app_id, reason } => guard.holds(app_id, *reason, event.timestamp),
        Decision::None => false,
    };
    if still_held {
        recorded
    } else {
        Decision::None
    }
}

/// Restores what a launch decision consumed after the surface failed to
/// launch. The guard must already be released.
pub fn undo_launch(
    tx: &StoreTx<'_>,
    guard: &mut LifecycleGuard,
    app_id: &str,
    undo: &LaunchUndo,
) -> Result<(), StoreError> {
    let Some(flag) = &undo.consumed_flag else {
        return Ok(());
    };
    let restored = tx.insert_flag(flag)?;
    let reverted = guard.revert_suppression(app_id, undo.suppressed_before.clone());
    info!(
        app_id = %app_id,
        expired_at = flag.expired_at,
        restored,
        reverted,
        "Post-choice obligation restored after failed launch"
    );
    Ok(())
}

fn track_foreground(
    tx: &StoreTx<'_>,
    guard: &mut LifecycleGuard,
    classified: &ClassifiedEvent,
) -> Result<(), StoreError> {
    // Our own surfaces sit on top of the monitored app; they are not the user
    // leaving it.
    if classified.app_class == AppClass::Host {
        return Ok(());
    }

    tx.set_foreground(&classified.app_id, classified.timestamp)?;
    if let Some(previous) = guard.clear_suppression_unless(&classified.app_id) {
        info!(
            suppressed_app_id = %previous,
            app_id = %classified.app_id,
            "Quick Task suppression cleared (user left app)"
        );
    }
    Ok(())
}

fn handle_timer_elapsed(tx: &StoreTx<'_>, classified: &ClassifiedEvent) -> Result<(), StoreError> {
    if !classified.is_monitored() {
        return Ok(());
    }

    let Some(kind) = classified.elapsed_timer else {
        debug!(
            app_id = %classified.app_id,
            "Elapsed notification matches no stored timer; ignoring"
        );
        return Ok(());
    };

    let mut timers = tx.load_timers(&classified.app_id)?;
    timers.clear(kind);
    tx.save_timers(&timers)?;

    match kind {
        TimerKind::Intention => {
            info!(app_id = %classified.app_id, "Intention timer elapsed");
        }
        TimerKind::QuickTask => {
            let in_foreground = tx
                .foreground()?
                .map(|row| row.app_id == classified.app_id)
                .unwrap_or(false);
            let flag =
                ExpiredQuickTaskFlag::new(&classified.app_id, classified.timestamp, in_foreground);
            let created = tx.insert_flag(&flag)?;
            info!(
                app_id = %classified.app_id,
                expired_at = flag.expired_at,
                expired_while_foreground = in_foreground,
                created,
                "Quick Task timer elapsed"
            );
        }
    }
    Ok(())
}

fn decide(
    tx: &StoreTx<'_>,
    guard: &mut LifecycleGuard,
    config: &EngineConfig,
    classified: &ClassifiedEvent,
) -> Result<HandledEvent, StoreError> {
    if !classified.is_monitored() {
        return Ok(HandledEvent::quiet());
    }

    let app_id = classified.app_id.as_str();
    let now = classified.timestamp;
    let mut timers = tx.load_timers(app_id)?;
    let flag = tx.load_flag(app_id)?;
    let quota = QuotaState::from_history(tx.usage_history()?);
    let quota_remaining =
        quota.remaining_for(now, &config.quick_task, timers.quick_task_valid(now));

    let evaluation = evaluate(&EvaluationInput {
        app_id,
        now,
        monitored: classified.is_monitored(),
        timers: &timers,
        quota_remaining,
        expired_flag: flag.as_ref(),
        surface_active: guard.is_surface_active(),
        suppressed_app: guard.suppressed_app(),
        stale_threshold_ms: config.flags.stale_threshold_ms,
    });

    let mut undo = LaunchUndo {
        consumed_flag: None,
        suppressed_before: guard.suppressed_app().map(str::to_string),
    };
    for effect in &evaluation.effects {
        match effect {
            Effect::DeleteExpiredFlag => {
                tx.delete_flag(app_id)?;
                if let Some(flag) = &flag {
                    if flag.is_stale(now, config.flags.stale_threshold_ms) {
                        info!(
                            app_id = %app_id,
                            age_ms = flag.age_ms(now),
                            "Discarded stale expired Quick Task flag"
                        );
                    } else if !flag.expired_while_foreground {
                        debug!(app_id = %app_id, "Discarded background expired Quick Task flag");
                    }
                }
            }
            Effect::SuppressQuickTask => {
                undo.consumed_flag = flag.clone();
                guard.suppress_quick_task_for(app_id);
            }
            Effect::ClearIntentionTimer => {
                if timers.clear_intention() {
                    tx.save_timers(&timers)?;
                }
            }
            Effect::AcquireGuard => {}
        }
    }

    let Decision::Launch { reason, .. } = &evaluation.decision else {
        let step = evaluation.step.as_str();
        if evaluation.step == Step::LifecycleGuard {
            debug!(app_id = %app_id, step, "Duplicate launch vetoed by lifecycle guard");
        } else {
            debug!(app_id = %app_id, step, "Suppressed");
        }
        return Ok(HandledEvent::quiet());
    };

    if !guard.try_acquire(app_id, *reason, now) {
        warn!(app_id = %app_id, reason = reason.as_str(), "Launch vetoed; guard already held");
        return Ok(HandledEvent::quiet());
    }

    info!(
        app_id = %app_id,
        reason = reason.as_str(),
        step = evaluation.step.as_str(),
        quota_remaining,
        "Launch approved"
    );
    Ok(HandledEvent::decided(evaluation.decision, undo))
}

pub fn handle_outcome(
    tx: &StoreTx<'_>,
    guard: &mut LifecycleGuard,
    config: &EngineConfig,
    report: &OutcomeReport,
    now: i64,
) -> Result<OutcomeAck, StoreError> {
    let app_id = report.app_id.as_str();
    let mut ack = OutcomeAck::new(&report.outcome);

    match &report.outcome {
        Outcome::AcceptQuickTask => {
            if guard.clear_suppression_for(app_id) {
                info!(app_id = %app_id, "Quick Task suppression cleared (explicit request)");
            }
            if !config.is_monitored(app_id) {
                warn!(app_id = %app_id, "Quick Task accepted for unmonitored app; ignoring");
                return Ok(ack);
            }

            let quota = QuotaState::from_history(tx.usage_history()?);
            if quota.remaining(now, &config.quick_task) == 0 {
                warn!(app_id = %app_id, "Quick Task accepted with exhausted quota; not granted");
                return Ok(ack);
            }

            let mut timers = tx.load_timers(app_id)?;
            let expires_at = timers.set_quick_task(config.quick_task.duration_ms, now);
            tx.save_timers(&timers)?;
            tx.delete_flag(app_id)?;
            tx.record_usage(app_id, now)?;
            info!(app_id = %app_id, expires_at, "Quick Task granted");

            ack.applied = true;
            ack.quick_task_expires_at = Some(expires_at);
        }
        Outcome::Decline => {
            let mut timers = tx.load_timers(app_id)?;
            if timers.clear_intention() {
                tx.save_timers(&timers)?;
            }
            info!(app_id = %app_id, "Quick Task declined; intervention proceeds");
            ack.applied = true;
        }
        Outcome::IntentionSet { duration_ms } => {
            if !config.intention.is_preset(*duration_ms) {
                info!(
                    app_id = %app_id,
                    duration_ms,
                    "Intention duration is not one of the configured presets"
                );
            }
            let mut timers = tx.load_timers(app_id)?;
            let expires_at = timers.set_intention(*duration_ms, now);
            tx.save_timers(&timers)?;
            info!(app_id = %app_id, expires_at, "Intention timer set");

            ack.applied = true;
            ack.intention_expires_at = Some(expires_at);
        }
        Outcome::SurfaceClosed => {
            match guard.release() {
                Some(surface) => {
                    if surface.app_id != app_id {
                        warn!(
                            app_id = %app_id,
                            active_app_id = %surface.app_id,
                            "Surface closed for a different app than launched; releasing anyway"
                        );
                    }
                    if surface.reason == LaunchReason::ShowPostQuickTaskChoice
                        && guard.clear_suppression_for(&surface.app_id)
                    {
                        info!(
                            app_id = %surface.app_id,
                            "Quick Task suppression cleared (forced intervention ended)"
                        );
                    }
                    info!(
                        app_id = %surface.app_id,
                        reason = surface.reason.as_str(),
                        open_ms = now.saturating_sub(surface.approved_at),
                        "Surface closed"
                    );
                    ack.surface_released = true;
                }
                None => {
                    debug!(app_id = %app_id, "Surface closed while guard already inactive");
                }
            }
            ack.applied = true;
        }
    }

    Ok(ack)
}
