//! Priority chain that turns (event, snapshot) into exactly one decision.
//!
//! `evaluate` is pure. It reports the decision together with the side effects
//! the caller must apply (flag deletion, suppression, intention clearing,
//! guard acquisition), so the same chain can be unit tested without a store.
//!
//! Steps run in the order of `CHAIN`; the first step that returns a verdict
//! wins. Steps that only clean up (stale or background flags) record an
//! effect and fall through.

use mindgate_protocol::{Decision, LaunchReason};
use serde::Serialize;

use crate::flags::ExpiredQuickTaskFlag;
use crate::timers::AppTimers;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    LifecycleGuard,
    ForegroundExpiredQuickTask,
    BackgroundExpiredQuickTask,
    MonitoredApp,
    IntentionTimer,
    QuotaExhausted,
    QuickTaskTimer,
    QuickTaskOffer,
    Fallback,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Step::LifecycleGuard => "lifecycle_guard",
            Step::ForegroundExpiredQuickTask => "foreground_expired_quick_task",
            Step::BackgroundExpiredQuickTask => "background_expired_quick_task",
            Step::MonitoredApp => "monitored_app",
            Step::IntentionTimer => "intention_timer",
            Step::QuotaExhausted => "quota_exhausted",
            Step::QuickTaskTimer => "quick_task_timer",
            Step::QuickTaskOffer => "quick_task_offer",
            Step::Fallback => "fallback",
        }
    }
}

const CHAIN: [Step; 8] = [
    Step::LifecycleGuard,
    Step::ForegroundExpiredQuickTask,
    Step::BackgroundExpiredQuickTask,
    Step::MonitoredApp,
    Step::IntentionTimer,
    Step::QuotaExhausted,
    Step::QuickTaskTimer,
    Step::QuickTaskOffer,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// Consume the app's expired Quick Task flag.
    DeleteExpiredFlag,
    /// Stop re-offering Quick Task for this app entry.
    SuppressQuickTask,
    /// A fresh intervention voids any permission window.
    ClearIntentionTimer,
    /// Move the lifecycle guard to Active for the launched surface.
    AcquireGuard,
}

#[derive(Debug, Clone)]
pub struct EvaluationInput<'a> {
    pub app_id: &'a str,
    pub now: i64,
    pub monitored: bool,
    pub timers: &'a AppTimers,
    pub quota_remaining: u32,
    pub expired_flag: Option<&'a ExpiredQuickTaskFlag>,
    pub surface_active: bool,
    pub suppressed_app: Option<&'a str>,
    pub stale_threshold_ms: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Evaluation {
    pub decision: Decision,
    pub step: Step,
    pub effects: Vec<Effect>,
}

enum Verdict {
    Suppress,
    Launch(LaunchReason),
}

pub fn evaluate(input: &EvaluationInput<'_>) -> Evaluation {
    let mut effects = Vec::new();

    for step in CHAIN {
        if let Some(verdict) = apply_step(step, input, &mut effects) {
            return finish(input, step, verdict, effects);
        }
    }

    // Unreachable while QuickTaskOffer always answers, but kept as the
    // restrictive default should a step above ever decline to.
    finish(
        input,
        Step::Fallback,
        Verdict::Launch(LaunchReason::StartInterventionFlow),
        effects,
    )
}

fn apply_step(
    step: Step,
    input: &EvaluationInput<'_>,
    effects: &mut Vec<Effect>,
) -> Option<Verdict> {
    match step {
        Step::LifecycleGuard => input.surface_active.then_some(Verdict::Suppress),
        Step::ForegroundExpiredQuickTask => {
            let flag = input
                .expired_flag
                .filter(|flag| flag.expired_while_foreground)?;
            effects.push(Effect::DeleteExpiredFlag);
            if flag.is_stale(input.now, input.stale_threshold_ms) {
                return None;
            }
            effects.push(Effect::SuppressQuickTask);
            Some(Verdict::Launch(LaunchReason::ShowPostQuickTaskChoice))
        }
        Step::BackgroundExpiredQuickTask => {
            if input
                .expired_flag
                .map(|flag| !flag.expired_while_foreground)
                .unwrap_or(false)
            {
                effects.push(Effect::DeleteExpiredFlag);
            }
            None
        }
        Step::MonitoredApp => (!input.monitored).then_some(Verdict::Suppress),
        Step::IntentionTimer => input
            .timers
            .intention_valid(input.now)
            .then_some(Verdict::Suppress),
        Step::QuotaExhausted => (input.quota_remaining == 0)
            .then_some(Verdict::Launch(LaunchReason::StartInterventionFlow)),
        Step::QuickTaskTimer => input
            .timers
            .quick_task_valid(input.now)
            .then_some(Verdict::Suppress),
        Step::QuickTaskOffer => {
            if input.suppressed_app == Some(input.app_id) {
                Some(Verdict::Suppress)
            } else {
                Some(Verdict::Launch(LaunchReason::ShowQuickTaskDialog))
            }
        }
        Step::Fallback => Some(Verdict::Launch(LaunchReason::StartInterventionFlow)),
    }
}

fn finish(
    input: &EvaluationInput<'_>,
    step: Step,
    verdict: Verdict,
    mut effects: Vec<Effect>,
) -> Evaluation {
    let decision = match verdict {
        Verdict::Suppress => Decision::None,
        Verdict::Launch(reason) => {
            if reason == LaunchReason::StartInterventionFlow {
                effects.push(Effect::ClearIntentionTimer);
            }
            effects.push(Effect::AcquireGuard);
            Decision::launch(input.app_id, reason)
        }
    };

    Evaluation {
        decision,
        step,
        effects,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "com.example.feed";
    const THRESHOLD: i64 = 600_000;

    struct Fixture {
        timers: AppTimers,
        flag: Option<ExpiredQuickTaskFlag>,
        quota_remaining: u32,
        monitored: bool,
        surface_active: bool,
        suppressed: Option<String>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                timers: AppTimers::empty(APP),
                flag: None,
                quota_remaining: 1,
                monitored: true,
                surface_active: false,
                suppressed: None,
            }
        }

        fn run(&self, now: i64) -> Evaluation {
            evaluate(&EvaluationInput {
                app_id: APP,
                now,
                monitored: self.monitored,
                timers: &self.timers,
                quota_remaining: self.quota_remaining,
                expired_flag: self.flag.as_ref(),
                surface_active: self.surface_active,
                suppressed_app: self.suppressed.as_deref(),
                stale_threshold_ms: THRESHOLD,
            })
        }
    }

    #[test]
    fn unmonitored_app_is_suppressed() {
        let mut fixture = Fixture::new();
        fixture.monitored = false;
        let evaluation = fixture.run(1_000);
        assert_eq!(evaluation.decision, Decision::None);
        assert_eq!(evaluation.step, Step::MonitoredApp);
    }

    #[test]
    fn offers_quick_task_when_quota_remains() {
        let evaluation = Fixture::new().run(1_000);
        assert_eq!(
            evaluation.decision,
            Decision::launch(APP, LaunchReason::ShowQuickTaskDialog)
        );
        assert_eq!(evaluation.effects, vec![Effect::AcquireGuard]);
    }

    #[test]
    fn active_surface_dominates_everything() {
        let mut fixture = Fixture::new();
        fixture.surface_active = true;
        fixture.flag = Some(ExpiredQuickTaskFlag::new(APP, 1_000, true));
        let evaluation = fixture.run(1_050);
        assert_eq!(evaluation.decision, Decision::None);
        assert_eq!(evaluation.step, Step::LifecycleGuard);
        assert!(evaluation.effects.is_empty(), "flag must survive for later");
    }

    #[test]
    fn fresh_foreground_flag_forces_post_choice() {
        let mut fixture = Fixture::new();
        fixture.flag = Some(ExpiredQuickTaskFlag::new(APP, 181_000, true));
        let evaluation = fixture.run(181_050);
        assert_eq!(
            evaluation.decision,
            Decision::launch(APP, LaunchReason::ShowPostQuickTaskChoice)
        );
        assert_eq!(
            evaluation.effects,
            vec![
                Effect::DeleteExpiredFlag,
                Effect::SuppressQuickTask,
                Effect::AcquireGuard
            ]
        );
    }

    #[test]
    fn stale_foreground_flag_is_dropped_and_falls_through() {
        let mut fixture = Fixture::new();
        fixture.flag = Some(ExpiredQuickTaskFlag::new(APP, 0, true));
        let evaluation = fixture.run(700_000);
        assert_eq!(
            evaluation.decision,
            Decision::launch(APP, LaunchReason::ShowQuickTaskDialog)
        );
        assert_eq!(evaluation.effects[0], Effect::DeleteExpiredFlag);
        assert!(!evaluation.effects.contains(&Effect::SuppressQuickTask));
    }

    #[test]
    fn background_flag_is_dropped_without_deciding() {
        let mut fixture = Fixture::new();
        fixture.flag = Some(ExpiredQuickTaskFlag::new(APP, 1_000, false));
        fixture.timers.set_intention(60_000, 1_000);
        let evaluation = fixture.run(2_000);
        assert_eq!(evaluation.decision, Decision::None);
        assert_eq!(evaluation.step, Step::IntentionTimer);
        assert_eq!(evaluation.effects, vec![Effect::DeleteExpiredFlag]);
    }

    #[test]
    fn intention_outranks_quick_task_offer() {
        let mut fixture = Fixture::new();
        fixture.timers.set_intention(300_000, 0);
        let evaluation = fixture.run(1_000);
        assert_eq!(evaluation.decision, Decision::None);
        assert_eq!(evaluation.step, Step::IntentionTimer);
    }

    #[test]
    fn exhausted_quota_starts_intervention_and_clears_intention() {
        let mut fixture = Fixture::new();
        fixture.quota_remaining = 0;
        let evaluation = fixture.run(2_000);
        assert_eq!(
            evaluation.decision,
            Decision::launch(APP, LaunchReason::StartInterventionFlow)
        );
        assert_eq!(
            evaluation.effects,
            vec![Effect::ClearIntentionTimer, Effect::AcquireGuard]
        );
    }

    #[test]
    fn exhausted_quota_wins_over_valid_quick_task_timer() {
        let mut fixture = Fixture::new();
        fixture.quota_remaining = 0;
        fixture.timers.set_quick_task(180_000, 0);
        let evaluation = fixture.run(1_000);
        assert_eq!(evaluation.step, Step::QuotaExhausted);
    }

    #[test]
    fn valid_quick_task_timer_suppresses() {
        let mut fixture = Fixture::new();
        fixture.timers.set_quick_task(180_000, 1_000);
        let evaluation = fixture.run(1_100);
        assert_eq!(evaluation.decision, Decision::None);
        assert_eq!(evaluation.step, Step::QuickTaskTimer);
    }

    #[test]
    fn suppression_blocks_quick_task_reoffer_for_same_app_only() {
        let mut fixture = Fixture::new();
        fixture.suppressed = Some(APP.to_string());
        let evaluation = fixture.run(1_000);
        assert_eq!(evaluation.decision, Decision::None);
        assert_eq!(evaluation.step, Step::QuickTaskOffer);

        fixture.suppressed = Some("com.example.other".to_string());
        assert!(fixture.run(1_000).decision.is_launch());
    }

    #[test]
    fn elapsed_intention_no_longer_suppresses() {
        let mut fixture = Fixture::new();
        fixture.timers.set_intention(1_000, 0);
        let evaluation = fixture.run(1_000);
        assert_eq!(
            evaluation.decision,
            Decision::launch(APP, LaunchReason::ShowQuickTaskDialog)
        );
    }
}
