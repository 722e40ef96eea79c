//! In-memory lifecycle guard and Quick Task suppression.
//!
//! Both flags are owned by the long-lived coordinator (see `state.rs`) and are
//! never written to disk: a fresh daemon always starts with no active surface
//! and no suppression.

use mindgate_protocol::LaunchReason;
use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ActiveSurface {
    pub app_id: String,
    pub reason: LaunchReason,
    pub approved_at: i64,
}

#[derive(Debug, Clone, Default)]
pub struct LifecycleGuard {
    active: Option<ActiveSurface>,
    suppress_quick_task_for: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GuardSnapshot {
    pub surface_active: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_surface: Option<ActiveSurface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suppress_quick_task_for: Option<String>,
}

impl LifecycleGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_surface_active(&self) -> bool {
        self.active.is_some()
    }

    pub fn active_surface(&self) -> Option<&ActiveSurface> {
        self.active.as_ref()
    }

    /// Inactive -> Active. Fails if a surface is already approved.
    pub fn try_acquire(&mut self, app_id: &str, reason: LaunchReason, now: i64) -> bool {
        if let Some(active) = &self.active {
            debug!(
                app_id = %app_id,
                active_app_id = %active.app_id,
                active_reason = active.reason.as_str(),
                "Lifecycle guard already held"
            );
            return false;
        }
        self.active = Some(ActiveSurface {
            app_id: app_id.to_string(),
            reason,
            approved_at: now,
        });
        true
    }

    /// Whether the guard is still held for the surface approved for
    /// `app_id` with `reason` at `approved_at`.
    pub fn holds(&self, app_id: &str, reason: LaunchReason, approved_at: i64) -> bool {
        self.active
            .as_ref()
            .map(|active| {
                active.app_id == app_id
                    && active.reason == reason
                    && active.approved_at == approved_at
            })
            .unwrap_or(false)
    }

    /// Active -> Inactive. Only a confirmed surface closure, or a launch that
    /// never produced a surface, may call this.
    pub fn release(&mut self) -> Option<ActiveSurface> {
        self.active.take()
    }

    pub fn suppress_quick_task_for(&mut self, app_id: &str) {
        self.suppress_quick_task_for = Some(app_id.to_string());
    }

    pub fn suppressed_app(&self) -> Option<&str> {
        self.suppress_quick_task_for.as_deref()
    }

    pub fn is_suppressed(&self, app_id: &str) -> bool {
        self.suppressed_app() == Some(app_id)
    }

    /// Clears suppression only if it names `app_id`.
    pub fn clear_suppression_for(&mut self, app_id: &str) -> bool {
        if self.is_suppressed(app_id) {
            self.suppress_quick_task_for = None;
            return true;
        }
        false
    }

    /// Undoes `suppress_quick_task_for(app_id)` unless something cleared it
    /// in the meantime.
    pub fn revert_suppression(&mut self, app_id: &str, previous: Option<String>) -> bool {
        if !self.is_suppressed(app_id) {
            return false;
        }
        self.suppress_quick_task_for = previous;
        true
    }

    /// Clears suppression if it names an app other than `app_id`.
    pub fn clear_suppression_unless(&mut self, app_id: &str) -> Option<String> {
        match &self.suppress_quick_task_for {
            Some(suppressed) if suppressed != app_id => self.suppress_quick_task_for.take(),
            _ => None,
        }
    }

    pub fn snapshot(&self) -> GuardSnapshot {
        GuardSnapshot {
            surface_active: self.is_surface_active(),
            active_surface: self.active.clone(),
            suppress_quick_task_for: self.suppress_quick_task_for.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_inactive_and_unsuppressed() {
        let guard = LifecycleGuard::new();
        assert!(!guard.is_surface_active());
        assert!(guard.suppressed_app().is_none());
    }

    #[test]
    fn second_acquire_is_vetoed_until_release() {
        let mut guard = LifecycleGuard::new();
        assert!(guard.try_acquire("a", LaunchReason::ShowQuickTaskDialog, 1));
        assert!(!guard.try_acquire("b", LaunchReason::StartInterventionFlow, 2));
        let released = guard.release().expect("active surface");
        assert_eq!(released.app_id, "a");
        assert!(guard.try_acquire("b", LaunchReason::StartInterventionFlow, 3));
    }

    #[test]
    fn release_when_inactive_is_harmless() {
        let mut guard = LifecycleGuard::new();
        assert!(guard.release().is_none());
        assert!(!guard.is_surface_active());
    }

    #[test]
    fn suppression_clears_only_for_other_apps() {
        let mut guard = LifecycleGuard::new();
        guard.suppress_quick_task_for("a");
        assert!(guard.clear_suppression_unless("a").is_none());
        assert!(guard.is_suppressed("a"));
        assert_eq!(guard.clear_suppression_unless("b").as_deref(), Some("a"));
        assert!(guard.suppressed_app().is_none());
    }

    #[test]
    fn targeted_clear_ignores_other_apps() {
        let mut guard = LifecycleGuard::new();
        guard.suppress_quick_task_for("a");
        assert!(!guard.clear_suppression_for("b"));
        assert!(guard.clear_suppression_for("a"));
        assert!(!guard.is_suppressed("a"));
    }

    #[test]
    fn holds_matches_the_exact_approval() {
        let mut guard = LifecycleGuard::new();
        assert!(!guard.holds("a", LaunchReason::ShowQuickTaskDialog, 1));
        assert!(guard.try_acquire("a", LaunchReason::ShowQuickTaskDialog, 1));
        assert!(guard.holds("a", LaunchReason::ShowQuickTaskDialog, 1));
        assert!(!guard.holds("a", LaunchReason::ShowQuickTaskDialog, 2));
        assert!(!guard.holds("a", LaunchReason::StartInterventionFlow, 1));
    }

    #[test]
    fn revert_suppression_respects_later_clears() {
        let mut guard = LifecycleGuard::new();
        guard.suppress_quick_task_for("a");
        assert!(guard.revert_suppression("a", None));
        assert!(guard.suppressed_app().is_none());

        guard.suppress_quick_task_for("a");
        guard.clear_suppression_unless("b");
        assert!(!guard.revert_suppression("a", Some("c".to_string())));
        assert!(guard.suppressed_app().is_none());
    }
}
