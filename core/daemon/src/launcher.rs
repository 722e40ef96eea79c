//! Hands approved launches to the renderer.
//!
//! The daemon does not draw anything itself. When a launch is approved it runs
//! the configured `[launcher] command` with the configured args followed by the
//! app id and launch reason, e.g. `open -g mindgate://surface --args com.example.feed
//! SHOW_QUICK_TASK_DIALOG`. Without a command the decision is only logged and
//! returned to the caller, which is then responsible for rendering.

use mindgate_protocol::LaunchReason;
use std::process::{Command, Stdio};

use crate::config::LauncherConfig;
use crate::error::LaunchError;

pub trait SurfaceLauncher: Send + Sync {
    fn launch_surface(&self, app_id: &str, reason: LaunchReason) -> Result<(), LaunchError>;
}

pub struct CommandLauncher {
    command: String,
    args: Vec<String>,
}

impl CommandLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }
}

impl SurfaceLauncher for CommandLauncher {
    fn launch_surface(&self, app_id: &str, reason: LaunchReason) -> Result<(), LaunchError> {
        let status = Command::new(&self.command)
            .args(&self.args)
            .arg(app_id)
            .arg(reason.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map_err(|source| LaunchError::Spawn {
                command: self.command.clone(),
                source,
            })?;

        if !status.success() {
            return Err(LaunchError::Exited {
                command: self.command.clone(),
                status: status.to_string(),
            });
        }
        tracing::debug!(command = %self.command, app_id = %app_id, "Surface command dispatched");
        Ok(())
    }
}

/// Used when no command is configured; the caller renders from the returned
/// decision.
pub struct LogLauncher;

impl SurfaceLauncher for LogLauncher {
    fn launch_surface(&self, app_id: &str, reason: LaunchReason) -> Result<(), LaunchError> {
        tracing::info!(
            app_id = %app_id,
            reason = reason.as_str(),
            "No launcher command configured; leaving surface to caller"
        );
        Ok(())
    }
}

pub fn launcher_for(config: &LauncherConfig) -> Box<dyn SurfaceLauncher> {
    match config.command.as_deref().map(str::trim) {
        Some(command) if !command.is_empty() => {
            Box::new(CommandLauncher::new(command, config.args.clone()))
        }
        _ => Box::new(LogLauncher),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn successful_command_is_ok() {
        let launcher = CommandLauncher::new("true", Vec::new());
        assert!(launcher
            .launch_surface("com.example.feed", LaunchReason::ShowQuickTaskDialog)
            .is_ok());
    }

    #[test]
    fn failing_command_is_an_error() {
        let launcher = CommandLauncher::new("false", Vec::new());
        let err = launcher
            .launch_surface("com.example.feed", LaunchReason::StartInterventionFlow)
            .expect_err("non-zero exit");
        assert!(matches!(err, LaunchError::Exited { .. }));
    }

    #[test]
    fn missing_binary_is_a_spawn_error() {
        let launcher = CommandLauncher::new("/nonexistent/mindgate-surface", Vec::new());
        let err = launcher
            .launch_surface("com.example.feed", LaunchReason::ShowQuickTaskDialog)
            .expect_err("spawn fails");
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }

    #[test]
    fn command_receives_app_and_reason() {
        let temp_dir = tempfile::tempdir().expect("temp dir");
        let out = temp_dir.path().join("args.txt");
        let launcher = CommandLauncher::new(
            "sh",
            vec![
                "-c".to_string(),
                format!("echo \"$1 $2\" > {}", out.display()),
                "surface".to_string(),
            ],
        );
        launcher
            .launch_surface("com.example.feed", LaunchReason::ShowPostQuickTaskChoice)
            .expect("launch");
        let written = std::fs::read_to_string(&out).expect("read args");
        assert_eq!(written.trim(), "com.example.feed SHOW_POST_QUICK_TASK_CHOICE");
    }

    #[test]
    fn blank_command_falls_back_to_logging() {
        let config = LauncherConfig {
            command: Some("  ".to_string()),
            args: Vec::new(),
        };
        assert!(launcher_for(&config)
            .launch_surface("com.example.feed", LaunchReason::ShowQuickTaskDialog)
            .is_ok());
    }
}
