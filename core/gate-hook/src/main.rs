//! gate-hook: CLI bridge to the mindgate daemon.
//!
//! Called by the platform app detector for every mechanical event and by the
//! surface renderer to report what the user chose.
//!
//! ## Subcommands
//!
//! - `event`: Forward a detector event; prints the decision JSON on stdout
//! - `outcome`: Report a user choice or surface closure
//! - `state`: Dump the daemon's view of one app
//! - `health`: Check that the daemon is up

mod daemon_client;
mod logging;

use clap::{Parser, Subcommand, ValueEnum};
use mindgate_protocol::{Decision, EventKind, Outcome, OutcomeReport};
use serde::Serialize;

use daemon_client::{ClientError, EventArgs};

#[derive(Parser)]
#[command(name = "gate-hook")]
#[command(about = "Mindgate decision engine client")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Forward a detector event and print the resulting decision
    Event {
        #[arg(value_enum)]
        kind: KindArg,

        /// Bundle id / package name / domain of the app
        #[arg(value_name = "APP_ID")]
        app_id: String,

        /// Epoch milliseconds; defaults to now
        #[arg(long)]
        timestamp: Option<i64>,

        /// Scheduled expiry of the elapsed timer (timer-elapsed only)
        #[arg(long)]
        expires_at: Option<i64>,

        /// Correlation id; reuse it when re-sending the same event
        #[arg(long)]
        event_id: Option<String>,
    },

    /// Report what the user did on an interruption surface
    Outcome {
        #[arg(value_name = "APP_ID")]
        app_id: String,

        #[arg(value_enum)]
        outcome: OutcomeArg,

        /// Required for intention-set
        #[arg(long)]
        duration_ms: Option<i64>,

        /// Epoch milliseconds; defaults to the daemon's clock
        #[arg(long)]
        timestamp: Option<i64>,
    },

    /// Print timers, quota, and guard state for an app
    State {
        #[arg(value_name = "APP_ID")]
        app_id: String,
    },

    /// Check daemon health
    Health,
}

#[derive(Clone, Copy, ValueEnum)]
enum KindArg {
    ForegroundChanged,
    TimerElapsed,
    UserInteraction,
}

impl From<KindArg> for EventKind {
    fn from(value: KindArg) -> Self {
        match value {
            KindArg::ForegroundChanged => EventKind::ForegroundChanged,
            KindArg::TimerElapsed => EventKind::TimerElapsed,
            KindArg::UserInteraction => EventKind::UserInteraction,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum OutcomeArg {
    AcceptQuickTask,
    Decline,
    IntentionSet,
    SurfaceClosed,
}

fn main() {
    let _logging_guard = logging::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Event {
            kind,
            app_id,
            timestamp,
            expires_at,
            event_id,
        } => {
            let result = daemon_client::send_event(EventArgs {
                kind: kind.into(),
                app_id: &app_id,
                timestamp,
                expires_at,
                event_id,
            });
            let decision = match result {
                Ok(decision) => decision,
                Err(err) => {
                    // An unreachable daemon must never turn into a launch.
                    tracing::warn!(error = %err, app_id = %app_id, "gate-hook event failed");
                    print_json(&Decision::None);
                    std::process::exit(exit_code(&err));
                }
            };
            print_json(&decision);
        }
        Commands::Outcome {
            app_id,
            outcome,
            duration_ms,
            timestamp,
        } => {
            let outcome = match to_outcome(outcome, duration_ms) {
                Ok(outcome) => outcome,
                Err(message) => {
                    eprintln!("gate-hook: {}", message);
                    std::process::exit(2);
                }
            };
            let report = OutcomeReport {
                app_id,
                outcome,
                timestamp,
            };
            finish(daemon_client::report_outcome(&report), "outcome");
        }
        Commands::State { app_id } => finish(daemon_client::app_state(&app_id), "state"),
        Commands::Health => finish(daemon_client::daemon_health(), "health"),
    }
}

fn to_outcome(outcome: OutcomeArg, duration_ms: Option<i64>) -> Result<Outcome, String> {
    match (outcome, duration_ms) {
        (OutcomeArg::IntentionSet, Some(duration_ms)) => Ok(Outcome::IntentionSet { duration_ms }),
        (OutcomeArg::IntentionSet, None) => Err("intention-set requires --duration-ms".to_string()),
        (_, Some(_)) => Err("--duration-ms only applies to intention-set".to_string()),
        (OutcomeArg::AcceptQuickTask, None) => Ok(Outcome::AcceptQuickTask),
        (OutcomeArg::Decline, None) => Ok(Outcome::Decline),
        (OutcomeArg::SurfaceClosed, None) => Ok(Outcome::SurfaceClosed),
    }
}

fn finish<T: Serialize>(result: Result<T, ClientError>, label: &str) {
    match result {
        Ok(value) => print_json(&value),
        Err(err) => {
            tracing::error!(error = %err, "gate-hook {} failed", label);
            eprintln!("gate-hook: {}", err);
            std::process::exit(exit_code(&err));
        }
    }
}

fn exit_code(err: &ClientError) -> i32 {
    match err {
        ClientError::Disabled => 0,
        _ => 1,
    }
}

fn print_json<T: Serialize>(value: &T) {
    match serde_json::to_string(value) {
        Ok(line) => println!("{}", line),
        Err(err) => {
            eprintln!("gate-hook: failed to encode output: {}", err);
            std::process::exit(1);
        }
    }
}
