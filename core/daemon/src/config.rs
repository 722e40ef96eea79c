//! Runtime configuration read from `~/.mindgate/config.toml`.
//!
//! The settings collaborator owns this file; the daemon only reads it. It is
//! loaded fresh for every event and outcome so edits (a new monitored app, a
//! lower quota) take effect on the next decision without a restart.

use serde::Deserialize;
use std::env;
use std::path::PathBuf;

use crate::error::ConfigError;

const DEFAULT_CONFIG_RELATIVE_PATH: &str = ".mindgate/config.toml";
const CONFIG_PATH_ENV: &str = "MINDGATE_CONFIG";
const DEFAULT_HOST_APP_ID: &str = "mindgate";

#[derive(Debug, Clone, Deserialize)]
pub struct QuickTaskConfig {
    #[serde(default = "default_quick_task_duration_ms")]
    pub duration_ms: i64,
    #[serde(default = "default_quick_task_max_uses")]
    pub max_uses: u32,
    #[serde(default = "default_quick_task_window_ms")]
    pub window_ms: i64,
}

impl Default for QuickTaskConfig {
    fn default() -> Self {
        Self {
            duration_ms: default_quick_task_duration_ms(),
            max_uses: default_quick_task_max_uses(),
            window_ms: default_quick_task_window_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct IntentionConfig {
    /// Presets offered by the renderer after an intervention.
    #[serde(default = "default_intention_durations_ms")]
    pub durations_ms: Vec<i64>,
}

impl Default for IntentionConfig {
    fn default() -> Self {
        Self {
            durations_ms: default_intention_durations_ms(),
        }
    }
}

impl IntentionConfig {
    pub fn is_preset(&self, duration_ms: i64) -> bool {
        self.durations_ms.contains(&duration_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FlagsConfig {
    #[serde(default = "default_stale_threshold_ms")]
    pub stale_threshold_ms: i64,
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for FlagsConfig {
    fn default() -> Self {
        Self {
            stale_threshold_ms: default_stale_threshold_ms(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct QuotaConfig {
    #[serde(default = "default_history_retention_ms")]
    pub history_retention_ms: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            history_retention_ms: default_history_retention_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct LauncherConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_host_app_id")]
    pub host_app_id: String,
    #[serde(default)]
    pub monitored_apps: Vec<String>,
    #[serde(default)]
    pub quick_task: QuickTaskConfig,
    #[serde(default)]
    pub intention: IntentionConfig,
    #[serde(default)]
    pub flags: FlagsConfig,
    #[serde(default)]
    pub quota: QuotaConfig,
    #[serde(default)]
    pub launcher: LauncherConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            host_app_id: default_host_app_id(),
            monitored_apps: Vec::new(),
            quick_task: QuickTaskConfig::default(),
            intention: IntentionConfig::default(),
            flags: FlagsConfig::default(),
            quota: QuotaConfig::default(),
            launcher: LauncherConfig::default(),
        }
    }
}

impl EngineConfig {
    /// The host application is never monitored, even if listed.
    pub fn is_monitored(&self, app_id: &str) -> bool {
        app_id != self.host_app_id && self.monitored_apps.iter().any(|app| app == app_id)
    }

    /// Quota history older than this can be dropped from storage. Never
    /// shorter than the live window, or compaction would change `remaining`.
    pub fn quota_retention_ms(&self) -> i64 {
        self.quota
            .history_retention_ms
            .max(self.quick_task.window_ms)
    }
}

/// Where the config lives. Cheap to clone; `load` re-reads the file each time.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    path: PathBuf,
}

impl ConfigSource {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = env::var(CONFIG_PATH_ENV) {
            if !path.trim().is_empty() {
                return Ok(Self::new(PathBuf::from(path)));
            }
        }
        Ok(Self::new(default_config_path()?))
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    pub fn load(&self) -> Result<EngineConfig, ConfigError> {
        load_config(&self.path)
    }
}

pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
    Ok(home.join(DEFAULT_CONFIG_RELATIVE_PATH))
}

pub fn load_config(path: &PathBuf) -> Result<EngineConfig, ConfigError> {
    if !path.exists() {
        return Ok(EngineConfig::default());
    }

    let content = fs_err::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.clone(),
        source,
    })?;
    toml::from_str::<EngineConfig>(&content).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })
}

fn default_host_app_id() -> String {
    DEFAULT_HOST_APP_ID.to_string()
}

fn default_quick_task_duration_ms() -> i64 {
    3 * 60 * 1000
}

fn default_quick_task_max_uses() -> u32 {
    1
}

fn default_quick_task_window_ms() -> i64 {
    15 * 60 * 1000
}

fn default_intention_durations_ms() -> Vec<i64> {
    vec![5 * 60 * 1000, 15 * 60 * 1000, 30 * 60 * 1000]
}

fn default_stale_threshold_ms() -> i64 {
    10 * 60 * 1000
}

fn default_sweep_interval_secs() -> u64 {
    60
}

fn default_history_retention_ms() -> i64 {
    7 * 24 * 60 * 60 * 1000
}
