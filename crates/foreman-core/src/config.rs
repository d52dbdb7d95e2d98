//! Configuration resolution for Foreman.
//!
//! Implements layered config resolution:
//! 1. Built-in defaults
//! 2. Global config (`$XDG_CONFIG_HOME/foreman/settings.json`)
//! 3. Project config (`.foreman/settings.json`)
//! 4. Environment variables (`FOREMAN_*`)
//! 5. CLI arguments (applied by the binary, highest priority)
//!
//! Files are merged key by key, so a partial file only overrides what it
//! names.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Complete Foreman configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(default)]
pub struct Config {
    pub daemon: DaemonConfig,
    pub scheduler: SchedulerConfig,
    pub sessions: SessionConfig,
    pub pipeline: PipelineConfig,
    pub bus: BusConfig,
}

/// Daemon process configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DaemonConfig {
    pub listen_addr: String,
    pub database_path: Option<PathBuf>,
    pub log_level: String,
    pub log_json: bool,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:7420".to_string(),
            database_path: None,
            log_level: "info".to_string(),
            log_json: false,
        }
    }
}

/// Feature watcher and concurrency configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between watcher polls.
    pub poll_interval_secs: u64,
    /// Active pipelines allowed per project unless overridden.
    pub default_project_limit: usize,
    /// Per-project overrides of `default_project_limit`.
    pub project_limits: HashMap<String, usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 30,
            default_project_limit: 1,
            project_limits: HashMap::new(),
        }
    }
}

impl SchedulerConfig {
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }
}

/// Agent subprocess configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SessionConfig {
    /// Agent CLI binary.
    pub agent_program: String,
    /// Arguments passed before any per-session arguments.
    pub agent_args: Vec<String>,
    /// Seconds without new input before a session is torn down.
    pub idle_timeout_secs: u64,
    /// Seconds between SIGTERM and SIGKILL.
    pub terminate_grace_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent_program: "claude".to_string(),
            agent_args: vec![
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--input-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ],
            idle_timeout_secs: 30 * 60,
            terminate_grace_secs: 5,
        }
    }
}

impl SessionConfig {
    pub const fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub const fn terminate_grace(&self) -> Duration {
        Duration::from_secs(self.terminate_grace_secs)
    }
}

/// Where a feature lands after all four roles succeed.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SuccessStatus {
    /// Wait for an explicit promotion to `passing`.
    #[default]
    ReviewReady,
    Passing,
}

/// Agent identity serving each pipeline role.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RoleRoster {
    pub architect: String,
    pub coder: String,
    pub reviewer: String,
    pub tester: String,
}

impl Default for RoleRoster {
    fn default() -> Self {
        Self {
            architect: "architect".to_string(),
            coder: "coder".to_string(),
            reviewer: "reviewer".to_string(),
            tester: "tester".to_string(),
        }
    }
}

/// Pipeline policy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PipelineConfig {
    pub success_status: SuccessStatus,
    pub roster: RoleRoster,
    /// Base directory for per-project workspaces; `<root>/<project_id>`.
    pub workspace_root: Option<PathBuf>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            success_status: SuccessStatus::default(),
            roster: RoleRoster::default(),
            workspace_root: None,
        }
    }
}

/// Stream bus tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct BusConfig {
    /// Live broadcast buffer per channel.
    pub broadcast_capacity: usize,
    /// Seconds a closed channel keeps its backlog for late reconnects.
    pub closed_retention_secs: u64,
    /// Events a run or thread channel keeps for replay.
    pub channel_backlog: usize,
    /// Events the aggregate feed keeps for replay.
    pub feed_backlog: usize,
}

impl BusConfig {
    pub const fn closed_retention(&self) -> Duration {
        Duration::from_secs(self.closed_retention_secs)
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            broadcast_capacity: 256,
            closed_retention_secs: 10 * 60,
            channel_backlog: 5_000,
            feed_backlog: 10_000,
        }
    }
}

/// Load configuration with layered resolution from the standard locations.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let global = global_config_path();
    let project = project_dir.map(|dir| dir.join(".foreman").join("settings.json"));
    let mut config = load_config_files(&[global.as_deref(), project.as_deref()])?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    Ok(config)
}

/// Merge the given settings files (lowest priority first) over the defaults.
///
/// Missing files are skipped; unreadable or malformed ones are an error.
pub fn load_config_files(paths: &[Option<&Path>]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths.iter().flatten() {
        if path.exists() {
            let overlay = read_config_file(path)?;
            merge_values(&mut merged, overlay);
        }
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("foreman").join("settings.json"))
}

/// Default database location: `~/.foreman/foreman.db`.
pub fn default_database_path() -> Option<PathBuf> {
    dirs::home_dir().map(|h| h.join(".foreman").join("foreman.db"))
}

fn read_config_file(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Recursively merge `overlay` into `base`. Objects merge per key, anything
/// else replaces.
fn merge_values(base: &mut Value, overlay: Value) {
    match (base, overlay) {
        (Value::Object(base), Value::Object(overlay)) => {
            for (key, value) in overlay {
                match base.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `FOREMAN_*` overrides. Values that fail to parse are ignored.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    if let Some(val) = lookup("FOREMAN_LISTEN_ADDR") {
        config.daemon.listen_addr = val;
    }
    if let Some(val) = lookup("FOREMAN_DB_PATH") {
        config.daemon.database_path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("FOREMAN_LOG_LEVEL") {
        config.daemon.log_level = val;
    }
    if let Some(n) = lookup("FOREMAN_POLL_INTERVAL_SECS").and_then(|v| v.parse().ok()) {
        config.scheduler.poll_interval_secs = n;
    }
    if let Some(n) = lookup("FOREMAN_PROJECT_LIMIT").and_then(|v| v.parse().ok()) {
        config.scheduler.default_project_limit = n;
    }
    if let Some(val) = lookup("FOREMAN_AGENT_PROGRAM") {
        config.sessions.agent_program = val;
    }
    if let Some(n) = lookup("FOREMAN_IDLE_TIMEOUT_SECS").and_then(|v| v.parse().ok()) {
        config.sessions.idle_timeout_secs = n;
    }
    if let Some(val) = lookup("FOREMAN_SUCCESS_STATUS") {
        match val.as_str() {
            "review_ready" => config.pipeline.success_status = SuccessStatus::ReviewReady,
            "passing" => config.pipeline.success_status = SuccessStatus::Passing,
            _ => {}
        }
    }
    if let Some(val) = lookup("FOREMAN_WORKSPACE_ROOT") {
        config.pipeline.workspace_root = Some(PathBuf::from(val));
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.scheduler.poll_interval(), Duration::from_secs(30));
        assert_eq!(config.scheduler.default_project_limit, 1);
        assert_eq!(config.sessions.idle_timeout(), Duration::from_secs(1800));
        assert_eq!(config.pipeline.success_status, SuccessStatus::ReviewReady);
    }

    #[test]
    fn partial_file_overrides_only_named_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(
            &path,
            r#"{"scheduler":{"project_limits":{"web":3}},"pipeline":{"success_status":"passing"}}"#,
        )
        .unwrap();

        let config = load_config_files(&[Some(&path)]).unwrap();
        assert_eq!(config.scheduler.project_limits.get("web"), Some(&3));
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.pipeline.success_status, SuccessStatus::Passing);
        assert_eq!(config.pipeline.roster.architect, "architect");
    }

    #[test]
    fn project_file_wins_over_global() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"sessions":{"agent_program":"global-agent","idle_timeout_secs":60}}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"sessions":{"agent_program":"project-agent"}}"#).unwrap();

        let config = load_config_files(&[Some(&global), Some(&project)]).unwrap();
        assert_eq!(config.sessions.agent_program, "project-agent");
        assert_eq!(config.sessions.idle_timeout_secs, 60);
    }

    #[test]
    fn missing_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        let config = load_config_files(&[Some(&missing), None]).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.json");
        std::fs::write(&path, "{not json").unwrap();
        assert!(matches!(
            load_config_files(&[Some(&path)]),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn env_overrides_apply_and_ignore_garbage() {
        let mut config = Config::default();
        let env: HashMap<&str, &str> = [
            ("FOREMAN_PROJECT_LIMIT", "4"),
            ("FOREMAN_POLL_INTERVAL_SECS", "soon"),
            ("FOREMAN_SUCCESS_STATUS", "passing"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut config, |k| env.get(k).map(ToString::to_string));

        assert_eq!(config.scheduler.default_project_limit, 4);
        assert_eq!(config.scheduler.poll_interval_secs, 30);
        assert_eq!(config.pipeline.success_status, SuccessStatus::Passing);
    }
}
