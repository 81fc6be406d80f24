//! Configuration resolution for hostprobe.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Global config (`<config dir>/hostprobe/settings.json`)
//! 3. Project config (`.hostprobe/settings.json`)
//! 4. Environment variables (`HOSTPROBE_*`)
//! 5. CLI arguments (highest priority, applied by the binary)
//!
//! File layers are merged key by key, so a project file that only sets
//! `scheduler.max_concurrency` keeps every other value from the layers below.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Complete hostprobe configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerSettings,
    #[serde(default)]
    pub retry: RetrySettings,
    #[serde(default)]
    pub shell: ShellSettings,
    #[serde(default)]
    pub logging: LoggingSettings,
    /// Probes to run. Empty means the built-in catalog for the shell dialect.
    #[serde(default)]
    pub probes: Vec<ProbeSpec>,
}

/// What the scheduler does once the global deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeadlinePolicy {
    /// Cancel unfinished tasks and return the partial report.
    #[default]
    Abandon,
    /// Cancel unfinished tasks and surface the report as an error.
    Fail,
    /// Log the report and keep waiting for every task.
    Wait,
}

impl std::str::FromStr for DeadlinePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "abandon" => Ok(Self::Abandon),
            "fail" => Ok(Self::Fail),
            "wait" => Ok(Self::Wait),
            other => Err(Error::Config(format!(
                "Unknown deadline policy '{other}' (expected abandon, fail or wait)"
            ))),
        }
    }
}

/// Shell family used to frame commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShellDialect {
    /// `/bin/sh` compatible shells.
    Posix,
    /// Windows PowerShell / pwsh.
    #[serde(alias = "pwsh")]
    PowerShell,
}

impl Default for ShellDialect {
    fn default() -> Self {
        if cfg!(windows) {
            Self::PowerShell
        } else {
            Self::Posix
        }
    }
}

impl ShellDialect {
    /// Program spawned when no explicit shell program is configured.
    pub const fn default_program(self) -> &'static str {
        match self {
            Self::Posix => "/bin/sh",
            Self::PowerShell => "powershell",
        }
    }
}

impl std::str::FromStr for ShellDialect {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "posix" | "sh" => Ok(Self::Posix),
            "powershell" | "pwsh" => Ok(Self::PowerShell),
            other => Err(Error::Config(format!(
                "Unknown shell dialect '{other}' (expected posix or powershell)"
            ))),
        }
    }
}

/// Batch scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SchedulerSettings {
    pub max_concurrency: usize,
    /// Per-task timeout (milliseconds).
    pub task_timeout_ms: u64,
    /// Deadline for the whole batch (milliseconds).
    pub global_deadline_ms: u64,
    pub progress_interval_ms: u64,
    pub deadline_policy: DeadlinePolicy,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            task_timeout_ms: 30_000,
            global_deadline_ms: 5 * 60 * 1000, // 5 minutes
            progress_interval_ms: 5_000,
            deadline_policy: DeadlinePolicy::default(),
        }
    }
}

/// Retry behaviour for empty results.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetrySettings {
    /// Retries after the first attempt.
    pub max_retries: u32,
    /// Fixed delay between attempts (milliseconds).
    pub delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_retries: 2,
            delay_ms: 500,
        }
    }
}

/// Local shell configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ShellSettings {
    pub dialect: ShellDialect,
    /// Shell binary. Defaults to the dialect's usual program.
    pub program: Option<PathBuf>,
    /// Keep one interactive shell alive for all commands.
    pub persistent: bool,
    /// Grace period for the persistent shell to exit before it is killed (milliseconds).
    pub terminate_timeout_ms: u64,
}

impl Default for ShellSettings {
    fn default() -> Self {
        Self {
            dialect: ShellDialect::default(),
            program: None,
            persistent: true,
            terminate_timeout_ms: 5_000,
        }
    }
}

impl ShellSettings {
    /// The shell binary to spawn.
    pub fn program(&self) -> PathBuf {
        self.program
            .clone()
            .unwrap_or_else(|| PathBuf::from(self.dialect.default_program()))
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    pub json: bool,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

/// A single named telemetry command.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeSpec {
    /// Task name used in diagnostics.
    pub name: String,
    /// Key under which the output is reported. Defaults to `name`.
    #[serde(default)]
    pub result_key: Option<String>,
    /// Command text in the configured shell dialect.
    pub command: String,
    /// Per-probe timeout override (milliseconds).
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl ProbeSpec {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            result_key: None,
            command: command.into(),
            timeout_ms: None,
        }
    }

    /// Key under which this probe's result is reported.
    pub fn key(&self) -> &str {
        self.result_key.as_deref().unwrap_or(&self.name)
    }
}

impl Config {
    /// Check values that would make a batch meaningless.
    pub fn validate(&self) -> Result<()> {
        if self.scheduler.task_timeout_ms == 0 {
            return Err(Error::Config("scheduler.task_timeout_ms must be > 0".into()));
        }
        if self.scheduler.global_deadline_ms == 0 {
            return Err(Error::Config(
                "scheduler.global_deadline_ms must be > 0".into(),
            ));
        }
        if self.scheduler.progress_interval_ms == 0 {
            return Err(Error::Config(
                "scheduler.progress_interval_ms must be > 0".into(),
            ));
        }

        let mut keys = HashSet::new();
        for probe in &self.probes {
            if probe.name.trim().is_empty() {
                return Err(Error::Config("Probe with empty name".into()));
            }
            if probe.command.trim().is_empty() {
                return Err(Error::Config(format!(
                    "Probe '{}' has an empty command",
                    probe.name
                )));
            }
            if !keys.insert(probe.key().to_string()) {
                return Err(Error::Config(format!(
                    "Duplicate probe result key '{}'",
                    probe.key()
                )));
            }
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
pub fn load_config(project_dir: Option<&Path>) -> Result<Config> {
    let mut layers = Vec::new();
    if let Some(global_path) = global_config_path() {
        layers.push(global_path);
    }
    if let Some(dir) = project_dir {
        layers.push(project_config_path(dir));
    }

    let mut config = load_layers(&layers)?;
    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    config.validate()?;
    Ok(config)
}

/// Merge the given config files (missing files are skipped) over the defaults.
pub fn load_layers(paths: &[PathBuf]) -> Result<Config> {
    let mut merged = serde_json::to_value(Config::default())?;
    for path in paths {
        if !path.exists() {
            continue;
        }
        tracing::debug!(path = %path.display(), "Loading config layer");
        let overlay = load_config_file(path)?;
        merge_values(&mut merged, overlay);
    }
    serde_json::from_value(merged)
        .map_err(|e| Error::Config(format!("Invalid merged configuration: {e}")))
}

/// Get the global config file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("hostprobe").join("settings.json"))
}

/// Project-level config file path under `dir`.
pub fn project_config_path(dir: &Path) -> PathBuf {
    dir.join(".hostprobe").join("settings.json")
}

fn load_config_file(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

/// Deep-merge `overlay` into `base`. Objects merge per key; anything else replaces.
fn merge_values(base: &mut serde_json::Value, overlay: serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base_map), serde_json::Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                match base_map.get_mut(&key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        base_map.insert(key, value);
                    }
                }
            }
        }
        (base, overlay) => *base = overlay,
    }
}

/// Apply `HOSTPROBE_*` overrides. `lookup` resolves a variable name.
///
/// Unparseable values are ignored with a warning.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    fn parsed<T: std::str::FromStr>(
        lookup: &impl Fn(&str) -> Option<String>,
        key: &str,
    ) -> Option<T> {
        let raw = lookup(key)?;
        match raw.parse() {
            Ok(v) => Some(v),
            Err(_) => {
                tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
                None
            }
        }
    }

    if let Some(n) = parsed(&lookup, "HOSTPROBE_MAX_CONCURRENCY") {
        config.scheduler.max_concurrency = n;
    }
    if let Some(n) = parsed(&lookup, "HOSTPROBE_TASK_TIMEOUT_MS") {
        config.scheduler.task_timeout_ms = n;
    }
    if let Some(n) = parsed(&lookup, "HOSTPROBE_GLOBAL_DEADLINE_MS") {
        config.scheduler.global_deadline_ms = n;
    }
    if let Some(policy) = parsed(&lookup, "HOSTPROBE_DEADLINE_POLICY") {
        config.scheduler.deadline_policy = policy;
    }
    if let Some(n) = parsed(&lookup, "HOSTPROBE_MAX_RETRIES") {
        config.retry.max_retries = n;
    }
    if let Some(n) = parsed(&lookup, "HOSTPROBE_RETRY_DELAY_MS") {
        config.retry.delay_ms = n;
    }
    if let Some(dialect) = parsed(&lookup, "HOSTPROBE_SHELL_DIALECT") {
        config.shell.dialect = dialect;
    }
    if let Some(program) = lookup("HOSTPROBE_SHELL_PROGRAM") {
        config.shell.program = Some(PathBuf::from(program));
    }
    if let Some(level) = lookup("HOSTPROBE_LOG_LEVEL") {
        config.logging.level = level;
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn write(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    #[test]
    fn default_retry_is_two_retries_half_second_apart() {
        let config = Config::default();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.delay_ms, 500);
    }

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn layers_merge_per_key() {
        let dir = tempfile::tempdir().unwrap();
        let global = write(
            dir.path(),
            "global.json",
            r#"{"scheduler": {"max_concurrency": 4, "task_timeout_ms": 1000}}"#,
        );
        let project = write(
            dir.path(),
            "project.json",
            r#"{"scheduler": {"max_concurrency": 2}, "shell": {"dialect": "powershell"}}"#,
        );

        let config = load_layers(&[global, project]).unwrap();
        assert_eq!(config.scheduler.max_concurrency, 2);
        assert_eq!(config.scheduler.task_timeout_ms, 1000);
        assert_eq!(
            config.scheduler.global_deadline_ms,
            SchedulerSettings::default().global_deadline_ms
        );
        assert_eq!(config.shell.dialect, ShellDialect::PowerShell);
    }

    #[test]
    fn missing_layers_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let config = load_layers(&[dir.path().join("nope.json")]).unwrap();
        assert_eq!(config, Config::default());
    }

    #[test]
    fn malformed_layer_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let bad = write(dir.path(), "bad.json", "{ not json");
        let err = load_layers(&[bad]).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "got {err:?}");
    }

    #[test]
    fn probes_load_from_project_layer() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".hostprobe")).unwrap();
        std::fs::write(
            project_config_path(dir.path()),
            r#"{"probes": [{"name": "uptime", "command": "uptime", "timeout_ms": 50},
                           {"name": "kernel", "result_key": "os.kernel", "command": "uname -r"}]}"#,
        )
        .unwrap();

        let config = load_layers(&[project_config_path(dir.path())]).unwrap();
        assert_eq!(config.probes.len(), 2);
        assert_eq!(config.probes[0].timeout_ms, Some(50));
        assert_eq!(config.probes[0].key(), "uptime");
        assert_eq!(config.probes[1].key(), "os.kernel");
    }

    #[test]
    fn env_overrides_apply() {
        let vars: HashMap<&str, &str> = [
            ("HOSTPROBE_MAX_CONCURRENCY", "3"),
            ("HOSTPROBE_DEADLINE_POLICY", "fail"),
            ("HOSTPROBE_SHELL_DIALECT", "pwsh"),
            ("HOSTPROBE_RETRY_DELAY_MS", "not-a-number"),
            ("HOSTPROBE_LOG_LEVEL", "debug"),
        ]
        .into_iter()
        .collect();

        let mut config = Config::default();
        apply_env_overrides(&mut config, |k| vars.get(k).map(ToString::to_string));

        assert_eq!(config.scheduler.max_concurrency, 3);
        assert_eq!(config.scheduler.deadline_policy, DeadlinePolicy::Fail);
        assert_eq!(config.shell.dialect, ShellDialect::PowerShell);
        assert_eq!(config.retry.delay_ms, 500);
        assert_eq!(config.logging.level, "debug");
    }

    #[test]
    fn validate_rejects_duplicate_keys() {
        let config = Config {
            probes: vec![
                ProbeSpec::new("a", "echo a"),
                ProbeSpec {
                    result_key: Some("a".into()),
                    ..ProbeSpec::new("b", "echo b")
                },
            ],
            ..Default::default()
        };
        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("Duplicate"), "{err}");
    }

    #[test]
    fn validate_rejects_empty_command() {
        let config = Config {
            probes: vec![ProbeSpec::new("a", "   ")],
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_zero_timeout() {
        let mut config = Config::default();
        config.scheduler.task_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn dialect_program_defaults() {
        let settings = ShellSettings {
            dialect: ShellDialect::Posix,
            ..Default::default()
        };
        assert_eq!(settings.program(), PathBuf::from("/bin/sh"));

        let settings = ShellSettings {
            program: Some(PathBuf::from("/usr/bin/bash")),
            ..settings
        };
        assert_eq!(settings.program(), PathBuf::from("/usr/bin/bash"));
    }

    #[test]
    fn deadline_policy_parses() {
        assert_eq!("Wait".parse::<DeadlinePolicy>().unwrap(), DeadlinePolicy::Wait);
        assert!("sometimes".parse::<DeadlinePolicy>().is_err());
    }
}
