//! Configuration loader and validator for the autoreel daemon.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::retry::{Backoff, RetryPolicy};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub service: Service,
    pub automation: Automation,
    pub scheduler: Scheduler,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    #[serde(default)]
    pub database_url: Option<String>,
}

/// Remote generation service settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Service {
    pub base_url: String,
    #[serde(default)]
    pub api_key: Option<String>,
    pub request_timeout_seconds: u64,
}

/// Pipeline tuning.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Automation {
    pub video_attempts: u32,
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub backoff: Backoff,
    pub max_concurrent_videos: usize,
    #[serde(default = "default_prepared_delay")]
    pub prepared_breakdown_delay_ms: u64,
    #[serde(default = "default_true")]
    pub notify: bool,
}

/// Idle-triggered queue scheduler settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub enabled: bool,
    pub idle_threshold_seconds: u64,
    pub tick_interval_ms: u64,
}

fn default_prepared_delay() -> u64 {
    300
}

fn default_true() -> bool {
    true
}

impl App {
    /// Database URL to use when `DATABASE_URL` is not set in the environment.
    pub fn resolved_database_url(&self) -> String {
        match self.database_url.as_deref().map(str::trim) {
            Some(url) if !url.is_empty() => url.to_string(),
            _ => format!("sqlite://{}/autoreel.db", self.data_dir.trim_end_matches('/')),
        }
    }
}

impl Automation {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.video_attempts,
            delay: Duration::from_millis(self.retry_delay_ms),
            backoff: self.backoff,
        }
    }
}

impl Scheduler {
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_secs(self.idle_threshold_seconds)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.service.request_timeout_seconds)
    }
}

/// Load configuration from a YAML file and validate it.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let cfg: Config = serde_yaml::from_str(&content)?;
    validate(&cfg)?;
    Ok(cfg)
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }

    let base = cfg.service.base_url.trim();
    if base.is_empty() {
        return Err(ConfigError::Invalid("service.base_url must be non-empty"));
    }
    if reqwest::Url::parse(base).is_err() {
        return Err(ConfigError::Invalid("service.base_url must be an absolute URL"));
    }
    if cfg.service.request_timeout_seconds == 0 {
        return Err(ConfigError::Invalid(
            "service.request_timeout_seconds must be > 0",
        ));
    }

    if cfg.automation.video_attempts == 0 {
        return Err(ConfigError::Invalid("automation.video_attempts must be > 0"));
    }
    if cfg.automation.max_concurrent_videos == 0 {
        return Err(ConfigError::Invalid(
            "automation.max_concurrent_videos must be > 0",
        ));
    }
    // retry_delay_ms may be zero; that just disables the pause between attempts

    if cfg.scheduler.idle_threshold_seconds == 0 {
        return Err(ConfigError::Invalid(
            "scheduler.idle_threshold_seconds must be > 0",
        ));
    }
    if cfg.scheduler.tick_interval_ms == 0 {
        return Err(ConfigError::Invalid("scheduler.tick_interval_ms must be > 0"));
    }

    Ok(())
}

/// Returns the example YAML content shipped with the project.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"

service:
  base_url: "http://127.0.0.1:8000/api/"
  api_key: ""
  request_timeout_seconds: 900

automation:
  video_attempts: 3
  retry_delay_ms: 2000
  backoff: fixed
  max_concurrent_videos: 4
  prepared_breakdown_delay_ms: 300
  notify: true

scheduler:
  enabled: true
  idle_threshold_seconds: 900
  tick_interval_ms: 1000
"#
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn parse_example_ok() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        validate(&cfg).unwrap();
        assert_eq!(cfg.automation.backoff, Backoff::Fixed);
        assert_eq!(cfg.scheduler.idle_threshold(), Duration::from_secs(15 * 60));
    }

    #[test]
    fn shipped_example_file_matches() {
        assert_eq!(include_str!("../config.example.yaml"), example());
    }

    #[test]
    fn invalid_base_url() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.service.base_url = "".into();
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("service.base_url")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.service.base_url = "not a url".into();
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_automation_limits() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.automation.video_attempts = 0;
        let err = validate(&cfg).unwrap_err();
        match err {
            ConfigError::Invalid(msg) => assert!(msg.contains("video_attempts")),
            _ => panic!("wrong error"),
        }

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.automation.max_concurrent_videos = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn invalid_scheduler_settings() {
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.scheduler.idle_threshold_seconds = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));

        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.scheduler.tick_interval_ms = 0;
        assert!(matches!(validate(&cfg), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn exponential_backoff_parses() {
        let yaml = example().replace("backoff: fixed", "backoff: exponential");
        let cfg: Config = serde_yaml::from_str(&yaml).unwrap();
        let policy = cfg.automation.retry_policy();
        assert_eq!(policy.backoff, Backoff::Exponential);
        assert_eq!(policy.max_attempts, 3);
    }

    #[test]
    fn database_url_defaults_to_data_dir() {
        let cfg: Config = serde_yaml::from_str(example()).unwrap();
        assert_eq!(cfg.app.resolved_database_url(), "sqlite://./data/autoreel.db");

        let mut cfg = cfg;
        cfg.app.database_url = Some("sqlite::memory:".into());
        assert_eq!(cfg.app.resolved_database_url(), "sqlite::memory:");
    }

    #[test]
    fn ensure_dirs_creates_data_dir() {
        let td = tempdir().unwrap();
        let data_path = td.path().join("data");
        let mut cfg: Config = serde_yaml::from_str(example()).unwrap();
        cfg.app.data_dir = data_path.to_string_lossy().to_string();
        cfg.ensure_dirs().unwrap();
        assert!(data_path.exists());
    }

    #[test]
    fn load_from_file_ok() {
        let td = tempdir().unwrap();
        let p = td.path().join("config.yaml");
        fs::write(&p, example()).unwrap();
        let cfg = load(Some(&p)).unwrap();
        assert_eq!(cfg.automation.max_concurrent_videos, 4);
        assert!(cfg.scheduler.enabled);
    }
}
