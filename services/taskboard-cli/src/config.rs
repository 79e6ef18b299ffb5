//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! The login password is read from TASKBOARD_PASSWORD only, never from the
//! TOML file or argv.

use std::path::{Path, PathBuf};
use std::time::Duration;

use api_client::RetryPolicy;
use common::Secret;
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub api: ApiConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(skip)]
    pub password: Option<Secret<String>>,
}

/// Backend connection settings
#[derive(Debug, Deserialize)]
pub struct ApiConfig {
    pub base_url: String,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_refresh_timeout")]
    pub refresh_timeout_secs: u64,
}

/// Credential file and proactive refresh settings
#[derive(Debug, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_credentials_path")]
    pub credentials_path: PathBuf,
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_secs: u64,
    /// Refresh when the access token expires within this window
    #[serde(default = "default_refresh_threshold")]
    pub refresh_threshold_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            credentials_path: default_credentials_path(),
            refresh_interval_secs: default_refresh_interval(),
            refresh_threshold_secs: default_refresh_threshold(),
        }
    }
}

/// Backoff for `request` calls
#[derive(Debug, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
        }
    }
}

impl RetryConfig {
    pub fn policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts,
            Duration::from_millis(self.base_delay_ms),
            Duration::from_millis(self.max_delay_ms),
        )
    }
}

fn default_timeout() -> u64 {
    30
}

fn default_refresh_timeout() -> u64 {
    10
}

fn default_credentials_path() -> PathBuf {
    PathBuf::from("taskboard-credentials.json")
}

fn default_refresh_interval() -> u64 {
    600
}

fn default_refresh_threshold() -> u64 {
    120
}

fn default_max_attempts() -> u32 {
    3
}

fn default_base_delay() -> u64 {
    200
}

fn default_max_delay() -> u64 {
    5000
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    ///
    /// - TASKBOARD_API_URL replaces `api.base_url`
    /// - TASKBOARD_PASSWORD supplies the login password
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;

        if let Ok(url) = std::env::var("TASKBOARD_API_URL") {
            config.api.base_url = url;
        }
        if let Ok(password) = std::env::var("TASKBOARD_PASSWORD")
            && !password.is_empty()
        {
            config.password = Some(Secret::new(password));
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "base_url must start with http:// or https://, got: {}",
                self.api.base_url
            )));
        }

        for (name, value) in [
            ("timeout_secs", self.api.timeout_secs),
            ("refresh_timeout_secs", self.api.refresh_timeout_secs),
            ("refresh_interval_secs", self.session.refresh_interval_secs),
            ("max_attempts", u64::from(self.retry.max_attempts)),
        ] {
            if value == 0 {
                return Err(common::Error::Config(format!(
                    "{name} must be greater than 0"
                )));
            }
        }

        if self.retry.max_delay_ms < self.retry.base_delay_ms {
            return Err(common::Error::Config(format!(
                "max_delay_ms ({}) must not be below base_delay_ms ({})",
                self.retry.max_delay_ms, self.retry.base_delay_ms
            )));
        }

        Ok(())
    }

    /// Config file path from `--config` (or its CONFIG_PATH env fallback),
    /// else `taskboard.toml` in the working directory.
    pub fn resolve_path(cli_path: Option<&Path>) -> PathBuf {
        cli_path
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("taskboard.toml"))
    }
}
