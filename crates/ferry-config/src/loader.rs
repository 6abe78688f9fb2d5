//! Configuration loader with file and environment variable support

use crate::{parse_queue_list, AppConfig, ConfigError, Result};
use std::env;
use std::path::PathBuf;
use tracing::info;

/// Standard config file search paths
const CONFIG_PATHS: &[&str] = &[
    "ferry.toml",
    "config.toml",
    "./config/ferry.toml",
    "/etc/ferry/ferry.toml",
];

/// Configuration loader
pub struct ConfigLoader {
    config_path: Option<PathBuf>,
    profile: Option<String>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_path: None,
            profile: None,
        }
    }

    /// Create a loader with a specific config file path
    pub fn with_path<P: Into<PathBuf>>(path: P) -> Self {
        Self {
            config_path: Some(path.into()),
            profile: None,
        }
    }

    /// Merge `[profiles.<name>]` over the top-level keys (default: `FERRY_ENV`)
    pub fn with_profile(mut self, profile: impl Into<String>) -> Self {
        self.profile = Some(profile.into());
        self
    }

    /// Load configuration from file (if found) with environment variable overrides
    pub fn load(&self) -> Result<AppConfig> {
        self.load_with(|key| env::var(key).ok())
    }

    /// Same as [`load`](Self::load) with a custom variable source
    pub fn load_with<F>(&self, lookup: F) -> Result<AppConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let profile = self.profile.clone().or_else(|| lookup("FERRY_ENV"));

        let mut config = match self.find_config_file(&lookup)? {
            Some(path) => {
                info!(?path, profile = ?profile, "Loading configuration from file");
                AppConfig::from_file(&path, profile.as_deref())?
            }
            None => AppConfig::default(),
        };

        apply_overrides(&mut config, &lookup)?;
        Ok(config)
    }

    /// Find the configuration file to use. Explicitly named files must exist.
    fn find_config_file<F>(&self, lookup: &F) -> Result<Option<PathBuf>>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.config_path {
            return existing(path.clone()).map(Some);
        }

        if let Some(path) = lookup("FERRY_CONFIG") {
            return existing(PathBuf::from(path)).map(Some);
        }

        Ok(CONFIG_PATHS.iter().map(PathBuf::from).find(|p| p.exists()))
    }
}

fn existing(path: PathBuf) -> Result<PathBuf> {
    if path.exists() {
        Ok(path)
    } else {
        Err(ConfigError::NotFound(path.display().to_string()))
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::EnvError(format!("{} has an invalid value: {}", key, value)))
}

/// Apply `FERRY_*` overrides
fn apply_overrides<F>(config: &mut AppConfig, lookup: &F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(val) = lookup("FERRY_CONCURRENCY") {
        config.concurrency = parse_var("FERRY_CONCURRENCY", &val)?;
    }
    if let Some(val) = lookup("FERRY_QUEUES") {
        config.merge_queues(parse_queue_list(&val)?);
    }
    if let Some(val) = lookup("FERRY_TIMEOUT") {
        config.timeout = parse_var("FERRY_TIMEOUT", &val)?;
    }
    if let Some(val) = lookup("FERRY_DELAY") {
        config.delay = parse_var("FERRY_DELAY", &val)?;
    }
    if let Some(val) = lookup("FERRY_WAIT_TIME_SECONDS") {
        config.wait_time_seconds = Some(parse_var("FERRY_WAIT_TIME_SECONDS", &val)?);
    }

    // AWS
    if let Some(val) = lookup("FERRY_AWS_REGION") {
        config.aws.region = Some(val);
    }
    if let Some(val) = lookup("FERRY_AWS_ENDPOINT") {
        config.aws.endpoint = Some(val);
    }

    // General
    if let Some(val) = lookup("FERRY_VERBOSE") {
        config.verbose = val == "true" || val == "1";
    }

    Ok(())
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
