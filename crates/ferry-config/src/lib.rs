//! Ferry Configuration System
//!
//! TOML configuration with per-environment profiles and environment variable
//! overrides. The result is turned into the consumer's [`LauncherConfig`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

use ferry_common::{GroupConfig, LauncherConfig, ManagerConfig, RebalanceConfig, WeightedQueue};

mod loader;

pub use loader::ConfigLoader;

/// Name of the group built from top-level `queues`
pub const DEFAULT_GROUP: &str = "default";

/// Concurrency used when neither the file nor the group sets one
pub const DEFAULT_CONCURRENCY: i64 = 25;

/// Configuration error types
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("The supplied config file {0} does not exist")]
    NotFound(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),

    #[error("Environment variable error: {0}")]
    EnvError(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// A queue entry: either `"name"` or `["name", weight]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueSpec {
    Name(String),
    Weighted(String, i64),
}

impl QueueSpec {
    pub fn name(&self) -> &str {
        match self {
            QueueSpec::Name(name) | QueueSpec::Weighted(name, _) => name,
        }
    }

    /// Configured weight, coerced to at least one
    pub fn weight(&self) -> u32 {
        match self {
            QueueSpec::Name(_) => 1,
            QueueSpec::Weighted(_, weight) => (*weight).clamp(1, u32::MAX as i64) as u32,
        }
    }

    fn to_weighted(&self) -> WeightedQueue {
        WeightedQueue::new(self.name(), self.weight())
    }
}

/// A named group of queues sharing one worker pool
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GroupSpec {
    pub concurrency: Option<i64>,
    pub queues: Vec<QueueSpec>,
}

/// AWS transport settings
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AwsConfig {
    pub region: Option<String>,
    /// Custom endpoint, e.g. LocalStack
    pub endpoint: Option<String>,
}

/// Root application configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Concurrency of the `default` group
    pub concurrency: i64,
    /// Hard shutdown deadline in seconds
    pub timeout: u64,
    /// Seconds a queue stays paused after an empty fetch
    pub delay: f64,
    pub min_dispatch_interval_ms: u64,
    pub drain_poll_interval_ms: u64,
    /// Long-poll wait for receive calls; absent means short polling
    pub wait_time_seconds: Option<i32>,
    pub verbose: bool,
    pub queues: Vec<QueueSpec>,
    pub groups: BTreeMap<String, GroupSpec>,
    pub rebalance: RebalanceConfig,
    pub aws: AwsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            timeout: 8,
            delay: 0.0,
            min_dispatch_interval_ms: 100,
            drain_poll_interval_ms: 100,
            wait_time_seconds: None,
            verbose: false,
            queues: Vec::new(),
            groups: BTreeMap::new(),
            rebalance: RebalanceConfig::default(),
            aws: AwsConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file, merging the named profile if given
    pub fn from_file<P: AsRef<Path>>(path: P, profile: Option<&str>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content, profile)
    }

    /// Parse TOML text. Keys of `[profiles.<profile>]` replace top-level keys.
    pub fn from_toml_str(content: &str, profile: Option<&str>) -> Result<Self> {
        let mut root: toml::Table = content.parse()?;
        let profiles = root.remove("profiles");

        if let Some(profile) = profile {
            match profiles.as_ref().and_then(|p| p.get(profile)) {
                Some(toml::Value::Table(overrides)) => {
                    for (key, value) in overrides {
                        root.insert(key.clone(), value.clone());
                    }
                }
                Some(_) => {
                    return Err(ConfigError::ValidationError(format!(
                        "Profile {} must be a table",
                        profile
                    )))
                }
                None => warn!(profile = %profile, "No profile section found in config file"),
            }
        }

        Ok(toml::Value::Table(root).try_into()?)
    }

    /// Replace file-defined top-level queues with same-named ones, then append
    pub fn merge_queues(&mut self, overrides: Vec<QueueSpec>) {
        for queue in overrides {
            self.queues.retain(|existing| existing.name() != queue.name());
            self.queues.push(queue);
        }
    }

    /// Build the consumer configuration, validating as it goes
    pub fn to_launcher_config(&self) -> Result<LauncherConfig> {
        let mut groups = Vec::new();

        if !self.queues.is_empty() {
            if self.groups.contains_key(DEFAULT_GROUP) {
                return Err(ConfigError::ValidationError(format!(
                    "Group {} is reserved for top-level queues",
                    DEFAULT_GROUP
                )));
            }
            groups.push(GroupConfig {
                name: DEFAULT_GROUP.to_string(),
                concurrency: validate_concurrency(self.concurrency)?,
                queues: self.queues.iter().map(QueueSpec::to_weighted).collect(),
            });
        }

        for (name, group) in &self.groups {
            let concurrency = group.concurrency.unwrap_or(DEFAULT_CONCURRENCY);
            groups.push(GroupConfig {
                name: name.clone(),
                concurrency: validate_concurrency(concurrency)?,
                queues: group.queues.iter().map(QueueSpec::to_weighted).collect(),
            });
        }

        if groups.iter().all(|g| g.queues.is_empty()) {
            warn!("No queues supplied");
        }

        let pause_delay = Duration::try_from_secs_f64(self.delay).map_err(|_| {
            ConfigError::ValidationError(format!(
                "Delay value {} is invalid, it needs to be zero or a positive number",
                self.delay
            ))
        })?;

        Ok(LauncherConfig {
            groups,
            manager: ManagerConfig {
                min_dispatch_interval: validate_interval(
                    "min_dispatch_interval_ms",
                    self.min_dispatch_interval_ms,
                )?,
                pause_delay,
                drain_poll_interval: validate_interval(
                    "drain_poll_interval_ms",
                    self.drain_poll_interval_ms,
                )?,
                wait_time_seconds: self.wait_time_seconds,
                rebalance: self.rebalance,
            },
            shutdown_timeout: Duration::from_secs(self.timeout),
        })
    }

    /// Generate an example TOML configuration
    pub fn example_toml() -> String {
        r#"# Ferry Configuration
# FERRY_* environment variables override these settings

concurrency = 25
timeout = 8          # hard shutdown deadline (seconds)
delay = 0            # pause after an empty fetch (seconds)
min_dispatch_interval_ms = 100
# wait_time_seconds = 20
verbose = false

queues = ["default", ["critical", 3]]

[groups.reports]
concurrency = 2
queues = ["reports"]

[rebalance]
grow_on_messages = true
pause_after_empty = 1

[aws]
region = "us-east-1"
# endpoint = "http://localhost:4566"

[profiles.production]
concurrency = 50
"#
        .to_string()
    }
}

fn validate_concurrency(value: i64) -> Result<usize> {
    if value <= 0 {
        return Err(ConfigError::ValidationError(format!(
            "Concurrency value {} is invalid, it needs to be a positive number",
            value
        )));
    }
    Ok(value as usize)
}

/// Loop intervals must be at least one millisecond
fn validate_interval(key: &str, millis: u64) -> Result<Duration> {
    if millis == 0 {
        return Err(ConfigError::ValidationError(format!(
            "{} is invalid, it needs to be at least 1",
            key
        )));
    }
    Ok(Duration::from_millis(millis))
}

/// Parse `"a:2,b"` into queue specs
pub fn parse_queue_list(value: &str) -> Result<Vec<QueueSpec>> {
    value
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once(':') {
            Some((name, weight)) => weight
                .trim()
                .parse::<i64>()
                .map(|w| QueueSpec::Weighted(name.trim().to_string(), w))
                .map_err(|_| ConfigError::EnvError(format!("Invalid queue weight in {}", entry))),
            None => Ok(QueueSpec::Name(entry.to_string())),
        })
        .collect()
}
