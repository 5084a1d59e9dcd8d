//! Argus configuration
//!
//! Loaded from a TOML file with sane defaults; the API token may also come
//! from the `ARGUS_TOKEN` environment variable. Validation is eager so a
//! malformed hostname pattern or missing token fails the build before any
//! browser launches.

use crate::hostname::HostnamePattern;
use crate::types::{BuildInfo, DEFAULT_MIN_HEIGHT, DEFAULT_WIDTHS};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable consulted for the API token
pub const TOKEN_ENV: &str = "ARGUS_TOKEN";

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Remote API settings
    pub api: ApiConfig,

    /// Build metadata passed through to the remote service
    pub build: BuildInfo,

    /// Asset discovery settings
    pub discovery: DiscoveryConfig,

    /// Default snapshot capture settings
    pub snapshot: SnapshotDefaults,

    /// Upload settings
    pub upload: UploadConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            build: BuildInfo::default(),
            discovery: DiscoveryConfig::default(),
            snapshot: SnapshotDefaults::default(),
            upload: UploadConfig::default(),
        }
    }
}

/// Remote API client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the remote build service
    pub base_url: String,

    /// Auth token; overridden by `ARGUS_TOKEN` when set
    pub token: String,

    /// Overrides the default `argus/<version>` User-Agent
    pub user_agent: Option<String>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.argus-ci.dev/v1".to_string(),
            token: String::new(),
            user_agent: None,
        }
    }
}

/// Asset discovery configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Hostnames allowed in addition to each snapshot's own origin
    pub allowed_hostnames: Vec<String>,

    /// Hostnames always blocked
    pub disallowed_hostnames: Vec<String>,

    /// Settle window the network must stay quiet for
    pub network_idle_timeout_ms: u64,

    /// In-flight request poll interval
    pub idle_poll_ms: u64,

    /// Hard cap on waiting for the network to idle
    pub discovery_timeout_ms: u64,

    /// Concurrent discovery tasks
    pub concurrency: usize,

    /// Maximum simultaneously open pages, independent of task concurrency
    pub page_pool_size: usize,

    /// Skip the URL-keyed response cache
    pub disable_cache: bool,

    /// Retries per snapshot after a transient discovery failure
    pub retries: u32,

    /// Grace period granted to in-flight tasks on abort
    pub abort_grace_ms: u64,

    /// Browser launch options
    pub launch: LaunchOptions,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            allowed_hostnames: Vec::new(),
            disallowed_hostnames: Vec::new(),
            network_idle_timeout_ms: 100,
            idle_poll_ms: 10,
            discovery_timeout_ms: 30_000,
            concurrency: 5,
            page_pool_size: 5,
            disable_cache: false,
            retries: 2,
            abort_grace_ms: 5_000,
            launch: LaunchOptions::default(),
        }
    }
}

impl DiscoveryConfig {
    pub fn network_idle_timeout(&self) -> Duration {
        Duration::from_millis(self.network_idle_timeout_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn discovery_timeout(&self) -> Duration {
        Duration::from_millis(self.discovery_timeout_ms)
    }

    pub fn abort_grace(&self) -> Duration {
        Duration::from_millis(self.abort_grace_ms)
    }

    /// Parse both hostname lists, failing on the first malformed pattern.
    pub fn parse_policies(&self) -> Result<(Vec<HostnamePattern>, Vec<HostnamePattern>)> {
        Ok((
            HostnamePattern::parse_all(&self.allowed_hostnames)?,
            HostnamePattern::parse_all(&self.disallowed_hostnames)?,
        ))
    }
}

/// Browser launch options
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LaunchOptions {
    /// Browser executable; probed from known install paths when unset
    pub executable: Option<PathBuf>,

    /// Run without a visible window
    pub headless: bool,

    /// Extra command-line arguments appended to the defaults
    pub args: Vec<String>,

    /// How long to wait for the browser's debugging endpoint
    pub launch_timeout_ms: u64,
}

impl Default for LaunchOptions {
    fn default() -> Self {
        Self {
            executable: None,
            headless: true,
            args: Vec::new(),
            launch_timeout_ms: 30_000,
        }
    }
}

impl LaunchOptions {
    pub fn launch_timeout(&self) -> Duration {
        Duration::from_millis(self.launch_timeout_ms)
    }
}

/// Defaults applied to snapshot requests that do not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotDefaults {
    pub widths: Vec<u32>,
    pub min_height: u32,
    pub enable_javascript: bool,
}

impl Default for SnapshotDefaults {
    fn default() -> Self {
        Self {
            widths: DEFAULT_WIDTHS.to_vec(),
            min_height: DEFAULT_MIN_HEIGHT,
            enable_javascript: false,
        }
    }
}

/// Upload configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadConfig {
    /// Concurrent snapshot uploads; smaller than discovery concurrency so
    /// uploads do not saturate bandwidth while discovery is running
    pub concurrency: usize,

    /// Backoff policy for failed uploads
    pub retry: RetryPolicy,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            concurrency: 2,
            retry: RetryPolicy::default(),
        }
    }
}

/// Exponential backoff policy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 500,
            max_delay_ms: 8_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Zero-delay policy for tests
    pub fn instant(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before the given retry, where `attempt` counts from 1 for the
    /// first retry. Grows by `multiplier` and saturates at the cap.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms as f64 * self.multiplier.powi(attempt.saturating_sub(1) as i32);
        Duration::from_millis((base as u64).min(self.max_delay_ms))
    }
}

impl Config {
    /// Load configuration from a TOML file, falling back to defaults when
    /// the file does not exist. The `ARGUS_TOKEN` environment variable
    /// overrides any configured token.
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content).map_err(|e| Error::InvalidConfig(e.to_string()))?
        } else {
            Self::default()
        };

        if let Ok(token) = std::env::var(TOKEN_ENV) {
            if !token.is_empty() {
                config.api.token = token;
            }
        }

        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::InvalidConfig(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate everything that can fail before a build starts.
    pub fn validate(&self) -> Result<()> {
        if self.api.token.trim().is_empty() {
            return Err(Error::config(format!(
                "missing API token, set {} or [api] token",
                TOKEN_ENV
            )));
        }

        url::Url::parse(&self.api.base_url).map_err(|e| {
            Error::config(format!("invalid api.base_url '{}': {}", self.api.base_url, e))
        })?;

        if self.discovery.concurrency == 0 {
            return Err(Error::config("discovery.concurrency must be at least 1"));
        }
        if self.discovery.page_pool_size == 0 {
            return Err(Error::config("discovery.page_pool_size must be at least 1"));
        }
        if self.upload.concurrency == 0 {
            return Err(Error::config("upload.concurrency must be at least 1"));
        }
        if self.upload.retry.max_attempts == 0 {
            return Err(Error::config("upload.retry.max_attempts must be at least 1"));
        }

        // malformed hostname patterns abort the build before discovery
        self.discovery.parse_policies()?;

        Ok(())
    }
}
