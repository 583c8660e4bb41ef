//! Configuration for the extraction service.
//!
//! Settings are plain serde structs with per-field defaults so a missing
//! or partial TOML file always yields a usable configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Top-level settings, loadable from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub browser: BrowserConfig,

    #[serde(default)]
    pub jobs: JobConfig,

    #[serde(default)]
    pub scrape: ScrapeConfig,
}

/// HTTP server binding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Browser engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrowserConfig {
    /// Run in headless mode (default: true).
    /// Set to false for debugging gate interactions.
    #[serde(default = "default_headless")]
    pub headless: bool,

    /// Remote Chrome DevTools URL (e.g., "ws://localhost:9222").
    /// If set, connects to an existing browser instead of launching one.
    #[serde(default)]
    pub remote_url: Option<String>,

    /// Page load timeout in seconds.
    #[serde(default = "default_browser_timeout")]
    pub timeout: u64,

    /// Additional Chrome arguments.
    #[serde(default)]
    pub chrome_args: Vec<String>,
}

/// Job manager limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    /// Maximum number of jobs extracting at once; the rest queue FIFO.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Seconds a finished job's artifact is retained before eviction.
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,
}

/// Per-job extraction tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScrapeConfig {
    /// Largest page index the probing search will consider.
    #[serde(default = "default_page_cap")]
    pub page_cap: u32,

    /// Number of simultaneous image downloads within a job.
    #[serde(default = "default_image_batch_size")]
    pub image_batch_size: usize,

    /// Seconds to wait for a gate form to settle after submission.
    #[serde(default = "default_gate_wait_secs")]
    pub gate_wait_secs: u64,

    /// Seconds to wait for post-submit navigation.
    #[serde(default = "default_nav_wait_secs")]
    pub nav_wait_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8088
}

fn default_headless() -> bool {
    true
}

fn default_browser_timeout() -> u64 {
    30
}

fn default_max_concurrent() -> usize {
    5
}

fn default_retention_secs() -> u64 {
    30 * 60
}

fn default_page_cap() -> u32 {
    500
}

fn default_image_batch_size() -> usize {
    10
}

fn default_gate_wait_secs() -> u64 {
    10
}

fn default_nav_wait_secs() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: default_headless(),
            remote_url: None,
            timeout: default_browser_timeout(),
            chrome_args: Vec::new(),
        }
    }
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            retention_secs: default_retention_secs(),
        }
    }
}

impl Default for ScrapeConfig {
    fn default() -> Self {
        Self {
            page_cap: default_page_cap(),
            image_batch_size: default_image_batch_size(),
            gate_wait_secs: default_gate_wait_secs(),
            nav_wait_secs: default_nav_wait_secs(),
        }
    }
}

impl Settings {
    /// Load settings from a TOML file, or defaults if no path is given.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) => {
                let content = std::fs::read_to_string(p)
                    .map_err(|e| anyhow::anyhow!("Failed to read config {}: {}", p.display(), e))?;
                let settings: Settings = toml::from_str(&content)?;
                Ok(settings)
            }
            None => Ok(Settings::default()),
        }
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.jobs.retention_secs)
    }
}
