//! Configuration management for fsentryd.
//!
//! Uses figment to merge configuration from multiple sources:
//! 1. Default values
//! 2. Config file (TOML)
//! 3. Environment variables
//! 4. Command-line arguments

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Daemon configuration
    #[serde(default)]
    pub daemon: DaemonConfig,

    /// Audit log configuration
    #[serde(default)]
    pub audit: AuditConfig,

    /// Polling intervals (milliseconds)
    #[serde(default)]
    pub intervals: IntervalConfig,
}

/// Daemon-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Shared-memory segment path
    #[serde(default = "default_segment_path")]
    pub segment: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Audit log configuration; disabled when no path is set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// File receiving one JSON line per processed change.
    pub path: Option<PathBuf>,
}

/// Polling intervals, overridable mainly for tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntervalConfig {
    /// Sleep between pause-flag polls.
    #[serde(default = "default_pause_poll_ms")]
    pub pause_poll_ms: u64,

    /// Longest wait for the first record of a batch.
    #[serde(default = "default_batch_wait_ms")]
    pub batch_wait_ms: u64,

    /// Sleep after processing one batch.
    #[serde(default = "default_batch_delay_ms")]
    pub batch_delay_ms: u64,

    /// Sleep after one dispatch cycle.
    #[serde(default = "default_dispatch_cycle_ms")]
    pub dispatch_cycle_ms: u64,
}

/// Resolved intervals handed to each watcher task.
#[derive(Debug, Clone, Copy)]
pub struct WatchIntervals {
    pub pause_poll: Duration,
    pub batch_wait: Duration,
    pub batch_delay: Duration,
}

fn default_segment_path() -> PathBuf {
    fsentry_protocol::segment_path_with_xdg_fallback()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_pause_poll_ms() -> u64 {
    200
}

fn default_batch_wait_ms() -> u64 {
    200
}

fn default_batch_delay_ms() -> u64 {
    200
}

fn default_dispatch_cycle_ms() -> u64 {
    50
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            audit: AuditConfig::default(),
            intervals: IntervalConfig::default(),
        }
    }
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            segment: default_segment_path(),
            log_level: default_log_level(),
        }
    }
}

impl Default for IntervalConfig {
    fn default() -> Self {
        Self {
            pause_poll_ms: default_pause_poll_ms(),
            batch_wait_ms: default_batch_wait_ms(),
            batch_delay_ms: default_batch_delay_ms(),
            dispatch_cycle_ms: default_dispatch_cycle_ms(),
        }
    }
}

impl IntervalConfig {
    /// Intervals for the watcher loop.
    #[must_use]
    pub fn watch_intervals(&self) -> WatchIntervals {
        WatchIntervals {
            pause_poll: Duration::from_millis(self.pause_poll_ms),
            batch_wait: Duration::from_millis(self.batch_wait_ms),
            batch_delay: Duration::from_millis(self.batch_delay_ms),
        }
    }

    /// Sleep between dispatch cycles.
    #[must_use]
    pub fn dispatch_cycle(&self) -> Duration {
        Duration::from_millis(self.dispatch_cycle_ms)
    }
}

impl Config {
    /// Load configuration from all sources
    pub fn load(config_file: Option<&PathBuf>) -> Result<Self, figment::Error> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        // Add config file if provided
        if let Some(path) = config_file {
            figment = figment.merge(Toml::file(path));
        } else {
            let default_path = PathBuf::from("/etc/fsentry/config.toml");
            if default_path.exists() {
                figment = figment.merge(Toml::file(default_path));
            }
        }

        // Environment variables (FSENTRYD_ prefix)
        figment = figment.merge(Env::prefixed("FSENTRYD_").split("_"));

        figment.extract()
    }

    /// Override segment path from CLI
    pub fn with_segment(mut self, segment: Option<PathBuf>) -> Self {
        if let Some(s) = segment {
            self.daemon.segment = s;
        }
        self
    }

    /// Override log level from CLI
    pub fn with_log_level(mut self, log_level: Option<String>) -> Self {
        if let Some(level) = log_level {
            self.daemon.log_level = level;
        }
        self
    }

    /// Override audit log path from CLI
    pub fn with_audit_log(mut self, path: Option<PathBuf>) -> Self {
        if let Some(p) = path {
            self.audit.path = Some(p);
        }
        self
    }
}
