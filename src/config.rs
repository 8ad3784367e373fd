//! Runtime configuration.
//!
//! Defines the tunables for the scheduler loop, mailboxes, leases and the
//! EC replication defaults. Loaded from JSON, then overlaid from `AIKO_*`
//! environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Configuration for a [`Runtime`](crate::runtime::Runtime).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Topic namespace prefix, `{namespace}/{service}/...`.
    /// Default: "aiko"
    pub namespace: String,

    /// Scheduler sleep budget per iteration, in milliseconds.
    /// Default: 10
    pub loop_period_ms: u64,

    /// Keep looping when no handlers are registered.
    /// Default: false
    pub allow_idle: bool,

    /// Maximum mailbox items handled in one iteration.
    /// Default: 4096
    pub mailbox_drain_limit: usize,

    /// Queue depth at which a mailbox logs a high-water warning.
    /// Default: 1024
    pub mailbox_high_water_warn: usize,

    /// Fraction of a lease's duration after which an auto-extending lease
    /// renews itself. Must be in (0, 1).
    /// Default: 0.8
    pub lease_extend_factor: f64,

    /// Lease time EC consumers request from producers, in seconds.
    /// Default: 300
    pub ec_lease_seconds: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            namespace: "aiko".to_string(),
            loop_period_ms: 10,
            allow_idle: false,
            mailbox_drain_limit: 4096,
            mailbox_high_water_warn: 1024,
            lease_extend_factor: 0.8,
            ec_lease_seconds: 300,
        }
    }
}

impl RuntimeConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RuntimeConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overlaid with any `AIKO_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::default().with_env_overrides()
    }

    /// Overlays `AIKO_NAMESPACE`, `AIKO_LOOP_PERIOD_MS`, `AIKO_ALLOW_IDLE`,
    /// `AIKO_MAILBOX_DRAIN_LIMIT`, `AIKO_MAILBOX_HIGH_WATER_WARN`,
    /// `AIKO_LEASE_EXTEND_FACTOR` and `AIKO_EC_LEASE_SECONDS`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(value) = lookup("AIKO_NAMESPACE") {
            self.namespace = value;
        }
        if let Some(value) = lookup("AIKO_LOOP_PERIOD_MS") {
            self.loop_period_ms = parse_var("AIKO_LOOP_PERIOD_MS", &value)?;
        }
        if let Some(value) = lookup("AIKO_ALLOW_IDLE") {
            self.allow_idle = parse_var("AIKO_ALLOW_IDLE", &value)?;
        }
        if let Some(value) = lookup("AIKO_MAILBOX_DRAIN_LIMIT") {
            self.mailbox_drain_limit = parse_var("AIKO_MAILBOX_DRAIN_LIMIT", &value)?;
        }
        if let Some(value) = lookup("AIKO_MAILBOX_HIGH_WATER_WARN") {
            self.mailbox_high_water_warn = parse_var("AIKO_MAILBOX_HIGH_WATER_WARN", &value)?;
        }
        if let Some(value) = lookup("AIKO_LEASE_EXTEND_FACTOR") {
            self.lease_extend_factor = parse_var("AIKO_LEASE_EXTEND_FACTOR", &value)?;
        }
        if let Some(value) = lookup("AIKO_EC_LEASE_SECONDS") {
            self.ec_lease_seconds = parse_var("AIKO_EC_LEASE_SECONDS", &value)?;
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(['+', '#']) {
            return Err(Error::Config(format!(
                "namespace {:?} must be non-empty and wildcard free",
                self.namespace
            )));
        }
        if self.loop_period_ms == 0 {
            return Err(Error::Config("loop_period_ms must be > 0".to_string()));
        }
        if self.mailbox_drain_limit == 0 {
            return Err(Error::Config("mailbox_drain_limit must be > 0".to_string()));
        }
        if !(self.lease_extend_factor > 0.0 && self.lease_extend_factor < 1.0) {
            return Err(Error::Config(format!(
                "lease_extend_factor {} must be in (0, 1)",
                self.lease_extend_factor
            )));
        }
        if self.ec_lease_seconds == 0 {
            return Err(Error::Config("ec_lease_seconds must be > 0".to_string()));
        }
        Ok(())
    }

    pub fn loop_period(&self) -> Duration {
        Duration::from_millis(self.loop_period_ms)
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("{key}={value:?} is not valid")))
}
