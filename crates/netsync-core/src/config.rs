//! Configuration types for the provisioning core
//!
//! This module defines all configuration structures used throughout the crate.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main netsync configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NetsyncConfig {
    /// Reconciler settings
    #[serde(default)]
    pub reconciler: ReconcilerConfig,

    /// Address pool settings
    #[serde(default)]
    pub pool: PoolConfig,

    /// Persistence backend
    #[serde(default)]
    pub store: StoreConfig,

    /// Device driver backend
    #[serde(default)]
    pub driver: DriverConfig,
}

impl NetsyncConfig {
    /// Create a new configuration with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        self.reconciler.validate()?;
        self.pool.validate()?;
        self.store.validate()?;
        self.driver.validate()?;
        Ok(())
    }
}

/// Reconciler configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcilerConfig {
    /// Timeout applied to every device push (in milliseconds)
    ///
    /// A timeout counts as a failed attempt.
    #[serde(default = "default_push_timeout_ms")]
    pub push_timeout_ms: u64,

    /// Delay before a failed job is attempted again (in seconds)
    #[serde(default = "default_retry_delay_secs")]
    pub retry_delay_secs: u64,

    /// Interval of the store scan that picks up jobs enqueued by other
    /// processes or left pending across a restart (in seconds)
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,

    /// Interval of the drift sweep and suspension expiry (in seconds)
    ///
    /// Set to 0 to disable periodic maintenance.
    #[serde(default = "default_drift_interval_secs")]
    pub drift_interval_secs: u64,

    /// Maximum time to wait for in-flight jobs on shutdown (in seconds)
    #[serde(default = "default_drain_timeout_secs")]
    pub drain_timeout_secs: u64,

    /// Trailing window used by the sync health query (in seconds)
    #[serde(default = "default_health_window_secs")]
    pub health_window_secs: u64,

    /// Capacity of the audit mirror channel
    ///
    /// When full, audit entries are still persisted but not mirrored
    /// (with a warning log).
    #[serde(default = "default_event_channel_capacity")]
    pub event_channel_capacity: usize,
}

impl ReconcilerConfig {
    pub fn push_timeout(&self) -> Duration {
        Duration::from_millis(self.push_timeout_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn drift_interval(&self) -> Option<Duration> {
        (self.drift_interval_secs > 0).then(|| Duration::from_secs(self.drift_interval_secs))
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    pub fn health_window(&self) -> Duration {
        Duration::from_secs(self.health_window_secs)
    }

    /// Validate the reconciler configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.push_timeout_ms == 0 {
            return Err(crate::Error::config("push timeout must be > 0"));
        }
        if self.retry_delay_secs > MAX_RETRY_DELAY_SECS {
            return Err(crate::Error::config("retry delay must be at most one day"));
        }
        if self.poll_interval_secs == 0 {
            return Err(crate::Error::config("poll interval must be > 0"));
        }
        if self.event_channel_capacity == 0 {
            return Err(crate::Error::config("event channel capacity must be > 0"));
        }
        Ok(())
    }
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            push_timeout_ms: default_push_timeout_ms(),
            retry_delay_secs: default_retry_delay_secs(),
            poll_interval_secs: default_poll_interval_secs(),
            drift_interval_secs: default_drift_interval_secs(),
            drain_timeout_secs: default_drain_timeout_secs(),
            health_window_secs: default_health_window_secs(),
            event_channel_capacity: default_event_channel_capacity(),
        }
    }
}

const MAX_RETRY_DELAY_SECS: u64 = 86_400;

fn default_push_timeout_ms() -> u64 {
    5_000
}

fn default_retry_delay_secs() -> u64 {
    5
}

fn default_poll_interval_secs() -> u64 {
    30
}

fn default_drift_interval_secs() -> u64 {
    300
}

fn default_drain_timeout_secs() -> u64 {
    30
}

fn default_health_window_secs() -> u64 {
    86_400
}

fn default_event_channel_capacity() -> usize {
    1000
}

const MAX_RELEASE_COOLDOWN_SECS: u64 = 10 * 365 * 86_400;

/// Address pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Largest subnet (in host addresses) that may be enumerated into a pool
    #[serde(default = "default_max_enumerated_hosts")]
    pub max_enumerated_hosts: u64,

    /// How long a released address stays out of auto-pick (in seconds)
    ///
    /// With 0, releasing returns the address straight to `available`.
    #[serde(default)]
    pub release_cooldown_secs: u64,
}

impl PoolConfig {
    pub fn release_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.release_cooldown_secs as i64)
    }

    /// Validate the pool configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.max_enumerated_hosts == 0 {
            return Err(crate::Error::config("max enumerated hosts must be > 0"));
        }
        if self.release_cooldown_secs > MAX_RELEASE_COOLDOWN_SECS {
            return Err(crate::Error::config(
                "release cooldown must be at most 10 years",
            ));
        }
        Ok(())
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_enumerated_hosts: default_max_enumerated_hosts(),
            release_cooldown_secs: 0,
        }
    }
}

fn default_max_enumerated_hosts() -> u64 {
    65_534
}

/// Persistence backend configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// File-backed store
    File {
        /// Path to the state file
        path: String,
    },

    /// In-memory store (not persistent)
    #[default]
    Memory,

    /// Custom store
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl StoreConfig {
    /// Validate the store configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            StoreConfig::File { path } if path.is_empty() => {
                Err(crate::Error::config("File store path cannot be empty"))
            }
            StoreConfig::Custom { factory, .. } if factory.is_empty() => {
                Err(crate::Error::config("Custom store factory cannot be empty"))
            }
            _ => Ok(()),
        }
    }

    /// Get the store type name
    pub fn type_name(&self) -> &str {
        match self {
            StoreConfig::File { .. } => "file",
            StoreConfig::Memory => "memory",
            StoreConfig::Custom { factory, .. } => factory,
        }
    }
}

/// Device driver configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DriverConfig {
    /// Log pushes without touching any device
    #[default]
    DryRun,

    /// Custom driver
    Custom {
        /// Factory name to use
        factory: String,
        /// Custom configuration data
        config: serde_json::Value,
    },
}

impl DriverConfig {
    /// Validate the driver configuration
    pub fn validate(&self) -> Result<(), crate::Error> {
        match self {
            DriverConfig::Custom { factory, config } => {
                if factory.is_empty() {
                    return Err(crate::Error::config(
                        "Custom driver factory cannot be empty",
                    ));
                }
                if config.is_null() {
                    return Err(crate::Error::config("Custom driver config cannot be null"));
                }
                Ok(())
            }
            DriverConfig::DryRun => Ok(()),
        }
    }

    /// Get the driver type name
    pub fn type_name(&self) -> &str {
        match self {
            DriverConfig::DryRun => "dry_run",
            DriverConfig::Custom { factory, .. } => factory,
        }
    }
}
