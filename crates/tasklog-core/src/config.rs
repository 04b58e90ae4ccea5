//! Store configuration.
//!
//! All fields are optional in the TOML file; missing ones fall back to
//! [`ConfigDefaults`]. A missing file is the same as an empty one.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;

// ============================================================================
// Default Values
// ============================================================================

/// Central source of truth for all configuration defaults.
pub struct ConfigDefaults;

impl ConfigDefaults {
    pub const STALE_MS: u64 = 31_000;
    pub const UPDATE_INTERVAL_MS: u64 = 10_000;
    pub const RETRY_COUNT: u32 = 5;
    pub const RETRY_BACKOFF_FACTOR: f64 = 2.0;
    pub const RETRY_MIN_DELAY_MS: u64 = 100;
    pub const RETRY_MAX_DELAY_MS: u64 = 1_000;
    pub const PRUNE_AFTER_READ: bool = false;
}

// Thin wrappers for serde's #[serde(default = "...")] requirement
fn default_stale_ms() -> u64 {
    ConfigDefaults::STALE_MS
}
fn default_update_interval_ms() -> u64 {
    ConfigDefaults::UPDATE_INTERVAL_MS
}
fn default_retry_count() -> u32 {
    ConfigDefaults::RETRY_COUNT
}
fn default_backoff_factor() -> f64 {
    ConfigDefaults::RETRY_BACKOFF_FACTOR
}
fn default_min_delay_ms() -> u64 {
    ConfigDefaults::RETRY_MIN_DELAY_MS
}
fn default_max_delay_ms() -> u64 {
    ConfigDefaults::RETRY_MAX_DELAY_MS
}
fn default_prune_after_read() -> bool {
    ConfigDefaults::PRUNE_AFTER_READ
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level config, usually from `tasklog.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub lock: LockConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
}

/// Advisory lock timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// A lock whose heartbeat is older than this may be broken.
    #[serde(default = "default_stale_ms")]
    pub stale_ms: u64,
    /// How often a holder refreshes its heartbeat.
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_retry_count")]
    pub count: u32,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(default = "default_min_delay_ms")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Delete leftover temp artifacts after a successful canonical read.
    #[serde(default = "default_prune_after_read")]
    pub prune_after_read: bool,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            stale_ms: ConfigDefaults::STALE_MS,
            update_interval_ms: ConfigDefaults::UPDATE_INTERVAL_MS,
            retry: RetryConfig::default(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            count: ConfigDefaults::RETRY_COUNT,
            backoff_factor: ConfigDefaults::RETRY_BACKOFF_FACTOR,
            min_delay_ms: ConfigDefaults::RETRY_MIN_DELAY_MS,
            max_delay_ms: ConfigDefaults::RETRY_MAX_DELAY_MS,
        }
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            prune_after_read: ConfigDefaults::PRUNE_AFTER_READ,
        }
    }
}

impl StoreConfig {
    /// Load from a TOML file. A missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(StoreError::io("reading config", path, e)),
        };
        Self::from_toml(&content).map_err(|message| StoreError::Config {
            path: path.to_path_buf(),
            message,
        })
    }

    pub fn from_toml(content: &str) -> Result<Self, String> {
        let config: StoreConfig = toml::from_str(content).map_err(|e| e.to_string())?;
        Ok(config.validated())
    }

    /// Clamp values that would make the lock manager misbehave.
    pub fn validated(mut self) -> Self {
        self.lock = self.lock.validated();
        self
    }
}

impl LockConfig {
    pub fn validated(mut self) -> Self {
        self.stale_ms = self.stale_ms.max(2);
        if self.update_interval_ms == 0 || self.update_interval_ms >= self.stale_ms {
            self.update_interval_ms = self.stale_ms / 2;
        }
        if !self.retry.backoff_factor.is_finite() || self.retry.backoff_factor < 1.0 {
            self.retry.backoff_factor = 1.0;
        }
        self.retry.max_delay_ms = self.retry.max_delay_ms.max(self.retry.min_delay_ms);
        self
    }

    pub fn stale(&self) -> Duration {
        Duration::from_millis(self.stale_ms)
    }

    pub fn update_interval(&self) -> Duration {
        Duration::from_millis(self.update_interval_ms)
    }

    /// Backoff before retry number `attempt` (0-based):
    /// `min(max_delay, min_delay * factor^attempt)`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let retry = &self.retry;
        let exponent = attempt.min(30) as i32;
        let scaled = retry.min_delay_ms as f64 * retry.backoff_factor.powi(exponent);
        let capped = scaled.min(retry.max_delay_ms as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }
}
