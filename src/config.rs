//! Outbox configuration.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const DEFAULT_POLLING_DELAY_MS: u64 = 1_000;
pub const DEFAULT_POLLING_PERIOD_MS: u64 = 1_000;
pub const DEFAULT_MAX_BATCH_SIZE: usize = 10;
pub const DEFAULT_CLEANUP_AGE_DAYS: u32 = 7;
pub const DEFAULT_CLEANUP_PERIOD_MS: u64 = 60 * 60 * 1_000;
pub const DEFAULT_BATCH_DELIVERY_TIMEOUT_SECONDS: u64 = 300;
pub const DEFAULT_DELIVERY_CHECK_PERIOD_MS: u64 = 60 * 1_000;
pub const DEFAULT_LOCK_TIMEOUT_MS: u64 = 100;
pub const DEFAULT_BOOKKEEPING_RETRIES: u32 = 3;

/// Options recognized by the poller, batch fetch and sweeps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OutboxConfig {
    /// Delay before the first poll.
    pub polling_delay_ms: u64,
    /// Time between polls.
    pub polling_period_ms: u64,
    /// Upper bound on entries claimed per fetch.
    pub max_batch_size: usize,
    /// Claim the oldest unclaimed entries first, never skipping one.
    pub strict_batch_order: bool,
    /// Delivered entries older than this are deleted by the cleanup sweep.
    pub cleanup_age_days: u32,
    pub cleanup_period_ms: u64,
    /// In-flight entries older than this are marked `DELIVERY_TIMED_OUT`.
    pub batch_delivery_timeout_seconds: u64,
    pub delivery_check_period_ms: u64,
    /// Publishing without a caller transaction fails instead of committing on its own.
    pub require_transaction: bool,
    /// How long a batch fetch waits for the store lock before giving up.
    pub lock_timeout_ms: u64,
    /// Attempts for a result write-back before it is logged and left for the timeout sweep.
    pub bookkeeping_retries: u32,
}

impl Default for OutboxConfig {
    fn default() -> Self {
        Self {
            polling_delay_ms: DEFAULT_POLLING_DELAY_MS,
            polling_period_ms: DEFAULT_POLLING_PERIOD_MS,
            max_batch_size: DEFAULT_MAX_BATCH_SIZE,
            strict_batch_order: true,
            cleanup_age_days: DEFAULT_CLEANUP_AGE_DAYS,
            cleanup_period_ms: DEFAULT_CLEANUP_PERIOD_MS,
            batch_delivery_timeout_seconds: DEFAULT_BATCH_DELIVERY_TIMEOUT_SECONDS,
            delivery_check_period_ms: DEFAULT_DELIVERY_CHECK_PERIOD_MS,
            require_transaction: true,
            lock_timeout_ms: DEFAULT_LOCK_TIMEOUT_MS,
            bookkeeping_retries: DEFAULT_BOOKKEEPING_RETRIES,
        }
    }
}

impl OutboxConfig {
    /// Defaults overridden from `OUTBOX_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.load_from_env()?;
        Ok(config)
    }

    /// Load configuration from a JSON file. Missing fields keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let config: OutboxConfig = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from environment variables and validate the result.
    /// Unparseable values are ignored.
    pub fn load_from_env(&mut self) -> Result<(), ConfigError> {
        self.load_from(|key| std::env::var(key).ok())
    }

    fn load_from<F>(&mut self, var: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parse<T: std::str::FromStr>(raw: Option<String>, target: &mut T) {
            if let Some(value) = raw.and_then(|raw| raw.trim().parse().ok()) {
                *target = value;
            }
        }

        parse(var("OUTBOX_POLLING_DELAY_MS"), &mut self.polling_delay_ms);
        parse(var("OUTBOX_POLLING_PERIOD_MS"), &mut self.polling_period_ms);
        parse(var("OUTBOX_MAX_BATCH_SIZE"), &mut self.max_batch_size);
        parse(var("OUTBOX_STRICT_BATCH_ORDER"), &mut self.strict_batch_order);
        parse(var("OUTBOX_CLEANUP_AGE_DAYS"), &mut self.cleanup_age_days);
        parse(var("OUTBOX_CLEANUP_PERIOD_MS"), &mut self.cleanup_period_ms);
        parse(
            var("OUTBOX_BATCH_DELIVERY_TIMEOUT_SECONDS"),
            &mut self.batch_delivery_timeout_seconds,
        );
        parse(
            var("OUTBOX_DELIVERY_CHECK_PERIOD_MS"),
            &mut self.delivery_check_period_ms,
        );
        parse(var("OUTBOX_REQUIRE_TRANSACTION"), &mut self.require_transaction);
        parse(var("OUTBOX_LOCK_TIMEOUT_MS"), &mut self.lock_timeout_ms);
        parse(var("OUTBOX_BOOKKEEPING_RETRIES"), &mut self.bookkeeping_retries);
        self.validate()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_batch_size == 0 {
            return Err(ConfigError::Invalid("maxBatchSize must be at least 1".into()));
        }
        if self.polling_period_ms == 0 {
            return Err(ConfigError::Invalid("pollingPeriodMs must be positive".into()));
        }
        if self.cleanup_period_ms == 0 || self.delivery_check_period_ms == 0 {
            return Err(ConfigError::Invalid("sweep periods must be positive".into()));
        }
        Ok(())
    }

    pub fn polling_delay(&self) -> Duration {
        Duration::from_millis(self.polling_delay_ms)
    }

    pub fn polling_period(&self) -> Duration {
        Duration::from_millis(self.polling_period_ms)
    }

    pub fn cleanup_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.cleanup_age_days) * 24 * 60 * 60)
    }

    pub fn cleanup_period(&self) -> Duration {
        Duration::from_millis(self.cleanup_period_ms)
    }

    pub fn batch_delivery_timeout(&self) -> Duration {
        Duration::from_secs(self.batch_delivery_timeout_seconds)
    }

    pub fn delivery_check_period(&self) -> Duration {
        Duration::from_millis(self.delivery_check_period_ms)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}
