//! Configuration module for billing-service.

use crate::provisioning::DispatchSettings;
use crate::services::LedgerSettings;
use crate::workers::SweepSettings;
use service_core::config::{self as core_config, env_or, env_required};
use service_core::error::AppError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct BillingConfig {
    pub common: core_config::Config,
    pub service_name: String,
    pub log_level: String,
    pub otlp_endpoint: Option<String>,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub queue: QueueConfig,
    pub sweeper: SweeperConfig,
    pub invoice_due_hours: i64,
}

#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Clone)]
pub struct RedisConfig {
    pub url: String,
}

#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Workers per extension queue.
    pub workers: usize,
    pub action_attempts: u32,
    pub poll_timeout_secs: u64,
    /// `0` keeps action locks until they are released.
    pub lock_ttl_secs: u64,
    pub flash_ttl_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub interval_secs: u64,
    pub initial_delay_secs: u64,
    /// `0` disables stale lock reaping.
    pub stale_lock_threshold_secs: u64,
}

impl BillingConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let common = core_config::Config::load()?;

        let config = Self {
            common,
            service_name: env::var("SERVICE_NAME").unwrap_or_else(|_| "billing-service".to_string()),
            log_level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            otlp_endpoint: env::var("OTLP_ENDPOINT").ok(),
            database: DatabaseConfig {
                url: env_required("DATABASE_URL")?,
                max_connections: env_or("DATABASE_MAX_CONNECTIONS", 10),
                min_connections: env_or("DATABASE_MIN_CONNECTIONS", 2),
            },
            redis: RedisConfig {
                url: env_required("REDIS_URL")?,
            },
            queue: QueueConfig {
                workers: env_or("ACTION_QUEUE_WORKERS", 2),
                action_attempts: env_or("ACTION_ATTEMPTS", 1),
                poll_timeout_secs: env_or("QUEUE_POLL_TIMEOUT_SECS", 10),
                lock_ttl_secs: env_or("ACTION_LOCK_TTL_SECS", 3600),
                flash_ttl_secs: env_or("ACTION_FLASH_TTL_SECS", 60),
            },
            sweeper: SweeperConfig {
                interval_secs: env_or("SWEEP_INTERVAL_SECS", 3600),
                initial_delay_secs: env_or("SWEEP_INITIAL_DELAY_SECS", 5),
                stale_lock_threshold_secs: env_or("STALE_LOCK_THRESHOLD_SECS", 7200),
            },
            invoice_due_hours: env_or("INVOICE_DUE_HOURS", 168),
        };
        config.validate()?;

        Ok(config)
    }

    fn validate(&self) -> Result<(), AppError> {
        if self.queue.workers == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "ACTION_QUEUE_WORKERS must be at least 1"
            )));
        }
        if self.sweeper.interval_secs == 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "SWEEP_INTERVAL_SECS must be at least 1"
            )));
        }
        if self.invoice_due_hours <= 0 {
            return Err(AppError::ConfigError(anyhow::anyhow!(
                "INVOICE_DUE_HOURS must be positive"
            )));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.queue.poll_timeout_secs.max(1))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            attempts: self.queue.action_attempts.max(1),
            lock_ttl: non_zero_secs(self.queue.lock_ttl_secs),
            flash_ttl: Duration::from_secs(self.queue.flash_ttl_secs),
        }
    }

    pub fn sweep_settings(&self) -> SweepSettings {
        SweepSettings {
            interval: Duration::from_secs(self.sweeper.interval_secs),
            initial_delay: Duration::from_secs(self.sweeper.initial_delay_secs),
            stale_lock_threshold: non_zero_secs(self.sweeper.stale_lock_threshold_secs),
        }
    }

    pub fn ledger_settings(&self) -> LedgerSettings {
        LedgerSettings {
            invoice_due: chrono::Duration::hours(self.invoice_due_hours),
        }
    }
}

fn non_zero_secs(secs: u64) -> Option<Duration> {
    (secs > 0).then(|| Duration::from_secs(secs))
}
