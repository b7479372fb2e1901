//! Configuration module for paywatch-server.
//!
//! Reads the TOML file, applies CLI overrides, validates every section and
//! converts it into the runtime types of `paywatch_core::config`.

pub mod file;

use crate::config::file::FileConfig;
use paywatch_core::config::{
    ApiKeysConfig, CoreConfig, MaintenanceConfig, NotifyConfig, PaymentConfig, QueueConfig,
    ReconcileConfig, SeedAddress, TelegramConfig,
};
use rust_decimal::Decimal;
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during configuration loading.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    ParseError(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    ValidationError(String),

    #[error("DATABASE_URL environment variable not set")]
    MissingDatabaseUrl,
}

/// Loaded configuration: where to listen plus everything the core needs.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub listen: SocketAddr,
    pub core: CoreConfig,
}

pub struct ConfigLoader {
    config_path: PathBuf,
    listen_override: Option<SocketAddr>,
}

impl ConfigLoader {
    pub fn new(config_path: impl AsRef<Path>, listen_override: Option<SocketAddr>) -> Self {
        Self {
            config_path: config_path.as_ref().to_path_buf(),
            listen_override,
        }
    }

    pub fn load(&self) -> Result<LoadedConfig, ConfigError> {
        let config_content = std::fs::read_to_string(&self.config_path)?;
        self.load_str(&config_content)
    }

    fn load_str(&self, content: &str) -> Result<LoadedConfig, ConfigError> {
        let mut file_config: FileConfig = toml::from_str(content)?;
        if let Some(listen) = self.listen_override {
            file_config.server.listen = listen;
        }
        validate(&file_config)?;
        Ok(build_loaded_config(file_config))
    }
}

fn invalid(message: impl Into<String>) -> ConfigError {
    ConfigError::ValidationError(message.into())
}

fn validate(config: &FileConfig) -> Result<(), ConfigError> {
    if config.notify.api_token.trim().is_empty() {
        return Err(invalid("notify.api_token must not be empty"));
    }
    if config.notify.telegram_bot_token.is_some() != config.notify.telegram_chat_id.is_some() {
        return Err(invalid(
            "notify.telegram_bot_token and notify.telegram_chat_id must be set together",
        ));
    }

    let payment = &config.payment;
    if payment.window_minutes == 0 {
        return Err(invalid("payment.window_minutes must be positive"));
    }
    if payment.forced_rate.is_some_and(|rate| rate <= Decimal::ZERO) {
        return Err(invalid("payment.forced_rate must be positive"));
    }
    if payment.min_fiat_amount < Decimal::ZERO || payment.min_token_amount < Decimal::ZERO {
        return Err(invalid("payment minimums must not be negative"));
    }
    if payment.max_increments == 0 {
        return Err(invalid("payment.max_increments must be positive"));
    }

    if config.reconcile.interval_secs == 0 || config.reconcile.lookback_hours == 0 {
        return Err(invalid("reconcile intervals must be positive"));
    }

    let queue = &config.queue;
    if queue.names.is_empty() {
        return Err(invalid("queue.names must list at least one queue"));
    }
    let mut seen = HashSet::new();
    for name in &queue.names {
        if name.trim().is_empty() || !seen.insert(name.as_str()) {
            return Err(invalid(format!("queue name {name:?} is empty or repeated")));
        }
    }
    if queue.poll_interval_ms == 0 {
        return Err(invalid("queue.poll_interval_ms must be positive"));
    }
    if queue.default_max_retry <= 0 {
        return Err(invalid("queue.default_max_retry must be positive"));
    }

    if config.maintenance.reservation_sweep_secs == 0 || config.maintenance.queue_purge_secs == 0 {
        return Err(invalid("maintenance intervals must be positive"));
    }

    for entry in &config.addresses {
        if entry.address.trim().is_empty() {
            return Err(invalid(format!("empty address for chain {}", entry.chain)));
        }
    }
    Ok(())
}

fn build_loaded_config(file_config: FileConfig) -> LoadedConfig {
    let FileConfig {
        server,
        payment,
        reconcile,
        queue,
        maintenance,
        notify,
        explorers,
        addresses,
    } = file_config;

    let telegram = match (notify.telegram_bot_token, notify.telegram_chat_id) {
        (Some(bot_token), Some(chat_id)) => Some(TelegramConfig { bot_token, chat_id }),
        _ => None,
    };

    let core = CoreConfig {
        payment: PaymentConfig {
            window: Duration::from_secs(payment.window_minutes * 60),
            forced_rate: payment.forced_rate,
            min_fiat_amount: payment.min_fiat_amount,
            min_token_amount: payment.min_token_amount,
            max_increments: payment.max_increments,
        },
        reconcile: ReconcileConfig {
            interval: Duration::from_secs(reconcile.interval_secs),
            lookback: Duration::from_secs(reconcile.lookback_hours * 60 * 60),
        },
        queue: QueueConfig {
            names: queue.names,
            poll_interval: Duration::from_millis(queue.poll_interval_ms),
            backoff_unit: Duration::from_secs(queue.backoff_unit_secs),
            default_max_retry: queue.default_max_retry,
            stale_after: Duration::from_secs(queue.stale_after_secs),
            retention: Duration::from_secs(queue.retention_days * 24 * 60 * 60),
        },
        maintenance: MaintenanceConfig {
            reservation_sweep: Duration::from_secs(maintenance.reservation_sweep_secs),
            queue_purge: Duration::from_secs(maintenance.queue_purge_secs),
        },
        notify: NotifyConfig {
            api_token: notify.api_token,
            telegram,
        },
        api_keys: ApiKeysConfig {
            etherscan_api_key: explorers.etherscan_api_key.filter(|key| !key.is_empty()),
            tronscan_api_key: explorers.tronscan_api_key.filter(|key| !key.is_empty()),
        },
        addresses: addresses
            .into_iter()
            .map(|entry| SeedAddress {
                chain: entry.chain,
                address: entry.address.trim().to_string(),
                remark: entry.remark,
                enabled: entry.enabled,
            })
            .collect(),
    };

    LoadedConfig {
        listen: server.listen,
        core,
    }
}

/// Get the database URL from the environment.
pub fn get_database_url() -> Result<String, ConfigError> {
    std::env::var("DATABASE_URL").map_err(|_| ConfigError::MissingDatabaseUrl)
}
