//! Validated runtime configuration.
//!
//! The server crate parses the TOML file and converts it into these types;
//! nothing in here touches the filesystem.

mod api_keys;
mod notify;
mod payment;
mod queue;
mod wallet;

pub use api_keys::ApiKeysConfig;
pub use notify::{NotifyConfig, TelegramConfig};
pub use payment::{PaymentConfig, ReconcileConfig};
pub use queue::{MaintenanceConfig, QUEUE_CRITICAL, QUEUE_DEFAULT, QUEUE_LOW, QueueConfig};
pub use wallet::SeedAddress;

/// Everything the core needs to run, grouped by section.
#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub payment: PaymentConfig,
    pub reconcile: ReconcileConfig,
    pub queue: QueueConfig,
    pub maintenance: MaintenanceConfig,
    pub notify: NotifyConfig,
    pub api_keys: ApiKeysConfig,
    pub addresses: Vec<SeedAddress>,
}
