//! TOML file configuration structures.
//!
//! These structs directly map to the `paywatch.toml` file format. Every
//! section except `[notify]` may be omitted.

use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::net::{Ipv4Addr, SocketAddr};

/// Root configuration structure as read from the TOML file.
#[derive(Debug, Clone, Deserialize)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub payment: PaymentSection,
    #[serde(default)]
    pub reconcile: ReconcileSection,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub maintenance: MaintenanceSection,
    pub notify: NotifySection,
    #[serde(default)]
    pub explorers: ExplorersSection,
    #[serde(default)]
    pub addresses: Vec<AddressEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_listen_addr")]
    pub listen: SocketAddr,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen: default_listen_addr(),
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080))
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PaymentSection {
    pub window_minutes: u64,
    pub forced_rate: Option<Decimal>,
    pub min_fiat_amount: Decimal,
    pub min_token_amount: Decimal,
    pub max_increments: u32,
}

impl Default for PaymentSection {
    fn default() -> Self {
        Self {
            window_minutes: 10,
            forced_rate: None,
            min_fiat_amount: Decimal::new(1, 2),
            min_token_amount: Decimal::new(1, 4),
            max_increments: 1000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ReconcileSection {
    pub interval_secs: u64,
    pub lookback_hours: u64,
}

impl Default for ReconcileSection {
    fn default() -> Self {
        Self {
            interval_secs: 10,
            lookback_hours: 24,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QueueSection {
    pub names: Vec<String>,
    pub poll_interval_ms: u64,
    pub backoff_unit_secs: u64,
    pub default_max_retry: i32,
    pub stale_after_secs: u64,
    pub retention_days: u64,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            names: vec!["critical".into(), "default".into(), "low".into()],
            poll_interval_ms: 1000,
            backoff_unit_secs: 10,
            default_max_retry: 3,
            stale_after_secs: 300,
            retention_days: 7,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MaintenanceSection {
    pub reservation_sweep_secs: u64,
    pub queue_purge_secs: u64,
}

impl Default for MaintenanceSection {
    fn default() -> Self {
        Self {
            reservation_sweep_secs: 300,
            queue_purge_secs: 6 * 60 * 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotifySection {
    /// Shared secret for request verification and webhook signing.
    pub api_token: String,
    #[serde(default)]
    pub telegram_bot_token: Option<String>,
    #[serde(default)]
    pub telegram_chat_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExplorersSection {
    #[serde(default)]
    pub etherscan_api_key: Option<String>,
    #[serde(default)]
    pub tronscan_api_key: Option<String>,
}

/// A receiving address to upsert at startup.
#[derive(Debug, Clone, Deserialize)]
pub struct AddressEntry {
    pub chain: ChainType,
    pub address: String,
    #[serde(default)]
    pub remark: String,
    /// `false` soft-disables the address; unset leaves the stored flag alone.
    #[serde(default)]
    pub enabled: Option<bool>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config_parsing() {
        let toml_str = r#"
[server]
listen = "127.0.0.1:3000"

[payment]
window_minutes = 15
forced_rate = "7.2"
max_increments = 500

[reconcile]
interval_secs = 30

[queue]
names = ["critical", "default"]
backoff_unit_secs = 5

[notify]
api_token = "secret123"
telegram_bot_token = "123:abc"
telegram_chat_id = "-100200"

[explorers]
etherscan_api_key = "ETHERSCANKEY"

[[addresses]]
chain = "TRC20"
address = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE"
remark = "main"

[[addresses]]
chain = "ERC20"
address = "0x1234567890abcdef1234567890abcdef12345678"
enabled = false
"#;
        let config: FileConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.server.listen.port(), 3000);
        assert_eq!(config.payment.window_minutes, 15);
        assert_eq!(config.payment.forced_rate, Some(Decimal::new(72, 1)));
        assert_eq!(config.payment.max_increments, 500);
        assert_eq!(config.payment.min_fiat_amount, Decimal::new(1, 2));
        assert_eq!(config.reconcile.interval_secs, 30);
        assert_eq!(config.reconcile.lookback_hours, 24);
        assert_eq!(config.queue.names.len(), 2);
        assert_eq!(config.queue.default_max_retry, 3);
        assert_eq!(config.explorers.tronscan_api_key, None);
        assert_eq!(config.addresses.len(), 2);
        assert_eq!(config.addresses[0].chain, ChainType::Trc20);
        assert_eq!(config.addresses[1].remark, "");
        assert_eq!(config.addresses[0].enabled, None);
        assert_eq!(config.addresses[1].enabled, Some(false));
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config: FileConfig = toml::from_str("[notify]\napi_token = \"t\"\n").unwrap();
        assert_eq!(config.server.listen, default_listen_addr());
        assert_eq!(config.payment.window_minutes, 10);
        assert_eq!(config.queue.names, ["critical", "default", "low"]);
        assert!(config.addresses.is_empty());
    }

    #[test]
    fn test_missing_notify_section_is_rejected() {
        assert!(toml::from_str::<FileConfig>("[server]\n").is_err());
    }
}
