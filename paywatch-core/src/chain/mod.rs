//! Chain capability: fetch incoming token transfers for an address.
//!
//! Each supported chain is served by one [`ChainService`]. The set of chains
//! is the closed [`ChainType`] enum; [`ChainRegistry`] maps each of them to
//! an optional service so that a chain without a client is skipped instead
//! of failing the whole pipeline.

mod etherscan;
mod tronscan;

pub use etherscan::EtherScanClient;
pub use tronscan::TronScanClient;

use crate::config::ApiKeysConfig;
use async_trait::async_trait;
use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// One incoming token transfer, amount already divided by the token decimals.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transfer {
    pub hash: String,
    pub from: String,
    pub to: String,
    pub amount: Decimal,
    /// Milliseconds since the Unix epoch.
    pub block_timestamp_ms: i64,
    pub confirmations: u64,
    pub status: String,
    pub contract_address: String,
}

impl Transfer {
    /// Symbol of the token moved, from its contract. Unknown contracts
    /// count as USDT.
    pub fn token_symbol(&self, chain: ChainType) -> &'static str {
        if chain == ChainType::Trc20 {
            return "USDT";
        }
        EtherScanClient::symbol_for(chain, &self.contract_address).unwrap_or("USDT")
    }
}

/// Balances of the two stablecoins an address may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TokenBalance {
    pub primary: Decimal,
    pub secondary: Decimal,
}

#[derive(Debug, Error)]
pub enum ChainError {
    #[error("API request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("rate limit exceeded, retry after {retry_after_secs} seconds")]
    RateLimited { retry_after_secs: u64 },

    #[error("API error: {message}")]
    Api { message: String },

    #[error("API response parsing error: {0}")]
    Parse(String),

    #[error("chain {0} is not supported by this client")]
    Unsupported(ChainType),

    #[error("no service registered for chain {0}")]
    NoService(ChainType),
}

#[async_trait]
pub trait ChainService: Send + Sync {
    fn chain_type(&self) -> ChainType;

    fn validate_address(&self, address: &str) -> bool;

    /// Incoming transfers to `address` with block time in `[start_ms, end_ms]`.
    async fn get_transactions(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Transfer>, ChainError>;

    async fn get_token_balance(&self, address: &str) -> Result<TokenBalance, ChainError>;
}

#[derive(Default, Clone)]
pub struct ChainRegistry {
    services: Vec<(ChainType, Arc<dyn ChainService>)>,
}

impl ChainRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service under its own chain type, replacing any previous one.
    pub fn register(&mut self, service: Arc<dyn ChainService>) {
        let chain = service.chain_type();
        self.services.retain(|(existing, _)| *existing != chain);
        self.services.push((chain, service));
    }

    /// The explorer clients a deployment gets from its API keys: TronScan
    /// always, Etherscan for every EVM chain when a key is configured.
    pub fn from_api_keys(keys: &ApiKeysConfig) -> Result<Self, ChainError> {
        let mut registry = Self::new().with(Arc::new(TronScanClient::new(
            keys.tronscan_api_key.clone(),
        )));
        if let Some(key) = &keys.etherscan_api_key {
            let evm: Vec<ChainType> = ChainType::ALL
                .into_iter()
                .filter(|chain| chain.evm_chain_id().is_some())
                .collect();
            for client in EtherScanClient::for_chains(&evm, key)? {
                registry.register(Arc::new(client));
            }
        }
        Ok(registry)
    }

    pub fn with(mut self, service: Arc<dyn ChainService>) -> Self {
        self.register(service);
        self
    }

    pub fn get(&self, chain: ChainType) -> Option<Arc<dyn ChainService>> {
        self.services
            .iter()
            .find(|(existing, _)| *existing == chain)
            .map(|(_, service)| service.clone())
    }

    pub fn require(&self, chain: ChainType) -> Result<Arc<dyn ChainService>, ChainError> {
        self.get(chain).ok_or(ChainError::NoService(chain))
    }

    /// Chains that have a service, in [`ChainType::ALL`] order.
    pub fn chains(&self) -> Vec<ChainType> {
        ChainType::ALL
            .into_iter()
            .filter(|chain| self.get(*chain).is_some())
            .collect()
    }

    /// Address format check for a chain. Chains without a service only
    /// get a non-empty check.
    pub fn validate_address(&self, chain: ChainType, address: &str) -> bool {
        match self.get(chain) {
            Some(service) => service.validate_address(address),
            None => !address.trim().is_empty(),
        }
    }
}

impl std::fmt::Debug for ChainRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.chains()).finish()
    }
}

/// Spaces out calls to an explorer API that enforces a request rate.
#[derive(Debug)]
pub(crate) struct RateGate {
    min_interval: Duration,
    last: Mutex<Option<Instant>>,
}

impl RateGate {
    pub(crate) fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last: Mutex::new(None),
        }
    }

    pub(crate) async fn wait(&self) {
        let mut last = self.last.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.min_interval).await;
        }
        *last = Some(Instant::now());
    }
}

/// Divide a raw integer token amount by `10^decimals`.
pub(crate) fn scale_token_amount(raw: &str, decimals: u32) -> Result<Decimal, ChainError> {
    let value: Decimal = raw
        .parse()
        .map_err(|e| ChainError::Parse(format!("Invalid value {raw:?}: {e}")))?;
    let divisor = 10u64
        .checked_pow(decimals)
        .map(Decimal::from)
        .ok_or_else(|| ChainError::Parse(format!("Invalid decimals: {decimals}")))?;
    value
        .checked_div(divisor)
        .ok_or_else(|| ChainError::Parse(format!("Value out of range: {raw}")))
}

pub(crate) fn is_evm_address(address: &str) -> bool {
    address.len() == 42
        && address.starts_with("0x")
        && address[2..].chars().all(|c| c.is_ascii_hexdigit())
}
