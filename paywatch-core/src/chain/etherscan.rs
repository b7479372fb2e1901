use super::{
    ChainError, ChainService, RateGate, TokenBalance, Transfer, is_evm_address, scale_token_amount,
};
use async_trait::async_trait;
use paywatch_sdk::objects::ChainType;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Stablecoin contracts watched on one EVM chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct TokenContracts {
    usdt: (&'static str, u32),
    usdc: (&'static str, u32),
}

const fn contracts_for(chain: ChainType) -> Option<TokenContracts> {
    match chain {
        ChainType::Erc20 => Some(TokenContracts {
            usdt: ("0xdac17f958d2ee523a2206206994597c13d831ec7", 6),
            usdc: ("0xA0b86991c6218b36c1d19D4a2e9Eb0cE3606eB48", 6),
        }),
        ChainType::Bep20 => Some(TokenContracts {
            usdt: ("0x55d398326f99059fF775485246999027B3197955", 18),
            usdc: ("0x8AC76a51cc950d9822D68b83fE1Ad97B32Cd580d", 18),
        }),
        ChainType::Polygon => Some(TokenContracts {
            usdt: ("0xc2132D05D31c914a87C6611C10748AEb04B58e8F", 6),
            usdc: ("0x2791Bca1f2de4661ED88A30C99A7a9449Aa84174", 6),
        }),
        ChainType::Arbitrum => Some(TokenContracts {
            usdt: ("0xFd086bC7CD5C481DCC9C85ebE478A1C0b69FCbb9", 6),
            usdc: ("0xaf88d065e77c8cC2239327C5EDb3A432268e5831", 6),
        }),
        ChainType::Trc20 | ChainType::Solana => None,
    }
}

/// USDT/USDC client for EVM chains through the Etherscan v2 multichain API.
///
/// One instance serves one chain; instances for different chains can share
/// a [`reqwest::Client`] and rate gate through [`EtherScanClient::for_chains`].
pub struct EtherScanClient {
    chain: ChainType,
    chain_id: u64,
    contracts: TokenContracts,
    api_key: String,
    http_client: reqwest::Client,
    gate: Arc<RateGate>,
}

impl EtherScanClient {
    const API_URL: &str = "https://api.etherscan.io/v2/api";

    pub fn new(chain: ChainType, api_key: String) -> Result<Self, ChainError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self::with_shared(
            chain,
            api_key,
            http_client,
            Arc::new(RateGate::new(Duration::from_secs(1))),
        )
    }

    /// One client per chain, sharing the key's rate limit.
    pub fn for_chains(chains: &[ChainType], api_key: &str) -> Result<Vec<Self>, ChainError> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let gate = Arc::new(RateGate::new(Duration::from_millis(350)));
        chains
            .iter()
            .map(|chain| {
                Self::with_shared(*chain, api_key.to_string(), http_client.clone(), gate.clone())
            })
            .collect()
    }

    fn with_shared(
        chain: ChainType,
        api_key: String,
        http_client: reqwest::Client,
        gate: Arc<RateGate>,
    ) -> Result<Self, ChainError> {
        let (Some(chain_id), Some(contracts)) = (chain.evm_chain_id(), contracts_for(chain)) else {
            return Err(ChainError::Unsupported(chain));
        };
        Ok(Self {
            chain,
            chain_id,
            contracts,
            api_key,
            http_client,
            gate,
        })
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        params: &[(&str, &str)],
    ) -> Result<EtherScanResponse<T>, ChainError> {
        self.gate.wait().await;
        let chain_id = self.chain_id.to_string();
        let response = self
            .http_client
            .get(Self::API_URL)
            .query(&[("apikey", self.api_key.as_str()), ("chainid", chain_id.as_str())])
            .query(params)
            .send()
            .await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainError::RateLimited {
                retry_after_secs: 2,
            });
        }
        Ok(response.json().await?)
    }

    async fn fetch_token_transfers(
        &self,
        address: &str,
        contract: &str,
    ) -> Result<Vec<EtherScanTokenTx>, ChainError> {
        let response: EtherScanResponse<serde_json::Value> = self
            .call(&[
                ("module", "account"),
                ("action", "tokentx"),
                ("contractaddress", contract),
                ("address", address),
                ("page", "1"),
                ("offset", "100"),
                ("startblock", "0"),
                ("endblock", "99999999"),
                ("sort", "desc"),
            ])
            .await?;
        if response.status != "1" {
            return response.into_empty_or_error();
        }
        serde_json::from_value(response.result)
            .map_err(|e| ChainError::Parse(format!("Invalid tokentx result: {e}")))
    }

    async fn fetch_balance(&self, address: &str, contract: (&str, u32)) -> Result<rust_decimal::Decimal, ChainError> {
        let response: EtherScanResponse<String> = self
            .call(&[
                ("module", "account"),
                ("action", "tokenbalance"),
                ("contractaddress", contract.0),
                ("address", address),
                ("tag", "latest"),
            ])
            .await?;
        if response.status != "1" {
            return Err(ChainError::Api {
                message: format!("{}: {}", response.message, response.result),
            });
        }
        scale_token_amount(&response.result, contract.1)
    }

    /// Keep transfers into `address` inside the time window. An item that
    /// cannot be parsed is logged and dropped.
    fn collect_incoming(
        address: &str,
        start_ms: i64,
        end_ms: i64,
        items: Vec<EtherScanTokenTx>,
    ) -> Vec<Transfer> {
        let mut transfers = Vec::new();
        for item in items {
            if !item.to.eq_ignore_ascii_case(address) {
                continue;
            }
            let Some(block_timestamp_ms) = item
                .time_stamp
                .parse::<i64>()
                .ok()
                .and_then(|secs| secs.checked_mul(1000))
            else {
                warn!(tx_hash = %item.hash, time_stamp = %item.time_stamp, "Skipping transfer with invalid timestamp");
                continue;
            };
            if block_timestamp_ms < start_ms || block_timestamp_ms > end_ms {
                continue;
            }
            let decimals: u32 = item.token_decimal.parse().unwrap_or(6);
            let amount = match scale_token_amount(&item.value, decimals) {
                Ok(amount) => amount,
                Err(e) => {
                    warn!(tx_hash = %item.hash, error = %e, "Skipping transfer with invalid value");
                    continue;
                }
            };
            transfers.push(Transfer {
                amount,
                hash: item.hash,
                from: item.from,
                to: item.to,
                block_timestamp_ms,
                confirmations: item.confirmations.parse().unwrap_or(0),
                status: "SUCCESS".to_string(),
                contract_address: item.contract_address,
            });
        }
        transfers
    }

    /// `USDT` or `USDC` for one of this chain's watched contracts.
    pub(super) fn symbol_for(chain: ChainType, contract: &str) -> Option<&'static str> {
        let contracts = contracts_for(chain)?;
        if contracts.usdt.0.eq_ignore_ascii_case(contract) {
            Some("USDT")
        } else if contracts.usdc.0.eq_ignore_ascii_case(contract) {
            Some("USDC")
        } else {
            None
        }
    }
}

#[async_trait]
impl ChainService for EtherScanClient {
    fn chain_type(&self) -> ChainType {
        self.chain
    }

    fn validate_address(&self, address: &str) -> bool {
        is_evm_address(address)
    }

    async fn get_transactions(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Transfer>, ChainError> {
        let mut transfers = Vec::new();
        for (contract, _) in [self.contracts.usdt, self.contracts.usdc] {
            let items = self.fetch_token_transfers(address, contract).await?;
            debug!(
                chain = %self.chain,
                address = %address,
                contract = %contract,
                fetched = items.len(),
                "Fetched token transfers"
            );
            transfers.extend(Self::collect_incoming(address, start_ms, end_ms, items));
        }
        Ok(transfers)
    }

    async fn get_token_balance(&self, address: &str) -> Result<TokenBalance, ChainError> {
        Ok(TokenBalance {
            primary: self.fetch_balance(address, self.contracts.usdt).await?,
            secondary: self.fetch_balance(address, self.contracts.usdc).await?,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct EtherScanResponse<T> {
    status: String,
    message: String,
    result: T,
}

impl<T> EtherScanResponse<T> {
    /// Etherscan answers "no transactions" with status 0; anything else with
    /// status 0 is a real error.
    fn into_empty_or_error<U>(self) -> Result<Vec<U>, ChainError>
    where
        T: std::fmt::Debug,
    {
        if self.message.starts_with("No transactions found") {
            Ok(Vec::new())
        } else {
            Err(ChainError::Api {
                message: format!("{}: {:?}", self.message, self.result),
            })
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct EtherScanTokenTx {
    hash: String,
    time_stamp: String,
    from: String,
    to: String,
    value: String,
    contract_address: String,
    token_decimal: String,
    #[serde(default)]
    confirmations: String,
}
