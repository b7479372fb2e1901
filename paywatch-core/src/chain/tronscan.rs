use super::{ChainError, ChainService, RateGate, TokenBalance, Transfer, scale_token_amount};
use async_trait::async_trait;
use paywatch_sdk::objects::ChainType;
use std::time::Duration;
use tracing::{debug, warn};

/// TRC-20 USDT client backed by the public TronScan API.
pub struct TronScanClient {
    api_key: Option<String>,
    http_client: reqwest::Client,
    gate: RateGate,
}

impl TronScanClient {
    const TRANSFERS_URL: &str = "https://apilist.tronscanapi.com/api/transfer/trc20";
    const TOKENS_URL: &str = "https://apilist.tronscanapi.com/api/account/tokens";
    pub const USDT_CONTRACT: &str = "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t";
    const USDT_DECIMALS: u32 = 6;

    pub fn new(api_key: Option<String>) -> Self {
        Self {
            api_key,
            http_client: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            gate: RateGate::new(Duration::from_millis(200)),
        }
    }

    fn get(&self, url: &str) -> reqwest::RequestBuilder {
        let request = self.http_client.get(url);
        match &self.api_key {
            Some(key) => request.header("TRON-PRO-API-KEY", key),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, ChainError> {
        self.gate.wait().await;
        let response = request.send().await?;
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ChainError::RateLimited {
                retry_after_secs: 5,
            });
        }
        if !response.status().is_success() {
            return Err(ChainError::Api {
                message: format!("TronScan returned status {}", response.status()),
            });
        }
        Ok(response)
    }

    /// Keep successful transfers into `address` and normalize their amounts.
    /// An item that cannot be parsed is logged and dropped.
    fn collect_incoming(address: &str, items: Vec<TronScanTransfer>) -> Vec<Transfer> {
        items
            .into_iter()
            .filter(|item| item.to == address && item.contract_ret == "SUCCESS")
            .filter_map(|item| {
                let decimals = item.decimals.unwrap_or(Self::USDT_DECIMALS);
                let amount = match scale_token_amount(&item.amount, decimals) {
                    Ok(amount) => amount,
                    Err(e) => {
                        warn!(tx_hash = %item.hash, error = %e, "Skipping malformed TRC-20 transfer");
                        return None;
                    }
                };
                Some(Transfer {
                    amount,
                    hash: item.hash,
                    from: item.from,
                    to: item.to,
                    block_timestamp_ms: item.block_timestamp,
                    confirmations: u64::from(item.confirmed),
                    status: item.contract_ret,
                    contract_address: Self::USDT_CONTRACT.to_string(),
                })
            })
            .collect()
    }
}

#[async_trait]
impl ChainService for TronScanClient {
    fn chain_type(&self) -> ChainType {
        ChainType::Trc20
    }

    fn validate_address(&self, address: &str) -> bool {
        address.len() == 34
            && address.starts_with('T')
            && address.chars().all(|c| c.is_ascii_alphanumeric())
    }

    async fn get_transactions(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Transfer>, ChainError> {
        let request = self.get(Self::TRANSFERS_URL).query(&[
            ("sort", "-timestamp"),
            ("limit", "50"),
            ("start", "0"),
            ("direction", "2"),
            ("db_version", "1"),
            ("trc20Id", Self::USDT_CONTRACT),
            ("address", address),
            ("start_timestamp", start_ms.to_string().as_str()),
            ("end_timestamp", end_ms.to_string().as_str()),
        ]);
        let response: TronScanTransfersResponse = self.send(request).await?.json().await?;
        debug!(
            address = %address,
            fetched = response.data.len(),
            "Fetched TRC-20 transfers"
        );
        Ok(Self::collect_incoming(address, response.data))
    }

    async fn get_token_balance(&self, address: &str) -> Result<TokenBalance, ChainError> {
        let request = self.get(Self::TOKENS_URL).query(&[("address", address)]);
        let response: TronScanTokensResponse = self.send(request).await?.json().await?;
        if !response.success {
            return Err(ChainError::Api {
                message: "TronScan account/tokens returned success=false".to_string(),
            });
        }
        let primary = match response
            .data
            .iter()
            .find(|token| token.token_id == Self::USDT_CONTRACT && token.token_type == "trc20")
        {
            Some(token) => scale_token_amount(
                &token.balance,
                token.token_decimal.unwrap_or(Self::USDT_DECIMALS),
            )?,
            None => rust_decimal::Decimal::ZERO,
        };
        Ok(TokenBalance {
            primary,
            secondary: rust_decimal::Decimal::ZERO,
        })
    }
}

#[derive(Debug, serde::Deserialize)]
struct TronScanTransfersResponse {
    #[serde(default)]
    data: Vec<TronScanTransfer>,
}

#[derive(Debug, serde::Deserialize)]
struct TronScanTransfer {
    hash: String,
    from: String,
    to: String,
    amount: String,
    block_timestamp: i64,
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    contract_ret: String,
    #[serde(default)]
    decimals: Option<u32>,
}

#[derive(Debug, serde::Deserialize)]
struct TronScanTokensResponse {
    #[serde(default)]
    data: Vec<TronScanToken>,
    #[serde(default)]
    success: bool,
}

#[derive(Debug, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
struct TronScanToken {
    token_id: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    balance: String,
    #[serde(default)]
    token_decimal: Option<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal::Decimal;
    use std::str::FromStr;

    const WALLET: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";

    #[test]
    fn test_collect_incoming_filters_and_scales() {
        let json = format!(
            r#"{{"data": [
                {{"hash": "h1", "from": "TFrom", "to": "{WALLET}", "amount": "15625000",
                  "block_timestamp": 1700000000000, "confirmed": true, "contract_ret": "SUCCESS", "decimals": 6}},
                {{"hash": "h2", "from": "TFrom", "to": "{WALLET}", "amount": "1000000",
                  "block_timestamp": 1700000000000, "contract_ret": "REVERT"}},
                {{"hash": "h3", "from": "{WALLET}", "to": "TOther", "amount": "1000000",
                  "block_timestamp": 1700000000000, "contract_ret": "SUCCESS"}}
            ]}}"#
        );
        let response: TronScanTransfersResponse = serde_json::from_str(&json).unwrap();
        let transfers = TronScanClient::collect_incoming(WALLET, response.data);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].hash, "h1");
        assert_eq!(transfers[0].amount, Decimal::from_str("15.625").unwrap());
        assert_eq!(transfers[0].confirmations, 1);
    }

    #[test]
    fn test_malformed_item_does_not_drop_the_batch() {
        let json = format!(
            r#"{{"data": [
                {{"hash": "broken", "from": "TFrom", "to": "{WALLET}", "amount": "",
                  "block_timestamp": 1700000000000, "contract_ret": "SUCCESS"}},
                {{"hash": "good", "from": "TFrom", "to": "{WALLET}", "amount": "2500000",
                  "block_timestamp": 1700000000000, "contract_ret": "SUCCESS"}}
            ]}}"#
        );
        let response: TronScanTransfersResponse = serde_json::from_str(&json).unwrap();
        let transfers = TronScanClient::collect_incoming(WALLET, response.data);
        assert_eq!(transfers.len(), 1);
        assert_eq!(transfers[0].hash, "good");
        assert_eq!(transfers[0].amount, Decimal::from_str("2.5").unwrap());
    }

    #[test]
    fn test_validate_address() {
        let client = TronScanClient::new(None);
        assert!(client.validate_address(WALLET));
        assert!(!client.validate_address("0xdac17f958d2ee523a2206206994597c13d831ec7"));
        assert!(!client.validate_address("TShort"));
    }
}
