//! API keys for blockchain explorer services.

#[derive(Debug, Clone, Default)]
pub struct ApiKeysConfig {
    /// Etherscan v2 key, shared by every EVM chain.
    pub etherscan_api_key: Option<String>,
    /// Sent as `TRON-PRO-API-KEY`; TronScan works without one at a lower rate limit.
    pub tronscan_api_key: Option<String>,
}
