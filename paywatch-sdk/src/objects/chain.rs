use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Every chain paywatch can accept payments on.
///
/// The set is closed on purpose: adding a chain means touching every
/// exhaustive match that dispatches on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChainType {
    #[serde(rename = "TRC20")]
    Trc20,
    #[serde(rename = "ERC20")]
    Erc20,
    #[serde(rename = "BEP20")]
    Bep20,
    #[serde(rename = "POLYGON")]
    Polygon,
    #[serde(rename = "ARBITRUM")]
    Arbitrum,
    #[serde(rename = "SOLANA")]
    Solana,
}

impl ChainType {
    pub const ALL: [ChainType; 6] = [
        ChainType::Trc20,
        ChainType::Erc20,
        ChainType::Bep20,
        ChainType::Polygon,
        ChainType::Arbitrum,
        ChainType::Solana,
    ];

    pub const fn as_str(&self) -> &'static str {
        match self {
            ChainType::Trc20 => "TRC20",
            ChainType::Erc20 => "ERC20",
            ChainType::Bep20 => "BEP20",
            ChainType::Polygon => "POLYGON",
            ChainType::Arbitrum => "ARBITRUM",
            ChainType::Solana => "SOLANA",
        }
    }

    /// Chain id used by the Etherscan v2 multichain API. `None` for non-EVM chains.
    pub const fn evm_chain_id(&self) -> Option<u64> {
        match self {
            ChainType::Erc20 => Some(1),
            ChainType::Bep20 => Some(56),
            ChainType::Polygon => Some(137),
            ChainType::Arbitrum => Some(42161),
            ChainType::Trc20 | ChainType::Solana => None,
        }
    }

    /// Public block explorer link for a transaction hash.
    pub fn explorer_url(&self, tx_hash: &str) -> String {
        match self {
            ChainType::Trc20 => format!("https://tronscan.org/#/transaction/{tx_hash}"),
            ChainType::Erc20 => format!("https://etherscan.io/tx/{tx_hash}"),
            ChainType::Bep20 => format!("https://bscscan.com/tx/{tx_hash}"),
            ChainType::Polygon => format!("https://polygonscan.com/tx/{tx_hash}"),
            ChainType::Arbitrum => format!("https://arbiscan.io/tx/{tx_hash}"),
            ChainType::Solana => format!("https://solscan.io/tx/{tx_hash}"),
        }
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown chain type: {0}")]
pub struct UnknownChainType(pub String);

impl FromStr for ChainType {
    type Err = UnknownChainType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainType::ALL
            .into_iter()
            .find(|chain| chain.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownChainType(s.to_owned()))
    }
}

impl TryFrom<String> for ChainType {
    type Error = UnknownChainType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!("trc20".parse::<ChainType>(), Ok(ChainType::Trc20));
        assert_eq!("POLYGON".parse::<ChainType>(), Ok(ChainType::Polygon));
        assert!("dogecoin".parse::<ChainType>().is_err());
    }

    #[test]
    fn test_serde_names_match_display() {
        for chain in ChainType::ALL {
            let json = serde_json::to_string(&chain).unwrap();
            assert_eq!(json, format!("\"{chain}\""));
        }
    }

    #[test]
    fn test_explorer_url() {
        assert_eq!(
            ChainType::Trc20.explorer_url("abc"),
            "https://tronscan.org/#/transaction/abc"
        );
        assert_eq!(
            ChainType::Bep20.explorer_url("0x1"),
            "https://bscscan.com/tx/0x1"
        );
    }
}
