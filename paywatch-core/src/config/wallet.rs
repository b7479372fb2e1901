use paywatch_sdk::objects::ChainType;

/// A receiving address declared in the config file and upserted at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeedAddress {
    pub chain: ChainType,
    pub address: String,
    pub remark: String,
    pub enabled: Option<bool>,
}
