//! Fixed-point settlement amounts and the reservation keys built from them.
//!
//! Amounts are always carried with exactly four fractional digits so that
//! `12.31` and `12.3100` produce the same key at allocation and at matching
//! time.

use paywatch_sdk::objects::ChainType;
use rust_decimal::{Decimal, RoundingStrategy};
use std::fmt;

pub const SCALE: u32 = 4;

/// Smallest step between two candidate amounts (0.0001).
pub const INCREMENT: Decimal = Decimal::from_parts(1, 0, 0, false, SCALE);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SettlementAmount(Decimal);

impl SettlementAmount {
    pub fn normalize(value: Decimal) -> Self {
        let mut rounded = value.round_dp_with_strategy(SCALE, RoundingStrategy::MidpointAwayFromZero);
        rounded.rescale(SCALE);
        Self(rounded)
    }

    /// Convert a fiat amount into token units at `rate` fiat per token.
    /// Returns `None` for a non-positive rate.
    pub fn from_fiat(fiat: Decimal, rate: Decimal) -> Option<Self> {
        if rate <= Decimal::ZERO {
            return None;
        }
        fiat.checked_div(rate).map(Self::normalize)
    }

    pub fn increment(self) -> Self {
        Self::normalize(self.0 + INCREMENT)
    }

    pub fn value(&self) -> Decimal {
        self.0
    }
}

impl From<SettlementAmount> for Decimal {
    fn from(value: SettlementAmount) -> Self {
        value.0
    }
}

impl fmt::Display for SettlementAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// LockStore key: `address|amount|CHAIN`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ReservationKey(String);

impl ReservationKey {
    pub fn new(address: &str, amount: SettlementAmount, chain: ChainType) -> Self {
        Self(format!("{address}|{amount}|{chain}"))
    }

    /// Prefix shared by every key of `address`.
    pub fn address_prefix(address: &str) -> String {
        format!("{address}|")
    }

    /// Suffix shared by every key on `chain`.
    pub fn chain_suffix(chain: ChainType) -> String {
        format!("|{chain}")
    }

    pub fn belongs_to(&self, address: &str, chain: ChainType) -> bool {
        self.0.starts_with(&Self::address_prefix(address))
            && self.0.ends_with(&Self::chain_suffix(chain))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReservationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> Decimal {
        Decimal::from_str(s).unwrap()
    }

    #[test]
    fn test_equal_values_produce_equal_keys() {
        let a = ReservationKey::new("TAddr", SettlementAmount::normalize(dec("12.31")), ChainType::Trc20);
        let b = ReservationKey::new("TAddr", SettlementAmount::normalize(dec("12.310000")), ChainType::Trc20);
        assert_eq!(a, b);
        assert_eq!(a.as_str(), "TAddr|12.3100|TRC20");
    }

    #[test]
    fn test_from_fiat_rounds_to_four_places() {
        let amount = SettlementAmount::from_fiat(dec("100"), dec("6.4")).unwrap();
        assert_eq!(amount.to_string(), "15.6250");

        let amount = SettlementAmount::from_fiat(dec("10"), dec("3")).unwrap();
        assert_eq!(amount.to_string(), "3.3333");

        assert_eq!(SettlementAmount::from_fiat(dec("10"), Decimal::ZERO), None);
    }

    #[test]
    fn test_midpoint_rounds_away_from_zero() {
        assert_eq!(SettlementAmount::normalize(dec("1.00005")).to_string(), "1.0001");
        assert_eq!(SettlementAmount::normalize(dec("1.00004")).to_string(), "1.0000");
    }

    #[test]
    fn test_increment_is_one_ten_thousandth() {
        let amount = SettlementAmount::normalize(dec("15.625"));
        assert_eq!(amount.increment().to_string(), "15.6251");
        assert_eq!(INCREMENT, dec("0.0001"));
    }

    #[test]
    fn test_key_ownership() {
        let key = ReservationKey::new("0xabc", SettlementAmount::normalize(dec("1")), ChainType::Erc20);
        assert!(key.belongs_to("0xabc", ChainType::Erc20));
        assert!(!key.belongs_to("0xabc", ChainType::Bep20));
        assert!(!key.belongs_to("0xab", ChainType::Erc20));
    }
}
