use rust_decimal::Decimal;
use std::time::Duration;

/// Order creation and amount allocation settings.
#[derive(Debug, Clone)]
pub struct PaymentConfig {
    /// How long an order stays payable. Also the reservation TTL.
    pub window: Duration,
    /// Fiat per token. When unset, [`PaymentConfig::FALLBACK_RATE`] is used.
    pub forced_rate: Option<Decimal>,
    pub min_fiat_amount: Decimal,
    pub min_token_amount: Decimal,
    /// Upper bound on amount bumps before the pool counts as exhausted.
    pub max_increments: u32,
}

impl PaymentConfig {
    pub const FALLBACK_RATE: Decimal = Decimal::from_parts(64, 0, 0, false, 1);

    pub fn rate(&self) -> Decimal {
        self.forced_rate
            .filter(|rate| *rate > Decimal::ZERO)
            .unwrap_or(Self::FALLBACK_RATE)
    }
}

impl Default for PaymentConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(10 * 60),
            forced_rate: None,
            min_fiat_amount: Decimal::from_parts(1, 0, 0, false, 2),
            min_token_amount: Decimal::from_parts(1, 0, 0, false, 4),
            max_increments: 1000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ReconcileConfig {
    pub interval: Duration,
    /// Trailing window of transfers fetched on every cycle.
    pub lookback: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            lookback: Duration::from_secs(24 * 60 * 60),
        }
    }
}
