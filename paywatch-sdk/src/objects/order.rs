use crate::objects::ChainType;
use crate::signature::Signature;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Request body for `POST /api/v1/orders`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderRequest {
    /// Merchant-side order id, unique per merchant.
    pub order_id: String,
    /// Amount in fiat units.
    pub amount: Decimal,
    pub chain_type: ChainType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

impl Signature for CreateOrderRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrderResponse {
    pub trade_id: String,
    pub order_id: String,
    pub amount: Decimal,
    /// The exact token amount the payer must send.
    pub actual_amount: Decimal,
    pub receiving_address: String,
    pub chain_type: ChainType,
    /// Unix timestamp (seconds) after which the order expires.
    pub expiration_time: i64,
}

/// Request body for `POST /api/v1/orders/status`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusRequest {
    pub trade_id: String,
}

impl Signature for OrderStatusRequest {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusResponse {
    pub trade_id: String,
    pub order_id: String,
    pub status: OrderStatus,
    pub actual_amount: Decimal,
    pub receiving_address: String,
    pub chain_type: ChainType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_transaction_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_url: Option<String>,
}

/// Order status as seen by merchants.
///
/// Database code keeps its own `sqlx::Type` mirror of this enum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    AwaitingPayment,
    Paid,
    Expired,
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderStatus::AwaitingPayment => write!(f, "awaiting_payment"),
            OrderStatus::Paid => write!(f, "paid"),
            OrderStatus::Expired => write!(f, "expired"),
        }
    }
}
