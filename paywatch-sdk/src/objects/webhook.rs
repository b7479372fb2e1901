//! Payload posted to a merchant's notify URL.

use crate::objects::{ChainType, OrderStatus};
use crate::signature::Signature;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Sent when an order is paid or expires. The merchant acknowledges by
/// answering with a body of `ok` or `success`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNotifyPayload {
    pub trade_id: String,
    pub order_id: String,
    pub amount: Decimal,
    pub actual_amount: Decimal,
    pub receiving_address: String,
    pub chain_type: ChainType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_transaction_id: Option<String>,
    pub status: OrderStatus,
}

impl Signature for OrderNotifyPayload {}
