pub mod chain;
pub mod order;
pub mod webhook;

pub use chain::{ChainType, UnknownChainType};
pub use order::{
    CreateOrderRequest, CreateOrderResponse, OrderStatus, OrderStatusRequest, OrderStatusResponse,
};
pub use webhook::OrderNotifyPayload;
