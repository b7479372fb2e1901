//! Application state shared across all request handlers.

use paywatch_core::chain::ChainRegistry;
use paywatch_core::orders::OrderService;
use paywatch_core::store::postgres::PgStore;
use std::sync::Arc;

/// Cheap to clone; everything is behind `Arc`.
pub struct AppState<S = PgStore> {
    pub orders: Arc<OrderService<S>>,
    /// Used to check receiving-address formats per chain.
    pub registry: Arc<ChainRegistry>,
    /// HMAC key for the Service API signature.
    pub api_token: Arc<[u8]>,
}

impl<S> AppState<S> {
    pub fn new(orders: Arc<OrderService<S>>, registry: Arc<ChainRegistry>, api_token: &str) -> Self {
        Self {
            orders,
            registry,
            api_token: Arc::from(api_token.as_bytes()),
        }
    }
}

impl<S> Clone for AppState<S> {
    fn clone(&self) -> Self {
        Self {
            orders: self.orders.clone(),
            registry: self.registry.clone(),
            api_token: self.api_token.clone(),
        }
    }
}
