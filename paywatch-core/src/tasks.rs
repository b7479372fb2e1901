//! Job handlers for the task types the payment core schedules.

use crate::chain::{ChainError, ChainRegistry};
use crate::notify::{NotificationSink, NotifyError};
use crate::orders::OrderService;
use crate::queue::{HandlerRegistry, JobHandler};
use crate::store::{AddressPool, OrderStore, PaymentStore, StoreError};
use async_trait::async_trait;
use paywatch_sdk::objects::ChainType;
use paywatch_sdk::signature::SignedObject;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{info, warn};

pub const TASK_ORDER_EXPIRATION: &str = "order:expiration";
pub const TASK_ORDER_CALLBACK: &str = "order:callback";
pub const TASK_ORDER_EXPIRATION_CALLBACK: &str = "order:expiration:callback";
pub const TASK_BALANCE_REFRESH: &str = "wallet:balance_refresh";

/// Paid-order webhooks get more attempts than other jobs.
pub const CALLBACK_MAX_RETRY: i32 = 5;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("invalid job payload: {0}")]
    InvalidPayload(String),

    #[error("no handler registered for task type {0}")]
    UnknownTaskType(String),

    #[error("webhook not acknowledged (status {status}): {body}")]
    NotAcknowledged { status: u16, body: String },

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),

    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),
}

fn trade_id_from(payload: &[u8]) -> Result<&str, TaskError> {
    let trade_id = std::str::from_utf8(payload)
        .map_err(|e| TaskError::InvalidPayload(e.to_string()))?
        .trim();
    if trade_id.is_empty() {
        return Err(TaskError::InvalidPayload("empty trade id".to_string()));
    }
    Ok(trade_id)
}

/// `order:expiration`: payload is the trade id.
pub struct OrderExpirationTask<S> {
    orders: Arc<OrderService<S>>,
}

impl<S> OrderExpirationTask<S> {
    pub fn new(orders: Arc<OrderService<S>>) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl<S: PaymentStore> JobHandler for OrderExpirationTask<S> {
    async fn handle(&self, payload: &[u8]) -> Result<(), TaskError> {
        let trade_id = trade_id_from(payload)?;
        self.orders.expire_order(trade_id).await?;
        Ok(())
    }
}

/// `order:callback` and `order:expiration:callback`: post the order's
/// current state to its notify URL.
///
/// Every attempt is recorded on the order. An answer other than `ok` or
/// `success` fails the job so the queue retries it.
pub struct OrderCallbackTask<S> {
    store: Arc<S>,
    notifier: Arc<dyn NotificationSink>,
    signing_key: Arc<[u8]>,
}

impl<S> OrderCallbackTask<S> {
    pub fn new(store: Arc<S>, notifier: Arc<dyn NotificationSink>, signing_key: Arc<[u8]>) -> Self {
        Self {
            store,
            notifier,
            signing_key,
        }
    }
}

#[async_trait]
impl<S: OrderStore + 'static> JobHandler for OrderCallbackTask<S> {
    async fn handle(&self, payload: &[u8]) -> Result<(), TaskError> {
        let trade_id = trade_id_from(payload)?;
        let Some(order) = self.store.get_by_trade_id(trade_id).await? else {
            warn!(trade_id = %trade_id, "Callback for unknown order dropped");
            return Ok(());
        };
        let Some(url) = order.callback_url.as_deref().filter(|url| !url.is_empty()) else {
            return Ok(());
        };
        if order.callback_acknowledged {
            return Ok(());
        }

        let signed = SignedObject::new(order.notify_payload(), &self.signing_key)
            .map_err(NotifyError::from)?;
        let response = match self.notifier.deliver_webhook(url, &signed).await {
            Ok(response) => response,
            Err(e) => {
                self.store.record_callback_attempt(trade_id, false).await?;
                return Err(e.into());
            }
        };

        let acknowledged = response.is_acknowledged();
        self.store
            .record_callback_attempt(trade_id, acknowledged)
            .await?;
        if !acknowledged {
            return Err(TaskError::NotAcknowledged {
                status: response.status,
                body: response.body,
            });
        }

        info!(
            trade_id = %trade_id,
            status = ?order.status,
            "Webhook acknowledged"
        );
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalanceRefreshPayload {
    pub address: String,
    pub chain: ChainType,
}

/// `wallet:balance_refresh`: re-read an address balance after a payment.
pub struct BalanceRefreshTask<S> {
    store: Arc<S>,
    registry: Arc<ChainRegistry>,
}

impl<S> BalanceRefreshTask<S> {
    pub fn new(store: Arc<S>, registry: Arc<ChainRegistry>) -> Self {
        Self { store, registry }
    }
}

#[async_trait]
impl<S: AddressPool + 'static> JobHandler for BalanceRefreshTask<S> {
    async fn handle(&self, payload: &[u8]) -> Result<(), TaskError> {
        let payload: BalanceRefreshPayload = serde_json::from_slice(payload)
            .map_err(|e| TaskError::InvalidPayload(e.to_string()))?;
        let service = self.registry.require(payload.chain)?;
        let balance = service.get_token_balance(&payload.address).await?;
        self.store
            .update_balance(&payload.address, payload.chain, balance.primary)
            .await?;
        info!(
            chain = %payload.chain,
            address = %payload.address,
            balance = %balance.primary,
            "Address balance refreshed"
        );
        Ok(())
    }
}

/// The handler set every deployment runs.
pub fn default_handlers<S: PaymentStore>(
    orders: Arc<OrderService<S>>,
    store: Arc<S>,
    registry: Arc<ChainRegistry>,
    notifier: Arc<dyn NotificationSink>,
    signing_key: Arc<[u8]>,
) -> HandlerRegistry {
    let callback: Arc<dyn JobHandler> =
        Arc::new(OrderCallbackTask::new(store.clone(), notifier, signing_key));
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        TASK_ORDER_EXPIRATION,
        Arc::new(OrderExpirationTask::new(orders)),
    );
    handlers.register(TASK_ORDER_CALLBACK, callback.clone());
    handlers.register(TASK_ORDER_EXPIRATION_CALLBACK, callback);
    handlers.register(
        TASK_BALANCE_REFRESH,
        Arc::new(BalanceRefreshTask::new(store, registry)),
    );
    handlers
}
