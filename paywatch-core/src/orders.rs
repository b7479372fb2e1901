//! Order lifecycle: creation, lookup with lazy expiration, and expiration.

use crate::allocator::{AllocationError, AllocationRequest, AllocatorHandle};
use crate::config::{PaymentConfig, QUEUE_CRITICAL, QUEUE_DEFAULT};
use crate::entities::OrderStatus;
use crate::entities::queue_jobs::NewJob;
use crate::store::{NewOrder, OrderRecord, PaymentStore, StoreError};
use crate::tasks::{TASK_ORDER_EXPIRATION, TASK_ORDER_EXPIRATION_CALLBACK};
use paywatch_sdk::objects::ChainType;
use rand::Rng;
use rust_decimal::Decimal;
use std::sync::Arc;
use time::OffsetDateTime;
use tracing::{error, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrder {
    pub external_order_id: String,
    pub fiat_amount: Decimal,
    pub chain: ChainType,
    pub callback_url: Option<String>,
    pub redirect_url: Option<String>,
}

pub struct OrderService<S> {
    store: Arc<S>,
    allocator: AllocatorHandle,
    config: PaymentConfig,
    expiration_max_retry: i32,
}

impl<S: PaymentStore> OrderService<S> {
    pub fn new(store: Arc<S>, allocator: AllocatorHandle, config: PaymentConfig) -> Self {
        Self {
            store,
            allocator,
            config,
            expiration_max_retry: NewJob::DEFAULT_MAX_RETRY,
        }
    }

    /// Retry budget for the expiration jobs this service schedules.
    pub fn with_job_retry(mut self, max_retry: i32) -> Self {
        if max_retry > 0 {
            self.expiration_max_retry = max_retry;
        }
        self
    }

    pub fn config(&self) -> &PaymentConfig {
        &self.config
    }

    /// Allocate an amount slot, persist the order and schedule its expiration.
    ///
    /// Anything that fails after the slot was reserved undoes the earlier
    /// steps, so a failed creation leaves neither an order nor a reservation.
    /// The work runs on its own task: dropping the returned future (a client
    /// disconnect) does not stop a creation halfway.
    pub async fn create_order(
        self: &Arc<Self>,
        request: CreateOrder,
    ) -> Result<OrderRecord, AllocationError> {
        let service = Arc::clone(self);
        tokio::spawn(async move { service.create_order_to_completion(request).await })
            .await
            .map_err(|e| {
                error!(error = %e, "Order creation task aborted");
                AllocationError::Aborted
            })?
    }

    async fn create_order_to_completion(
        &self,
        request: CreateOrder,
    ) -> Result<OrderRecord, AllocationError> {
        if self
            .store
            .get_by_external_id(&request.external_order_id)
            .await?
            .is_some()
        {
            return Err(AllocationError::DuplicateOrder(request.external_order_id));
        }

        let trade_id = generate_trade_id(OffsetDateTime::now_utc());
        let allocation = self
            .allocator
            .allocate(AllocationRequest {
                trade_id: trade_id.clone(),
                fiat_amount: request.fiat_amount,
                chain: request.chain,
            })
            .await?;

        let inserted = self
            .store
            .insert_order(NewOrder {
                trade_id: trade_id.clone(),
                external_order_id: request.external_order_id,
                requested_fiat_amount: request.fiat_amount,
                settlement_amount: allocation.amount,
                receiving_address: allocation.address.clone(),
                chain_type: request.chain,
                callback_url: request.callback_url.filter(|url| !url.is_empty()),
                redirect_url: request.redirect_url.filter(|url| !url.is_empty()),
            })
            .await;
        let order = match inserted {
            Ok(order) => order,
            Err(e) => {
                self.release_quietly(&trade_id, &allocation.key).await;
                return Err(match e {
                    StoreError::DuplicateOrder(id) => AllocationError::DuplicateOrder(id),
                    other => other.into(),
                });
            }
        };

        let expiration = NewJob::new(QUEUE_DEFAULT, TASK_ORDER_EXPIRATION, trade_id.as_bytes())
            .schedule_at(order.expires_at(self.config.window))
            .max_retry(self.expiration_max_retry);
        if let Err(e) = self.store.enqueue(expiration).await {
            error!(trade_id = %trade_id, error = %e, "Failed to schedule expiration, rolling back order");
            if let Err(delete_error) = self.store.delete_order(&trade_id).await {
                error!(trade_id = %trade_id, error = %delete_error, "Failed to roll back order");
            }
            self.release_quietly(&trade_id, &allocation.key).await;
            return Err(e.into());
        }

        info!(
            trade_id = %order.trade_id,
            external_order_id = %order.external_order_id,
            chain = %order.chain_type,
            address = %order.receiving_address,
            amount = %order.settlement(),
            "Order created"
        );
        Ok(order)
    }

    /// Fetch an order, expiring it first if its window has passed.
    pub async fn get_order(&self, trade_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        let Some(order) = self.store.get_by_trade_id(trade_id).await? else {
            return Ok(None);
        };
        if order.status == OrderStatus::AwaitingPayment
            && order.is_past_window(self.config.window, OffsetDateTime::now_utc())
        {
            self.expire_order(trade_id).await?;
            return self.store.get_by_trade_id(trade_id).await;
        }
        Ok(Some(order))
    }

    /// Move an AwaitingPayment order to Expired and free its slot.
    ///
    /// Returns `false` when there was nothing to do: the order is unknown,
    /// already settled, or was paid concurrently.
    pub async fn expire_order(&self, trade_id: &str) -> Result<bool, StoreError> {
        let Some(order) = self.store.get_by_trade_id(trade_id).await? else {
            warn!(trade_id = %trade_id, "Expiration requested for unknown order");
            return Ok(false);
        };
        if order.status != OrderStatus::AwaitingPayment {
            return Ok(false);
        }
        if !self.store.mark_expired(trade_id).await? {
            return Ok(false);
        }

        // The transition is committed; the callback must not depend on the
        // release. A reservation left behind expires with its TTL.
        if let Err(e) = self.store.release(&order.reservation_key()).await {
            warn!(trade_id = %trade_id, error = %e, "Failed to release reservation of expired order");
        }
        info!(trade_id = %trade_id, "Order expired");

        if order.has_callback() {
            let job = NewJob::new(
                QUEUE_CRITICAL,
                TASK_ORDER_EXPIRATION_CALLBACK,
                trade_id.as_bytes(),
            )
            .max_retry(self.expiration_max_retry);
            self.store.enqueue(job).await?;
        }
        Ok(true)
    }

    async fn release_quietly(&self, trade_id: &str, key: &crate::amount::ReservationKey) {
        if let Err(e) = self.store.release(key).await {
            // The reservation expires on its own.
            warn!(trade_id = %trade_id, key = %key, error = %e, "Failed to release reservation");
        }
    }
}

/// `YYYYMMDD` + unix milliseconds + three random digits.
pub fn generate_trade_id(now: OffsetDateTime) -> String {
    let millis = now.unix_timestamp_nanos() / 1_000_000;
    let suffix: u16 = rand::rng().random_range(0..1000);
    format!(
        "{:04}{:02}{:02}{}{:03}",
        now.year(),
        u8::from(now.month()),
        now.day(),
        millis,
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::AmountAllocator;
    use crate::entities::JobStatus;
    use crate::store::memory::MemoryStore;
    use crate::store::{AddressPool, LockStore, OrderStore};
    use crate::testing::FlakyStore;
    use std::time::Duration;
    use tokio::sync::watch;

    const ADDR: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";

    async fn service(
        window: Duration,
    ) -> (Arc<MemoryStore>, Arc<OrderService<MemoryStore>>, watch::Sender<bool>) {
        let store = Arc::new(MemoryStore::new());
        store
            .upsert_address(ADDR, ChainType::Trc20, "main")
            .await
            .unwrap();
        let config = PaymentConfig {
            window,
            ..PaymentConfig::default()
        };
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _) = AmountAllocator::new(store.clone(), config.clone()).spawn(shutdown_rx);
        (store.clone(), Arc::new(OrderService::new(store, handle, config)), shutdown_tx)
    }

    fn create(external: &str, callback: Option<&str>) -> CreateOrder {
        CreateOrder {
            external_order_id: external.to_string(),
            fiat_amount: Decimal::from(100),
            chain: ChainType::Trc20,
            callback_url: callback.map(str::to_string),
            redirect_url: None,
        }
    }

    #[test]
    fn test_trade_id_shape() {
        let now = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap();
        let id = generate_trade_id(now);
        assert!(id.starts_with("20231114"));
        assert!(id[8..].starts_with("1700000000000"));
        assert_eq!(id.len(), 8 + 13 + 3);
    }

    #[tokio::test]
    async fn test_create_order_reserves_and_schedules_expiration() {
        let (store, orders, _shutdown) = service(Duration::from_secs(600)).await;
        let order = orders.create_order(create("m1", None)).await.unwrap();

        assert_eq!(order.status, OrderStatus::AwaitingPayment);
        assert_eq!(order.settlement().to_string(), "15.6250");
        assert_eq!(
            store.lookup(&order.reservation_key()).await.unwrap(),
            Some(order.trade_id.clone())
        );

        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_type, TASK_ORDER_EXPIRATION);
        assert_eq!(jobs[0].payload, order.trade_id.as_bytes());
        assert_eq!(jobs[0].schedule_at, order.created_at + Duration::from_secs(600));
    }

    #[tokio::test]
    async fn test_duplicate_external_id_is_rejected_without_reserving() {
        let (store, orders, _shutdown) = service(Duration::from_secs(600)).await;
        orders.create_order(create("m1", None)).await.unwrap();
        assert!(matches!(
            orders.create_order(create("m1", None)).await,
            Err(AllocationError::DuplicateOrder(id)) if id == "m1"
        ));
        let next = orders.create_order(create("m2", None)).await.unwrap();
        assert_eq!(next.settlement().to_string(), "15.6251");
        assert_eq!(store.orders().await.len(), 2);
    }

    #[tokio::test]
    async fn test_expire_order_frees_slot_once() {
        let (store, orders, _shutdown) = service(Duration::from_secs(600)).await;
        let order = orders
            .create_order(create("m1", Some("https://merchant.example/notify")))
            .await
            .unwrap();

        assert!(orders.expire_order(&order.trade_id).await.unwrap());
        assert!(!orders.expire_order(&order.trade_id).await.unwrap());
        assert!(!store.exists(&order.reservation_key()).await.unwrap());

        let expired = store.get_by_trade_id(&order.trade_id).await.unwrap().unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);

        let callbacks: Vec<_> = store
            .jobs()
            .await
            .into_iter()
            .filter(|job| job.task_type == TASK_ORDER_EXPIRATION_CALLBACK)
            .collect();
        assert_eq!(callbacks.len(), 1);
        assert_eq!(callbacks[0].status, JobStatus::Pending);

        let reused = orders.create_order(create("m2", None)).await.unwrap();
        assert_eq!(reused.settlement(), order.settlement());
    }

    #[tokio::test]
    async fn test_paid_order_is_not_expired() {
        let (store, orders, _shutdown) = service(Duration::from_secs(600)).await;
        let order = orders.create_order(create("m1", None)).await.unwrap();
        store.mark_paid(&order.trade_id, "0xhash", Vec::new()).await.unwrap();
        assert!(!orders.expire_order(&order.trade_id).await.unwrap());
        let paid = store.get_by_trade_id(&order.trade_id).await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn test_get_order_expires_lazily() {
        let (store, orders, _shutdown) = service(Duration::from_secs(600)).await;
        let order = orders.create_order(create("m1", None)).await.unwrap();

        let fresh = orders.get_order(&order.trade_id).await.unwrap().unwrap();
        assert_eq!(fresh.status, OrderStatus::AwaitingPayment);

        store
            .backdate_order(
                &order.trade_id,
                OffsetDateTime::now_utc() - Duration::from_secs(601),
            )
            .await;
        let stale = orders.get_order(&order.trade_id).await.unwrap().unwrap();
        assert_eq!(stale.status, OrderStatus::Expired);
        assert!(!store.exists(&order.reservation_key()).await.unwrap());
        assert!(orders.get_order("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_dropped_create_still_completes_consistently() {
        let (store, orders, _shutdown) = service(Duration::from_secs(600)).await;

        // Polled once, then dropped as a disconnecting client would.
        let dropped =
            tokio::time::timeout(Duration::ZERO, orders.create_order(create("m1", None))).await;
        assert!(dropped.is_err());

        let mut created = Vec::new();
        for _ in 0..100 {
            created = store.orders().await;
            if !created.is_empty() && !store.jobs().await.is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(created.len(), 1);
        let order = &created[0];
        assert_eq!(
            store.lookup(&order.reservation_key()).await.unwrap(),
            Some(order.trade_id.clone())
        );
        let jobs = store.jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].task_type, TASK_ORDER_EXPIRATION);
    }

    #[tokio::test]
    async fn test_expiration_callback_survives_release_failure() {
        let store = Arc::new(FlakyStore::new());
        store
            .upsert_address(ADDR, ChainType::Trc20, "main")
            .await
            .unwrap();
        let config = PaymentConfig::default();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let (handle, _) = AmountAllocator::new(store.clone(), config.clone()).spawn(shutdown_rx);
        let orders = Arc::new(OrderService::new(store.clone(), handle, config));
        let order = orders
            .create_order(create("m1", Some("https://merchant.example/notify")))
            .await
            .unwrap();

        store.fail_release(true);
        assert!(orders.expire_order(&order.trade_id).await.unwrap());

        let expired = store.get_by_trade_id(&order.trade_id).await.unwrap().unwrap();
        assert_eq!(expired.status, OrderStatus::Expired);
        assert!(
            store
                .inner()
                .jobs()
                .await
                .iter()
                .any(|job| job.task_type == TASK_ORDER_EXPIRATION_CALLBACK)
        );
    }
}
