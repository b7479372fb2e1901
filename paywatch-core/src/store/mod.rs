//! Storage capabilities used by the payment core.
//!
//! Each concern is its own trait so that components only depend on what
//! they touch. [`postgres::PgStore`] implements all of them on one pool;
//! [`memory::MemoryStore`] implements them in-process with the same
//! contracts.

pub mod memory;
pub mod postgres;

use crate::amount::ReservationKey;
use crate::entities::JobStatus;
use crate::entities::queue_jobs::{NewJob, QueueJob};
use crate::entities::receiving_address::ReceivingAddress;
use async_trait::async_trait;
use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;

pub use crate::entities::order_records::{NewOrder, OrderRecord, PaidOutcome};

#[derive(Debug, Error)]
pub enum StoreError {
    /// A live reservation already holds the key.
    #[error("reservation already held")]
    AlreadyReserved,

    #[error("duplicate external order id: {0}")]
    DuplicateOrder(String),

    #[error("record not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Time-bounded exclusive reservations keyed by `address|amount|chain`.
#[async_trait]
pub trait LockStore: Send + Sync {
    /// First writer wins. Fails with [`StoreError::AlreadyReserved`] while
    /// a live entry holds the key; an expired entry is replaced.
    async fn reserve(
        &self,
        key: &ReservationKey,
        trade_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError>;

    /// Idempotent.
    async fn release(&self, key: &ReservationKey) -> Result<(), StoreError>;

    /// The trade id holding the key, if the reservation is live.
    async fn lookup(&self, key: &ReservationKey) -> Result<Option<String>, StoreError>;

    async fn exists(&self, key: &ReservationKey) -> Result<bool, StoreError> {
        Ok(self.lookup(key).await?.is_some())
    }

    async fn has_live_reservation(
        &self,
        address: &str,
        chain: ChainType,
    ) -> Result<bool, StoreError>;

    /// Drop expired entries. Returns how many were removed.
    async fn purge_expired(&self) -> Result<u64, StoreError>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Fails with [`StoreError::DuplicateOrder`] if the external id is taken.
    async fn insert_order(&self, order: NewOrder) -> Result<OrderRecord, StoreError>;

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<OrderRecord>, StoreError>;

    async fn get_by_external_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError>;

    /// Atomic tx-hash uniqueness check plus AwaitingPayment -> Paid.
    /// `follow_ups` are enqueued in the same commit, and only on `Paid`.
    async fn mark_paid(
        &self,
        trade_id: &str,
        tx_hash: &str,
        follow_ups: Vec<NewJob>,
    ) -> Result<PaidOutcome, StoreError>;

    /// AwaitingPayment -> Expired. `false` if the order was not awaiting payment.
    async fn mark_expired(&self, trade_id: &str) -> Result<bool, StoreError>;

    /// Only used to roll back a creation that could not be completed.
    async fn delete_order(&self, trade_id: &str) -> Result<(), StoreError>;

    async fn record_callback_attempt(
        &self,
        trade_id: &str,
        acknowledged: bool,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait AddressPool: Send + Sync {
    /// Enabled addresses of a chain in a stable order.
    async fn enabled_addresses(&self, chain: ChainType)
    -> Result<Vec<ReceivingAddress>, StoreError>;

    async fn upsert_address(
        &self,
        address: &str,
        chain: ChainType,
        remark: &str,
    ) -> Result<(), StoreError>;

    /// Soft enable/disable. `false` if the address is unknown.
    async fn set_enabled(
        &self,
        address: &str,
        chain: ChainType,
        enabled: bool,
    ) -> Result<bool, StoreError>;

    async fn update_balance(
        &self,
        address: &str,
        chain: ChainType,
        balance: Decimal,
    ) -> Result<bool, StoreError>;
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError>;

    /// Atomically move one due Pending job (oldest first) to Processing.
    async fn claim_next(
        &self,
        queue_name: &str,
        now: OffsetDateTime,
    ) -> Result<Option<QueueJob>, StoreError>;

    async fn complete(&self, id: i64) -> Result<(), StoreError>;

    /// Consume one retry. Returns the job's new status: Pending when it was
    /// rescheduled, Failed once `max_retry` is reached.
    async fn fail(&self, id: i64, backoff_unit: Duration) -> Result<JobStatus, StoreError>;

    async fn get_job(&self, id: i64) -> Result<Option<QueueJob>, StoreError>;

    async fn requeue_stale(&self, older_than: OffsetDateTime) -> Result<u64, StoreError>;

    async fn purge_finished(&self, older_than: OffsetDateTime) -> Result<u64, StoreError>;
}

/// Everything the payment core needs from storage.
pub trait PaymentStore: LockStore + OrderStore + AddressPool + JobStore + 'static {}

impl<T> PaymentStore for T where T: LockStore + OrderStore + AddressPool + JobStore + 'static {}
