//! In-process store with the same contracts as the Postgres one.
//!
//! Used by tests and by dry runs without a database. Every operation takes
//! one async mutex, which gives the same atomicity the SQL statements get
//! from row locks and transactions.

use super::{
    AddressPool, JobStore, LockStore, NewOrder, OrderRecord, OrderStore, PaidOutcome, StoreError,
};
use crate::amount::ReservationKey;
use crate::entities::queue_jobs::{NewJob, QueueJob};
use crate::entities::receiving_address::ReceivingAddress;
use crate::entities::{JobStatus, OrderStatus};
use async_trait::async_trait;
use paywatch_sdk::objects::ChainType;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;

#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
}

#[derive(Debug, Default)]
struct MemoryState {
    reservations: HashMap<ReservationKey, (String, OffsetDateTime)>,
    orders: HashMap<String, OrderRecord>,
    addresses: Vec<ReceivingAddress>,
    jobs: BTreeMap<i64, QueueJob>,
    next_job_id: i64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every job ever enqueued, oldest first.
    pub async fn jobs(&self) -> Vec<QueueJob> {
        self.state.lock().await.jobs.values().cloned().collect()
    }

    pub async fn orders(&self) -> Vec<OrderRecord> {
        self.state.lock().await.orders.values().cloned().collect()
    }

    /// All addresses, enabled or not.
    pub async fn addresses(&self) -> Vec<ReceivingAddress> {
        self.state.lock().await.addresses.clone()
    }

    /// Rewrite an order's creation time, for exercising time-window rules.
    #[cfg(any(test, feature = "testing"))]
    pub async fn backdate_order(&self, trade_id: &str, created_at: OffsetDateTime) -> bool {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(trade_id) {
            Some(order) => {
                order.created_at = created_at;
                true
            }
            None => false,
        }
    }

    /// Rewrite a job's `updated_at`, for exercising the staleness sweep.
    #[cfg(any(test, feature = "testing"))]
    pub async fn touch_job(&self, id: i64, updated_at: OffsetDateTime) -> bool {
        let mut state = self.state.lock().await;
        match state.jobs.get_mut(&id) {
            Some(job) => {
                job.updated_at = updated_at;
                true
            }
            None => false,
        }
    }
}

impl MemoryState {
    fn live_value(&self, key: &ReservationKey, now: OffsetDateTime) -> Option<&String> {
        self.reservations
            .get(key)
            .filter(|(_, expires_at)| *expires_at > now)
            .map(|(value, _)| value)
    }

    fn push_job(&mut self, job: NewJob, now: OffsetDateTime) -> i64 {
        self.next_job_id += 1;
        let id = self.next_job_id;
        self.jobs.insert(
            id,
            QueueJob {
                id,
                queue_name: job.queue_name,
                task_type: job.task_type,
                payload: job.payload,
                status: JobStatus::Pending,
                retry_count: 0,
                max_retry: job.max_retry,
                schedule_at: job.schedule_at.unwrap_or(now),
                updated_at: now,
                created_at: now,
            },
        );
        id
    }
}

#[async_trait]
impl LockStore for MemoryStore {
    async fn reserve(
        &self,
        key: &ReservationKey,
        trade_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        if state.live_value(key, now).is_some() {
            return Err(StoreError::AlreadyReserved);
        }
        state
            .reservations
            .insert(key.clone(), (trade_id.to_string(), now + ttl));
        Ok(())
    }

    async fn release(&self, key: &ReservationKey) -> Result<(), StoreError> {
        self.state.lock().await.reservations.remove(key);
        Ok(())
    }

    async fn lookup(&self, key: &ReservationKey) -> Result<Option<String>, StoreError> {
        let now = OffsetDateTime::now_utc();
        Ok(self.state.lock().await.live_value(key, now).cloned())
    }

    async fn has_live_reservation(
        &self,
        address: &str,
        chain: ChainType,
    ) -> Result<bool, StoreError> {
        let now = OffsetDateTime::now_utc();
        let state = self.state.lock().await;
        Ok(state
            .reservations
            .iter()
            .any(|(key, (_, expires_at))| *expires_at > now && key.belongs_to(address, chain)))
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let before = state.reservations.len();
        state
            .reservations
            .retain(|_, (_, expires_at)| *expires_at > now);
        Ok((before - state.reservations.len()) as u64)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn insert_order(&self, order: NewOrder) -> Result<OrderRecord, StoreError> {
        let mut state = self.state.lock().await;
        if state.orders.contains_key(&order.trade_id)
            || state
                .orders
                .values()
                .any(|o| o.external_order_id == order.external_order_id)
        {
            return Err(StoreError::DuplicateOrder(order.external_order_id));
        }
        let now = OffsetDateTime::now_utc();
        let record = OrderRecord {
            trade_id: order.trade_id,
            external_order_id: order.external_order_id,
            requested_fiat_amount: order.requested_fiat_amount,
            settlement_amount: order.settlement_amount.value(),
            receiving_address: order.receiving_address,
            chain_type: order.chain_type,
            status: OrderStatus::AwaitingPayment,
            callback_url: order.callback_url,
            redirect_url: order.redirect_url,
            callback_delivery_count: 0,
            callback_acknowledged: false,
            matched_tx_hash: None,
            created_at: now,
            updated_at: now,
        };
        state.orders.insert(record.trade_id.clone(), record.clone());
        Ok(record)
    }

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self.state.lock().await.orders.get(trade_id).cloned())
    }

    async fn get_by_external_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .orders
            .values()
            .find(|o| o.external_order_id == external_order_id)
            .cloned())
    }

    async fn mark_paid(
        &self,
        trade_id: &str,
        tx_hash: &str,
        follow_ups: Vec<NewJob>,
    ) -> Result<PaidOutcome, StoreError> {
        let mut state = self.state.lock().await;
        if state
            .orders
            .values()
            .any(|o| o.matched_tx_hash.as_deref() == Some(tx_hash))
        {
            return Ok(PaidOutcome::AlreadyClaimed);
        }
        let now = OffsetDateTime::now_utc();
        match state.orders.get_mut(trade_id) {
            Some(order) if order.status == OrderStatus::AwaitingPayment => {
                order.status = OrderStatus::Paid;
                order.matched_tx_hash = Some(tx_hash.to_string());
                order.callback_acknowledged = false;
                order.updated_at = now;
            }
            _ => return Ok(PaidOutcome::NotAwaitingPayment),
        }
        for job in follow_ups {
            state.push_job(job, now);
        }
        Ok(PaidOutcome::Paid)
    }

    async fn mark_expired(&self, trade_id: &str) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state.orders.get_mut(trade_id) {
            Some(order) if order.status == OrderStatus::AwaitingPayment => {
                order.status = OrderStatus::Expired;
                order.updated_at = OffsetDateTime::now_utc();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn delete_order(&self, trade_id: &str) -> Result<(), StoreError> {
        self.state.lock().await.orders.remove(trade_id);
        Ok(())
    }

    async fn record_callback_attempt(
        &self,
        trade_id: &str,
        acknowledged: bool,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(order) = state.orders.get_mut(trade_id) {
            order.callback_delivery_count += 1;
            order.callback_acknowledged = acknowledged;
            order.updated_at = OffsetDateTime::now_utc();
        }
        Ok(())
    }
}

#[async_trait]
impl AddressPool for MemoryStore {
    async fn enabled_addresses(
        &self,
        chain: ChainType,
    ) -> Result<Vec<ReceivingAddress>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .addresses
            .iter()
            .filter(|a| a.chain_type == chain && a.enabled)
            .cloned()
            .collect())
    }

    async fn upsert_address(
        &self,
        address: &str,
        chain: ChainType,
        remark: &str,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        match state
            .addresses
            .iter_mut()
            .find(|a| a.address == address && a.chain_type == chain)
        {
            Some(existing) => existing.remark = remark.to_string(),
            None => state.addresses.push(ReceivingAddress {
                address: address.to_string(),
                chain_type: chain,
                remark: remark.to_string(),
                enabled: true,
                cached_balance: Decimal::ZERO,
                balance_updated_at: None,
            }),
        }
        Ok(())
    }

    async fn set_enabled(
        &self,
        address: &str,
        chain: ChainType,
        enabled: bool,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state
            .addresses
            .iter_mut()
            .find(|a| a.address == address && a.chain_type == chain)
        {
            Some(existing) => {
                existing.enabled = enabled;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_balance(
        &self,
        address: &str,
        chain: ChainType,
        balance: Decimal,
    ) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        match state
            .addresses
            .iter_mut()
            .find(|a| a.address == address && a.chain_type == chain)
        {
            Some(existing) => {
                existing.cached_balance = balance;
                existing.balance_updated_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for MemoryStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        let now = OffsetDateTime::now_utc();
        Ok(self.state.lock().await.push_job(job, now))
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        now: OffsetDateTime,
    ) -> Result<Option<QueueJob>, StoreError> {
        let mut state = self.state.lock().await;
        let Some(job) = state.jobs.values_mut().find(|job| {
            job.queue_name == queue_name
                && job.status == JobStatus::Pending
                && job.schedule_at <= now
        }) else {
            return Ok(None);
        };
        job.status = JobStatus::Processing;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(Some(job.clone()))
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.status = JobStatus::Completed;
        job.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn fail(&self, id: i64, backoff_unit: Duration) -> Result<JobStatus, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let job = state.jobs.get_mut(&id).ok_or(StoreError::NotFound)?;
        job.retry_count += 1;
        if job.retry_count >= job.max_retry {
            job.status = JobStatus::Failed;
        } else {
            job.status = JobStatus::Pending;
            job.schedule_at = now + backoff_unit * job.retry_count.unsigned_abs();
        }
        job.updated_at = now;
        Ok(job.status)
    }

    async fn get_job(&self, id: i64) -> Result<Option<QueueJob>, StoreError> {
        Ok(self.state.lock().await.jobs.get(&id).cloned())
    }

    async fn requeue_stale(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        let now = OffsetDateTime::now_utc();
        let mut state = self.state.lock().await;
        let mut requeued = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Processing && job.updated_at < older_than {
                job.status = JobStatus::Pending;
                job.updated_at = now;
                requeued += 1;
            }
        }
        Ok(requeued)
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let before = state.jobs.len();
        state
            .jobs
            .retain(|_, job| !(job.status.is_terminal() && job.updated_at < older_than));
        Ok((before - state.jobs.len()) as u64)
    }
}
