//! In-process doubles for the chain, notification and storage seams.
//!
//! Paired with [`crate::store::memory::MemoryStore`] they let the whole
//! payment flow run without network or database access.

use crate::amount::ReservationKey;
use crate::chain::{ChainError, ChainService, TokenBalance, Transfer};
use crate::entities::JobStatus;
use crate::entities::queue_jobs::{NewJob, QueueJob};
use crate::entities::receiving_address::ReceivingAddress;
use crate::notify::{NotificationSink, NotifyError, WebhookResponse};
use crate::store::memory::MemoryStore;
use crate::store::{
    AddressPool, JobStore, LockStore, NewOrder, OrderRecord, OrderStore, PaidOutcome, StoreError,
};
use async_trait::async_trait;
use paywatch_sdk::objects::{ChainType, OrderNotifyPayload};
use paywatch_sdk::signature::SignedObject;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::Mutex;

/// Serves transfers pushed by the test, per address.
pub struct ScriptedChain {
    chain: ChainType,
    transfers: Mutex<HashMap<String, Vec<Transfer>>>,
    failing: Mutex<Vec<String>>,
    balance: Mutex<TokenBalance>,
    calls: AtomicUsize,
}

impl ScriptedChain {
    pub fn new(chain: ChainType) -> Self {
        Self {
            chain,
            transfers: Mutex::new(HashMap::new()),
            failing: Mutex::new(Vec::new()),
            balance: Mutex::new(TokenBalance::default()),
            calls: AtomicUsize::new(0),
        }
    }

    pub async fn push(&self, transfer: Transfer) {
        self.transfers
            .lock()
            .await
            .entry(transfer.to.clone())
            .or_default()
            .push(transfer);
    }

    /// Make every query for `address` fail with an API error.
    pub async fn fail_for(&self, address: &str) {
        self.failing.lock().await.push(address.to_string());
    }

    pub async fn set_balance(&self, balance: TokenBalance) {
        *self.balance.lock().await = balance;
    }

    /// How many `get_transactions` calls were made.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChainService for ScriptedChain {
    fn chain_type(&self) -> ChainType {
        self.chain
    }

    fn validate_address(&self, address: &str) -> bool {
        !address.trim().is_empty()
    }

    async fn get_transactions(
        &self,
        address: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Transfer>, ChainError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.lock().await.iter().any(|a| a == address) {
            return Err(ChainError::Api {
                message: format!("scripted failure for {address}"),
            });
        }
        Ok(self
            .transfers
            .lock()
            .await
            .get(address)
            .map(|transfers| {
                transfers
                    .iter()
                    .filter(|t| t.block_timestamp_ms >= start_ms && t.block_timestamp_ms <= end_ms)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_token_balance(&self, _address: &str) -> Result<TokenBalance, ChainError> {
        Ok(*self.balance.lock().await)
    }
}

/// Records webhooks and alerts, answering every webhook with a fixed body.
pub struct RecordingSink {
    answer: Mutex<String>,
    webhooks: Mutex<Vec<(String, SignedObject<OrderNotifyPayload>)>>,
    alerts: Mutex<Vec<String>>,
}

impl RecordingSink {
    pub fn answering(body: &str) -> Self {
        Self {
            answer: Mutex::new(body.to_string()),
            webhooks: Mutex::new(Vec::new()),
            alerts: Mutex::new(Vec::new()),
        }
    }

    pub async fn set_answer(&self, body: &str) {
        *self.answer.lock().await = body.to_string();
    }

    pub async fn webhooks(&self) -> Vec<(String, SignedObject<OrderNotifyPayload>)> {
        self.webhooks.lock().await.clone()
    }

    pub async fn alerts(&self) -> Vec<String> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn deliver_webhook(
        &self,
        url: &str,
        payload: &SignedObject<OrderNotifyPayload>,
    ) -> Result<WebhookResponse, NotifyError> {
        self.webhooks
            .lock()
            .await
            .push((url.to_string(), payload.clone()));
        Ok(WebhookResponse {
            status: 200,
            body: self.answer.lock().await.clone(),
        })
    }

    async fn send_operator_alert(&self, text: &str) -> Result<(), NotifyError> {
        self.alerts.lock().await.push(text.to_string());
        Ok(())
    }
}

/// A [`MemoryStore`] whose `release` and `enqueue` can be switched to fail,
/// as a database outage would make them.
#[derive(Debug, Default)]
pub struct FlakyStore {
    inner: MemoryStore,
    fail_release: AtomicBool,
    fail_enqueue: AtomicBool,
}

impl FlakyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inner(&self) -> &MemoryStore {
        &self.inner
    }

    pub fn fail_release(&self, fail: bool) {
        self.fail_release.store(fail, Ordering::SeqCst);
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail_enqueue.store(fail, Ordering::SeqCst);
    }

    fn outage() -> StoreError {
        StoreError::Database(sqlx::Error::PoolTimedOut)
    }
}

#[async_trait]
impl LockStore for FlakyStore {
    async fn reserve(
        &self,
        key: &ReservationKey,
        trade_id: &str,
        ttl: Duration,
    ) -> Result<(), StoreError> {
        self.inner.reserve(key, trade_id, ttl).await
    }

    async fn release(&self, key: &ReservationKey) -> Result<(), StoreError> {
        if self.fail_release.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.release(key).await
    }

    async fn lookup(&self, key: &ReservationKey) -> Result<Option<String>, StoreError> {
        self.inner.lookup(key).await
    }

    async fn has_live_reservation(
        &self,
        address: &str,
        chain: ChainType,
    ) -> Result<bool, StoreError> {
        self.inner.has_live_reservation(address, chain).await
    }

    async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.inner.purge_expired().await
    }
}

#[async_trait]
impl OrderStore for FlakyStore {
    async fn insert_order(&self, order: NewOrder) -> Result<OrderRecord, StoreError> {
        self.inner.insert_order(order).await
    }

    async fn get_by_trade_id(&self, trade_id: &str) -> Result<Option<OrderRecord>, StoreError> {
        self.inner.get_by_trade_id(trade_id).await
    }

    async fn get_by_external_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<OrderRecord>, StoreError> {
        self.inner.get_by_external_id(external_order_id).await
    }

    async fn mark_paid(
        &self,
        trade_id: &str,
        tx_hash: &str,
        follow_ups: Vec<NewJob>,
    ) -> Result<PaidOutcome, StoreError> {
        self.inner.mark_paid(trade_id, tx_hash, follow_ups).await
    }

    async fn mark_expired(&self, trade_id: &str) -> Result<bool, StoreError> {
        self.inner.mark_expired(trade_id).await
    }

    async fn delete_order(&self, trade_id: &str) -> Result<(), StoreError> {
        self.inner.delete_order(trade_id).await
    }

    async fn record_callback_attempt(
        &self,
        trade_id: &str,
        acknowledged: bool,
    ) -> Result<(), StoreError> {
        self.inner.record_callback_attempt(trade_id, acknowledged).await
    }
}

#[async_trait]
impl AddressPool for FlakyStore {
    async fn enabled_addresses(
        &self,
        chain: ChainType,
    ) -> Result<Vec<ReceivingAddress>, StoreError> {
        self.inner.enabled_addresses(chain).await
    }

    async fn upsert_address(
        &self,
        address: &str,
        chain: ChainType,
        remark: &str,
    ) -> Result<(), StoreError> {
        self.inner.upsert_address(address, chain, remark).await
    }

    async fn set_enabled(
        &self,
        address: &str,
        chain: ChainType,
        enabled: bool,
    ) -> Result<bool, StoreError> {
        self.inner.set_enabled(address, chain, enabled).await
    }

    async fn update_balance(
        &self,
        address: &str,
        chain: ChainType,
        balance: Decimal,
    ) -> Result<bool, StoreError> {
        self.inner.update_balance(address, chain, balance).await
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn enqueue(&self, job: NewJob) -> Result<i64, StoreError> {
        if self.fail_enqueue.load(Ordering::SeqCst) {
            return Err(Self::outage());
        }
        self.inner.enqueue(job).await
    }

    async fn claim_next(
        &self,
        queue_name: &str,
        now: OffsetDateTime,
    ) -> Result<Option<QueueJob>, StoreError> {
        self.inner.claim_next(queue_name, now).await
    }

    async fn complete(&self, id: i64) -> Result<(), StoreError> {
        self.inner.complete(id).await
    }

    async fn fail(&self, id: i64, backoff_unit: Duration) -> Result<JobStatus, StoreError> {
        self.inner.fail(id, backoff_unit).await
    }

    async fn get_job(&self, id: i64) -> Result<Option<QueueJob>, StoreError> {
        self.inner.get_job(id).await
    }

    async fn requeue_stale(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        self.inner.requeue_stale(older_than).await
    }

    async fn purge_finished(&self, older_than: OffsetDateTime) -> Result<u64, StoreError> {
        self.inner.purge_finished(older_than).await
    }
}
