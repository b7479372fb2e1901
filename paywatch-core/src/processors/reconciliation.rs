//! Turns observed chain transfers into paid orders.
//!
//! One runner per chain wakes every `interval`, lists the chain's enabled
//! addresses, skips those without a live reservation and fetches the
//! trailing `lookback` window of incoming transfers for the rest, one task
//! per address. Each transfer is matched to a reservation by its normalized
//! amount and, if it belongs to a still-payable order created before the
//! transfer, marks that order paid.

use crate::amount::{ReservationKey, SettlementAmount};
use crate::chain::{ChainError, ChainRegistry, ChainService, Transfer};
use crate::config::{QUEUE_CRITICAL, QUEUE_LOW, ReconcileConfig};
use crate::entities::queue_jobs::NewJob;
use crate::notify::{NotificationSink, PaymentAlert};
use crate::store::{OrderRecord, PaidOutcome, PaymentStore, StoreError};
use crate::tasks::{
    BalanceRefreshPayload, CALLBACK_MAX_RETRY, TASK_BALANCE_REFRESH, TASK_ORDER_CALLBACK,
};
use paywatch_sdk::objects::ChainType;
use std::sync::Arc;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("chain error: {0}")]
    Chain(#[from] ChainError),
}

/// Why a transfer did or did not settle an order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferOutcome {
    Paid { trade_id: String },
    /// Not a credit to the monitored address.
    NotCredit,
    NoReservation,
    UnknownOrder,
    ChainMismatch,
    /// Mined before the order existed.
    BeforeOrderCreated,
    /// The hash already settled an order.
    AlreadyClaimed,
    NotAwaitingPayment,
}

/// Totals for one chain cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub addresses_scanned: usize,
    pub addresses_failed: usize,
    pub orders_paid: usize,
}

pub struct ReconciliationPipeline<S> {
    store: Arc<S>,
    registry: Arc<ChainRegistry>,
    notifier: Arc<dyn NotificationSink>,
    config: ReconcileConfig,
}

impl<S: PaymentStore> ReconciliationPipeline<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<ChainRegistry>,
        notifier: Arc<dyn NotificationSink>,
        config: ReconcileConfig,
    ) -> Self {
        Self {
            store,
            registry,
            notifier,
            config,
        }
    }

    /// One pass over every enabled address of `chain`.
    ///
    /// A failing address is logged and counted; the other addresses of the
    /// cycle still run.
    pub async fn run_cycle(self: &Arc<Self>, chain: ChainType) -> Result<CycleReport, ReconcileError> {
        let Some(service) = self.registry.get(chain) else {
            warn!(chain = %chain, "No chain service registered, skipping cycle");
            return Ok(CycleReport::default());
        };

        let mut report = CycleReport::default();
        let mut tasks = JoinSet::new();
        for address in self.store.enabled_addresses(chain).await? {
            let address = address.address;
            match self.store.has_live_reservation(&address, chain).await {
                Ok(false) => continue,
                Ok(true) => {}
                Err(e) => {
                    // Scan it anyway rather than miss a payment.
                    warn!(chain = %chain, address = %address, error = %e, "Reservation check failed");
                }
            }
            report.addresses_scanned += 1;
            let pipeline = self.clone();
            let service = service.clone();
            tasks.spawn(async move {
                let result = pipeline.reconcile_address(service.as_ref(), &address).await;
                (address, result)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(paid))) => report.orders_paid += paid,
                Ok((address, Err(e))) => {
                    report.addresses_failed += 1;
                    warn!(chain = %chain, address = %address, error = %e, "Address scan failed");
                }
                Err(e) => {
                    report.addresses_failed += 1;
                    error!(chain = %chain, error = %e, "Address scan task aborted");
                }
            }
        }

        debug!(
            chain = %chain,
            scanned = report.addresses_scanned,
            failed = report.addresses_failed,
            paid = report.orders_paid,
            "Reconciliation cycle finished"
        );
        Ok(report)
    }

    /// Fetch and process the lookback window for one address. Returns the
    /// number of orders it paid.
    async fn reconcile_address(
        &self,
        service: &dyn ChainService,
        address: &str,
    ) -> Result<usize, ReconcileError> {
        let chain = service.chain_type();
        let now = OffsetDateTime::now_utc();
        let end_ms = unix_millis(now);
        let start_ms = unix_millis(now - self.config.lookback);
        let transfers = service.get_transactions(address, start_ms, end_ms).await?;

        let mut paid = 0;
        for transfer in &transfers {
            match self.process_transfer(chain, address, transfer).await {
                Ok(TransferOutcome::Paid { .. }) => paid += 1,
                Ok(outcome) => {
                    debug!(chain = %chain, tx_hash = %transfer.hash, outcome = ?outcome, "Transfer skipped");
                }
                Err(e) => {
                    error!(
                        chain = %chain,
                        address = %address,
                        tx_hash = %transfer.hash,
                        error = %e,
                        "Failed to process transfer"
                    );
                }
            }
        }
        Ok(paid)
    }

    /// Match a single transfer against the reservations of `address`.
    pub async fn process_transfer(
        &self,
        chain: ChainType,
        address: &str,
        transfer: &Transfer,
    ) -> Result<TransferOutcome, ReconcileError> {
        if !transfer.to.eq_ignore_ascii_case(address) {
            return Ok(TransferOutcome::NotCredit);
        }

        let amount = SettlementAmount::normalize(transfer.amount);
        let key = ReservationKey::new(address, amount, chain);
        let Some(trade_id) = self.store.lookup(&key).await? else {
            return Ok(TransferOutcome::NoReservation);
        };
        let Some(order) = self.store.get_by_trade_id(&trade_id).await? else {
            warn!(key = %key, trade_id = %trade_id, "Reservation points at a missing order");
            return Ok(TransferOutcome::UnknownOrder);
        };
        if order.chain_type != chain {
            warn!(trade_id = %trade_id, expected = %order.chain_type, got = %chain, "Chain mismatch");
            return Ok(TransferOutcome::ChainMismatch);
        }
        if transfer.block_timestamp_ms < unix_millis(order.created_at) {
            return Ok(TransferOutcome::BeforeOrderCreated);
        }

        let follow_ups = follow_up_jobs(&order, address, chain);
        match self
            .store
            .mark_paid(&trade_id, &transfer.hash, follow_ups)
            .await?
        {
            PaidOutcome::Paid => {}
            PaidOutcome::AlreadyClaimed => return Ok(TransferOutcome::AlreadyClaimed),
            PaidOutcome::NotAwaitingPayment => return Ok(TransferOutcome::NotAwaitingPayment),
        }
        info!(
            chain = %chain,
            trade_id = %trade_id,
            amount = %amount,
            tx_hash = %transfer.hash,
            "Order paid"
        );

        // Only after the Paid transition committed.
        if let Err(e) = self.store.release(&key).await {
            warn!(trade_id = %trade_id, key = %key, error = %e, "Failed to release reservation");
        }
        self.alert_payment(&order, transfer, chain).await;

        Ok(TransferOutcome::Paid { trade_id })
    }

    async fn alert_payment(&self, order: &OrderRecord, transfer: &Transfer, chain: ChainType) {
        let text = PaymentAlert {
            order,
            tx_hash: &transfer.hash,
            token: transfer.token_symbol(chain),
            paid_at: OffsetDateTime::now_utc(),
        }
        .to_string();
        if let Err(e) = self.notifier.send_operator_alert(&text).await {
            warn!(trade_id = %order.trade_id, error = %e, "Failed to send payment alert");
        }
    }

    /// One runner per chain that has a service.
    pub fn spawn_runners(self: Arc<Self>, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        self.registry
            .chains()
            .into_iter()
            .map(|chain| {
                let pipeline = self.clone();
                tokio::spawn(pipeline.run(chain, shutdown_rx.clone()))
            })
            .collect()
    }

    async fn run(self: Arc<Self>, chain: ChainType, mut shutdown_rx: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(chain = %chain, interval = ?self.config.interval, "Reconciliation runner started");

        loop {
            tokio::select! {
                biased;

                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }

                _ = interval.tick() => {
                    if let Err(e) = self.run_cycle(chain).await {
                        warn!(chain = %chain, error = %e, "Reconciliation cycle skipped");
                    }
                }
            }
        }

        info!(chain = %chain, "Reconciliation runner shutdown complete");
    }
}

/// Jobs committed together with the Paid transition: the merchant callback
/// (when the order has one) and a balance refresh of the paid address.
fn follow_up_jobs(order: &OrderRecord, address: &str, chain: ChainType) -> Vec<NewJob> {
    let mut jobs = Vec::with_capacity(2);
    if order.has_callback() {
        jobs.push(
            NewJob::new(QUEUE_CRITICAL, TASK_ORDER_CALLBACK, order.trade_id.as_bytes())
                .max_retry(CALLBACK_MAX_RETRY),
        );
    }
    let payload = BalanceRefreshPayload {
        address: address.to_string(),
        chain,
    };
    match serde_json::to_vec(&payload) {
        Ok(bytes) => jobs.push(NewJob::new(QUEUE_LOW, TASK_BALANCE_REFRESH, bytes)),
        Err(e) => {
            error!(trade_id = %order.trade_id, address = %address, error = %e, "Failed to encode balance refresh");
        }
    }
    jobs
}

/// Milliseconds since the Unix epoch, saturating outside the `i64` range.
fn unix_millis(at: OffsetDateTime) -> i64 {
    let millis = at.unix_timestamp_nanos() / 1_000_000;
    i64::try_from(millis).unwrap_or(if millis < 0 { i64::MIN } else { i64::MAX })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::OrderStatus;
    use crate::store::memory::MemoryStore;
    use crate::store::{AddressPool, JobStore, LockStore, NewOrder, OrderStore};
    use crate::testing::{FlakyStore, RecordingSink, ScriptedChain};
    use rust_decimal::Decimal;
    use std::time::Duration;

    const ADDR_A: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";
    const ADDR_B: &str = "TJRabPrwbZy45sbavfcjinPJC18kjpRTv8";

    struct Fixture {
        store: Arc<MemoryStore>,
        chain: Arc<ScriptedChain>,
        sink: Arc<RecordingSink>,
        pipeline: Arc<ReconciliationPipeline<MemoryStore>>,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        for address in [ADDR_A, ADDR_B] {
            store
                .upsert_address(address, ChainType::Trc20, "")
                .await
                .unwrap();
        }
        let chain = Arc::new(ScriptedChain::new(ChainType::Trc20));
        let sink = Arc::new(RecordingSink::answering("ok"));
        let registry = Arc::new(ChainRegistry::new().with(chain.clone()));
        let pipeline = Arc::new(ReconciliationPipeline::new(
            store.clone(),
            registry,
            sink.clone(),
            ReconcileConfig::default(),
        ));
        Fixture {
            store,
            chain,
            sink,
            pipeline,
        }
    }

    async fn pending_order(
        store: &MemoryStore,
        trade_id: &str,
        address: &str,
        amount: Decimal,
        chain: ChainType,
    ) -> OrderRecord {
        let amount = SettlementAmount::normalize(amount);
        let order = store
            .insert_order(NewOrder {
                trade_id: trade_id.to_string(),
                external_order_id: format!("m-{trade_id}"),
                requested_fiat_amount: Decimal::from(100),
                settlement_amount: amount,
                receiving_address: address.to_string(),
                chain_type: chain,
                callback_url: Some("https://merchant.example/notify".to_string()),
                redirect_url: None,
            })
            .await
            .unwrap();
        store
            .reserve(
                &ReservationKey::new(address, amount, ChainType::Trc20),
                trade_id,
                Duration::from_secs(600),
            )
            .await
            .unwrap();
        order
    }

    fn transfer(hash: &str, to: &str, amount: Decimal, at: OffsetDateTime) -> Transfer {
        Transfer {
            hash: hash.to_string(),
            from: "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf".to_string(),
            to: to.to_string(),
            amount,
            block_timestamp_ms: unix_millis(at),
            confirmations: 20,
            status: "SUCCESS".to_string(),
            contract_address: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
        }
    }

    #[tokio::test]
    async fn test_matching_transfer_pays_order() {
        let f = fixture().await;
        let order = pending_order(&f.store, "t1", ADDR_A, Decimal::new(15625, 3), ChainType::Trc20).await;
        let later = order.created_at + Duration::from_secs(5);

        let outcome = f
            .pipeline
            .process_transfer(
                ChainType::Trc20,
                ADDR_A,
                &transfer("h1", ADDR_A, Decimal::new(15625, 3), later),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Paid { trade_id: "t1".to_string() });

        let paid = f.store.get_by_trade_id("t1").await.unwrap().unwrap();
        assert_eq!(paid.status, OrderStatus::Paid);
        assert_eq!(paid.matched_tx_hash.as_deref(), Some("h1"));
        assert!(!f.store.exists(&order.reservation_key()).await.unwrap());

        let jobs = f.store.jobs().await;
        let callback = jobs
            .iter()
            .find(|job| job.task_type == TASK_ORDER_CALLBACK)
            .unwrap();
        assert_eq!(callback.queue_name, QUEUE_CRITICAL);
        assert_eq!(callback.max_retry, CALLBACK_MAX_RETRY);
        assert!(jobs.iter().any(|job| job.task_type == TASK_BALANCE_REFRESH));
        let alerts = f.sink.alerts().await;
        assert_eq!(alerts.len(), 1);
        assert!(alerts[0].contains("Paid: 15.6250 USDT"));
    }

    #[tokio::test]
    async fn test_follow_up_jobs_commit_with_payment() {
        let store = Arc::new(FlakyStore::new());
        let sink = Arc::new(RecordingSink::answering("ok"));
        let pipeline = ReconciliationPipeline::new(
            store.clone(),
            Arc::new(ChainRegistry::new()),
            sink,
            ReconcileConfig::default(),
        );
        let order =
            pending_order(store.inner(), "t1", ADDR_A, Decimal::new(15625, 3), ChainType::Trc20).await;

        // Standalone enqueues are down; the payment must still carry its jobs.
        store.fail_enqueue(true);
        let outcome = pipeline
            .process_transfer(
                ChainType::Trc20,
                ADDR_A,
                &transfer("h1", ADDR_A, Decimal::new(15625, 3), order.created_at),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::Paid { trade_id: "t1".to_string() });

        let jobs = store.inner().jobs().await;
        assert_eq!(jobs.len(), 2);
        assert!(jobs.iter().any(|job| job.task_type == TASK_ORDER_CALLBACK));
        assert!(jobs.iter().any(|job| job.task_type == TASK_BALANCE_REFRESH));
    }

    #[test]
    fn test_unix_millis() {
        let at = OffsetDateTime::from_unix_timestamp(1_700_000_000).unwrap()
            + Duration::from_millis(123);
        assert_eq!(unix_millis(at), 1_700_000_000_123);
        let before_epoch = OffsetDateTime::from_unix_timestamp(-2).unwrap();
        assert_eq!(unix_millis(before_epoch), -2000);
    }

    #[tokio::test]
    async fn test_transfer_before_order_creation_is_ignored() {
        let f = fixture().await;
        let order = pending_order(&f.store, "t1", ADDR_A, Decimal::new(15625, 3), ChainType::Trc20).await;
        let earlier = order.created_at - Duration::from_secs(60);

        let outcome = f
            .pipeline
            .process_transfer(
                ChainType::Trc20,
                ADDR_A,
                &transfer("h1", ADDR_A, Decimal::new(15625, 3), earlier),
            )
            .await
            .unwrap();
        assert_eq!(outcome, TransferOutcome::BeforeOrderCreated);
        let order = f.store.get_by_trade_id("t1").await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::AwaitingPayment);
        assert!(f.store.exists(&order.reservation_key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_replayed_hash_pays_at_most_one_order() {
        let f = fixture().await;
        let first = pending_order(&f.store, "t1", ADDR_A, Decimal::new(15625, 3), ChainType::Trc20).await;
        pending_order(&f.store, "t2", ADDR_A, Decimal::new(156251, 4), ChainType::Trc20).await;
        let later = first.created_at + Duration::from_secs(5);

        let hit = transfer("h1", ADDR_A, Decimal::new(15625, 3), later);
        assert!(matches!(
            f.pipeline.process_transfer(ChainType::Trc20, ADDR_A, &hit).await.unwrap(),
            TransferOutcome::Paid { .. }
        ));
        assert_eq!(
            f.pipeline.process_transfer(ChainType::Trc20, ADDR_A, &hit).await.unwrap(),
            TransferOutcome::NoReservation
        );

        // Same hash, amount of the other order.
        let forged = transfer("h1", ADDR_A, Decimal::new(156251, 4), later);
        assert_eq!(
            f.pipeline.process_transfer(ChainType::Trc20, ADDR_A, &forged).await.unwrap(),
            TransferOutcome::AlreadyClaimed
        );
        let second = f.store.get_by_trade_id("t2").await.unwrap().unwrap();
        assert_eq!(second.status, OrderStatus::AwaitingPayment);
    }

    #[tokio::test]
    async fn test_chain_mismatch_and_non_credit() {
        let f = fixture().await;
        let order = pending_order(&f.store, "t1", ADDR_A, Decimal::new(15625, 3), ChainType::Erc20).await;
        let later = order.created_at + Duration::from_secs(5);

        assert_eq!(
            f.pipeline
                .process_transfer(
                    ChainType::Trc20,
                    ADDR_A,
                    &transfer("h1", ADDR_A, Decimal::new(15625, 3), later),
                )
                .await
                .unwrap(),
            TransferOutcome::ChainMismatch
        );
        assert_eq!(
            f.pipeline
                .process_transfer(
                    ChainType::Trc20,
                    ADDR_A,
                    &transfer("h2", ADDR_B, Decimal::new(15625, 3), later),
                )
                .await
                .unwrap(),
            TransferOutcome::NotCredit
        );
    }

    #[tokio::test]
    async fn test_cycle_isolates_failing_address_and_skips_idle_ones() {
        let f = fixture().await;
        let a = pending_order(&f.store, "t1", ADDR_A, Decimal::new(15625, 3), ChainType::Trc20).await;
        pending_order(&f.store, "t2", ADDR_B, Decimal::new(15625, 3), ChainType::Trc20).await;
        f.chain
            .push(transfer("h1", ADDR_A, Decimal::new(156250, 4), a.created_at))
            .await;
        f.chain.fail_for(ADDR_B).await;

        let report = f.pipeline.run_cycle(ChainType::Trc20).await.unwrap();
        assert_eq!(
            report,
            CycleReport {
                addresses_scanned: 2,
                addresses_failed: 1,
                orders_paid: 1,
            }
        );

        // ADDR_A no longer holds a reservation and is not queried again.
        let calls = f.chain.calls();
        let report = f.pipeline.run_cycle(ChainType::Trc20).await.unwrap();
        assert_eq!(report.addresses_scanned, 1);
        assert_eq!(f.chain.calls(), calls + 1);
    }

    #[tokio::test]
    async fn test_chain_without_service_is_skipped() {
        let f = fixture().await;
        let report = f.pipeline.run_cycle(ChainType::Solana).await.unwrap();
        assert_eq!(report, CycleReport::default());
    }

    #[tokio::test]
    async fn test_runner_stops_on_shutdown() {
        let f = fixture().await;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let runners = f.pipeline.clone().spawn_runners(shutdown_rx);
        assert_eq!(runners.len(), 1);
        tokio::time::sleep(Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        for runner in runners {
            runner.await.unwrap();
        }
        // Nothing is reserved, so no address was ever queried.
        assert_eq!(f.chain.calls(), 0);
    }
}
