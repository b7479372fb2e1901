use paywatch_core::allocator::AmountAllocator;
use paywatch_core::amount::ReservationKey;
use paywatch_core::chain::{ChainRegistry, Transfer};
use paywatch_core::config::{PaymentConfig, QueueConfig, ReconcileConfig};
use paywatch_core::entities::{JobStatus, OrderStatus};
use paywatch_core::orders::{CreateOrder, OrderService};
use paywatch_core::processors::{ReconciliationPipeline, TransferOutcome};
use paywatch_core::queue::{JobOutcome, JobQueue};
use paywatch_core::store::memory::MemoryStore;
use paywatch_core::store::{AddressPool, LockStore, OrderStore};
use paywatch_core::tasks::{TASK_ORDER_CALLBACK, TASK_ORDER_EXPIRATION_CALLBACK, default_handlers};
use paywatch_core::testing::{RecordingSink, ScriptedChain};
use paywatch_sdk::objects::{ChainType, OrderStatus as SdkOrderStatus};
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

const ADDRESS: &str = "TQn9Y2khEsLJW1ChVWFMSMeRDow5KcbLSE";
const API_TOKEN: &[u8] = b"merchant-secret";

struct Harness {
    store: Arc<MemoryStore>,
    chain: Arc<ScriptedChain>,
    sink: Arc<RecordingSink>,
    orders: Arc<OrderService<MemoryStore>>,
    pipeline: Arc<ReconciliationPipeline<MemoryStore>>,
    queue: JobQueue<MemoryStore>,
    _shutdown: watch::Sender<bool>,
}

async fn harness(window: Duration) -> Harness {
    let store = Arc::new(MemoryStore::new());
    store
        .upsert_address(ADDRESS, ChainType::Trc20, "main")
        .await
        .unwrap();

    let payment = PaymentConfig {
        window,
        ..PaymentConfig::default()
    };
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (allocator, _) = AmountAllocator::new(store.clone(), payment.clone()).spawn(shutdown_rx);
    let orders = Arc::new(OrderService::new(store.clone(), allocator, payment));

    let chain = Arc::new(ScriptedChain::new(ChainType::Trc20));
    let registry = Arc::new(ChainRegistry::new().with(chain.clone()));
    let sink = Arc::new(RecordingSink::answering("ok"));
    let pipeline = Arc::new(ReconciliationPipeline::new(
        store.clone(),
        registry.clone(),
        sink.clone(),
        ReconcileConfig::default(),
    ));
    let handlers = default_handlers(
        orders.clone(),
        store.clone(),
        registry,
        sink.clone(),
        Arc::from(API_TOKEN),
    );
    let queue = JobQueue::new(
        store.clone(),
        handlers,
        QueueConfig {
            backoff_unit: Duration::ZERO,
            ..QueueConfig::default()
        },
    );

    Harness {
        store,
        chain,
        sink,
        orders,
        pipeline,
        queue,
        _shutdown: shutdown_tx,
    }
}

fn create(external: &str) -> CreateOrder {
    CreateOrder {
        external_order_id: external.to_string(),
        fiat_amount: Decimal::from(100),
        chain: ChainType::Trc20,
        callback_url: Some("https://merchant.example/notify".to_string()),
        redirect_url: Some("https://merchant.example/done".to_string()),
    }
}

async fn drain(queue: &JobQueue<MemoryStore>, name: &str) -> Vec<JobOutcome> {
    let mut outcomes = Vec::new();
    while let Some(outcome) = queue.poll_once(name).await.unwrap() {
        outcomes.push(outcome);
    }
    outcomes
}

#[tokio::test]
async fn test_order_is_paid_once_and_merchant_notified() {
    let h = harness(Duration::from_secs(600)).await;
    let order = h.orders.create_order(create("merchant-1")).await.unwrap();
    assert_eq!(order.settlement().to_string(), "15.6250");
    assert_eq!(order.receiving_address, ADDRESS);

    let transfer = Transfer {
        hash: "4f1c0e".to_string(),
        from: "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf".to_string(),
        to: ADDRESS.to_string(),
        amount: Decimal::new(1562500, 5),
        block_timestamp_ms: i64::try_from(order.created_at.unix_timestamp_nanos() / 1_000_000).unwrap(),
        confirmations: 19,
        status: "SUCCESS".to_string(),
        contract_address: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
    };
    h.chain.push(transfer.clone()).await;

    let report = h.pipeline.run_cycle(ChainType::Trc20).await.unwrap();
    assert_eq!(report.orders_paid, 1);

    let paid = h.orders.get_order(&order.trade_id).await.unwrap().unwrap();
    assert_eq!(paid.status, OrderStatus::Paid);
    assert_eq!(paid.matched_tx_hash.as_deref(), Some("4f1c0e"));
    let key = ReservationKey::new(ADDRESS, order.settlement(), ChainType::Trc20);
    assert!(!h.store.exists(&key).await.unwrap());

    // The same transfer again, directly and through a new cycle.
    h.chain.push(transfer.clone()).await;
    let report = h.pipeline.run_cycle(ChainType::Trc20).await.unwrap();
    assert_eq!(report.orders_paid, 0);
    assert_eq!(
        h.pipeline
            .process_transfer(ChainType::Trc20, ADDRESS, &transfer)
            .await
            .unwrap(),
        TransferOutcome::NoReservation
    );

    let outcomes = drain(&h.queue, "critical").await;
    assert_eq!(outcomes.len(), 1);
    assert!(matches!(outcomes[0], JobOutcome::Completed { .. }));

    let webhooks = h.sink.webhooks().await;
    assert_eq!(webhooks.len(), 1);
    let payload = webhooks[0].1.clone().verify(API_TOKEN).unwrap();
    assert_eq!(payload.trade_id, order.trade_id);
    assert_eq!(payload.order_id, "merchant-1");
    assert_eq!(payload.status, SdkOrderStatus::Paid);
    assert_eq!(payload.actual_amount.to_string(), "15.6250");

    let notified = h.store.get_by_trade_id(&order.trade_id).await.unwrap().unwrap();
    assert!(notified.callback_acknowledged);
    assert_eq!(notified.callback_delivery_count, 1);

    assert_eq!(drain(&h.queue, "low").await.len(), 1);
    assert_eq!(h.sink.alerts().await.len(), 1);
}

#[tokio::test]
async fn test_unacknowledged_callback_is_retried_until_exhausted() {
    let h = harness(Duration::from_secs(600)).await;
    h.sink.set_answer("received").await;
    let order = h.orders.create_order(create("merchant-1")).await.unwrap();
    h.chain
        .push(Transfer {
            hash: "9a9a".to_string(),
            from: "TXYZopYRdj2D9XRtbG411XZZ3kM5VkAeBf".to_string(),
            to: ADDRESS.to_string(),
            amount: order.settlement().value(),
            block_timestamp_ms: i64::try_from(order.created_at.unix_timestamp_nanos() / 1_000_000).unwrap(),
            confirmations: 1,
            status: "SUCCESS".to_string(),
            contract_address: "TR7NHqjeKQxGTCi8q8ZY4pL8otSzgjLj6t".to_string(),
        })
        .await;
    h.pipeline.run_cycle(ChainType::Trc20).await.unwrap();

    let outcomes = drain(&h.queue, "critical").await;
    assert_eq!(outcomes.len(), 5);
    assert!(matches!(outcomes[4], JobOutcome::Failed { .. }));
    assert_eq!(h.sink.webhooks().await.len(), 5);

    let job = h
        .store
        .jobs()
        .await
        .into_iter()
        .find(|job| job.task_type == TASK_ORDER_CALLBACK)
        .unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    let order = h.store.get_by_trade_id(&order.trade_id).await.unwrap().unwrap();
    assert_eq!(order.callback_delivery_count, 5);
    assert!(!order.callback_acknowledged);
}

#[tokio::test]
async fn test_unpaid_order_expires_once_and_frees_its_slot() {
    let h = harness(Duration::from_millis(200)).await;
    let order = h.orders.create_order(create("merchant-1")).await.unwrap();

    // The expiration job is not due yet.
    assert!(drain(&h.queue, "default").await.is_empty());
    tokio::time::sleep(Duration::from_millis(300)).await;

    let outcomes = drain(&h.queue, "default").await;
    assert_eq!(outcomes.len(), 1);
    let expired = h.store.get_by_trade_id(&order.trade_id).await.unwrap().unwrap();
    assert_eq!(expired.status, OrderStatus::Expired);
    assert!(!h.orders.expire_order(&order.trade_id).await.unwrap());

    let callbacks = drain(&h.queue, "critical").await;
    assert_eq!(callbacks.len(), 1);
    let webhooks = h.sink.webhooks().await;
    assert_eq!(webhooks.len(), 1);
    assert_eq!(
        webhooks[0].1.clone().verify(API_TOKEN).unwrap().status,
        SdkOrderStatus::Expired
    );
    assert!(
        h.store
            .jobs()
            .await
            .iter()
            .any(|job| job.task_type == TASK_ORDER_EXPIRATION_CALLBACK
                && job.status == JobStatus::Completed)
    );

    let next = h.orders.create_order(create("merchant-2")).await.unwrap();
    assert_eq!(next.settlement(), order.settlement());
}
