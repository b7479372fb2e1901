//! Paywatch server
//!
//! Watches receiving addresses for stablecoin transfers and settles
//! merchant orders by their unique payment amount.

mod api;
mod config;
mod server;
mod shutdown;
mod state;

use clap::Parser;
use config::{ConfigLoader, get_database_url};
use paywatch_core::allocator::AmountAllocator;
use paywatch_core::chain::ChainRegistry;
use paywatch_core::config::SeedAddress;
use paywatch_core::notify::{HttpNotificationSink, NotificationSink};
use paywatch_core::orders::OrderService;
use paywatch_core::processors::{MaintenanceRunner, ReconciliationPipeline};
use paywatch_core::queue::JobQueue;
use paywatch_core::store::AddressPool;
use paywatch_core::store::postgres::PgStore;
use paywatch_core::tasks::default_handlers;
use server::{build_router, run_server};
use shutdown::shutdown_signal;
use sqlx::postgres::PgPoolOptions;
use state::AppState;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

/// Paywatch - stablecoin payment reconciliation service
#[derive(Parser, Debug)]
#[command(name = "paywatch-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env = "PAYWATCH_CONFIG", default_value = "./paywatch.toml")]
    config: PathBuf,

    /// Override the listen address (e.g., 0.0.0.0:3000)
    #[arg(short, long)]
    listen: Option<SocketAddr>,

    /// Run database migrations on startup
    #[arg(long, default_value = "false")]
    migrate: bool,

    /// Emit logs as JSON lines
    #[arg(long, default_value = "false")]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    tracing::info!("Starting paywatch-server v{}", env!("CARGO_PKG_VERSION"));

    let loaded = ConfigLoader::new(&args.config, args.listen)
        .load()
        .inspect_err(|e| tracing::error!("Failed to load configuration: {}", e))?;
    tracing::info!("Configuration loaded from {:?}", args.config);
    let listen_addr = loaded.listen;
    let core = loaded.core;

    let database_url = get_database_url()
        .inspect_err(|_| tracing::error!("DATABASE_URL environment variable not set"))?;

    tracing::info!("Connecting to database...");
    let db_pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .inspect_err(|e| tracing::error!("Failed to connect to database: {}", e))?;
    tracing::info!("Database connection established");

    if args.migrate {
        tracing::info!("Running database migrations...");
        sqlx::migrate!("../migrations")
            .run(&db_pool)
            .await
            .inspect_err(|e| tracing::error!("Failed to run migrations: {}", e))?;
        tracing::info!("Migrations completed successfully");
    }

    let store = Arc::new(PgStore::new(db_pool.clone()));
    let registry = Arc::new(ChainRegistry::from_api_keys(&core.api_keys)?);
    tracing::info!(chains = ?registry, "Chain services ready");
    seed_addresses(&store, &registry, &core.addresses).await?;

    let notifier: Arc<dyn NotificationSink> =
        Arc::new(HttpNotificationSink::new(core.notify.telegram.clone()));
    let api_token: Arc<[u8]> = Arc::from(core.notify.api_token.as_bytes());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut workers = Vec::new();

    let (allocator, allocator_task) =
        AmountAllocator::new(store.clone(), core.payment.clone()).spawn(shutdown_rx.clone());
    workers.push(allocator_task);

    let orders = Arc::new(
        OrderService::new(store.clone(), allocator, core.payment.clone())
            .with_job_retry(core.queue.default_max_retry),
    );

    let handlers = default_handlers(
        orders.clone(),
        store.clone(),
        registry.clone(),
        notifier.clone(),
        api_token,
    );
    let queue = Arc::new(
        JobQueue::new(store.clone(), handlers, core.queue.clone()).with_alerts(notifier.clone()),
    );
    workers.extend(queue.spawn_workers(shutdown_rx.clone()));

    let pipeline = Arc::new(ReconciliationPipeline::new(
        store.clone(),
        registry.clone(),
        notifier,
        core.reconcile.clone(),
    ));
    workers.extend(pipeline.spawn_runners(shutdown_rx.clone()));

    let maintenance =
        MaintenanceRunner::new(store.clone(), core.maintenance.clone(), core.queue.clone());
    workers.push(tokio::spawn(maintenance.run(shutdown_rx)));
    tracing::info!(workers = workers.len(), "Background workers started");

    let state = AppState::new(orders, registry, &core.notify.api_token);
    let router = build_router(state);

    tracing::info!("Starting HTTP server on {}", listen_addr);
    let result = run_server(router, listen_addr, shutdown_signal(shutdown_tx.clone())).await;

    // The server may also stop on its own (e.g. bind failure).
    shutdown_tx.send_replace(true);
    for worker in workers {
        if let Err(e) = worker.await {
            tracing::error!(error = %e, "Background worker panicked");
        }
    }

    tracing::info!("Closing database connections...");
    db_pool.close().await;
    tracing::info!("Server shutdown complete");

    result.map_err(Into::into)
}

/// Upsert the configured receiving addresses, skipping malformed ones.
/// An explicit `enabled` flag is applied after the upsert.
async fn seed_addresses(
    store: &PgStore,
    registry: &ChainRegistry,
    seeds: &[SeedAddress],
) -> anyhow::Result<()> {
    for seed in seeds {
        if !registry.validate_address(seed.chain, &seed.address) {
            tracing::warn!(chain = %seed.chain, address = %seed.address, "Skipping malformed receiving address");
            continue;
        }
        store
            .upsert_address(&seed.address, seed.chain, &seed.remark)
            .await?;
        if let Some(enabled) = seed.enabled {
            store.set_enabled(&seed.address, seed.chain, enabled).await?;
            if !enabled {
                tracing::info!(chain = %seed.chain, address = %seed.address, "Receiving address disabled");
            }
        }
    }
    tracing::info!(count = seeds.len(), "Receiving addresses seeded");
    Ok(())
}

/// Initialize the tracing subscriber with environment-based filtering.
fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,sqlx=warn"));

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}
