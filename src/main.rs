//! Transfer Engine
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────┐    ┌──────────┐
//! │ Transfer │───▶│  Ledger  │───▶│  Outbox  │───▶│ Consumer │
//! │  (lock)  │    │(+outbox) │    │Publisher │    │ (dedup)  │
//! └──────────┘    └──────────┘    └──────────┘    └──────────┘
//! ```
//!
//! With `postgres_url` configured the ledger and reporting stores live in
//! PostgreSQL and the engine runs until Ctrl-C. `--demo` (or no database)
//! runs one scripted transfer against in-memory stores.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use rust_decimal::Decimal;
use tokio::task::JoinHandle;

use transfer_engine::broker::{EventBroker, InMemoryBroker};
use transfer_engine::config::AppConfig;
use transfer_engine::consumer::{
    BrokerDeadLetterSink, ConsumerSettings, ConsumerStats, EventConsumer, InMemoryReportingStore,
    LogNotifier, PgReportingStore, REPORTING_SCHEMA, ReportingStore, TransactionProcessor,
};
use transfer_engine::db::Database;
use transfer_engine::ledger::schema::LEDGER_SCHEMA;
use transfer_engine::ledger::{
    AccountType, Currency, CustomerIdentity, InMemoryLedgerStore, LedgerStore, PgLedgerStore,
    VipTier,
};
use transfer_engine::logging::init_logging;
use transfer_engine::outbox::OutboxPublisher;
use transfer_engine::signal::Signal;
use transfer_engine::transfer::{TransferCoordinator, TransferOutcome, TransferRequest};

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn use_demo_mode() -> bool {
    std::env::args().any(|a| a == "--demo")
}

/// Background tasks sharing one shutdown signal
struct Workers {
    shutdown: Signal,
    handles: Vec<JoinHandle<()>>,
    consumer_stats: Vec<Arc<ConsumerStats>>,
}

impl Workers {
    fn start(
        config: &AppConfig,
        store: Arc<dyn LedgerStore>,
        broker: Arc<dyn EventBroker>,
        reporting: Arc<dyn ReportingStore>,
        coordinator: &TransferCoordinator,
    ) -> Self {
        let shutdown = Signal::new();
        let mut handles = Vec::new();
        let mut consumer_stats = Vec::new();

        let publisher = OutboxPublisher::new(
            store,
            broker.clone(),
            config.outbox.clone(),
            coordinator.outbox_notify(),
        );
        handles.push(tokio::spawn(publisher.run(shutdown.clone())));

        let processor = Arc::new(TransactionProcessor::new(
            reporting,
            Arc::new(LogNotifier),
            config.consumer.high_value_threshold,
        ));
        let dead_letters = Arc::new(BrokerDeadLetterSink::new(
            broker.clone(),
            &config.consumer.dead_letter_topic,
        ));
        for topic in &config.consumer.topics {
            let consumer = EventConsumer::new(
                broker.clone(),
                processor.clone(),
                dead_letters.clone(),
                ConsumerSettings::from_config(&config.consumer, topic),
            );
            consumer_stats.push(consumer.stats());
            handles.push(tokio::spawn(consumer.run(shutdown.clone())));
        }

        Self {
            shutdown,
            handles,
            consumer_stats,
        }
    }

    fn processed(&self) -> u64 {
        self.consumer_stats
            .iter()
            .map(|s| s.processed() + s.duplicates() + s.dead_lettered())
            .sum()
    }

    async fn stop(self) {
        self.shutdown.trigger();
        for result in futures::future::join_all(self.handles).await {
            if let Err(e) = result {
                tracing::error!(error = %e, "Background task panicked");
            }
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load(&env).unwrap_or_else(|e| {
        eprintln!("{e}; using built-in defaults");
        AppConfig::default()
    });
    let _log_guard = init_logging(&app_config);

    tracing::info!(
        git_hash = env!("GIT_HASH"),
        "Starting transfer engine in {} mode",
        env
    );

    match app_config.postgres_url.clone() {
        Some(url) if !use_demo_mode() => run_postgres(&app_config, &url).await,
        _ => run_demo(&app_config).await,
    }
}

async fn run_postgres(config: &AppConfig, url: &str) -> anyhow::Result<()> {
    let db = Database::connect(
        url,
        config.db_max_connections,
        Duration::from_millis(config.db_acquire_timeout_ms),
    )
    .await
    .context("connecting to PostgreSQL")?;
    db.init_schema(LEDGER_SCHEMA).await.context("ledger schema")?;
    db.init_schema(REPORTING_SCHEMA)
        .await
        .context("reporting schema")?;
    db.health_check().await.context("database health check")?;

    let store: Arc<dyn LedgerStore> = Arc::new(PgLedgerStore::new(
        db.pool().clone(),
        Duration::from_millis(config.transfer.lock_timeout_ms),
    ));
    let broker: Arc<dyn EventBroker> = Arc::new(InMemoryBroker::new());
    let reporting = Arc::new(PgReportingStore::new(db.pool().clone()));
    let coordinator =
        TransferCoordinator::new(store.clone(), config.transfer.clone(), &config.outbox);

    let workers = Workers::start(config, store, broker, reporting, &coordinator);
    tracing::info!("Transfer engine running; press Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("waiting for Ctrl-C")?;
    tracing::info!("Shutdown requested");
    workers.stop().await;
    Ok(())
}

async fn run_demo(config: &AppConfig) -> anyhow::Result<()> {
    println!("=== Transfer Engine: in-memory demo ===");

    let store = InMemoryLedgerStore::new();
    let ils = Currency::new("ILS")?;
    let david = store.create_customer(
        "David Levi",
        CustomerIdentity::Individual {
            personal_id: "203948293".into(),
        },
        None,
    )?;
    let techno = store.create_customer(
        "TechnoCorp Ltd.",
        CustomerIdentity::Business {
            business_number: "514857392".into(),
        },
        Some(VipTier::Platinum),
    )?;
    store.open_account(david.id, "ACC-1001", ils.clone(), Decimal::new(1_500_00, 2))?;
    store.open_account(techno.id, "ACC-2002", ils, Decimal::new(8_000_00, 2))?;
    store.set_account_type("ACC-2002", AccountType::Business);

    let broker = InMemoryBroker::new();
    let reporting = Arc::new(InMemoryReportingStore::new());
    let coordinator = TransferCoordinator::new(
        Arc::new(store.clone()),
        config.transfer.clone(),
        &config.outbox,
    );
    let workers = Workers::start(
        config,
        Arc::new(store.clone()),
        Arc::new(broker.clone()),
        reporting.clone(),
        &coordinator,
    );

    let requests = [
        TransferRequest::new("ACC-1001", "ACC-2002", Decimal::new(300_00, 2), "ILS")
            .with_description("Invoice 2024-117"),
        TransferRequest::new("ACC-1001", "ACC-2002", Decimal::new(5_000_00, 2), "ILS"),
        TransferRequest::new("ACC-1001", "ACC-1001", Decimal::new(10_00, 2), "ILS"),
    ];
    for req in requests {
        let result = coordinator.transfer(req.clone()).await;
        match &result {
            Ok(r) => println!(
                "{} -> {} {}: {} (tx {}, balances {} / {})",
                req.from_account,
                req.to_account,
                req.amount,
                r.status,
                r.transaction_id,
                r.from_balance_after,
                r.to_balance_after
            ),
            Err(e) => println!(
                "{} -> {} {}: {:?} [{}] {}",
                req.from_account,
                req.to_account,
                req.amount,
                TransferOutcome::of(&result),
                e.code(),
                e
            ),
        }
    }

    // completed transfers and post-lock rejections both staged an event
    let expected_events = store.outbox().len() as u64;
    let delivered = tokio::time::timeout(Duration::from_secs(5), async {
        while workers.processed() < expected_events {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await;
    if delivered.is_err() {
        println!("Timed out waiting for the consumer");
    }

    for account in ["ACC-1001", "ACC-2002"] {
        let balance = store.balance_of(account).unwrap_or_default();
        let summary = reporting.account_summary(account).await?;
        println!("{account}: balance {balance}, analytics {summary:?}");
    }
    println!(
        "Events on broker: completed={} failed={}",
        broker.messages(&config.outbox.topic).len(),
        broker.messages(&config.outbox.failed_topic).len()
    );

    workers.stop().await;
    Ok(())
}
