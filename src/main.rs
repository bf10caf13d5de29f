use std::sync::Arc;
use std::time::Duration;
use stk_lifecycle::config::AppConfig;
use stk_lifecycle::database::memory::InMemoryTransactionStore;
use stk_lifecycle::database::repository::TransactionStore;
use stk_lifecycle::logging::init_tracing;
use stk_lifecycle::payments::providers::mpesa::MpesaEnvironment;
use stk_lifecycle::payments::providers::{MpesaGateway, SandboxGateway};
use stk_lifecycle::payments::provider::PaymentGateway;
use stk_lifecycle::payments::token_cache::AccessTokenCache;
use stk_lifecycle::services::notification::{EventNotifier, WILDCARD};
use stk_lifecycle::services::payment_lifecycle::PaymentLifecycleManager;
use stk_lifecycle::services::settlement::LoggingSettlementRecorder;
use stk_lifecycle::workers::reconciliation::ReconciliationWorker;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("Shutdown signal received, starting graceful shutdown");
}

async fn shutdown_signal_with_notify(shutdown_tx: watch::Sender<bool>) {
    shutdown_signal().await;
    let _ = shutdown_tx.send(true);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env()?;
    init_tracing(&config.logging);
    config.validate()?;

    info!(
        version = env!("CARGO_PKG_VERSION"),
        mpesa_environment = ?config.mpesa.environment,
        "🚀 Starting STK-push payment lifecycle service"
    );

    // Transaction store
    let store: Arc<dyn TransactionStore> = match &config.database {
        #[cfg(feature = "database")]
        Some(database) => {
            info!("📊 Initializing database connection pool...");
            let pool = stk_lifecycle::database::init_pool_from_config(database)
                .await
                .map_err(|e| {
                    error!("Failed to initialize database pool: {}", e);
                    e
                })?;
            info!(
                max_connections = pool.options().get_max_connections(),
                "✅ Database connection pool initialized"
            );
            Arc::new(stk_lifecycle::database::transaction_repository::PgTransactionStore::new(pool))
        }
        #[cfg(not(feature = "database"))]
        Some(_) => {
            anyhow::bail!("DATABASE_URL is set but the `database` feature is disabled");
        }
        None => {
            info!("⏭️  DATABASE_URL not set, using the in-memory transaction store");
            Arc::new(InMemoryTransactionStore::new())
        }
    };

    // Provider gateway
    let gateway: Arc<dyn PaymentGateway> = match config.mpesa.environment {
        MpesaEnvironment::Simulation => {
            info!("🧪 M-Pesa simulation mode, using the sandbox gateway");
            Arc::new(SandboxGateway::default())
        }
        _ => {
            let tokens = Arc::new(AccessTokenCache::new(Duration::from_secs(
                config.mpesa.token_refresh_margin_secs,
            )));
            info!(base_url = %config.mpesa.base_url, "💳 M-Pesa gateway initialized");
            Arc::new(MpesaGateway::new(config.mpesa.clone(), tokens)?)
        }
    };

    let notifier = Arc::new(EventNotifier::default());
    let lifecycle = Arc::new(PaymentLifecycleManager::new(
        store.clone(),
        gateway,
        notifier.clone(),
        Arc::new(LoggingSettlementRecorder),
        config.lifecycle.clone(),
    ));

    // Lifecycle event log
    let mut events = notifier.subscribe(WILDCARD)?;
    let event_log = tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            info!(
                transaction_id = %event.transaction_id,
                event = event.event_name(),
                previous_state = ?event.previous_state,
                "📣 lifecycle event"
            );
        }
    });

    // Reconciliation worker
    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let worker = ReconciliationWorker::new(store, lifecycle, config.reconciliation.clone());
    let worker_handle = tokio::spawn(worker.run(worker_shutdown_rx));
    info!(
        poll_interval_secs = config.reconciliation.poll_interval.as_secs(),
        "✅ Reconciliation worker started"
    );

    shutdown_signal_with_notify(worker_shutdown_tx).await;

    if let Err(e) = tokio::time::timeout(Duration::from_secs(5), worker_handle).await {
        error!(error = %e, "Timed out waiting for reconciliation worker shutdown");
    }
    event_log.abort();

    info!("👋 Payment lifecycle service stopped");
    Ok(())
}
