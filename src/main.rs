use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use stkpay_backend::api::{build_router, MpesaState};
use stkpay_backend::config::AppConfig;
use stkpay_backend::database::{
    init_pool, run_migrations, InMemoryTransactionStore, PgTransactionStore,
    TransactionStore,
};
use stkpay_backend::health::HealthChecker;
use stkpay_backend::logging::init_tracing;
use stkpay_backend::payments::providers::MpesaGateway;
use stkpay_backend::payments::StkPushGateway;
use stkpay_backend::services::reconciliation::ReconciliationCoordinator;
use stkpay_backend::services::stk_push::StkPushService;
use stkpay_backend::workers::reconciliation_sweep::ReconciliationSweepWorker;
use tokio::signal;
use tokio::sync::watch;
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

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
            Ok(mut sig) => {
                sig.recv().await;
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
    let config = AppConfig::from_env().context("failed to load configuration")?;
    config.validate().context("invalid configuration")?;

    init_tracing(&config.logging);
    info!("Starting STK push service");

    let skip_externals = std::env::var("SKIP_EXTERNALS")
        .map(|v| v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);

    let store: Arc<dyn TransactionStore> = match (&config.database, skip_externals) {
        (Some(db_config), false) => {
            info!("Initializing database connection pool...");
            let pool = init_pool(db_config).await?;
            if db_config.run_migrations {
                run_migrations(&pool).await?;
            }
            Arc::new(PgTransactionStore::new(pool))
        }
        (None, false) => {
            warn!("DATABASE_URL not set; transactions are kept in memory only");
            Arc::new(InMemoryTransactionStore::new())
        }
        (_, true) => {
            info!("Skipping database initialization (SKIP_EXTERNALS=true)");
            Arc::new(InMemoryTransactionStore::new())
        }
    };

    let mpesa = MpesaGateway::new(config.mpesa.clone())?;
    let credentials = mpesa.credentials();
    let gateway: Arc<dyn StkPushGateway> = Arc::new(mpesa);

    let builder = config.mpesa.request_builder();
    let coordinator = ReconciliationCoordinator::new(Arc::clone(&store), Arc::clone(&gateway));
    let stk_push = StkPushService::new(builder, Arc::clone(&gateway), Arc::clone(&store));
    let health_checker = HealthChecker::new(Arc::clone(&store), Some(credentials));

    let (worker_shutdown_tx, worker_shutdown_rx) = watch::channel(false);
    let sweep_handle = if config.sweep.enabled {
        let worker = ReconciliationSweepWorker::new(
            Arc::clone(&store),
            coordinator.clone(),
            config.sweep.clone(),
        );
        Some(tokio::spawn(worker.run(worker_shutdown_rx)))
    } else {
        info!("Reconciliation sweep disabled (RECONCILE_SWEEP_ENABLED=false)");
        None
    };

    let app = build_router(
        MpesaState {
            stk_push,
            coordinator,
        },
        health_checker,
    )
    .layer(
        ServiceBuilder::new()
            .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
            .layer(TraceLayer::new_for_http())
            .layer(PropagateRequestIdLayer::x_request_id()),
    );

    let addr: SocketAddr = config
        .server
        .bind_address()
        .parse()
        .context("invalid SERVER_HOST/SERVER_PORT")?;
    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        error!("Failed to bind to address {}: {}", addr, e);
        e
    })?;

    info!(address = %addr, "Server listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal_with_notify(worker_shutdown_tx.clone()))
        .await?;

    let _ = worker_shutdown_tx.send(true);
    if let Some(handle) = sweep_handle {
        if let Err(e) = tokio::time::timeout(Duration::from_secs(5), handle).await {
            error!(error = %e, "Timed out waiting for sweep worker shutdown");
        }
    }

    info!("Server shutdown complete");

    Ok(())
}
