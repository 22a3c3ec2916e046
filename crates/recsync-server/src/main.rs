//! Recsync Server - Main entry point

use anyhow::Result;
use recsync_common::logging::{init_logging, LogConfig};
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use recsync_server::{
    api::{self, AppState},
    config::{BrokerKind, Config},
    db,
    ingest::{FetchCoordinator, FetchSettings, HttpSource, PgBatchWriter, SyncScheduler, WorkerRuntime},
    queue::{Broker, ConsumerConfig, MemoryBroker, PgBroker, QueueHandle, QueuePublisher},
};

#[tokio::main]
async fn main() -> Result<()> {
    // Environment variables take precedence over these defaults
    let log_config = LogConfig::builder()
        .log_file_prefix("recsync-server")
        .filter_directives("recsync_server=debug,tower_http=debug,sqlx=warn")
        .build()
        .merge_env()?;

    init_logging(&log_config)?;

    info!("Starting Recsync Server");

    let config = Config::load()?;
    info!(
        "Configuration loaded - server will bind to {}:{}",
        config.server.host, config.server.port
    );

    let db_pool = db::create_pool(&config.database).await?;
    db::ensure_schema(&db_pool).await?;
    info!("Records table ready");

    let broker: Arc<dyn Broker> = match config.broker.kind {
        BrokerKind::Postgres => {
            let pool = db::create_lazy_pool(&config.broker.url, &config.database)?;
            Arc::new(PgBroker::new(pool))
        },
        BrokerKind::Memory => {
            warn!("Using in-process broker, queued batches do not survive a restart");
            Arc::new(MemoryBroker::new())
        },
    };
    let queue = QueueHandle::new(broker, config.broker.queue_name.as_str());

    let shutdown = CancellationToken::new();

    // Consumer side
    let writer = Arc::new(PgBatchWriter::new(
        db_pool.clone(),
        config.database.transaction_timeout(),
    ));
    let consumer = WorkerRuntime::new(
        queue.clone(),
        writer,
        ConsumerConfig::from_broker_config(&config.broker),
    )
    .start(shutdown.clone());
    info!(consumer = consumer.name(), "Worker runtime started");

    // Producer side
    let source = HttpSource::new(&config.sync.api_url, config.sync.request_timeout())?;
    let coordinator = FetchCoordinator::new(
        Arc::new(source),
        QueuePublisher::new(queue.clone()),
        FetchSettings::from(&config.sync),
    );
    let scheduler =
        SyncScheduler::new(config.sync.interval(), Arc::new(coordinator)).start(shutdown.clone());
    info!(
        api_url = %config.sync.api_url,
        batch_size = config.sync.batch_size,
        total_rows = config.sync.total_rows,
        "Sync scheduler started"
    );

    let app = api::router(AppState {
        db: db_pool,
        queue,
        consumer: consumer.status(),
    });

    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await?;

    // Wait for the consumer to return its deliveries and for the scheduler to exit.
    shutdown.cancel();
    let timeout = Duration::from_secs(config.server.shutdown_timeout_secs);
    let stopped = tokio::time::timeout(timeout, async {
        consumer.stop().await;
        if let Err(e) = scheduler.await {
            warn!("Scheduler task failed: {}", e);
        }
    })
    .await;
    if stopped.is_err() {
        warn!("Pipeline did not stop within {} seconds", timeout.as_secs());
    }

    info!("Server shut down gracefully");

    Ok(())
}

/// Graceful shutdown signal handler
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            info!("Received terminate signal, starting graceful shutdown");
        },
        _ = shutdown.cancelled() => {},
    }

    shutdown.cancel();
}
