//! Order ingestion service entry point.
//!
//! Startup order matters: configuration, logging, database (with
//! migrations), cache warm-up, stat collector, broker consumer, HTTP server.
//! Shutdown runs the same pipeline backwards under a single deadline: stop
//! deliveries, drain the workers, close the HTTP server, let the stat
//! collector run dry. Any startup failure and a missed shutdown deadline
//! exit non-zero.

use std::sync::Arc;

use anyhow::{Context, Result, anyhow};
use app_config::AppConfig;
use cache::OrderCache;
use nats_consumer::{ConsumerConfig, NatsConsumer};
use repository::PgOrderRepository;
use server::Server;
use service::{OrderService, OrderUseCase};
use stats::stats_channel;
use tokio::signal;
use tokio::sync::watch;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STATS_CAPACITY: usize = 16;

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

async fn run() -> Result<()> {
    let cfg = AppConfig::load().context("failed to load configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init()
        .map_err(|e| anyhow!("failed to initialize logger: {e}"))?;

    let pool = db::init_db_pool(&cfg)
        .await
        .context("failed to initialize database")?;

    let cache = Arc::new(OrderCache::new());
    let service = Arc::new(OrderUseCase::new(
        PgOrderRepository::new(pool),
        cache.clone(),
    ));

    // A cold cache is survivable; a dead store is not.
    if let Err(e) = service.restore_cache().await {
        error!(error = %e, "failed to restore cache, starting cold");
    }

    let (stats_pusher, stats_reader, collector) = stats_channel(STATS_CAPACITY);
    let collector = tokio::spawn(collector.run());

    let consumer = NatsConsumer::connect(
        ConsumerConfig {
            url: cfg.nats_url.clone(),
            client_name: cfg.nats_client.clone(),
            stream: cfg.nats_cluster.clone(),
            subject: cfg.nats_subject.clone(),
            qgroup: cfg.nats_qgroup.clone(),
            durable: cfg.nats_durable.clone(),
            subscribers: cfg.nats_subscribers,
            workers: cfg.workers,
            handoff_capacity: cfg.handoff_capacity,
            max_inflight: cfg.max_inflight,
        },
        service.clone(),
        stats_pusher,
    )
    .await
    .context("failed to connect to nats")?;

    let (unsubscribe_tx, unsubscribe_rx) = watch::channel(false);
    let pipeline = consumer
        .run(unsubscribe_rx)
        .await
        .context("failed to start order processing")?;

    let (http_shutdown_tx, mut http_shutdown_rx) = watch::channel(false);
    let http_service: Arc<dyn OrderService> = service.clone();
    let server = Server::new(
        cfg.run_address.clone(),
        http_service,
        cache.clone(),
        stats_reader,
    );
    let mut server_task = tokio::spawn(server.serve(async move {
        let _ = http_shutdown_rx.changed().await;
    }));

    tokio::select! {
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining");
        }
        result = &mut server_task => {
            // The server only returns on its own this early if it failed.
            return match result {
                Ok(Ok(())) => Err(anyhow!("HTTP server exited unexpectedly")),
                Ok(Err(e)) => Err(e.context("HTTP server failed")),
                Err(e) => Err(anyhow!("HTTP server task failed: {e}")),
            };
        }
    }

    let _ = unsubscribe_tx.send(true);

    let drain = async {
        // Subscribers let go of the bus, workers empty the handoff queue.
        pipeline.drained().await;

        let _ = http_shutdown_tx.send(true);
        match server_task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "HTTP server error during shutdown"),
            Err(e) => error!(error = %e, "HTTP server task failed"),
        }

        // Every stat producer has exited by now, so the collector runs dry.
        if let Err(e) = collector.await {
            error!(error = %e, "stat collector task failed");
        }
    };

    match tokio::time::timeout(cfg.shutdown_timeout, drain).await {
        Ok(()) => {
            info!("graceful shutdown complete");
            Ok(())
        }
        Err(_) => {
            error!(
                deadline = ?cfg.shutdown_timeout,
                "graceful shutdown timed out, forcing exit"
            );
            Err(anyhow!("graceful shutdown timed out"))
        }
    }
}

/// Waits for a termination signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
