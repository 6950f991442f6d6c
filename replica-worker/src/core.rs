use std::sync::Arc;

use replica::apply::ConfiguredApply;
use replica::concurrency::shutdown::{ShutdownTx, create_shutdown_channel};
use replica::handlers::HandlerRegistry;
use replica::workers::base::{Worker, WorkerHandle};
use replica::workers::replication::{ReplicationWorker, ReplicationWorkerHandle};
use replica_config::shared::{ApplyConfig, PgConnectionConfig, ReplicatorConfig, WorkerConfig};
use replica_postgres::connection::{connect, connect_pool};
use replica_postgres::copy::PgCopyDelegate;
use replica_postgres::destination::PostgresDestination;
use replica_postgres::queue::PgqTransport;
use replica_postgres::store::PostgresStateStore;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info, warn};

use crate::migrations::migrate_replica_schema;

/// Starts the replication worker with the provided configuration and runs it until it
/// stops or a shutdown signal arrives.
pub async fn start_replicator_with_config(
    replicator_config: ReplicatorConfig,
) -> anyhow::Result<()> {
    info!("starting replica worker");

    log_config(&replicator_config);

    let state_store = init_store(&replicator_config).await?;

    let worker_config = Arc::new(replicator_config.worker);
    let queue_name = worker_config.queue_name.clone();

    let source = connect(&replicator_config.source).await?;
    let transport = PgqTransport::new(source, &queue_name);
    let destination = PostgresDestination::new(replicator_config.destination.clone());
    let delegate = PgCopyDelegate::new(
        replicator_config.source,
        replicator_config.destination,
    );
    let apply = ConfiguredApply::from_config(&queue_name, &worker_config.apply)?;
    let registry = Arc::new(HandlerRegistry::default());

    let (shutdown_tx, _) = create_shutdown_channel();
    let worker = ReplicationWorker::new(
        worker_config,
        transport,
        state_store,
        destination,
        apply,
        delegate,
        registry,
        shutdown_tx.clone(),
    );

    let handle = worker.start().await?;
    wait_for_worker(handle, shutdown_tx).await?;

    info!("replica worker completed");

    Ok(())
}

fn log_config(config: &ReplicatorConfig) {
    log_worker_config(&config.worker);
    log_pg_connection_config("source", &config.source);
    log_pg_connection_config("destination", &config.destination);
    if let Some(state_store) = &config.state_store {
        log_pg_connection_config("state store", state_store);
    }
}

fn log_worker_config(config: &WorkerConfig) {
    debug!(
        queue_name = config.queue_name,
        consumer_name = config.consumer_name,
        max_parallel_copies = config.max_parallel_copies,
        sync_poll_interval_ms = config.sync_poll_interval_ms,
        loop_delay_ms = config.loop_delay_ms,
        batch_min_count = config.batch_window.min_count,
        batch_min_interval_ms = config.batch_window.min_interval_ms,
        resume_copies_on_start = config.resume_copies_on_start,
        "worker config"
    );

    match &config.apply {
        ApplyConfig::Direct => debug!("applying changes directly to the destination"),
        ApplyConfig::Buffered { sink } => debug!(?sink, "buffering changes per batch"),
    }
}

fn log_pg_connection_config(role: &str, config: &PgConnectionConfig) {
    debug!(
        host = config.host,
        port = config.port,
        dbname = config.name,
        username = config.username,
        require_ssl = config.require_ssl,
        "{role} postgres connection config",
    );
}

fn same_database(a: &PgConnectionConfig, b: &PgConnectionConfig) -> bool {
    a.host == b.host && a.port == b.port && a.name == b.name
}

/// Migrates the `replica` schema and creates the state store.
///
/// The destination keeps the completed ticks of the consumers, so it is migrated too when
/// the states live in another database.
async fn init_store(config: &ReplicatorConfig) -> anyhow::Result<PostgresStateStore> {
    let state_store_connection = config.state_store_connection();

    migrate_replica_schema(state_store_connection).await?;
    if !same_database(state_store_connection, &config.destination) {
        migrate_replica_schema(&config.destination).await?;
    }

    // The main worker and every copy worker may write their states at the same time.
    let max_connections = u32::from(config.worker.max_parallel_copies) + 1;
    let pool = connect_pool(state_store_connection, max_connections).await?;

    Ok(PostgresStateStore::new(pool))
}

/// Waits for the worker and turns SIGTERM and SIGINT into a graceful shutdown.
///
/// A shutdown lets the running batches finish; a batch interrupted by a kill is
/// redelivered on the next start.
async fn wait_for_worker(
    handle: ReplicationWorkerHandle,
    shutdown_tx: ShutdownTx,
) -> anyhow::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;

    let shutdown_handle = tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("SIGINT (Ctrl+C) received, shutting down replica worker");
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down replica worker");
            }
        }

        if let Err(e) = shutdown_tx.shutdown() {
            warn!("failed to send shutdown signal: {:?}", e);
            return;
        }

        info!("replica worker shutdown successfully")
    });

    let result = handle.wait().await;

    // The worker may stop on its own, the signal task is not needed anymore then.
    shutdown_handle.abort();
    let _ = shutdown_handle.await;

    result?;

    Ok(())
}
