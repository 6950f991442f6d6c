use replica_config::shared::ReplicatorConfig;
use replica_telemetry::metrics::init_metrics;
use replica_telemetry::tracing::{LogIdentity, init_tracing_with_identity};
use tracing::{error, info};

use crate::config::load_replicator_config;
use crate::core::start_replicator_with_config;

mod config;
mod core;
mod migrations;

fn main() -> anyhow::Result<()> {
    let replicator_config = load_replicator_config()?;

    // Every log line names the queue and consumer this process works for.
    let identity = LogIdentity {
        queue: replicator_config.worker.queue_name.clone(),
        consumer: replicator_config.worker.consumer_name.clone(),
    };
    let _log_flusher = init_tracing_with_identity(env!("CARGO_BIN_NAME"), Some(identity))?;

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async_main(replicator_config))?;

    Ok(())
}

async fn async_main(replicator_config: ReplicatorConfig) -> anyhow::Result<()> {
    match replicator_config.metrics_listen_address.as_deref() {
        Some(address) => {
            init_metrics(Some(address), &replicator_config.worker.queue_name)?;
            info!(%address, "serving prometheus metrics");
        }
        None => info!("metrics listener not configured, skipping initialization"),
    }

    if let Err(err) = start_replicator_with_config(replicator_config).await {
        error!("an error occurred in the replica worker: {err}");

        return Err(err);
    }

    Ok(())
}
