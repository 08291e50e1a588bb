//! mailgate worker
//!
//! Consumes envelopes from the Redis event stream in batches and dispatches
//! them through the [`Router`] to the subscription handlers.
//!
//! ## Configuration
//!
//! Read from `MAILGATE_CONFIG` (default `config/mailgate.toml`), with
//! environment overrides:
//! - `REDIS_URL`: Redis connection string
//! - `MAILGATE_WORKER_NAME`: consumer name (default: hostname or UUID)
//! - `RUST_LOG`: logging level (default: "info")
//!
//! The `memory` store backend is refused here: its records would only exist
//! in this process. The server runs its own consumer in that mode.

use tracing::{error, info, warn};

use mailgate::shutdown::ShutdownSignal;
use mailgate::MailgateConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    mailgate::init_tracing();

    let config = MailgateConfig::load()?;
    config.check_standalone_worker()?;
    let components = config.build_components()?;
    let worker = &config.worker;
    let worker_name = config.worker_name();

    info!(
        worker = %worker_name,
        group = %worker.consumer_group,
        stream = %worker.stream,
        batch_size = worker.batch_size,
        max_deliveries = worker.max_deliveries,
        "mailgate worker starting"
    );

    let consumer = components.stream_consumer(&config, &worker_name).await?;

    let shutdown = ShutdownSignal::new();
    tokio::spawn(shutdown.clone().listen_for_os_signals());

    let run = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run(shutdown).await })
    };

    shutdown.cancelled().await;
    info!("Waiting for in-flight batch to finish");

    let abort = run.abort_handle();
    match shutdown.drain(run).await {
        Some(Ok(stats)) => info!(
            batches = stats.batches,
            processed = stats.processed,
            failed = stats.failed,
            "Worker shutdown complete"
        ),
        Some(Err(e)) => error!(error = %e, "Worker task ended abnormally"),
        None => {
            warn!("Worker did not finish in time, aborting");
            abort.abort();
        }
    }

    Ok(())
}
