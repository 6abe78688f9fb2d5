//! Ferry consumer
//!
//! Pulls messages from the configured SQS queues and hands them to a logging
//! worker. Configured through `ferry.toml` and `FERRY_*` environment variables.
//!
//! ## Signals
//!
//! - `SIGINT`/`SIGTERM`: hard shutdown, bounded by `timeout` seconds
//! - `SIGUSR1`: stop fetching new messages, keep running in-flight ones
//!
//! ## Development Mode
//!
//! Set `FERRY_DEV_MODE=true` to consume from in-memory queues created for every
//! configured queue name instead of SQS.

use std::sync::Arc;
use anyhow::Result;
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info, warn};

use ferry_common::Unit;
use ferry_config::{AppConfig, ConfigLoader};
use ferry_queue::memory::InMemoryQueueClient;
use ferry_queue::sqs::{client_from_env, SqsQueueClient};
use ferry_queue::QueueClient;
use ferry_worker::{Launcher, Payload, Worker, WorkerDescriptor, WorkerError, WorkerRegistry};

/// Logs every message it receives
struct LogWorker;

#[async_trait]
impl Worker for LogWorker {
    async fn perform(&self, unit: &Unit, body: &Payload) -> Result<(), WorkerError> {
        for (message, parsed) in unit.messages().iter().zip(bodies(body)) {
            info!(
                message_id = %message.message_id,
                delivery_count = ?message.delivery_count(),
                body = %parsed.and_then(|b| b.as_text()).unwrap_or(&message.body),
                "Received message"
            );
        }
        Ok(())
    }
}

fn bodies(payload: &Payload) -> Vec<Option<&ferry_worker::Body>> {
    match payload {
        Payload::Single(body) => vec![body.as_ref()],
        Payload::Batch(bodies) => bodies.iter().map(Option::as_ref).collect(),
    }
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "true" || v == "1")
        .unwrap_or(false)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env file if present (for local development)
    let _ = dotenvy::dotenv();

    // Logging comes up before the config so loader warnings are not lost
    let logging = ferry_common::logging::init_logging("ferry", env_flag("FERRY_VERBOSE"));
    let config = ConfigLoader::new().load()?;
    logging.set_verbose(config.verbose)?;

    info!("Starting Ferry consumer");

    let launcher_config = config.to_launcher_config()?;
    let queue_names = launcher_config.queue_names();
    let shutdown_timeout = launcher_config.shutdown_timeout;

    // 1. Transport
    let client = build_client(&config, &queue_names).await;

    // 2. Workers
    let auto_delete = env_flag("FERRY_AUTO_DELETE");
    let workers = Arc::new(WorkerRegistry::new());
    for queue in &queue_names {
        workers.register(
            queue.clone(),
            WorkerDescriptor::new(format!("LogWorker[{}]", queue), Arc::new(LogWorker))
                .with_auto_delete(auto_delete),
        )?;
    }
    if !auto_delete {
        warn!("FERRY_AUTO_DELETE is not set, messages will be redelivered after processing");
    }

    // 3. Start consuming
    let launcher = Arc::new(Launcher::new(launcher_config, client, workers));
    launcher.start().await?;
    info!(queues = ?queue_names, "Ferry consumer running");

    // 4. USR1 quiets the consumer
    #[cfg(unix)]
    spawn_quiet_listener(launcher.clone())?;

    // 5. Wait for shutdown signal
    shutdown_signal().await?;
    info!(timeout_secs = shutdown_timeout.as_secs(), "Shutdown signal received");

    let outcomes = launcher.stop_with_timeout(shutdown_timeout).await;
    info!(outcomes = ?outcomes, "Ferry consumer shutdown complete");
    Ok(())
}

async fn build_client(config: &AppConfig, queue_names: &[String]) -> Arc<dyn QueueClient> {
    if env_flag("FERRY_DEV_MODE") {
        info!("Development mode enabled - using in-memory queues");
        let client = InMemoryQueueClient::new();
        for name in queue_names {
            client.create_queue(name, 30);
        }
        return Arc::new(client);
    }

    let sqs = client_from_env(config.aws.region.as_deref(), config.aws.endpoint.as_deref()).await;
    Arc::new(SqsQueueClient::new(sqs))
}

#[cfg(unix)]
fn spawn_quiet_listener(launcher: Arc<Launcher>) -> Result<()> {
    let mut usr1 = signal::unix::signal(signal::unix::SignalKind::user_defined1())?;
    tokio::spawn(async move {
        if usr1.recv().await.is_some() {
            info!("Received USR1, no longer accepting new work");
            launcher.quiet();
        }
    });
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    #[cfg(unix)]
    let mut terminate = signal::unix::signal(signal::unix::SignalKind::terminate())?;

    #[cfg(unix)]
    let terminate = async move {
        terminate.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = signal::ctrl_c() => {
            if let Err(e) = result {
                error!(error = %e, "Failed to listen for Ctrl+C");
                return Err(e.into());
            }
        }
        _ = terminate => {}
    }
    Ok(())
}
