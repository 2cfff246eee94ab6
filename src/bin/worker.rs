use invoice_ingest::{
    app_state::AppState,
    config::{AppConfig, PipelineConfig},
    services::worker::process_next_task,
};
use std::time::Duration;
use tokio::time::sleep;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .json()
        .init();

    tracing::info!("Starting invoice ingestion worker");

    let config = AppConfig::from_env().expect("Failed to load configuration");
    let pipeline = PipelineConfig::from_env().expect("Failed to load pipeline configuration");
    let poll_interval = Duration::from_millis(pipeline.poll_interval_ms);

    // The server owns migrations.
    let state = AppState::connect(&config, pipeline, false)
        .await
        .expect("Failed to initialize worker state");

    tracing::info!("Worker ready, starting task loop");

    loop {
        match process_next_task(&state).await {
            Ok(outcome) if outcome.processed => {
                tracing::debug!(document_id = ?outcome.document_id, "Task processed, checking for next task");
            }
            Ok(_) => {
                tracing::trace!("No tasks available, sleeping");
                sleep(poll_interval).await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Store error while processing, will retry");
                sleep(poll_interval).await;
            }
        }
    }
}
