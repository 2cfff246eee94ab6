use axum::extract::State;
use axum::response::IntoResponse;

use crate::app_state::MetricsState;

/// Prometheus scrape endpoint, text exposition format.
pub async fn prometheus_metrics(State(handle): State<MetricsState>) -> impl IntoResponse {
    handle.render()
}

/// Register descriptions for the pipeline metrics.
pub fn describe_metrics() {
    metrics::describe_counter!(
        "pipeline_tasks_total",
        "Processed tasks by outcome (completed, requeued, quota_requeued, duplicate, failed)"
    );
    metrics::describe_histogram!(
        "pipeline_processing_seconds",
        "Time to process one claimed task"
    );
    metrics::describe_counter!(
        "ocr_rotation_attempts_total",
        "OCR calls made by the rotation search"
    );
    metrics::describe_counter!(
        "llm_invocations_total",
        "LLM completions by operation"
    );
}
