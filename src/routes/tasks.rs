use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;

use crate::app_state::AppState;
use crate::services::worker::{self, ProcessOutcome};

/// POST /api/v1/tasks/process-next: claim and process one task.
///
/// Returns `processed: false` when the queue has nothing eligible. A failed
/// document is still a 200: its error is part of the outcome.
pub async fn process_next(State(state): State<AppState>) -> Result<Json<ProcessOutcome>, StatusCode> {
    match worker::process_next_task(&state).await {
        Ok(outcome) => Ok(Json(outcome)),
        Err(e) => {
            tracing::error!(error = %e, "Task queue unavailable");
            Err(StatusCode::SERVICE_UNAVAILABLE)
        }
    }
}
