//! One pass of the ingestion pipeline: claim a task and carry its document
//! from raw bytes to a persisted result.

use serde::Serialize;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::config::PipelineConfig;
use crate::db::repository::StoreError;
use crate::error::ProcessingError;
use crate::models::document::DocumentStatus;
use crate::models::task::Task;
use crate::services::extraction::Extractor;
use crate::services::text::TextAcquirer;
use crate::services::{persistence, post_process};

/// Result of one `process_next_task` call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessOutcome {
    /// Whether a task was claimed.
    pub processed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub document_id: Option<Uuid>,
    /// The document repeats an invoice already recorded. The task still
    /// succeeded.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ProcessOutcome {
    fn idle() -> Self {
        Self {
            processed: false,
            document_id: None,
            duplicate: false,
            error: None,
        }
    }

    fn finished(document_id: Uuid) -> Self {
        Self {
            processed: true,
            document_id: Some(document_id),
            ..Self::idle()
        }
    }
}

/// Task/document transition for a failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureAction {
    /// Task back to `pending`, document back to `queued`.
    Requeue {
        message: String,
        raise_max_attempts_to: Option<i32>,
    },
    /// Task `completed`, document `duplicate`.
    CompleteAsDuplicate,
    /// Task `failed`, document `error`.
    Fail { message: String },
}

/// Decide what a failed attempt does to its task.
///
/// Rate limits get the raised quota ceiling, duplicates end the task
/// successfully, unreadable documents never retry, everything else gets the
/// standard ceiling.
pub fn classify_failure(error: &ProcessingError, task: &Task, config: &PipelineConfig) -> FailureAction {
    match error {
        ProcessingError::QuotaExceeded(_) if task.attempts < config.quota_max_attempts => {
            FailureAction::Requeue {
                message: format!(
                    "{} (quota backoff: retry after {}s)",
                    error, config.quota_cooldown_secs
                ),
                raise_max_attempts_to: (task.max_attempts < config.quota_max_attempts)
                    .then_some(config.quota_max_attempts),
            }
        }
        ProcessingError::DuplicateInvoiceNumber { .. } => FailureAction::CompleteAsDuplicate,
        ProcessingError::UnreadableDocument(_) | ProcessingError::QuotaExceeded(_) => {
            FailureAction::Fail {
                message: error.to_string(),
            }
        }
        _ => {
            let ceiling = task.max_attempts.min(config.max_attempts);
            if task.attempts < ceiling {
                FailureAction::Requeue {
                    message: error.to_string(),
                    raise_max_attempts_to: None,
                }
            } else {
                FailureAction::Fail {
                    message: format!("failed after {} attempts: {}", task.attempts, error),
                }
            }
        }
    }
}

/// Claim the next eligible task and process it end to end.
///
/// Safe to call repeatedly and concurrently: only the claim decides who
/// works on a task. Errors are infrastructure failures while claiming or
/// recording a transition; processing failures are part of the outcome.
pub async fn process_next_task(state: &AppState) -> Result<ProcessOutcome, StoreError> {
    let Some(task) = state.tasks.claim_next(state.pipeline.quota_cooldown_secs).await? else {
        return Ok(ProcessOutcome::idle());
    };

    let span = info_span!(
        "process_task",
        task_id = %task.id,
        document_id = %task.document_id,
        attempt = task.attempts,
    );
    run_task(state, task).instrument(span).await
}

async fn run_task(state: &AppState, task: Task) -> Result<ProcessOutcome, StoreError> {
    info!("Processing task");
    let start = Instant::now();
    let result = process_document(state, &task).await;
    metrics::histogram!("pipeline_processing_seconds").record(start.elapsed().as_secs_f64());

    match result {
        Ok(()) => {
            state.tasks.complete(task.id).await?;
            metrics::counter!("pipeline_tasks_total", "outcome" => "completed").increment(1);
            info!(duration_ms = start.elapsed().as_millis() as u64, "Task completed");
            Ok(ProcessOutcome::finished(task.document_id))
        }
        Err(err) => {
            let action = classify_failure(&err, &task, &state.pipeline);
            let mut outcome = ProcessOutcome::finished(task.document_id);
            if action == FailureAction::CompleteAsDuplicate {
                outcome.duplicate = true;
            } else {
                outcome.error = Some(err.to_string());
            }
            apply_failure(state, &task, &err, action).await?;
            Ok(outcome)
        }
    }
}

async fn apply_failure(
    state: &AppState,
    task: &Task,
    err: &ProcessingError,
    action: FailureAction,
) -> Result<(), StoreError> {
    match action {
        FailureAction::Requeue {
            message,
            raise_max_attempts_to,
        } => {
            warn!(error = %err, attempts = task.attempts, "Attempt failed, task requeued");
            state.tasks.requeue(task.id, &message, raise_max_attempts_to).await?;
            state
                .documents
                .set_status(task.document_id, DocumentStatus::Queued, None)
                .await?;
            let outcome = if err.is_quota() { "quota_requeued" } else { "requeued" };
            metrics::counter!("pipeline_tasks_total", "outcome" => outcome).increment(1);
        }
        FailureAction::CompleteAsDuplicate => {
            info!(error = %err, "Duplicate invoice, task completed");
            state.tasks.complete(task.id).await?;
            state
                .documents
                .set_status(task.document_id, DocumentStatus::Duplicate, None)
                .await?;
            metrics::counter!("pipeline_tasks_total", "outcome" => "duplicate").increment(1);
        }
        FailureAction::Fail { message } => {
            error!(error = %err, attempts = task.attempts, "Task failed");
            state.tasks.fail(task.id, &message).await?;
            state
                .documents
                .set_status(task.document_id, DocumentStatus::Error, Some(&message))
                .await?;
            metrics::counter!("pipeline_tasks_total", "outcome" => "failed").increment(1);
        }
    }
    Ok(())
}

async fn process_document(state: &AppState, task: &Task) -> Result<(), ProcessingError> {
    let document = state.documents.get_document(task.document_id).await?;

    let stored = state.storage.download(&document.file_path).await?;
    let bytes = match &state.encryption {
        Some(encryption) => encryption.open(&stored)?.into_owned(),
        None => stored,
    };

    let acquirer = TextAcquirer::new(state.ocr.as_ref(), state.renderer.as_ref(), &state.pipeline);
    let acquired = acquirer.acquire(&bytes, &document.mime_type).await?;
    if acquired.is_blank() {
        return Err(ProcessingError::UnreadableDocument(
            "no text found in document".to_string(),
        ));
    }
    info!(
        pages = acquired.page_count(),
        source = %acquired.source,
        "Text acquired"
    );

    let extractor = Extractor::new(
        state.llm.as_ref(),
        state.usage.as_ref(),
        &state.pipeline,
        document.organization_id,
        document.id,
    );
    let mut outcome = extractor.run(&acquired).await?;

    // Header heuristics read the same page 1 the model did.
    let text = match outcome.used_alternate {
        Some(angle) => acquired.full_text_with_alternate(angle),
        None => acquired.full_text(),
    };
    post_process::post_process(
        &mut outcome.invoice,
        &text,
        document.file_name(),
        document.organization_id,
        state.suppliers.as_ref(),
    )
    .await?;

    persistence::persist(
        document.id,
        document.organization_id,
        &outcome.invoice,
        outcome.classification.as_ref(),
        state.documents.as_ref(),
        state.suppliers.as_ref(),
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sanitize::ParseFailure;

    fn task(attempts: i32, max_attempts: i32) -> Task {
        let mut task = Task::new(Uuid::new_v4(), 0, max_attempts);
        task.attempts = attempts;
        task
    }

    #[test]
    fn test_quota_requeues_below_raised_ceiling() {
        let config = PipelineConfig::default();
        let err = ProcessingError::QuotaExceeded("3036".to_string());

        match classify_failure(&err, &task(2, 5), &config) {
            FailureAction::Requeue {
                message,
                raise_max_attempts_to,
            } => {
                assert!(message.contains("quota"));
                assert_eq!(raise_max_attempts_to, None);
            }
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_quota_lifts_low_task_ceiling() {
        let config = PipelineConfig::default();
        let err = ProcessingError::QuotaExceeded("429".to_string());
        let action = classify_failure(&err, &task(3, 3), &config);
        assert!(matches!(
            action,
            FailureAction::Requeue { raise_max_attempts_to: Some(5), .. }
        ));
    }

    #[test]
    fn test_quota_fails_at_raised_ceiling() {
        let config = PipelineConfig::default();
        let err = ProcessingError::QuotaExceeded("429".to_string());
        assert!(matches!(
            classify_failure(&err, &task(5, 5), &config),
            FailureAction::Fail { .. }
        ));
    }

    #[test]
    fn test_duplicate_completes() {
        let config = PipelineConfig::default();
        let err = ProcessingError::DuplicateInvoiceNumber {
            invoice_number: "F-1".to_string(),
        };
        assert_eq!(classify_failure(&err, &task(1, 3), &config), FailureAction::CompleteAsDuplicate);
    }

    #[test]
    fn test_unreadable_never_retries() {
        let config = PipelineConfig::default();
        let err = ProcessingError::UnreadableDocument("no text".to_string());
        match classify_failure(&err, &task(1, 3), &config) {
            FailureAction::Fail { message } => assert!(message.starts_with("unreadable:")),
            other => panic!("unexpected action {:?}", other),
        }
    }

    #[test]
    fn test_outcome_json_omits_unset_fields() {
        let idle = serde_json::to_value(ProcessOutcome::idle()).unwrap();
        assert_eq!(idle, serde_json::json!({"processed": false}));

        let mut duplicate = ProcessOutcome::finished(Uuid::nil());
        duplicate.duplicate = true;
        let value = serde_json::to_value(duplicate).unwrap();
        assert_eq!(value["duplicate"], true);
        assert!(value.get("error").is_none());
    }

    #[test]
    fn test_standard_ceiling() {
        let config = PipelineConfig::default();
        let err = ProcessingError::ParseFailure(ParseFailure {
            reason: "no JSON".to_string(),
        });
        assert!(matches!(
            classify_failure(&err, &task(2, 3), &config),
            FailureAction::Requeue { raise_max_attempts_to: None, .. }
        ));
        assert!(matches!(
            classify_failure(&err, &task(3, 3), &config),
            FailureAction::Fail { .. }
        ));
        // A ceiling lifted by an earlier rate limit does not extend ordinary retries.
        assert!(matches!(
            classify_failure(&err, &task(3, 5), &config),
            FailureAction::Fail { .. }
        ));
    }
}
