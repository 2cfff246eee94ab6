//! Storage seams of the pipeline.
//!
//! The worker only talks to these traits. `db::queries` implements them on
//! PostgreSQL, `db::memory` in process for tests and local runs.

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::document::{Classification, Document, DocumentStatus, ExtractedInvoice};
use crate::models::supplier::SupplierRecord;
use crate::models::task::Task;
use crate::models::usage::TokenUsageRecord;

/// Everything written for a successfully extracted document.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionRecord<'a> {
    pub supplier_id: Option<Uuid>,
    pub invoice: &'a ExtractedInvoice,
    pub classification: Option<&'a Classification>,
}

#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(&self, document_id: Uuid, priority: i32, max_attempts: i32) -> Result<Task, StoreError>;

    /// Atomically move the next eligible task from `pending` to `processing`.
    ///
    /// Eligible: `attempts < max_attempts`, and not rate-limited within the
    /// last `quota_cooldown_secs`. Highest priority first, then oldest.
    /// Increments `attempts`, sets `started_at` and moves the document to
    /// `processing`. `None` when nothing is eligible or a concurrent claim won.
    async fn claim_next(&self, quota_cooldown_secs: i64) -> Result<Option<Task>, StoreError>;

    async fn complete(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Back to `pending` with `started_at` cleared. `raise_max_attempts_to`
    /// lifts a lower `max_attempts` so the task stays claimable.
    async fn requeue(
        &self,
        task_id: Uuid,
        error_message: &str,
        raise_max_attempts_to: Option<i32>,
    ) -> Result<(), StoreError>;

    async fn fail(&self, task_id: Uuid, error_message: &str) -> Result<(), StoreError>;

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError>;

    /// Connectivity check for the health endpoint.
    async fn ping(&self) -> Result<(), StoreError>;
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_document(&self, document: &Document) -> Result<(), StoreError>;

    async fn get_document(&self, document_id: Uuid) -> Result<Document, StoreError>;

    async fn set_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError>;

    /// Write items, extracted data, classification, invoice number and the
    /// `completed` status in one transaction.
    ///
    /// Fails with [`StoreError::UniqueViolation`] when the organization
    /// already has this supplier's invoice number.
    async fn save_extraction(&self, document_id: Uuid, record: ExtractionRecord<'_>) -> Result<(), StoreError>;

    /// Keep the extracted data for review but no invoice number, and mark the
    /// document `duplicate`.
    async fn mark_duplicate(&self, document_id: Uuid, record: ExtractionRecord<'_>) -> Result<(), StoreError>;
}

#[async_trait]
pub trait SupplierDirectory: Send + Sync {
    /// Find the supplier by normalized name or create it as `pending`.
    async fn upsert_supplier(&self, organization_id: Uuid, name: &str) -> Result<SupplierRecord, StoreError>;

    async fn find_by_normalized_key(
        &self,
        organization_id: Uuid,
        normalized_key: &str,
    ) -> Result<Option<SupplierRecord>, StoreError>;
}

#[async_trait]
pub trait UsageRecorder: Send + Sync {
    async fn record(&self, record: &TokenUsageRecord) -> Result<(), StoreError>;
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Unique constraint violated: {0}")]
    UniqueViolation(String),

    #[error("Record not found: {0}")]
    NotFound(Uuid),
}
