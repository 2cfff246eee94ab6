//! In-process store with the same semantics as the PostgreSQL one.
//!
//! Used by the integration tests and for running the pipeline without a
//! database. The claim predicate, cool-down window and the unique
//! `(organization_id, supplier_id, invoice_number)` constraint are emulated
//! under one lock.

use async_trait::async_trait;
use chrono::{Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::db::repository::{
    DocumentStore, ExtractionRecord, StoreError, SupplierDirectory, TaskQueue, UsageRecorder,
};
use crate::models::document::{Document, DocumentStatus, LineItem};
use crate::models::supplier::SupplierRecord;
use crate::models::task::{Task, TaskStatus};
use crate::models::usage::TokenUsageRecord;
use crate::services::heuristics::normalize_key;

#[derive(Debug, Default)]
struct Inner {
    tasks: HashMap<Uuid, Task>,
    documents: HashMap<Uuid, Document>,
    items: HashMap<Uuid, Vec<LineItem>>,
    suppliers: Vec<SupplierRecord>,
    usage: Vec<TokenUsageRecord>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<RwLock<Inner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a task as-is, e.g. one with prior attempts.
    pub async fn put_task(&self, task: Task) {
        self.inner.write().await.tasks.insert(task.id, task);
    }

    pub async fn document(&self, document_id: Uuid) -> Option<Document> {
        self.inner.read().await.documents.get(&document_id).cloned()
    }

    pub async fn items(&self, document_id: Uuid) -> Vec<LineItem> {
        self.inner
            .read()
            .await
            .items
            .get(&document_id)
            .cloned()
            .unwrap_or_default()
    }

    pub async fn suppliers(&self) -> Vec<SupplierRecord> {
        self.inner.read().await.suppliers.clone()
    }

    pub async fn usage_records(&self) -> Vec<TokenUsageRecord> {
        self.inner.read().await.usage.clone()
    }
}

fn is_claimable(task: &Task, quota_cooldown_secs: i64) -> bool {
    if task.status != TaskStatus::Pending || task.attempts >= task.max_attempts {
        return false;
    }
    !task.is_quota_backoff() || task.updated_at < Utc::now() - Duration::seconds(quota_cooldown_secs)
}

#[async_trait]
impl TaskQueue for MemoryStore {
    async fn enqueue(&self, document_id: Uuid, priority: i32, max_attempts: i32) -> Result<Task, StoreError> {
        let task = Task::new(document_id, priority, max_attempts);
        self.inner.write().await.tasks.insert(task.id, task.clone());
        Ok(task)
    }

    async fn claim_next(&self, quota_cooldown_secs: i64) -> Result<Option<Task>, StoreError> {
        let mut inner = self.inner.write().await;

        let next = inner
            .tasks
            .values()
            .filter(|t| is_claimable(t, quota_cooldown_secs))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.created_at.cmp(&b.created_at))
            })
            .map(|t| t.id);
        let Some(task_id) = next else {
            return Ok(None);
        };

        let now = Utc::now();
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
        task.status = TaskStatus::Processing;
        task.attempts += 1;
        task.started_at = Some(now);
        task.updated_at = now;
        let claimed = task.clone();

        if let Some(document) = inner.documents.get_mut(&claimed.document_id) {
            document.status = DocumentStatus::Processing;
            document.updated_at = now;
        }
        Ok(Some(claimed))
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
        let now = Utc::now();
        task.status = TaskStatus::Completed;
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    async fn requeue(
        &self,
        task_id: Uuid,
        error_message: &str,
        raise_max_attempts_to: Option<i32>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
        task.status = TaskStatus::Pending;
        task.started_at = None;
        task.error_message = Some(error_message.to_string());
        if let Some(ceiling) = raise_max_attempts_to {
            task.max_attempts = task.max_attempts.max(ceiling);
        }
        task.updated_at = Utc::now();
        Ok(())
    }

    async fn fail(&self, task_id: Uuid, error_message: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let task = inner.tasks.get_mut(&task_id).ok_or(StoreError::NotFound(task_id))?;
        let now = Utc::now();
        task.status = TaskStatus::Failed;
        task.error_message = Some(error_message.to_string());
        task.completed_at = Some(now);
        task.updated_at = now;
        Ok(())
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(self.inner.read().await.tasks.get(&task_id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        self.inner
            .write()
            .await
            .documents
            .insert(document.id, document.clone());
        Ok(())
    }

    async fn get_document(&self, document_id: Uuid) -> Result<Document, StoreError> {
        self.document(document_id)
            .await
            .ok_or(StoreError::NotFound(document_id))
    }

    async fn set_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let document = inner
            .documents
            .get_mut(&document_id)
            .ok_or(StoreError::NotFound(document_id))?;
        document.status = status;
        document.error_message = error_message.map(str::to_string);
        document.updated_at = Utc::now();
        Ok(())
    }

    async fn save_extraction(&self, document_id: Uuid, record: ExtractionRecord<'_>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let organization_id = inner
            .documents
            .get(&document_id)
            .map(|d| d.organization_id)
            .ok_or(StoreError::NotFound(document_id))?;

        let invoice_number = record.invoice.invoice_number.clone();
        if let (Some(supplier_id), Some(number)) = (record.supplier_id, invoice_number.as_deref()) {
            let taken = inner.documents.values().any(|d| {
                d.id != document_id
                    && d.organization_id == organization_id
                    && d.supplier_id == Some(supplier_id)
                    && d.invoice_number.as_deref() == Some(number)
            });
            if taken {
                return Err(StoreError::UniqueViolation(
                    "documents_org_supplier_invoice_number_key".to_string(),
                ));
            }
        }

        let extracted = serde_json::to_value(record.invoice).ok();
        let classification = record.classification.and_then(|c| serde_json::to_value(c).ok());
        if let Some(document) = inner.documents.get_mut(&document_id) {
            document.status = DocumentStatus::Completed;
            document.supplier_id = record.supplier_id;
            document.extracted_data = extracted;
            document.classification = classification;
            document.invoice_number = invoice_number;
            document.error_message = None;
            document.updated_at = Utc::now();
        }
        inner.items.insert(document_id, record.invoice.items.clone());
        Ok(())
    }

    async fn mark_duplicate(&self, document_id: Uuid, record: ExtractionRecord<'_>) -> Result<(), StoreError> {
        let mut inner = self.inner.write().await;
        let document = inner
            .documents
            .get_mut(&document_id)
            .ok_or(StoreError::NotFound(document_id))?;
        document.status = DocumentStatus::Duplicate;
        document.supplier_id = record.supplier_id;
        document.extracted_data = serde_json::to_value(record.invoice).ok();
        document.classification = record.classification.and_then(|c| serde_json::to_value(c).ok());
        document.invoice_number = None;
        document.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl SupplierDirectory for MemoryStore {
    async fn upsert_supplier(&self, organization_id: Uuid, name: &str) -> Result<SupplierRecord, StoreError> {
        let key = normalize_key(name);
        let mut inner = self.inner.write().await;
        if let Some(existing) = inner
            .suppliers
            .iter()
            .find(|s| s.organization_id == organization_id && s.normalized_key == key)
        {
            return Ok(existing.clone());
        }

        let supplier = SupplierRecord {
            id: Uuid::new_v4(),
            organization_id,
            normalized_key: key,
            display_name: name.to_string(),
            validation_status: "pending".to_string(),
        };
        inner.suppliers.push(supplier.clone());
        Ok(supplier)
    }

    async fn find_by_normalized_key(
        &self,
        organization_id: Uuid,
        normalized_key: &str,
    ) -> Result<Option<SupplierRecord>, StoreError> {
        Ok(self
            .inner
            .read()
            .await
            .suppliers
            .iter()
            .find(|s| s.organization_id == organization_id && s.normalized_key == normalized_key)
            .cloned())
    }
}

#[async_trait]
impl UsageRecorder for MemoryStore {
    async fn record(&self, record: &TokenUsageRecord) -> Result<(), StoreError> {
        self.inner.write().await.usage.push(record.clone());
        Ok(())
    }
}
