use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::db::repository::{
    DocumentStore, ExtractionRecord, StoreError, SupplierDirectory, TaskQueue, UsageRecorder,
};
use crate::models::document::{Document, DocumentStatus};
use crate::models::supplier::SupplierRecord;
use crate::models::task::{Task, TaskStatus};
use crate::models::usage::TokenUsageRecord;
use crate::services::heuristics::normalize_key;

const TASK_COLUMNS: &str = "id, document_id, status, attempts, max_attempts, priority, error_message, \
     started_at, completed_at, created_at, updated_at";

const DOCUMENT_COLUMNS: &str = "id, organization_id, supplier_id, file_path, mime_type, extracted_data, \
     status, classification, invoice_number, error_message, created_at, updated_at";

fn decode_err(e: strum::ParseError) -> sqlx::Error {
    sqlx::Error::Decode(Box::new(e))
}

fn task_from_row(row: &PgRow) -> Result<Task, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Task {
        id: row.try_get("id")?,
        document_id: row.try_get("document_id")?,
        status: status.parse::<TaskStatus>().map_err(decode_err)?,
        attempts: row.try_get("attempts")?,
        max_attempts: row.try_get("max_attempts")?,
        priority: row.try_get("priority")?,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn document_from_row(row: &PgRow) -> Result<Document, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(Document {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        supplier_id: row.try_get("supplier_id")?,
        file_path: row.try_get("file_path")?,
        mime_type: row.try_get("mime_type")?,
        extracted_data: row.try_get("extracted_data")?,
        status: status.parse::<DocumentStatus>().map_err(decode_err)?,
        classification: row.try_get("classification")?,
        invoice_number: row.try_get("invoice_number")?,
        error_message: row.try_get("error_message")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn supplier_from_row(row: &PgRow) -> Result<SupplierRecord, sqlx::Error> {
    Ok(SupplierRecord {
        id: row.try_get("id")?,
        organization_id: row.try_get("organization_id")?,
        normalized_key: row.try_get("normalized_key")?,
        display_name: row.try_get("display_name")?,
        validation_status: row.try_get("validation_status")?,
    })
}

/// Map a unique-constraint violation to [`StoreError::UniqueViolation`].
fn store_err(e: sqlx::Error) -> StoreError {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            StoreError::UniqueViolation(db.constraint().unwrap_or("unique").to_string())
        }
        _ => StoreError::Database(e),
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

/// Insert a new pending task
pub async fn create_task(
    pool: &PgPool,
    document_id: Uuid,
    priority: i32,
    max_attempts: i32,
) -> Result<Task, sqlx::Error> {
    let row = sqlx::query(&format!(
        r#"
        INSERT INTO processing_tasks (document_id, status, priority, max_attempts)
        VALUES ($1, 'pending', $2, $3)
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(document_id)
    .bind(priority)
    .bind(max_attempts)
    .fetch_one(pool)
    .await?;

    task_from_row(&row)
}

/// Claim the next eligible task and flag its document as processing.
///
/// The inner SELECT locks the candidate row with SKIP LOCKED, and the outer
/// UPDATE re-checks `status = 'pending'`, so a concurrent claim either skips
/// the row or updates nothing.
pub async fn claim_next_task(pool: &PgPool, quota_cooldown_secs: i64) -> Result<Option<Task>, sqlx::Error> {
    let mut tx = pool.begin().await?;

    let row = sqlx::query(&format!(
        r#"
        UPDATE processing_tasks
        SET status = 'processing',
            attempts = attempts + 1,
            started_at = NOW(),
            updated_at = NOW()
        WHERE id = (
            SELECT id
            FROM processing_tasks
            WHERE status = 'pending'
              AND attempts < max_attempts
              AND (error_message IS NULL
                   OR error_message NOT ILIKE '%quota%'
                   OR updated_at < NOW() - make_interval(secs => $1::double precision))
            ORDER BY priority DESC, created_at ASC
            FOR UPDATE SKIP LOCKED
            LIMIT 1
        )
          AND status = 'pending'
        RETURNING {TASK_COLUMNS}
        "#
    ))
    .bind(quota_cooldown_secs as f64)
    .fetch_optional(&mut *tx)
    .await?;

    let Some(row) = row else {
        tx.rollback().await?;
        return Ok(None);
    };
    let task = task_from_row(&row)?;

    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'processing', updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task.document_id)
    .execute(&mut *tx)
    .await?;

    tx.commit().await?;
    Ok(Some(task))
}

/// Mark a task as completed
pub async fn complete_task(pool: &PgPool, task_id: Uuid) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE processing_tasks
        SET status = 'completed', completed_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .execute(pool)
    .await?;

    Ok(())
}

/// Put a task back in the queue after a retryable failure
pub async fn requeue_task(
    pool: &PgPool,
    task_id: Uuid,
    error_message: &str,
    raise_max_attempts_to: Option<i32>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE processing_tasks
        SET status = 'pending',
            started_at = NULL,
            error_message = $2,
            max_attempts = GREATEST(max_attempts, COALESCE($3, max_attempts)),
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(error_message)
    .bind(raise_max_attempts_to)
    .execute(pool)
    .await?;

    Ok(())
}

/// Mark a task as permanently failed
pub async fn fail_task(pool: &PgPool, task_id: Uuid, error_message: &str) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE processing_tasks
        SET status = 'failed', error_message = $2, completed_at = NOW(), updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(task_id)
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(())
}

/// Get a task by ID
pub async fn get_task(pool: &PgPool, task_id: Uuid) -> Result<Option<Task>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {TASK_COLUMNS} FROM processing_tasks WHERE id = $1"))
        .bind(task_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(task_from_row).transpose()
}

// ── Documents ───────────────────────────────────────────────────────

pub async fn insert_document(pool: &PgPool, document: &Document) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO documents (id, organization_id, file_path, mime_type, status, created_at, updated_at)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        "#,
    )
    .bind(document.id)
    .bind(document.organization_id)
    .bind(&document.file_path)
    .bind(&document.mime_type)
    .bind(document.status.to_string())
    .bind(document.created_at)
    .bind(document.updated_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_document(pool: &PgPool, document_id: Uuid) -> Result<Option<Document>, sqlx::Error> {
    let row = sqlx::query(&format!("SELECT {DOCUMENT_COLUMNS} FROM documents WHERE id = $1"))
        .bind(document_id)
        .fetch_optional(pool)
        .await?;

    row.as_ref().map(document_from_row).transpose()
}

pub async fn update_document_status(
    pool: &PgPool,
    document_id: Uuid,
    status: DocumentStatus,
    error_message: Option<&str>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE documents
        SET status = $2, error_message = $3, updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(status.to_string())
    .bind(error_message)
    .execute(pool)
    .await?;

    Ok(())
}

/// Store the extraction and its items; the document becomes `completed`.
///
/// The document update runs first so a duplicate invoice number aborts the
/// transaction before any item is written.
pub async fn save_extraction(
    pool: &PgPool,
    document_id: Uuid,
    record: ExtractionRecord<'_>,
) -> Result<(), sqlx::Error> {
    let mut tx = pool.begin().await?;

    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'completed',
            supplier_id = $2,
            extracted_data = $3,
            classification = $4,
            invoice_number = $5,
            error_message = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(record.supplier_id)
    .bind(Json(record.invoice))
    .bind(record.classification.map(Json))
    .bind(record.invoice.invoice_number.as_deref())
    .execute(&mut *tx)
    .await?;

    sqlx::query("DELETE FROM document_items WHERE document_id = $1")
        .bind(document_id)
        .execute(&mut *tx)
        .await?;

    for (position, item) in record.invoice.items.iter().enumerate() {
        sqlx::query(
            r#"
            INSERT INTO document_items
                (document_id, position, description, reference, quantity, unit_price,
                 total_price, tax_rate, is_ht, category)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(document_id)
        .bind(position as i32)
        .bind(&item.description)
        .bind(item.reference.as_deref())
        .bind(item.quantity)
        .bind(item.unit_price)
        .bind(item.total_price)
        .bind(item.tax_rate)
        .bind(item.is_ht)
        .bind(item.category.as_deref())
        .execute(&mut *tx)
        .await?;
    }

    tx.commit().await?;
    Ok(())
}

/// Keep a duplicate's extraction for review without claiming its number.
pub async fn mark_duplicate(
    pool: &PgPool,
    document_id: Uuid,
    record: ExtractionRecord<'_>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        UPDATE documents
        SET status = 'duplicate',
            supplier_id = $2,
            extracted_data = $3,
            classification = $4,
            invoice_number = NULL,
            updated_at = NOW()
        WHERE id = $1
        "#,
    )
    .bind(document_id)
    .bind(record.supplier_id)
    .bind(Json(record.invoice))
    .bind(record.classification.map(Json))
    .execute(pool)
    .await?;

    Ok(())
}

// ── Suppliers & usage ───────────────────────────────────────────────

pub async fn upsert_supplier(
    pool: &PgPool,
    organization_id: Uuid,
    display_name: &str,
) -> Result<SupplierRecord, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO suppliers (organization_id, normalized_key, display_name, validation_status)
        VALUES ($1, $2, $3, 'pending')
        ON CONFLICT (organization_id, normalized_key)
        DO UPDATE SET updated_at = NOW()
        RETURNING id, organization_id, normalized_key, display_name, validation_status
        "#,
    )
    .bind(organization_id)
    .bind(normalize_key(display_name))
    .bind(display_name)
    .fetch_one(pool)
    .await?;

    supplier_from_row(&row)
}

pub async fn find_supplier_by_key(
    pool: &PgPool,
    organization_id: Uuid,
    normalized_key: &str,
) -> Result<Option<SupplierRecord>, sqlx::Error> {
    let row = sqlx::query(
        r#"
        SELECT id, organization_id, normalized_key, display_name, validation_status
        FROM suppliers
        WHERE organization_id = $1 AND normalized_key = $2
        "#,
    )
    .bind(organization_id)
    .bind(normalized_key)
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(supplier_from_row).transpose()
}

pub async fn insert_token_usage(pool: &PgPool, record: &TokenUsageRecord) -> Result<(), sqlx::Error> {
    sqlx::query(
        r#"
        INSERT INTO token_usage (organization_id, document_id, model, input_tokens, output_tokens, operation)
        VALUES ($1, $2, $3, $4, $5, $6)
        "#,
    )
    .bind(record.organization_id)
    .bind(record.document_id)
    .bind(&record.model)
    .bind(record.input_tokens)
    .bind(record.output_tokens)
    .bind(record.operation.to_string())
    .execute(pool)
    .await?;

    Ok(())
}

/// PostgreSQL-backed implementation of every storage seam.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl TaskQueue for PgStore {
    async fn enqueue(&self, document_id: Uuid, priority: i32, max_attempts: i32) -> Result<Task, StoreError> {
        Ok(create_task(&self.pool, document_id, priority, max_attempts).await?)
    }

    async fn claim_next(&self, quota_cooldown_secs: i64) -> Result<Option<Task>, StoreError> {
        Ok(claim_next_task(&self.pool, quota_cooldown_secs).await?)
    }

    async fn complete(&self, task_id: Uuid) -> Result<(), StoreError> {
        Ok(complete_task(&self.pool, task_id).await?)
    }

    async fn requeue(
        &self,
        task_id: Uuid,
        error_message: &str,
        raise_max_attempts_to: Option<i32>,
    ) -> Result<(), StoreError> {
        Ok(requeue_task(&self.pool, task_id, error_message, raise_max_attempts_to).await?)
    }

    async fn fail(&self, task_id: Uuid, error_message: &str) -> Result<(), StoreError> {
        Ok(fail_task(&self.pool, task_id, error_message).await?)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, StoreError> {
        Ok(get_task(&self.pool, task_id).await?)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgStore {
    async fn insert_document(&self, document: &Document) -> Result<(), StoreError> {
        Ok(insert_document(&self.pool, document).await?)
    }

    async fn get_document(&self, document_id: Uuid) -> Result<Document, StoreError> {
        get_document(&self.pool, document_id)
            .await?
            .ok_or(StoreError::NotFound(document_id))
    }

    async fn set_status(
        &self,
        document_id: Uuid,
        status: DocumentStatus,
        error_message: Option<&str>,
    ) -> Result<(), StoreError> {
        Ok(update_document_status(&self.pool, document_id, status, error_message).await?)
    }

    async fn save_extraction(&self, document_id: Uuid, record: ExtractionRecord<'_>) -> Result<(), StoreError> {
        save_extraction(&self.pool, document_id, record).await.map_err(store_err)
    }

    async fn mark_duplicate(&self, document_id: Uuid, record: ExtractionRecord<'_>) -> Result<(), StoreError> {
        Ok(mark_duplicate(&self.pool, document_id, record).await?)
    }
}

#[async_trait]
impl SupplierDirectory for PgStore {
    async fn upsert_supplier(&self, organization_id: Uuid, name: &str) -> Result<SupplierRecord, StoreError> {
        Ok(upsert_supplier(&self.pool, organization_id, name).await?)
    }

    async fn find_by_normalized_key(
        &self,
        organization_id: Uuid,
        normalized_key: &str,
    ) -> Result<Option<SupplierRecord>, StoreError> {
        Ok(find_supplier_by_key(&self.pool, organization_id, normalized_key).await?)
    }
}

#[async_trait]
impl UsageRecorder for PgStore {
    async fn record(&self, record: &TokenUsageRecord) -> Result<(), StoreError> {
        Ok(insert_token_usage(&self.pool, record).await?)
    }
}
