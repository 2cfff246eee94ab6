use tracing::{info, warn};
use uuid::Uuid;

use crate::db::repository::{DocumentStore, ExtractionRecord, StoreError, SupplierDirectory};
use crate::error::ProcessingError;
use crate::models::document::{Classification, ExtractedInvoice};
use crate::services::post_process::UNKNOWN_SUPPLIER;

/// Write the final result of a document.
///
/// Upserts the supplier (not for an unknown one), then stores everything in
/// one transaction. A second invoice with the same organization, supplier
/// and number is kept for review as `duplicate` and reported as
/// [`ProcessingError::DuplicateInvoiceNumber`].
pub async fn persist(
    document_id: Uuid,
    organization_id: Uuid,
    invoice: &ExtractedInvoice,
    classification: Option<&Classification>,
    documents: &dyn DocumentStore,
    suppliers: &dyn SupplierDirectory,
) -> Result<(), ProcessingError> {
    let supplier_id = match invoice.supplier_name.as_deref() {
        Some(name) if name != UNKNOWN_SUPPLIER => {
            let supplier = suppliers.upsert_supplier(organization_id, name).await?;
            Some(supplier.id)
        }
        _ => None,
    };

    let record = ExtractionRecord {
        supplier_id,
        invoice,
        classification,
    };

    match documents.save_extraction(document_id, record).await {
        Ok(()) => {
            info!(
                %document_id,
                items = invoice.items.len(),
                notes = invoice.notes.len(),
                "Extraction persisted"
            );
            Ok(())
        }
        Err(StoreError::UniqueViolation(constraint)) => {
            let invoice_number = invoice.invoice_number.clone().unwrap_or_default();
            warn!(
                %document_id,
                invoice_number = %invoice_number,
                constraint = %constraint,
                "Invoice number already recorded for this supplier"
            );
            documents.mark_duplicate(document_id, record).await?;
            Err(ProcessingError::DuplicateInvoiceNumber { invoice_number })
        }
        Err(e) => Err(e.into()),
    }
}
