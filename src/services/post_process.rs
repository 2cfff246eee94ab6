//! Deterministic corrections applied to the model's answer.

use tracing::info;
use uuid::Uuid;

use crate::db::repository::{StoreError, SupplierDirectory};
use crate::models::document::ExtractedInvoice;
use crate::services::heuristics::{self, names_collide, normalize_key};

/// Supplier name used when the issuer cannot be told apart from the client.
pub const UNKNOWN_SUPPLIER: &str = "Unknown supplier (needs verification)";

/// Run every correction on `invoice`, in order:
///
/// 1. header invoice number and date overrides
/// 2. supplier name from the document header, unless the extracted name is
///    already a known supplier of the organization
/// 3. supplier/client collision recovery
/// 4. supplier fields copied from the client are blanked
pub async fn post_process(
    invoice: &mut ExtractedInvoice,
    text: &str,
    file_name: &str,
    organization_id: Uuid,
    suppliers: &dyn SupplierDirectory,
) -> Result<(), StoreError> {
    apply_header_overrides(invoice, text);
    apply_supplier_header(invoice, text, organization_id, suppliers).await?;
    resolve_supplier_collision(invoice, file_name);
    clean_supplier_fields(invoice);
    Ok(())
}

/// Replace the invoice number and date with the header values when they
/// exist and differ.
pub fn apply_header_overrides(invoice: &mut ExtractedInvoice, text: &str) {
    if let Some(number) = heuristics::invoice_number_from_header(text) {
        let differs = invoice
            .invoice_number
            .as_deref()
            .map_or(true, |current| !same_reference(current, &number));
        if differs {
            invoice.add_note(format!(
                "invoice_number corrected from header: {} -> {}",
                invoice.invoice_number.as_deref().unwrap_or("none"),
                number
            ));
            invoice.invoice_number = Some(number);
        }
    }

    if let Some(date) = heuristics::invoice_date_from_header(text) {
        if invoice.invoice_date.as_deref() != Some(date.as_str()) {
            invoice.add_note(format!(
                "invoice_date corrected from header: {} -> {}",
                invoice.invoice_date.as_deref().unwrap_or("none"),
                date
            ));
            invoice.invoice_date = Some(date);
        }
    }
}

/// `F 2024-001` and `F2024001` are the same reference.
fn same_reference(a: &str, b: &str) -> bool {
    let key = |s: &str| -> String {
        s.chars()
            .filter(|c| c.is_alphanumeric())
            .flat_map(char::to_uppercase)
            .collect()
    };
    key(a) == key(b)
}

async fn apply_supplier_header(
    invoice: &mut ExtractedInvoice,
    text: &str,
    organization_id: Uuid,
    suppliers: &dyn SupplierDirectory,
) -> Result<(), StoreError> {
    let Some(candidate) = heuristics::supplier_from_header(text) else {
        return Ok(());
    };
    if let Some(client) = invoice.client_name.as_deref() {
        if names_collide(&candidate, client) {
            return Ok(());
        }
    }

    if let Some(current) = invoice.supplier_name.as_deref() {
        if normalize_key(current) == normalize_key(&candidate) {
            return Ok(());
        }
        let key = normalize_key(current);
        if !key.is_empty() && suppliers.find_by_normalized_key(organization_id, &key).await?.is_some() {
            info!(supplier = current, "Extracted supplier is already known, keeping it");
            return Ok(());
        }
    }

    invoice.add_note(format!(
        "supplier_name taken from document header: {} -> {}",
        invoice.supplier_name.as_deref().unwrap_or("none"),
        candidate
    ));
    invoice.supplier_name = Some(candidate);
    Ok(())
}

/// When the supplier came out as the client, recover it from the file name
/// or mark it unknown.
pub fn resolve_supplier_collision(invoice: &mut ExtractedInvoice, file_name: &str) {
    let (Some(supplier), Some(client)) = (invoice.supplier_name.as_deref(), invoice.client_name.as_deref()) else {
        return;
    };
    if !names_collide(supplier, client) {
        return;
    }

    let recovered = heuristics::file_name_prefix(file_name).filter(|prefix| !names_collide(prefix, client));
    match recovered {
        Some(prefix) => {
            invoice.add_note(format!(
                "supplier_name equal to client, recovered from file name: {}",
                prefix
            ));
            invoice.supplier_name = Some(prefix);
        }
        None => {
            invoice.add_note("supplier_name equal to client, supplier needs verification");
            invoice.supplier_name = Some(UNKNOWN_SUPPLIER.to_string());
        }
    }
}

/// Blank supplier address and VAT number when they repeat the client's.
pub fn clean_supplier_fields(invoice: &mut ExtractedInvoice) {
    if same_text(&invoice.supplier_address, &invoice.client_address) {
        invoice.supplier_address = None;
        invoice.add_note("supplier_address equal to client address, cleared");
    }
    if same_text(&invoice.supplier_vat_number, &invoice.client_vat_number) {
        invoice.supplier_vat_number = None;
        invoice.add_note("supplier_vat_number equal to client VAT number, cleared");
    }
}

fn same_text(a: &Option<String>, b: &Option<String>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => {
            let squash = |s: &str| -> String {
                s.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
            };
            !a.trim().is_empty() && squash(a) == squash(b)
        }
        _ => false,
    }
}
