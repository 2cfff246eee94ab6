//! Prompt templates for the extraction and classification calls.

use crate::models::document::LineItem;

const HEADER_SCHEMA: &str = r#"{
  "document_type": "invoice | credit_note | quote | receipt | other",
  "invoice_number": "string or null",
  "invoice_date": "yyyy-mm-dd or null",
  "due_date": "yyyy-mm-dd or null",
  "currency": "ISO 4217 code, e.g. EUR",
  "supplier_name": "company that issued the document",
  "supplier_address": "string or null",
  "supplier_vat_number": "string or null",
  "client_name": "company the document is addressed to",
  "client_address": "string or null",
  "client_vat_number": "string or null",
  "subtotal": "number, total excluding tax",
  "tax_amount": "number",
  "total_amount": "number, total including tax",
  "items": [ITEM]
}"#;

const ITEM_SCHEMA: &str = r#"{"description": "string", "reference": "string or null", "quantity": number, "unit_price": number, "total_price": number, "tax_rate": number, "is_ht": true}"#;

/// Full header + items extraction.
///
/// `context` carries keyword-selected excerpts from the other pages of a
/// multi-page document.
pub fn extraction_prompt(text: &str, context: Option<&str>) -> String {
    let schema = HEADER_SCHEMA.replace("ITEM", ITEM_SCHEMA);
    let mut prompt = format!(
        "Extract the data of this supplier invoice.\n\
         Answer with exactly one JSON object following this schema:\n{schema}\n\n\
         Rules:\n\
         - Use null for any field that is not printed on the document.\n\
         - Amounts are plain numbers with a dot as decimal separator.\n\
         - The supplier is the issuer of the invoice, never the addressee.\n\
         - One entry in items per billed line; skip subtotal and tax lines.\n\
         - is_ht is false only when total_price includes tax.\n\n\
         DOCUMENT:\n{text}\n"
    );
    if let Some(context) = context {
        prompt.push_str(&format!(
            "\nEXCERPTS FROM THE OTHER PAGES (headers and totals):\n{context}\n"
        ));
    }
    prompt
}

/// Items-only extraction for one continuation page.
pub fn items_prompt(page_text: &str, page_no: usize) -> String {
    format!(
        "This is page {page_no} of a multi-page supplier invoice.\n\
         List only the billed line items printed on this page.\n\
         Answer with exactly one JSON object: {{\"items\": [{ITEM_SCHEMA}]}}\n\
         Use an empty list when the page has no line items. \
         Skip subtotal, tax and carried-forward lines.\n\n\
         PAGE:\n{page_text}\n"
    )
}

/// Spend category of the invoice and of each line.
pub fn classification_prompt(supplier_name: Option<&str>, items: &[LineItem]) -> String {
    let lines = items
        .iter()
        .enumerate()
        .map(|(i, item)| format!("{}. {}", i + 1, item.description))
        .collect::<Vec<_>>()
        .join("\n");

    format!(
        "Classify this purchase by spend category \
         (e.g. food, beverages, packaging, cleaning, energy, rent, equipment, services, other).\n\
         Answer with exactly one JSON object:\n\
         {{\"category\": \"string\", \"confidence\": number between 0 and 1, \
         \"item_categories\": [\"one category per line, same order\"]}}\n\n\
         SUPPLIER: {}\n\
         LINES:\n{}\n",
        supplier_name.unwrap_or("unknown"),
        if lines.is_empty() { "(none)".to_string() } else { lines }
    )
}
