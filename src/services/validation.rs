use garde::Validate;
use tracing::warn;

use crate::models::document::ExtractedInvoice;

/// Comparison of the line totals with the invoice total.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SumCheck {
    pub items_total: f64,
    pub total_amount: f64,
    pub delta: f64,
    pub within_tolerance: bool,
}

/// `None` when there is nothing to compare: no total or no priced line.
pub fn check_item_sum(invoice: &ExtractedInvoice, tolerance: f64) -> Option<SumCheck> {
    let total_amount = invoice.total_amount?;
    if !invoice.items.iter().any(|i| i.total_price.is_some()) {
        return None;
    }

    let items_total = invoice.items_total();
    let delta = (items_total - total_amount).abs();
    Some(SumCheck {
        items_total,
        total_amount,
        delta,
        within_tolerance: delta <= tolerance,
    })
}

/// Advisory checks on a finished extraction. Never rejects the invoice:
/// every finding becomes a note.
///
/// - line sum against `total_amount`, within `tolerance`
/// - field constraints (lengths, non-negative quantities, tax rate range)
pub fn validate_invoice(invoice: &mut ExtractedInvoice, tolerance: f64) {
    // ── Sum check ────────────────────────────────────────────────────
    if let Some(check) = check_item_sum(invoice, tolerance) {
        if !check.within_tolerance {
            warn!(
                items_total = check.items_total,
                total_amount = check.total_amount,
                delta = check.delta,
                "Line items do not add up to the invoice total"
            );
            invoice.add_note(format!(
                "sum mismatch: items total {:.2} vs invoice total {:.2} (difference {:.2})",
                check.items_total, check.total_amount, check.delta
            ));
        }
    }

    // ── Field constraints ────────────────────────────────────────────
    if let Err(report) = invoice.validate() {
        let findings: Vec<String> = report
            .iter()
            .map(|(path, error)| format!("invalid field {}: {}", path, error))
            .collect();
        for finding in findings {
            invoice.add_note(finding);
        }
    }
}
