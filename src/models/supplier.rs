use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supplier as known to the organization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupplierRecord {
    pub id: Uuid,
    pub organization_id: Uuid,
    /// Comparison key, see `services::heuristics::normalize_key`.
    pub normalized_key: String,
    pub display_name: String,
    /// `validated` once a human confirmed the identity, `pending` otherwise.
    pub validation_status: String,
}
