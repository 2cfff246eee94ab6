use chrono::{DateTime, Utc};
use garde::Validate;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Lifecycle of an uploaded document.
///
/// `Completed`, `Duplicate` and `Error` are terminal for the pipeline; an
/// `Error` document only moves again through an external re-enqueue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DocumentStatus {
    Queued,
    Processing,
    Completed,
    Error,
    Duplicate,
}

/// An uploaded document row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub organization_id: Uuid,
    pub supplier_id: Option<Uuid>,
    pub file_path: String,
    pub mime_type: String,
    pub extracted_data: Option<Value>,
    pub status: DocumentStatus,
    pub classification: Option<Value>,
    pub invoice_number: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Document {
    pub fn new(organization_id: Uuid, file_path: &str, mime_type: &str) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            organization_id,
            supplier_id: None,
            file_path: file_path.to_string(),
            mime_type: mime_type.to_string(),
            extracted_data: None,
            status: DocumentStatus::Queued,
            classification: None,
            invoice_number: None,
            error_message: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// File name without its directory part.
    pub fn file_name(&self) -> &str {
        self.file_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.file_path)
    }
}

/// One invoice line as returned by the extraction model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
pub struct LineItem {
    #[garde(length(max = 1000))]
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,

    #[garde(length(max = 120))]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub reference: Option<String>,

    #[garde(range(min = 0.0))]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub quantity: Option<f64>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub unit_price: Option<f64>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_price: Option<f64>,

    #[garde(range(min = 0.0, max = 100.0))]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub tax_rate: Option<f64>,

    /// Whether `total_price` excludes tax.
    #[garde(skip)]
    #[serde(default = "default_true", deserialize_with = "lenient_bool")]
    pub is_ht: bool,

    #[garde(skip)]
    #[serde(default)]
    pub category: Option<String>,
}

impl LineItem {
    pub fn new(description: &str, total_price: f64) -> Self {
        Self {
            description: description.to_string(),
            reference: None,
            quantity: Some(1.0),
            unit_price: Some(total_price),
            total_price: Some(total_price),
            tax_rate: None,
            is_ht: true,
            category: None,
        }
    }
}

/// Structured result of extracting one invoice.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
pub struct ExtractedInvoice {
    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub document_type: Option<String>,

    #[garde(length(min = 1, max = 64))]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub invoice_number: Option<String>,

    /// ISO `yyyy-mm-dd`.
    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub invoice_date: Option<String>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub due_date: Option<String>,

    #[garde(length(max = 8))]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub currency: Option<String>,

    #[garde(length(max = 200))]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub supplier_name: Option<String>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub supplier_address: Option<String>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub supplier_vat_number: Option<String>,

    #[garde(length(max = 200))]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub client_name: Option<String>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub client_address: Option<String>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_opt_string")]
    pub client_vat_number: Option<String>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub subtotal: Option<f64>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub tax_amount: Option<f64>,

    #[garde(skip)]
    #[serde(default, deserialize_with = "lenient_amount")]
    pub total_amount: Option<f64>,

    #[garde(dive)]
    #[serde(default, deserialize_with = "lenient_items")]
    pub items: Vec<LineItem>,

    /// Advisory notes added by validation and heuristics.
    #[garde(skip)]
    #[serde(default)]
    pub notes: Vec<String>,
}

impl ExtractedInvoice {
    /// No usable header field and no line: the model found nothing.
    pub fn is_empty(&self) -> bool {
        self.invoice_number.is_none()
            && self.total_amount.is_none()
            && self.supplier_name.is_none()
            && self.items.is_empty()
    }

    /// Sum of the line totals that are present.
    pub fn items_total(&self) -> f64 {
        self.items.iter().filter_map(|i| i.total_price).sum()
    }

    pub fn add_note(&mut self, note: impl Into<String>) {
        self.notes.push(note.into());
    }
}

/// Accounting classification of a document and its lines.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    #[serde(default, deserialize_with = "lenient_string")]
    pub category: String,

    #[serde(default, deserialize_with = "lenient_confidence")]
    pub confidence: f64,

    /// One label per line item, in item order.
    #[serde(default)]
    pub item_categories: Vec<String>,
}

fn default_true() -> bool {
    true
}

/// Parse an amount as written on invoices: `1 234,56`, `1.234,56`,
/// `1,234.56`, `12,5 €`, `-3.00`.
pub fn parse_amount(raw: &str) -> Option<f64> {
    let cleaned: String = raw
        .chars()
        .filter(|c| c.is_ascii_digit() || matches!(c, ',' | '.' | '-'))
        .collect();
    if !cleaned.chars().any(|c| c.is_ascii_digit()) {
        return None;
    }

    let last_comma = cleaned.rfind(',');
    let last_dot = cleaned.rfind('.');
    let normalized = match (last_comma, last_dot) {
        (Some(c), Some(d)) if c > d => cleaned.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => cleaned.replace(',', ""),
        (Some(c), None) => {
            // A lone comma followed by exactly three digits is a thousands separator.
            let decimals = cleaned.len() - c - 1;
            if decimals == 3 && cleaned.matches(',').count() == 1 && c > 0 {
                cleaned.replace(',', "")
            } else {
                cleaned.replace(',', ".")
            }
        }
        _ => cleaned,
    };

    normalized.parse::<f64>().ok()
}

fn lenient_amount<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => parse_amount(&s),
        _ => None,
    })
}

fn lenient_confidence<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    let value = lenient_amount(deserializer)?.unwrap_or(0.0);
    Ok(value.clamp(0.0, 1.0))
}

fn lenient_opt_string<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let text = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => s,
        Some(Value::Number(n)) => n.to_string(),
        _ => return Ok(None),
    };
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") || trimmed.eq_ignore_ascii_case("n/a") {
        Ok(None)
    } else {
        Ok(Some(trimmed.to_string()))
    }
}

fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_opt_string(deserializer)?.unwrap_or_default())
}

fn lenient_bool<'de, D>(deserializer: D) -> Result<bool, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Bool(b)) => b,
        Some(Value::String(s)) => !matches!(
            s.trim().to_lowercase().as_str(),
            "false" | "no" | "ttc" | "0"
        ),
        _ => true,
    })
}

/// Items that fail to deserialize individually are dropped instead of
/// failing the whole invoice.
fn lenient_items<'de, D>(deserializer: D) -> Result<Vec<LineItem>, D::Error>
where
    D: Deserializer<'de>,
{
    let values = match Option::<Value>::deserialize(deserializer)? {
        Some(Value::Array(values)) => values,
        _ => return Ok(Vec::new()),
    };
    Ok(values
        .into_iter()
        .filter_map(|v| serde_json::from_value::<LineItem>(v).ok())
        .filter(|item| !item.description.is_empty() || item.total_price.is_some())
        .collect())
}
