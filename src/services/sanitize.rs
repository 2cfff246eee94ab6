//! Coercion of raw model output into JSON.
//!
//! Models wrap their answer in code fences, prepend prose or leave trailing
//! commas. Everything that turns a completion into a `serde_json::Value`
//! goes through [`sanitize_json`].

use regex::Regex;
use serde_json::Value;
use std::sync::LazyLock;

use crate::models::document::{Classification, ExtractedInvoice, LineItem};

static FENCE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^\s*```[A-Za-z]*\s*$").expect("valid fence regex"));

static TRAILING_COMMA: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r",(\s*[}\]])").expect("valid trailing comma regex"));

/// The model answer could not be read as the expected JSON.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("unparseable model response: {reason}")]
pub struct ParseFailure {
    pub reason: String,
}

impl ParseFailure {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

/// Strip code fences, cut the outermost `{...}` block (or `[...]` when there
/// is no object) and parse it.
pub fn sanitize_json(raw: &str) -> Result<Value, ParseFailure> {
    let unfenced = FENCE.replace_all(raw, "");
    let block = outermost_block(&unfenced, '{', '}')
        .or_else(|| outermost_block(&unfenced, '[', ']'))
        .ok_or_else(|| ParseFailure::new("no JSON object in response"))?;

    match serde_json::from_str(block) {
        Ok(value) => Ok(value),
        Err(first) => {
            let repaired = TRAILING_COMMA.replace_all(block, "$1");
            serde_json::from_str(&repaired).map_err(|_| ParseFailure::new(first.to_string()))
        }
    }
}

fn outermost_block(text: &str, open: char, close: char) -> Option<&str> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| &text[start..=end])
}

pub fn parse_invoice(raw: &str) -> Result<ExtractedInvoice, ParseFailure> {
    let value = sanitize_json(raw)?;
    if !value.is_object() {
        return Err(ParseFailure::new("expected a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| ParseFailure::new(e.to_string()))
}

/// Items of an items-only answer: `{"items": [...]}` or a bare array.
pub fn parse_items(raw: &str) -> Result<Vec<LineItem>, ParseFailure> {
    let value = match sanitize_json(raw)? {
        Value::Array(items) => serde_json::json!({ "items": items }),
        other => other,
    };
    let invoice: ExtractedInvoice =
        serde_json::from_value(value).map_err(|e| ParseFailure::new(e.to_string()))?;
    Ok(invoice.items)
}

pub fn parse_classification(raw: &str) -> Result<Classification, ParseFailure> {
    let value = sanitize_json(raw)?;
    if !value.is_object() {
        return Err(ParseFailure::new("expected a JSON object"));
    }
    serde_json::from_value(value).map_err(|e| ParseFailure::new(e.to_string()))
}
