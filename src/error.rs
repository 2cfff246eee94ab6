use crate::db::repository::StoreError;
use crate::services::encryption::EncryptionError;
use crate::services::llm::LlmError;
use crate::services::sanitize::ParseFailure;
use crate::services::storage::StorageError;
use crate::services::text::TextError;

/// Why processing a document stopped.
///
/// The worker maps each variant to a task/document transition; see
/// `services::worker::classify_failure`.
#[derive(Debug, thiserror::Error)]
pub enum ProcessingError {
    #[error(transparent)]
    ParseFailure(#[from] ParseFailure),

    /// Provider rate limit or exhausted quota. The message always contains
    /// the word "quota": the claim predicate keys on it.
    #[error("quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("duplicate invoice number {invoice_number}")]
    DuplicateInvoiceNumber { invoice_number: String },

    #[error("unreadable: {0}")]
    UnreadableDocument(String),

    #[error("storage error: {0}")]
    DownstreamStorage(String),

    #[error("text acquisition failed: {0}")]
    Acquisition(String),

    #[error("LLM error: {0}")]
    Llm(String),
}

impl ProcessingError {
    pub fn is_quota(&self) -> bool {
        matches!(self, ProcessingError::QuotaExceeded(_))
    }
}

impl From<LlmError> for ProcessingError {
    fn from(err: LlmError) -> Self {
        match err {
            LlmError::QuotaExceeded(msg) => ProcessingError::QuotaExceeded(msg),
            other => ProcessingError::Llm(other.to_string()),
        }
    }
}

impl From<TextError> for ProcessingError {
    fn from(err: TextError) -> Self {
        match err {
            TextError::QuotaExceeded(msg) => ProcessingError::QuotaExceeded(msg),
            TextError::Image(e) => ProcessingError::UnreadableDocument(e.to_string()),
            TextError::UnsupportedFormat(mime) => {
                ProcessingError::UnreadableDocument(format!("unsupported format {}", mime))
            }
            other => ProcessingError::Acquisition(other.to_string()),
        }
    }
}

impl From<StorageError> for ProcessingError {
    fn from(err: StorageError) -> Self {
        ProcessingError::DownstreamStorage(err.to_string())
    }
}

impl From<StoreError> for ProcessingError {
    fn from(err: StoreError) -> Self {
        ProcessingError::DownstreamStorage(err.to_string())
    }
}

impl From<EncryptionError> for ProcessingError {
    fn from(err: EncryptionError) -> Self {
        ProcessingError::DownstreamStorage(err.to_string())
    }
}
