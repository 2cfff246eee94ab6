//! LLM extraction orchestrator.
//!
//! A primary extraction is followed, when it comes back empty, by retries on
//! the runner-up OCR rotations of page 1, then by an items-only pass over the
//! continuation pages of a multi-page document. The order of these steps is
//! an explicit state machine so it can be tested without any provider.

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::PipelineConfig;
use crate::db::repository::UsageRecorder;
use crate::error::ProcessingError;
use crate::models::document::{Classification, ExtractedInvoice, LineItem};
use crate::models::text::{AcquiredText, RotationCandidate};
use crate::models::usage::{OperationType, TokenUsage, TokenUsageRecord};
use crate::services::chunking;
use crate::services::llm::LlmClient;
use crate::services::prompts;
use crate::services::sanitize;
use crate::services::validation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionState {
    /// Primary extraction on the best text.
    Extracting,
    /// Retry on the n-th alternate rotation of page 1.
    EmptyRetry(usize),
    /// Items-only extraction on pages 2..n.
    Reconciling,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtractionEvent {
    Extracted { empty: bool },
    Reconciled,
}

/// What the transition function needs to know about the document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlowContext {
    /// Alternate rotations available for page 1, already capped.
    pub alternates: usize,
    pub pages: usize,
}

impl FlowContext {
    fn after_extraction(&self) -> ExtractionState {
        if self.pages > 1 {
            ExtractionState::Reconciling
        } else {
            ExtractionState::Done
        }
    }
}

/// Pure transition of the extraction flow.
pub fn next_state(state: ExtractionState, event: ExtractionEvent, ctx: FlowContext) -> ExtractionState {
    use ExtractionEvent::*;
    use ExtractionState::*;

    match (state, event) {
        (Extracting, Extracted { empty: true }) if ctx.alternates > 0 => EmptyRetry(0),
        (Extracting, Extracted { .. }) => ctx.after_extraction(),
        (EmptyRetry(i), Extracted { empty: true }) if i + 1 < ctx.alternates => EmptyRetry(i + 1),
        (EmptyRetry(_), Extracted { .. }) => ctx.after_extraction(),
        (Reconciling, Reconciled) => Done,
        (Done, _) => Done,
        // Events that do not belong to the current state leave it unchanged.
        (state, _) => state,
    }
}

/// Final result of the orchestrator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractionOutcome {
    pub invoice: ExtractedInvoice,
    pub classification: Option<Classification>,
    /// Angle of the alternate rotation that produced the header, if any.
    pub used_alternate: Option<u16>,
}

/// Drives the LLM calls for one document.
pub struct Extractor<'a> {
    llm: &'a dyn LlmClient,
    usage: &'a dyn UsageRecorder,
    config: &'a PipelineConfig,
    organization_id: Uuid,
    document_id: Uuid,
}

impl<'a> Extractor<'a> {
    pub fn new(
        llm: &'a dyn LlmClient,
        usage: &'a dyn UsageRecorder,
        config: &'a PipelineConfig,
        organization_id: Uuid,
        document_id: Uuid,
    ) -> Self {
        Self {
            llm,
            usage,
            config,
            organization_id,
            document_id,
        }
    }

    pub async fn run(&self, acquired: &AcquiredText) -> Result<ExtractionOutcome, ProcessingError> {
        let page_count = acquired.page_count().max(1);
        let primary_text = primary_text(acquired);
        let context = self.continuation_context(acquired);
        let alternates: Vec<&RotationCandidate> = acquired
            .pages
            .first()
            .map(|p| p.alternates.iter().take(self.config.alternate_retries).collect())
            .unwrap_or_default();
        let ctx = FlowContext {
            alternates: alternates.len(),
            pages: page_count,
        };

        let mut invoice = ExtractedInvoice::default();
        let mut used_alternate = None;
        let mut state = ExtractionState::Extracting;

        loop {
            debug!(document_id = %self.document_id, ?state, "Extraction step");
            state = match state {
                ExtractionState::Extracting => {
                    invoice = self.extract(&primary_text, context.as_deref()).await?;
                    next_state(state, ExtractionEvent::Extracted { empty: invoice.is_empty() }, ctx)
                }
                ExtractionState::EmptyRetry(i) => {
                    let mut empty = true;
                    if let Some(alternate) = alternates.get(i) {
                        info!(
                            document_id = %self.document_id,
                            angle = alternate.angle,
                            "Empty extraction, retrying on alternate rotation"
                        );
                        match self.extract(&alternate.text, context.as_deref()).await {
                            Ok(candidate) if !candidate.is_empty() => {
                                invoice = candidate;
                                used_alternate = Some(alternate.angle);
                                empty = false;
                            }
                            Ok(_) => {}
                            Err(ProcessingError::ParseFailure(e)) => {
                                warn!(angle = alternate.angle, error = %e, "Alternate rotation answer unparseable");
                            }
                            Err(e) => return Err(e),
                        }
                    }
                    next_state(state, ExtractionEvent::Extracted { empty }, ctx)
                }
                ExtractionState::Reconciling => {
                    self.reconcile(&mut invoice, acquired).await?;
                    next_state(state, ExtractionEvent::Reconciled, ctx)
                }
                ExtractionState::Done => break,
            };
        }

        if invoice.is_empty() {
            warn!(document_id = %self.document_id, "No invoice data extracted");
            invoice.add_note("no invoice data could be extracted");
        }
        if let Some(angle) = used_alternate {
            invoice.add_note(format!("header extracted from page 1 rotated {}°", angle));
        }

        let classification = self.classify(&mut invoice).await?;
        validation::validate_invoice(&mut invoice, self.config.sum_tolerance);

        Ok(ExtractionOutcome {
            invoice,
            classification,
            used_alternate,
        })
    }

    /// Keyword-selected excerpts of pages 2..n.
    fn continuation_context(&self, acquired: &AcquiredText) -> Option<String> {
        if acquired.page_count() < 2 {
            return None;
        }
        let rest = acquired.pages[1..]
            .iter()
            .map(|p| p.text.trim())
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n\n");
        chunking::context_block(
            &rest,
            self.config.chunk_size,
            self.config.chunk_overlap,
            self.config.context_chunks,
        )
    }

    async fn extract(&self, text: &str, context: Option<&str>) -> Result<ExtractedInvoice, ProcessingError> {
        let prompt = prompts::extraction_prompt(text, context);
        let raw = self.complete(&prompt, OperationType::Extraction).await?;
        Ok(sanitize::parse_invoice(&raw)?)
    }

    /// Append the items of pages 2..n in page order and recompute the subtotal.
    async fn reconcile(&self, invoice: &mut ExtractedInvoice, acquired: &AcquiredText) -> Result<(), ProcessingError> {
        for (index, page) in acquired.pages.iter().enumerate().skip(1) {
            let page_no = index + 1;
            if page.text.trim().is_empty() {
                continue;
            }

            let prompt = prompts::items_prompt(&page.text, page_no);
            let raw = self.complete(&prompt, OperationType::Extraction).await?;
            match sanitize::parse_items(&raw) {
                Ok(items) => {
                    debug!(page = page_no, items = items.len(), "Continuation page reconciled");
                    invoice.items.extend(items);
                }
                Err(e) => {
                    warn!(page = page_no, error = %e, "Continuation page items unparseable");
                    invoice.add_note(format!("page {}: line items could not be read", page_no));
                }
            }
        }

        if !invoice.items.is_empty() {
            invoice.subtotal = Some(round_cents(invoice.items_total()));
        }
        Ok(())
    }

    /// Classify the final item set and write item categories back.
    ///
    /// An unparseable answer leaves the document unclassified; quota errors
    /// still propagate.
    async fn classify(&self, invoice: &mut ExtractedInvoice) -> Result<Option<Classification>, ProcessingError> {
        if invoice.is_empty() {
            return Ok(None);
        }

        let prompt = prompts::classification_prompt(invoice.supplier_name.as_deref(), &invoice.items);
        let raw = self.complete(&prompt, OperationType::Classification).await?;
        let classification = match sanitize::parse_classification(&raw) {
            Ok(c) => c,
            Err(e) => {
                warn!(document_id = %self.document_id, error = %e, "Classification unparseable");
                return Ok(None);
            }
        };

        apply_item_categories(&mut invoice.items, &classification);
        Ok(Some(classification))
    }

    async fn complete(&self, prompt: &str, operation: OperationType) -> Result<String, ProcessingError> {
        metrics::counter!("llm_invocations_total", "operation" => operation.to_string()).increment(1);
        let response = self.llm.invoke(prompt).await?;
        self.record_usage(response.usage, operation).await;
        Ok(response.text)
    }

    async fn record_usage(&self, usage: TokenUsage, operation: OperationType) {
        let record = TokenUsageRecord {
            organization_id: self.organization_id,
            document_id: self.document_id,
            model: self.llm.model().to_string(),
            input_tokens: usage.input_tokens,
            output_tokens: usage.output_tokens,
            operation,
        };
        if let Err(e) = self.usage.record(&record).await {
            warn!(document_id = %self.document_id, error = %e, "Failed to record token usage");
        }
    }
}

/// Page 1 for multi-page documents, else the whole text.
fn primary_text(acquired: &AcquiredText) -> String {
    match acquired.pages.first() {
        Some(first) if acquired.page_count() > 1 && !first.text.trim().is_empty() => first.text.clone(),
        _ => acquired.full_text(),
    }
}

fn apply_item_categories(items: &mut [LineItem], classification: &Classification) {
    for (item, category) in items.iter_mut().zip(&classification.item_categories) {
        let category = category.trim();
        if !category.is_empty() {
            item.category = Some(category.to_string());
        }
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
